#![forbid(unsafe_code)]

// One-shot timer slot. At most one timer is pending per slot; arming again
// replaces (and aborts) the previous one.

use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct AlarmSlot {
    pending: StdMutex<Option<JoinHandle<()>>>,
}

impl AlarmSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `on_fire` to run after `delay`, cancelling any pending timer.
    ///
    /// When the timer elapses `on_fire` is spawned as its own task, so a later
    /// `cancel` only ever stops a timer that has not fired yet.
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(on_fire);
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pending.replace(timer) {
            old.abort();
        }
    }

    /// Cancels the pending timer. Returns true if one was still waiting.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(timer) => {
                let was_waiting = !timer.is_finished();
                timer.abort();
                was_waiting
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for AlarmSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
