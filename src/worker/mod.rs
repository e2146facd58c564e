#![forbid(unsafe_code)]

// Worker actors - durable simulated clients.
//
// An actor is addressed by `(test_id, index)`. Its configuration lives in
// `ActorStorage` so a restarted process can re-arm timers that had not fired;
// the stop flag, pending timer and open session are transient.

pub mod alarm;
pub mod directory;
pub mod storage;
mod workload;

use crate::error::{WorkloadError, WorkloadResult};
use crate::event::{now_ms, EventReporter};
use crate::guard::OperationGuard;
use crate::sync::{SyncBackend, SyncSession};
use alarm::AlarmSlot;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{ActorStorage, WorkerRecord};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

pub use directory::WorkerDirectory;

/// Routing key of a worker: which test it belongs to and its slot in that test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerAddress {
    pub test_id: String,
    pub index: usize,
}

impl WorkerAddress {
    pub fn new(test_id: impl Into<String>, index: usize) -> Self {
        Self { test_id: test_id.into(), index }
    }

    /// Identity the worker authenticates as; stable for the life of the test.
    pub fn worker_id(&self) -> String {
        format!("{}-{}", self.test_id, self.index)
    }

    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.test_id, self.index)
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (test_id, index) = key.rsplit_once('/')?;
        if test_id.is_empty() {
            return None;
        }
        Some(Self::new(test_id, index.parse().ok()?))
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.test_id, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub operation_timeout: Duration,
    /// Shared secret used to mint `secret:user` access tokens
    pub access_secret: Option<String>,
}

/// Capabilities every actor is constructed with.
#[derive(Clone)]
pub struct WorkerDeps {
    pub storage: Arc<dyn ActorStorage>,
    pub backend: Arc<dyn SyncBackend>,
    pub reporter: Arc<dyn EventReporter>,
    pub settings: WorkerSettings,
}

/// Handle to one worker actor. Cloning yields another handle to the same actor.
#[derive(Clone)]
pub struct WorkerActor {
    inner: Arc<ActorInner>,
}

struct ActorInner {
    address: WorkerAddress,
    key: String,
    deps: WorkerDeps,
    should_stop: AtomicBool,
    alarm: AlarmSlot,
    session: TokioMutex<Option<Arc<dyn SyncSession>>>,
    /// Held for the whole workload so cycles never overlap
    run_lock: TokioMutex<()>,
}

impl WorkerActor {
    pub fn new(address: WorkerAddress, deps: WorkerDeps) -> Self {
        let key = address.storage_key();
        Self {
            inner: Arc::new(ActorInner {
                address,
                key,
                deps,
                should_stop: AtomicBool::new(false),
                alarm: AlarmSlot::new(),
                session: TokioMutex::new(None),
                run_lock: TokioMutex::new(()),
            }),
        }
    }

    /// Persists the workload parameters and picks the start delay.
    ///
    /// Does not schedule anything; `work` does.
    pub async fn start(
        &self,
        max_delay_ms: u64,
        file_count: usize,
        worker_id: &str,
        origin_uri: &str,
    ) -> WorkloadResult<()> {
        let delay_ms = pick_delay_ms(max_delay_ms);
        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            file_count,
            origin_uri: origin_uri.to_string(),
            delay_ms,
            alarm_at_ms: None,
        };
        self.storage().save(&self.inner.key, &record).await?;
        self.inner.should_stop.store(false, Ordering::SeqCst);
        debug!("Worker {} configured: {} files, delay {}ms", worker_id, file_count, delay_ms);

        self.guard(worker_id).run("startup", async { Ok(()) }).await
    }

    /// Schedules the workload after the persisted delay, replacing any
    /// pending timer.
    pub async fn work(&self) -> WorkloadResult<()> {
        self.inner.alarm.cancel();
        let mut record = self.record().await?;
        record.alarm_at_ms = Some(now_ms() + record.delay_ms);
        self.storage().save(&self.inner.key, &record).await?;
        self.arm(Duration::from_millis(record.delay_ms));
        debug!("Worker {} scheduled in {}ms", record.worker_id, record.delay_ms);
        Ok(())
    }

    /// Stops the worker: cancels its timer, clears its storage and closes its
    /// session. Safe to call any number of times.
    pub async fn stop(&self) -> WorkloadResult<()> {
        self.inner.should_stop.store(true, Ordering::SeqCst);
        self.inner.alarm.cancel();
        self.close_session().await;
        self.storage().delete(&self.inner.key).await?;
        debug!("Worker {} stopped", self.inner.address);
        Ok(())
    }

    /// Releases in-process resources but keeps the persisted record so the
    /// pending timer can be re-armed by a later process.
    pub async fn suspend(&self) {
        self.inner.alarm.cancel();
        self.close_session().await;
    }

    /// Re-arms the timer from a persisted `alarm_at_ms`. Overdue alarms fire
    /// immediately. Returns false when there was nothing to resume.
    pub async fn resume(&self) -> WorkloadResult<bool> {
        let record = self.record().await?;
        let Some(alarm_at) = record.alarm_at_ms else {
            return Ok(false);
        };
        let remaining = alarm_at.saturating_sub(now_ms());
        self.arm(Duration::from_millis(remaining));
        info!("Worker {} resumed, firing in {}ms", record.worker_id, remaining);
        Ok(true)
    }

    pub async fn get_id(&self) -> WorkloadResult<String> {
        Ok(self.record().await?.worker_id)
    }

    pub async fn record(&self) -> WorkloadResult<WorkerRecord> {
        self.storage()
            .load(&self.inner.key)
            .await?
            .ok_or(WorkloadError::NotInitialized)
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.alarm.is_armed()
    }

    fn arm(&self, delay: Duration) {
        let actor = self.clone();
        self.inner.alarm.arm(delay, async move { actor.fire().await });
    }

    /// Timer callback: clears the persisted alarm and runs one workload cycle.
    async fn fire(self) {
        let _running = self.inner.run_lock.lock().await;
        if self.stopping() {
            return;
        }
        match self.record().await {
            Ok(mut record) => {
                record.alarm_at_ms = None;
                if let Err(e) = self.storage().save(&self.inner.key, &record).await {
                    debug!("Worker {} could not clear alarm: {}", self.inner.address, e);
                }
            }
            Err(e) => debug!("Worker {} fired without state: {}", self.inner.address, e),
        }
        self.run_cycle().await;
    }

    async fn close_session(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn stopping(&self) -> bool {
        self.inner.should_stop.load(Ordering::SeqCst)
    }

    fn storage(&self) -> &dyn ActorStorage {
        self.inner.deps.storage.as_ref()
    }

    fn guard(&self, worker_id: &str) -> OperationGuard {
        OperationGuard::new(
            self.inner.deps.settings.operation_timeout,
            self.inner.deps.reporter.clone(),
            self.inner.address.test_id.clone(),
            worker_id,
        )
    }
}

/// Uniform in `[0, max_delay_ms]`.
fn pick_delay_ms(max_delay_ms: u64) -> u64 {
    if max_delay_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_delay_ms)
}
