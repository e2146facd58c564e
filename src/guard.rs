#![forbid(unsafe_code)]

// Timed-operation guard - races an action against a fixed timeout and reports
// exactly one operation event per call, whatever the outcome.

use crate::error::{WorkloadError, WorkloadResult};
use crate::event::{Event, EventReporter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default bound for every guarded operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct OperationGuard {
    timeout: Duration,
    reporter: Arc<dyn EventReporter>,
    test_id: String,
    worker_id: String,
}

impl OperationGuard {
    pub fn new(
        timeout: Duration,
        reporter: Arc<dyn EventReporter>,
        test_id: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            timeout,
            reporter,
            test_id: test_id.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Runs `action` bounded by the guard's timeout.
    ///
    /// The action is spawned as its own task. If the timer wins, the task is
    /// detached rather than cancelled and may still finish in the background;
    /// only the caller stops waiting for it.
    pub async fn run<T, F>(&self, operation: &str, action: F) -> WorkloadResult<T>
    where
        F: Future<Output = WorkloadResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let mut task = tokio::spawn(action);

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(WorkloadError::Panicked(e.to_string())),
            },
            _ = tokio::time::sleep(self.timeout) => {
                debug!("{}: {} exceeded {}ms", self.worker_id, operation, self.timeout.as_millis());
                Err(WorkloadError::Timeout(operation.to_string()))
            }
        };
        drop(task);

        let error = outcome.as_ref().err().map(ToString::to_string);
        self.reporter.report_event(
            &self.test_id,
            Event::operation(&self.worker_id, operation, started.elapsed(), error),
        );
        outcome
    }
}
