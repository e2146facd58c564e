#![forbid(unsafe_code)]

// Run registry: the coordinator's shared record of every test run.
//
// Workers hold an `Arc<RunRegistry>` as their event sink, so the registry is
// the only piece of coordinator state they can reach.

use crate::event::{Event, EventReporter};
use crate::metrics::CoordinatorMetrics;
use crate::run::{RunStatus, RunSummary, TestConfig, TestRun};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tracing::debug;

/// Point-in-time copy of every run, as served by `GET /state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub tests: HashMap<String, TestRun>,
}

pub struct RunRegistry {
    runs: StdRwLock<HashMap<String, TestRun>>,
    metrics: CoordinatorMetrics,
}

impl RunRegistry {
    pub fn new(metrics: CoordinatorMetrics) -> Self {
        Self {
            runs: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Registers a new run. Returns false if the id is taken.
    pub fn create(&self, test_id: &str, config: TestConfig) -> bool {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        if runs.contains_key(test_id) {
            return false;
        }
        runs.insert(test_id.to_string(), TestRun::new(test_id.to_string(), config));
        true
    }

    /// Returns true if the run existed and was running.
    pub fn mark_stopped(&self, test_id: &str) -> bool {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        runs.get_mut(test_id).is_some_and(|run| run.stop())
    }

    pub fn clear(&self) -> usize {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        let count = runs.len();
        runs.clear();
        count
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            tests: self.runs.read().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn summary(&self, test_id: &str) -> Option<RunSummary> {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).get(test_id).map(TestRun::summary)
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|run| run.status == RunStatus::Running)
            .count()
    }
}

impl EventReporter for RunRegistry {
    fn report_event(&self, test_id: &str, event: Event) {
        let duration = event.duration_ms.map(Duration::from_millis);
        let failed = event.is_failure();
        let worker_id = event.worker_id.clone();

        let accepted = match self.runs.write().unwrap_or_else(|e| e.into_inner()).get_mut(test_id) {
            Some(run) => {
                run.push(event);
                true
            }
            None => false,
        };

        if accepted {
            self.metrics.record_event(duration, failed);
        } else {
            debug!("Dropping event from {} for unknown test {}", worker_id, test_id);
            self.metrics.inc_events_dropped();
        }
    }
}
