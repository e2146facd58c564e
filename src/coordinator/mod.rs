#![forbid(unsafe_code)]

// Coordinator: owns test runs, provisions and stops worker actors, and
// collects the events they report.

pub mod api;
pub mod registry;

use crate::error::StorageError;
use crate::event::{Event, EventReporter};
use crate::metrics::CoordinatorMetrics;
use crate::run::{RunSummary, TestConfig};
use crate::sync::SyncBackend;
use crate::worker::storage::ActorStorage;
use crate::worker::{WorkerAddress, WorkerDeps, WorkerDirectory, WorkerSettings};
use futures_util::future::join_all;
use registry::{CoordinatorSnapshot, RunRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Test {0} already exists")]
    Conflict(String),

    #[error("Test {0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// Outcome of provisioning a test's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub requested: usize,
    pub provisioned: usize,
    pub failed: usize,
}

pub struct Coordinator {
    runs: Arc<RunRegistry>,
    workers: WorkerDirectory,
    metrics: CoordinatorMetrics,
    default_origin: String,
    max_workers: usize,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn ActorStorage>,
        backend: Arc<dyn SyncBackend>,
        settings: WorkerSettings,
        metrics: CoordinatorMetrics,
        default_origin: impl Into<String>,
        max_workers: usize,
    ) -> Self {
        let runs = Arc::new(RunRegistry::new(metrics.clone()));
        let deps = WorkerDeps {
            storage,
            backend,
            reporter: runs.clone(),
            settings,
        };
        Self {
            runs,
            workers: WorkerDirectory::new(deps),
            metrics,
            default_origin: default_origin.into(),
            max_workers,
        }
    }

    pub fn default_origin(&self) -> &str {
        &self.default_origin
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// Creates the run and provisions its workers concurrently.
    ///
    /// Individual worker failures are tolerated: each one is logged, reported
    /// as an error event and counted in the returned report.
    pub async fn start_test(
        &self,
        test_id: &str,
        config: TestConfig,
    ) -> Result<ProvisionReport, CoordinatorError> {
        self.validate(test_id, &config)?;
        if !self.runs.create(test_id, config.clone()) {
            return Err(CoordinatorError::Conflict(test_id.to_string()));
        }
        self.metrics.inc_tests_started();
        info!(
            "Starting test {}: {} workers x {} files within {}ms against {}",
            test_id, config.worker_count, config.file_count, config.start_within_ms, config.target_uri
        );

        let provisions = (0..config.worker_count).map(|index| {
            let address = WorkerAddress::new(test_id, index);
            self.provision(address, &config)
        });
        let results = join_all(provisions).await;

        let provisioned = results.iter().filter(|ok| **ok).count();
        let report = ProvisionReport {
            requested: config.worker_count,
            provisioned,
            failed: config.worker_count - provisioned,
        };
        info!("Test {} provisioned {}/{} workers", test_id, provisioned, config.worker_count);
        Ok(report)
    }

    async fn provision(&self, address: WorkerAddress, config: &TestConfig) -> bool {
        let worker_id = address.worker_id();
        let actor = self.workers.get_or_create(&address);
        let result = async {
            actor
                .start(config.start_within_ms, config.file_count, &worker_id, &config.target_uri)
                .await?;
            actor.work().await
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics.inc_workers_provisioned();
                true
            }
            Err(e) => {
                warn!("Failed to provision worker {}: {}", address, e);
                self.metrics.inc_provision_failures();
                self.runs.report_event(
                    &address.test_id,
                    Event::error(&worker_id, format!("Provisioning failed: {e}")),
                );
                false
            }
        }
    }

    fn validate(&self, test_id: &str, config: &TestConfig) -> Result<(), CoordinatorError> {
        if test_id.is_empty() || test_id.contains('/') {
            return Err(CoordinatorError::Invalid(format!("bad test id {test_id:?}")));
        }
        if config.worker_count > self.max_workers {
            return Err(CoordinatorError::Invalid(format!(
                "{} workers requested, limit is {}",
                config.worker_count, self.max_workers
            )));
        }
        Url::parse(&config.target_uri)
            .map_err(|e| CoordinatorError::Invalid(format!("bad uri {}: {e}", config.target_uri)))?;
        Ok(())
    }

    /// Best-effort stop of workers `0..worker_count`. Returns how many stopped
    /// cleanly. The run, if known, is marked stopped either way.
    pub async fn stop_test(&self, test_id: &str, worker_count: usize) -> usize {
        let stops = (0..worker_count).map(|index| {
            let address = WorkerAddress::new(test_id, index);
            async move {
                let actor = self.workers.get_or_create(&address);
                let result = actor.stop().await;
                self.workers.remove(&address);
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Failed to stop worker {}: {}", address, e);
                        false
                    }
                }
            }
        });
        let stopped = join_all(stops).await.into_iter().filter(|ok| *ok).count();

        if self.runs.mark_stopped(test_id) {
            self.metrics.inc_tests_stopped();
        }
        info!("Stopped test {}: {}/{} workers", test_id, stopped, worker_count);
        stopped
    }

    pub fn report_event(&self, test_id: &str, event: Event) {
        self.runs.report_event(test_id, event);
    }

    /// Forgets every run. Workers keep running; their later events are dropped.
    pub fn reset(&self) {
        let cleared = self.runs.clear();
        info!("Reset coordinator state ({} runs cleared)", cleared);
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.runs.snapshot()
    }

    pub fn summary(&self, test_id: &str) -> Result<RunSummary, CoordinatorError> {
        self.runs
            .summary(test_id)
            .ok_or_else(|| CoordinatorError::NotFound(test_id.to_string()))
    }

    pub fn tests_active(&self) -> usize {
        self.runs.active_count()
    }

    pub fn tests_total(&self) -> usize {
        self.runs.len()
    }

    pub fn workers_live(&self) -> usize {
        self.workers.len()
    }

    /// Re-arms workers persisted by a previous process.
    ///
    /// Each test found in storage gets its run registered again first, so the
    /// events of resumed workers are collected instead of dropped.
    pub async fn recover(&self) -> Result<usize, StorageError> {
        let persisted = self.workers.persisted().await?;

        let mut recovered: BTreeMap<&str, TestConfig> = BTreeMap::new();
        for (address, record) in &persisted {
            let config = recovered.entry(address.test_id.as_str()).or_insert_with(|| TestConfig {
                worker_count: 0,
                file_count: record.file_count,
                start_within_ms: 0,
                target_uri: record.origin_uri.clone(),
            });
            config.worker_count = config.worker_count.max(address.index + 1);
            config.file_count = config.file_count.max(record.file_count);
            config.start_within_ms = config.start_within_ms.max(record.delay_ms);
        }
        for (test_id, config) in recovered {
            if self.runs.create(test_id, config) {
                info!("Recovered run {} from persisted workers", test_id);
            }
        }

        let addresses: Vec<WorkerAddress> = persisted.into_iter().map(|(address, _)| address).collect();
        let resumed = self.workers.resume(&addresses).await;
        debug!("Recovery complete, {} workers resumed", resumed);
        Ok(resumed)
    }

    /// Suspends every live worker, keeping persisted state for `recover`.
    pub async fn shutdown(&self) {
        self.workers.suspend_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::run::RunStatus;
    use crate::sync::{BackendBehavior, MemoryBackend};
    use crate::worker::storage::MemoryStorage;
    use std::time::Duration;

    struct Harness {
        coordinator: Coordinator,
        storage: Arc<MemoryStorage>,
        backend: MemoryBackend,
        metrics: CoordinatorMetrics,
    }

    fn harness() -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let backend = MemoryBackend::new(Some("secret".into()));
        let metrics = CoordinatorMetrics::new();
        let coordinator = Coordinator::new(
            storage.clone(),
            Arc::new(backend.clone()),
            WorkerSettings {
                operation_timeout: Duration::from_secs(10),
                access_secret: Some("secret".into()),
            },
            metrics.clone(),
            "http://localhost:4000",
            100,
        );
        Harness { coordinator, storage, backend, metrics }
    }

    fn config(workers: usize, files: usize, start_within_ms: u64) -> TestConfig {
        TestConfig {
            worker_count: workers,
            file_count: files,
            start_within_ms,
            target_uri: "http://localhost:4000".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_provisions_every_worker() {
        let h = harness();
        let report = h.coordinator.start_test("t1", config(3, 1, 1_000)).await.unwrap();
        assert_eq!(report, ProvisionReport { requested: 3, provisioned: 3, failed: 0 });
        assert_eq!(h.coordinator.workers_live(), 3);
        assert_eq!(h.storage.len(), 3);

        tokio::time::sleep(Duration::from_secs(2)).await;
        for index in 0..3 {
            assert_eq!(h.backend.files_owned_by(&format!("t1-{index}")).len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_run_reports_operations_without_errors() {
        let h = harness();
        h.coordinator.start_test("t1", config(1, 1, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = h.coordinator.snapshot();
        let events = &snapshot.tests["t1"].events;
        let ops = events.iter().filter(|e| e.kind == EventKind::Operation).count();
        assert!(ops >= 4, "{events:?}");
        assert_eq!(events.iter().filter(|e| e.error.is_some()).count(), 0);
        assert!(events.iter().all(|e| e.worker_id == "t1-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_conflict() {
        let h = harness();
        h.coordinator.start_test("t1", config(1, 0, 0)).await.unwrap();
        let again = h.coordinator.start_test("t1", config(1, 0, 0)).await;
        assert_eq!(again, Err(CoordinatorError::Conflict("t1".into())));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_creating_run() {
        let h = harness();
        let too_many = h.coordinator.start_test("t1", config(101, 1, 0)).await;
        assert!(matches!(too_many, Err(CoordinatorError::Invalid(_))));

        let mut bad_uri = config(1, 1, 0);
        bad_uri.target_uri = "not a uri".into();
        assert!(matches!(h.coordinator.start_test("t1", bad_uri).await, Err(CoordinatorError::Invalid(_))));
        assert!(matches!(h.coordinator.start_test("a/b", config(1, 1, 0)).await, Err(CoordinatorError::Invalid(_))));
        assert_eq!(h.coordinator.tests_total(), 0);
    }

    #[tokio::test]
    async fn test_partial_provisioning_is_reported() {
        let h = harness();
        h.storage.set_unavailable(true);
        let report = h.coordinator.start_test("t1", config(2, 1, 0)).await.unwrap();
        assert_eq!(report, ProvisionReport { requested: 2, provisioned: 0, failed: 2 });

        let snapshot = h.coordinator.snapshot();
        let errors: Vec<_> = snapshot.tests["t1"]
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].error.as_deref().unwrap().starts_with("Provisioning failed"));
        let metrics = h.metrics.render_prometheus(1, 2);
        assert!(metrics.contains("syncstress_worker_provision_failures_total 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_workers() {
        let h = harness();
        h.coordinator.start_test("t1", config(4, 1, 5_000)).await.unwrap();
        let stopped = h.coordinator.stop_test("t1", 4).await;
        assert_eq!(stopped, 4);
        assert_eq!(h.coordinator.workers_live(), 0);
        assert!(h.storage.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.backend.sessions_opened(), 0);
        let snapshot = h.coordinator.snapshot();
        assert_eq!(snapshot.tests["t1"].status, RunStatus::Stopped);
        assert_eq!(h.coordinator.tests_active(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_test_is_harmless() {
        let h = harness();
        assert_eq!(h.coordinator.stop_test("nope", 2).await, 2);
        assert_eq!(h.coordinator.tests_total(), 0);
        assert_eq!(h.coordinator.workers_live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_runs_but_not_workers() {
        let h = harness();
        h.coordinator.start_test("t1", config(1, 1, 1_000)).await.unwrap();
        h.coordinator.reset();
        assert!(h.coordinator.snapshot().tests.is_empty());
        assert_eq!(h.coordinator.workers_live(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.backend.files_owned_by("t1-0").len(), 1);
        assert!(h.coordinator.snapshot().tests.is_empty());
        assert!(h.metrics.events_dropped() > 0);
    }

    #[tokio::test]
    async fn test_summary_of_unknown_test_is_not_found() {
        let h = harness();
        assert_eq!(h.coordinator.summary("t9").unwrap_err(), CoordinatorError::NotFound("t9".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_show_up_in_summary() {
        let h = harness();
        h.backend.set_behavior(BackendBehavior {
            reject_code: Some(500),
            ..Default::default()
        });
        h.coordinator.start_test("t1", config(2, 1, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = h.coordinator.summary("t1").unwrap();
        assert_eq!(summary.workers_reporting, 2);
        assert!(summary.error_events >= 2);
        assert_eq!(summary.operations["create user"].count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_then_recover_resumes_pending_workers() {
        let h = harness();
        h.coordinator.start_test("t1", config(2, 1, 1_000)).await.unwrap();
        h.coordinator.shutdown().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.backend.sessions_opened(), 0);

        let restarted = Coordinator::new(
            h.storage.clone(),
            Arc::new(h.backend.clone()),
            WorkerSettings {
                operation_timeout: Duration::from_secs(10),
                access_secret: Some("secret".into()),
            },
            CoordinatorMetrics::new(),
            "http://localhost:4000",
            100,
        );
        assert_eq!(restarted.recover().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.backend.file_count(), 2);

        let snapshot = restarted.snapshot();
        let run = &snapshot.tests["t1"];
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.config.worker_count, 2);
        assert_eq!(run.config.file_count, 1);
        assert_eq!(run.config.target_uri, "http://localhost:4000");
        assert!(run.config.start_within_ms <= 1_000);
        let files = run
            .events
            .iter()
            .filter(|e| e.operation.as_deref() == Some("create file"))
            .count();
        assert_eq!(files, 2);
        assert!(run.events.iter().all(|e| e.error.is_none()), "{:?}", run.events);
        assert_eq!(restarted.tests_active(), 1);
        assert_eq!(restarted.metrics().events_dropped(), 0);

        assert_eq!(restarted.stop_test("t1", run.config.worker_count).await, 2);
        assert!(h.storage.is_empty());
    }
}
