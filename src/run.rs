#![forbid(unsafe_code)]

// Test run state and per-run aggregation

use crate::event::{now_ms, Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Immutable configuration for one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    pub worker_count: usize,
    pub file_count: usize,
    pub start_within_ms: u64,
    pub target_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub test_id: String,
    pub config: TestConfig,
    pub status: RunStatus,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
    /// Append-only, in arrival order
    pub events: Vec<Event>,
}

impl TestRun {
    pub fn new(test_id: String, config: TestConfig) -> Self {
        Self {
            test_id,
            config,
            status: RunStatus::Running,
            started_at_ms: now_ms(),
            stopped_at_ms: None,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Marks the run stopped. Returns false if it was already stopped.
    pub fn stop(&mut self) -> bool {
        if self.status == RunStatus::Stopped {
            return false;
        }
        self.status = RunStatus::Stopped;
        self.stopped_at_ms = Some(now_ms());
        true
    }

    pub fn failures(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.is_failure())
    }

    pub fn summary(&self) -> RunSummary {
        let mut samples: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut workers = HashSet::new();
        let mut timeouts = 0;

        for event in &self.events {
            workers.insert(event.worker_id.as_str());
            if event.kind != EventKind::Operation {
                continue;
            }
            if event.error.as_deref().is_some_and(|e| e.starts_with("Timeout:")) {
                timeouts += 1;
            }
            if let (Some(op), Some(ms)) = (&event.operation, event.duration_ms) {
                samples.entry(op.clone()).or_default().push(ms);
            }
        }

        let operations = samples
            .into_iter()
            .map(|(op, samples)| (op, LatencyStats::from_samples(samples)))
            .collect();

        RunSummary {
            test_id: self.test_id.clone(),
            status: self.status,
            total_events: self.events.len(),
            error_events: self.failures().count(),
            timeouts,
            workers_reporting: workers.len(),
            operations,
        }
    }
}

/// Latency statistics for a single operation name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    pub fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let count = samples.len();
        Self {
            count,
            min_ms: samples[0],
            max_ms: samples[count - 1],
            avg_ms: samples.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub test_id: String,
    pub status: RunStatus,
    pub total_events: usize,
    pub error_events: usize,
    pub timeouts: usize,
    pub workers_reporting: usize,
    pub operations: BTreeMap<String, LatencyStats>,
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
