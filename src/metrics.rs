#![forbid(unsafe_code)]

// Coordinator metrics - lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds. The top bucket sits at the
/// default operation timeout so timed-out operations land just past it.
const BUCKET_BOUNDS_MS: [u64; 10] = [
    10,      // 10ms
    25,      // 25ms
    50,      // 50ms
    100,     // 100ms
    250,     // 250ms
    500,     // 500ms
    1_000,   // 1s
    2_500,   // 2.5s
    5_000,   // 5s
    10_000,  // 10s
];

const BUCKET_LABELS: [&str; 10] = [
    "0.01", "0.025", "0.05", "0.1", "0.25",
    "0.5", "1", "2.5", "5", "10",
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_MS[i]
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    pub fn observe_ms(&self, ms: u64) {
        self.sum_ms.fetch_add(ms, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            if ms <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_ms = self.sum_ms.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:03}", sum_ms / 1_000, sum_ms % 1_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Coordinator-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct CoordinatorMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    tests_started_total: AtomicU64,
    tests_stopped_total: AtomicU64,
    workers_provisioned_total: AtomicU64,
    worker_provision_failures_total: AtomicU64,
    events_total: AtomicU64,
    error_events_total: AtomicU64,
    events_dropped_total: AtomicU64,

    operation_duration: Histogram,
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tests_started_total: AtomicU64::new(0),
                tests_stopped_total: AtomicU64::new(0),
                workers_provisioned_total: AtomicU64::new(0),
                worker_provision_failures_total: AtomicU64::new(0),
                events_total: AtomicU64::new(0),
                error_events_total: AtomicU64::new(0),
                events_dropped_total: AtomicU64::new(0),
                operation_duration: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_tests_started(&self) {
        self.inner.tests_started_total.fetch_add(1, Relaxed);
    }

    pub fn inc_tests_stopped(&self) {
        self.inner.tests_stopped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_workers_provisioned(&self) {
        self.inner.workers_provisioned_total.fetch_add(1, Relaxed);
    }

    pub fn inc_provision_failures(&self) {
        self.inner.worker_provision_failures_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_dropped(&self) {
        self.inner.events_dropped_total.fetch_add(1, Relaxed);
    }

    /// Counts an accepted event and feeds its duration into the histogram.
    pub fn record_event(&self, duration: Option<Duration>, failed: bool) {
        self.inner.events_total.fetch_add(1, Relaxed);
        if failed {
            self.inner.error_events_total.fetch_add(1, Relaxed);
        }
        if let Some(duration) = duration {
            self.inner.operation_duration.observe_ms(duration.as_millis() as u64);
        }
    }

    pub fn events_dropped(&self) -> u64 {
        self.inner.events_dropped_total.load(Relaxed)
    }

    // --- Prometheus rendering ---

    /// `tests_active` and `workers_live` are on-demand gauges supplied by the coordinator.
    pub fn render_prometheus(&self, tests_active: usize, workers_live: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "syncstress_tests_started_total", "Total test runs started", i.tests_started_total.load(Relaxed));
        render_counter(&mut out, "syncstress_tests_stopped_total", "Total test runs stopped", i.tests_stopped_total.load(Relaxed));
        render_counter(&mut out, "syncstress_workers_provisioned_total", "Total workers provisioned", i.workers_provisioned_total.load(Relaxed));
        render_counter(&mut out, "syncstress_worker_provision_failures_total", "Total workers that failed to provision", i.worker_provision_failures_total.load(Relaxed));
        render_counter(&mut out, "syncstress_events_total", "Total events accepted", i.events_total.load(Relaxed));
        render_counter(&mut out, "syncstress_error_events_total", "Total accepted events carrying an error", i.error_events_total.load(Relaxed));
        render_counter(&mut out, "syncstress_events_dropped_total", "Total events dropped for unknown tests", i.events_dropped_total.load(Relaxed));

        render_gauge(&mut out, "syncstress_tests_active", "Test runs currently running", tests_active as u64);
        render_gauge(&mut out, "syncstress_workers_live", "Worker actors currently live", workers_live as u64);

        i.operation_duration.render(
            "syncstress_operation_duration_seconds",
            "Worker operation latency in seconds",
            &mut out,
        );

        out
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
