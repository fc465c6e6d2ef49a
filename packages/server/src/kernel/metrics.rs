//! Prometheus metrics surface.
//!
//! Counters are recorded where the work happens; process-level gauges are
//! refreshed at scrape time by the `/metrics` route.

use std::time::Instant;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const WORKER_UPTIME_SECONDS: &str = "worker_uptime_seconds";
pub const WORKER_PROCESSED_TOTAL: &str = "worker_processed_total";
pub const WORKER_ERRORS_TOTAL: &str = "worker_errors_total";
pub const WORKER_QUEUE_DEPTH: &str = "worker_queue_depth";
pub const WORKER_MEMORY_HEAP_USED_BYTES: &str = "worker_memory_heap_used_bytes";
pub const OUTBOX_UNSENT: &str = "outbox_unsent";
pub const STEP_DURATION_SECONDS: &str = "step_duration_seconds";
pub const STEPS_TOTAL: &str = "steps_total";

/// Install the process-wide recorder and return the render handle.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    // Materialize the worker counters so scrapes see them at zero before
    // the first message arrives.
    counter!(WORKER_PROCESSED_TOTAL).absolute(0);
    counter!(WORKER_ERRORS_TOTAL).absolute(0);
    Ok(handle)
}

/// Refresh gauges that are sampled rather than event-driven.
pub fn refresh_process_gauges(started_at: Instant, queue_depth: u64) {
    gauge!(WORKER_UPTIME_SECONDS).set(started_at.elapsed().as_secs_f64());
    gauge!(WORKER_QUEUE_DEPTH).set(queue_depth as f64);
    gauge!(WORKER_MEMORY_HEAP_USED_BYTES).set(heap_used_bytes() as f64);
}

/// Resident data-segment size of this process, in bytes.
#[cfg(target_os = "linux")]
fn heap_used_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(5)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn heap_used_bytes() -> u64 {
    0
}
