use metrics::{counter, histogram, Counter, Histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Run counters.
///
/// Every event goes to the `metrics` facade (a no-op unless the embedding
/// application installs a recorder) and to local atomics so a run can report
/// its own numbers through [`Metrics::snapshot`].
pub struct Metrics {
    captures: Counter,
    capture_failures: Counter,
    retakes: Counter,
    optimization_failures: Counter,
    screenshots_failed: Counter,
    uploads: Counter,
    upload_failures: Counter,
    failovers: Counter,
    upload_duration: Histogram,
    local: LocalCounters,
    start_time: Instant,
}

#[derive(Default)]
struct LocalCounters {
    captures: AtomicU64,
    capture_failures: AtomicU64,
    retakes: AtomicU64,
    optimization_failures: AtomicU64,
    screenshots_failed: AtomicU64,
    uploads: AtomicU64,
    upload_failures: AtomicU64,
    failovers: AtomicU64,
    upload_micros: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures: counter!("release_screens_captures_total"),
            capture_failures: counter!("release_screens_capture_failures_total"),
            retakes: counter!("release_screens_retakes_total"),
            optimization_failures: counter!("release_screens_optimization_failures_total"),
            screenshots_failed: counter!("release_screens_screenshots_failed_total"),
            uploads: counter!("release_screens_uploads_total"),
            upload_failures: counter!("release_screens_upload_failures_total"),
            failovers: counter!("release_screens_host_failovers_total"),
            upload_duration: histogram!("release_screens_upload_duration_seconds"),
            local: LocalCounters::default(),
            start_time: Instant::now(),
        }
    }

    pub fn record_capture(&self, success: bool) {
        if success {
            self.captures.increment(1);
            self.local.captures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.capture_failures.increment(1);
            self.local.capture_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retake(&self) {
        self.retakes.increment(1);
        self.local.retakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_optimization_failure(&self) {
        self.optimization_failures.increment(1);
        self.local.optimization_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A screenshot that ran out of retakes.
    pub fn record_screenshot_failed(&self) {
        self.screenshots_failed.increment(1);
        self.local.screenshots_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, duration: Duration, success: bool) {
        if success {
            self.uploads.increment(1);
            self.local.uploads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.upload_failures.increment(1);
            self.local.upload_failures.fetch_add(1, Ordering::Relaxed);
        }

        self.upload_duration.record(duration.as_secs_f64());
        self.local
            .upload_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.increment(1);
        self.local.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uploads = self.local.uploads.load(Ordering::Relaxed);
        let upload_failures = self.local.upload_failures.load(Ordering::Relaxed);
        let attempts = uploads + upload_failures;
        let average_upload_duration = if attempts > 0 {
            Duration::from_micros(self.local.upload_micros.load(Ordering::Relaxed) / attempts)
        } else {
            Duration::ZERO
        };

        MetricsSnapshot {
            captures: self.local.captures.load(Ordering::Relaxed),
            capture_failures: self.local.capture_failures.load(Ordering::Relaxed),
            retakes: self.local.retakes.load(Ordering::Relaxed),
            optimization_failures: self.local.optimization_failures.load(Ordering::Relaxed),
            screenshots_failed: self.local.screenshots_failed.load(Ordering::Relaxed),
            uploads,
            upload_failures,
            failovers: self.local.failovers.load(Ordering::Relaxed),
            average_upload_duration,
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub captures: u64,
    pub capture_failures: u64,
    pub retakes: u64,
    pub optimization_failures: u64,
    pub screenshots_failed: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    pub failovers: u64,
    pub average_upload_duration: Duration,
    pub uptime: Duration,
}
