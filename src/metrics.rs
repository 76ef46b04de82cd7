// Worker traffic metrics
//
// Lightweight counters for the command channel, the diagnostic stream and
// per-file processing outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared between the host, the command channel and the classifier
///
/// Uses atomic operations so the background classifier task can record
/// without taking any lock the command path might hold.
#[derive(Debug)]
pub struct Metrics {
    /// Commands written to the worker
    pub commands_sent: AtomicU64,

    /// Responses with `status: ok`
    pub responses_ok: AtomicU64,

    /// Responses with `status: error`
    pub responses_error: AtomicU64,

    /// Stdout lines that were not protocol responses
    pub discarded_lines: AtomicU64,

    pub timeouts: AtomicU64,
    pub cancellations: AtomicU64,

    /// Diagnostic lines classified as progress
    pub progress_events: AtomicU64,

    /// Diagnostic lines forwarded to the log
    pub worker_log_lines: AtomicU64,

    pub files_processed: AtomicU64,
    pub files_failed: AtomicU64,

    /// Total processing time in milliseconds
    pub total_processing_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            commands_sent: AtomicU64::new(0),
            responses_ok: AtomicU64::new(0),
            responses_error: AtomicU64::new(0),
            discarded_lines: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            progress_events: AtomicU64::new(0),
            worker_log_lines: AtomicU64::new(0),
            files_processed: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            total_processing_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, ok: bool) {
        if ok {
            self.responses_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.responses_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_discarded_line(&self) {
        self.discarded_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_progress_event(&self) {
        self.progress_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_log_line(&self) {
        self.worker_log_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished file, successful or not
    pub fn record_file(&self, success: bool, duration: Duration) {
        if success {
            self.files_processed.fetch_add(1, Ordering::Relaxed);
            self.total_processing_time_ms
                .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        } else {
            self.files_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average processing time per successful file in milliseconds
    pub fn avg_processing_time_ms(&self) -> f64 {
        let total = self.total_processing_time_ms.load(Ordering::Relaxed);
        let count = self.files_processed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Worker Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Commands: {} sent, {} ok, {} error, {} timed out, {} cancelled",
            self.commands_sent.load(Ordering::Relaxed),
            self.responses_ok.load(Ordering::Relaxed),
            self.responses_error.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.cancellations.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Worker output: {} discarded stdout lines, {} progress events, {} log lines",
            self.discarded_lines.load(Ordering::Relaxed),
            self.progress_events.load(Ordering::Relaxed),
            self.worker_log_lines.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Files: {} processed, {} failed (avg: {:.0}ms per file)",
            self.files_processed.load(Ordering::Relaxed),
            self.files_failed.load(Ordering::Relaxed),
            self.avg_processing_time_ms()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
