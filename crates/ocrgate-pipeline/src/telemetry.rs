use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use ocrgate_core::{FrameResult, RequestStatus};

/// Aggregated accelerator telemetry, readable without taking the
/// execution mutex.
#[derive(Debug, Default)]
pub struct GuardTelemetry {
    frames_succeeded: AtomicU64,
    frames_failed: AtomicU64,
    retries: AtomicU64,
    exhaustion_events: AtomicU64,
    cleanup_passes: AtomicU64,
    requests_completed: AtomicU64,
    requests_partially_failed: AtomicU64,
    requests_timed_out: AtomicU64,
    requests_cancelled: AtomicU64,
    rejections: AtomicU64,
    busy_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub frames_succeeded: u64,
    pub frames_failed: u64,
    pub retries: u64,
    pub exhaustion_events: u64,
    pub cleanup_passes: u64,
    pub requests_completed: u64,
    pub requests_partially_failed: u64,
    pub requests_timed_out: u64,
    pub requests_cancelled: u64,
    pub rejections: u64,
    pub busy_ms: u64,
}

impl GuardTelemetry {
    pub fn record_frame(&self, result: &FrameResult) {
        let outcome = if result.outcome.is_success() {
            self.frames_succeeded.fetch_add(1, Ordering::Relaxed);
            "text"
        } else {
            self.frames_failed.fetch_add(1, Ordering::Relaxed);
            "failed"
        };
        let retries = u64::from(result.metrics.retries);
        self.retries.fetch_add(retries, Ordering::Relaxed);

        metrics::counter!("ocrgate_frames_total", "outcome" => outcome).increment(1);
        metrics::counter!("ocrgate_frame_retries_total").increment(retries);
    }

    pub fn record_exhaustion(&self) {
        self.exhaustion_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self) {
        self.cleanup_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, status: RequestStatus, busy: Duration) {
        let counter = match status {
            RequestStatus::Completed => &self.requests_completed,
            RequestStatus::PartiallyFailed => &self.requests_partially_failed,
            RequestStatus::TimedOut => &self.requests_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.busy_micros
            .fetch_add(busy.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, busy: Duration) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        self.busy_micros
            .fetch_add(busy.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ocrgate_rejections_total", "reason" => "overloaded").increment(1);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            frames_succeeded: load(&self.frames_succeeded),
            frames_failed: load(&self.frames_failed),
            retries: load(&self.retries),
            exhaustion_events: load(&self.exhaustion_events),
            cleanup_passes: load(&self.cleanup_passes),
            requests_completed: load(&self.requests_completed),
            requests_partially_failed: load(&self.requests_partially_failed),
            requests_timed_out: load(&self.requests_timed_out),
            requests_cancelled: load(&self.requests_cancelled),
            rejections: load(&self.rejections),
            busy_ms: load(&self.busy_micros) / 1000,
        }
    }
}
