use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use ocrgate_core::{OcrError, RequestStatus};

/// Where a request is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Normalizing,
    Queued,
    Executing,
    Completed,
    PartiallyFailed,
    /// Non-validation fault before execution (backend load failure,
    /// internal error).
    Failed,
    TimedOut,
    /// Caller fault or overload, always before execution.
    Rejected,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::PartiallyFailed
                | RequestState::Failed
                | RequestState::TimedOut
                | RequestState::Rejected
        )
    }

    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Normalizing)
                | (Normalizing, Queued)
                | (Queued, Executing)
                | (Received | Normalizing | Queued, Rejected | Failed)
                | (Executing, Completed | PartiallyFailed | TimedOut)
        )
    }
}

impl From<RequestStatus> for RequestState {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Completed => RequestState::Completed,
            RequestStatus::PartiallyFailed => RequestState::PartiallyFailed,
            RequestStatus::TimedOut => RequestState::TimedOut,
        }
    }
}

/// Live and cumulative request counts by state.
#[derive(Debug, Default)]
pub struct PhaseCounters {
    received: AtomicUsize,
    normalizing: AtomicUsize,
    queued: AtomicUsize,
    executing: AtomicUsize,
    completed: AtomicU64,
    partially_failed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseSnapshot {
    pub received: usize,
    pub normalizing: usize,
    pub queued: usize,
    pub executing: usize,
    pub completed: u64,
    pub partially_failed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    /// Requests dropped by the caller before reaching a terminal state.
    pub abandoned: u64,
}

impl PhaseCounters {
    fn live(&self, state: RequestState) -> Option<&AtomicUsize> {
        match state {
            RequestState::Received => Some(&self.received),
            RequestState::Normalizing => Some(&self.normalizing),
            RequestState::Queued => Some(&self.queued),
            RequestState::Executing => Some(&self.executing),
            _ => None,
        }
    }

    fn total(&self, state: RequestState) -> Option<&AtomicU64> {
        match state {
            RequestState::Completed => Some(&self.completed),
            RequestState::PartiallyFailed => Some(&self.partially_failed),
            RequestState::Failed => Some(&self.failed),
            RequestState::TimedOut => Some(&self.timed_out),
            RequestState::Rejected => Some(&self.rejected),
            _ => None,
        }
    }

    fn enter(&self, state: RequestState) {
        if let Some(c) = self.live(state) {
            c.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(c) = self.total(state) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn leave(&self, state: RequestState) {
        if let Some(c) = self.live(state) {
            c.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            received: self.received.load(Ordering::Acquire),
            normalizing: self.normalizing.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            executing: self.executing.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Relaxed),
            partially_failed: self.partially_failed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one request through its states, keeping [`PhaseCounters`]
/// accurate even when the request future is dropped midway.
pub struct RequestLifecycle {
    id: Uuid,
    state: RequestState,
    counters: Arc<PhaseCounters>,
}

impl RequestLifecycle {
    pub fn begin(counters: Arc<PhaseCounters>) -> Self {
        counters.enter(RequestState::Received);
        Self {
            id: Uuid::new_v4(),
            state: RequestState::Received,
            counters,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: RequestState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                request_id = %self.id,
                from = ?self.state,
                to = ?next,
                "illegal request state transition"
            );
            return false;
        }
        self.counters.leave(self.state);
        self.counters.enter(next);
        tracing::trace!(request_id = %self.id, from = ?self.state, to = ?next, "request state");
        self.state = next;
        true
    }

    /// Record a pre-execution error as `Rejected` (caller fault or
    /// overload) or `Failed` (anything else) and hand it back.
    pub fn terminate(&mut self, err: OcrError) -> OcrError {
        let next = if err.is_client_error() || matches!(err, OcrError::Overloaded { .. }) {
            RequestState::Rejected
        } else {
            RequestState::Failed
        };
        self.advance(next);
        err
    }
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.counters.leave(self.state);
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_id = %self.id, state = ?self.state, "request abandoned");
        }
    }
}
