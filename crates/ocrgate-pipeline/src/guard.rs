use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ocrgate_core::{
    BackendMetrics, DocumentId, FailureReason, Frame, FrameError, FrameMetrics, FrameOutcome,
    FrameResult, OcrError, RecognitionOptions, RecognitionResult, RequestStatus, Result, TimingInfo,
};
use ocrgate_device::DeviceContext;

use crate::backend::{panic_message, Backend, FrameContext};
use crate::config::GuardConfig;
use crate::retry::{RetryState, RetryStep};
use crate::telemetry::{GuardTelemetry, TelemetrySnapshot};

/// Work handed to the guard: one document's frames for one backend.
#[derive(Debug)]
pub struct RecognitionRequest {
    pub document_id: DocumentId,
    pub backend: String,
    /// Frames in page order.
    pub frames: Vec<Frame>,
    pub options: RecognitionOptions,
    /// Checked between frames, never mid-frame.
    pub deadline: Option<Instant>,
}

/// Accelerator state owned by whoever holds the execution mutex.
#[derive(Debug, Default)]
pub struct GuardState {
    occupancy: u64,
    peak_occupancy: u64,
    holder: Option<u64>,
    executions: u64,
}

/// Non-blocking view of the guard for health reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardSnapshot {
    pub busy: bool,
    /// Ticket of the request holding the accelerator.
    pub holder: Option<u64>,
    pub occupancy_bytes: u64,
    pub peak_occupancy_bytes: u64,
    pub executions: u64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
}

/// Serializes all accelerator-bound work behind one process-wide mutex.
///
/// Waiters are served in arrival order (`tokio::sync::Mutex` is fair). A
/// bounded counter in front of the mutex turns excess waiters away with
/// [`OcrError::Overloaded`] instead of letting the queue grow.
#[derive(Clone)]
pub struct AcceleratorGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    device: Arc<DeviceContext>,
    config: GuardConfig,
    exec: Arc<Mutex<GuardState>>,
    max_queue_depth: usize,
    queue_depth: AtomicUsize,
    next_ticket: AtomicU64,
    // Copies of GuardState published by the mutex holder.
    busy: AtomicBool,
    holder: AtomicU64,
    occupancy: AtomicU64,
    peak_occupancy: AtomicU64,
    executions: AtomicU64,
    telemetry: GuardTelemetry,
}

impl AcceleratorGuard {
    pub fn new(device: Arc<DeviceContext>, config: GuardConfig, max_queue_depth: usize) -> Self {
        let occupancy = device.occupancy();
        Self {
            inner: Arc::new(GuardInner {
                device,
                config,
                exec: Arc::new(Mutex::new(GuardState {
                    occupancy,
                    peak_occupancy: occupancy,
                    ..GuardState::default()
                })),
                max_queue_depth,
                queue_depth: AtomicUsize::new(0),
                next_ticket: AtomicU64::new(1),
                busy: AtomicBool::new(false),
                holder: AtomicU64::new(0),
                occupancy: AtomicU64::new(occupancy),
                peak_occupancy: AtomicU64::new(occupancy),
                executions: AtomicU64::new(0),
                telemetry: GuardTelemetry::default(),
            }),
        }
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.inner.device
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    /// Requests currently waiting for the execution mutex.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth.load(Ordering::Acquire)
    }

    pub fn max_queue_depth(&self) -> usize {
        self.inner.max_queue_depth
    }

    /// Take a place in the wait queue, or fail with `Overloaded` without
    /// blocking when the queue is full.
    pub fn enqueue(&self) -> Result<QueueSlot> {
        let limit = self.inner.max_queue_depth;
        let mut depth = self.inner.queue_depth.load(Ordering::Acquire);
        loop {
            if depth >= limit {
                self.inner.telemetry.record_rejection();
                tracing::warn!(depth, limit, "accelerator queue full, rejecting request");
                return Err(OcrError::Overloaded { depth, limit });
            }
            match self.inner.queue_depth.compare_exchange_weak(
                depth,
                depth + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => depth = current,
            }
        }
        metrics::gauge!("ocrgate_queue_depth").set((depth + 1) as f64);

        Ok(QueueSlot {
            guard: self.clone(),
            ticket: self.inner.next_ticket.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
            waiting: true,
        })
    }

    /// Enqueue, wait for the accelerator and run `request` on `backend`.
    pub async fn execute(
        &self,
        backend: Arc<dyn Backend>,
        request: RecognitionRequest,
    ) -> Result<RecognitionResult> {
        let slot = self.enqueue()?;
        let permit = slot.acquire().await;
        permit.run(backend, request).await
    }

    /// Run `f` on a blocking thread while holding the execution mutex, after
    /// any in-flight execution has finished. Bypasses the wait-queue bound.
    ///
    /// Backend loads and unloads go through here, so device allocations
    /// never overlap a running frame. Occupancy is republished afterwards.
    pub async fn exclusive<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut state = self.inner.exec.clone().lock_owned().await;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let out = f();
            let occupancy = inner.device.occupancy();
            state.occupancy = occupancy;
            state.peak_occupancy = state.peak_occupancy.max(occupancy);
            inner.publish(&state);
            out
        })
        .await
        .map_err(|e| OcrError::Internal(format!("exclusive task failed: {e}")))
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let inner = &self.inner;
        let holder = inner.holder.load(Ordering::Acquire);
        GuardSnapshot {
            busy: inner.busy.load(Ordering::Acquire),
            holder: (holder != 0).then_some(holder),
            occupancy_bytes: inner.occupancy.load(Ordering::Acquire),
            peak_occupancy_bytes: inner.peak_occupancy.load(Ordering::Acquire),
            executions: inner.executions.load(Ordering::Acquire),
            queue_depth: self.queue_depth(),
            max_queue_depth: inner.max_queue_depth,
        }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }
}

impl GuardInner {
    fn publish(&self, state: &GuardState) {
        self.busy.store(state.holder.is_some(), Ordering::Release);
        self.holder.store(state.holder.unwrap_or(0), Ordering::Release);
        self.occupancy.store(state.occupancy, Ordering::Release);
        self.peak_occupancy.store(state.peak_occupancy, Ordering::Release);
        self.executions.store(state.executions, Ordering::Release);
    }
}

/// A place in the accelerator wait queue.
///
/// Dropping the slot (or the future of [`QueueSlot::acquire`]) leaves the
/// queue with no other side effect.
pub struct QueueSlot {
    guard: AcceleratorGuard,
    ticket: u64,
    enqueued_at: Instant,
    waiting: bool,
}

impl QueueSlot {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Wait for the execution mutex.
    pub async fn acquire(mut self) -> ExecutionPermit {
        let state = self.guard.inner.exec.clone().lock_owned().await;
        self.leave();
        ExecutionPermit::new(
            self.guard.clone(),
            state,
            self.ticket,
            self.enqueued_at.elapsed(),
        )
    }

    fn leave(&mut self) {
        if std::mem::take(&mut self.waiting) {
            let depth = self.guard.inner.queue_depth.fetch_sub(1, Ordering::AcqRel) - 1;
            metrics::gauge!("ocrgate_queue_depth").set(depth as f64);
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if self.waiting {
            tracing::debug!(ticket = self.ticket, "queued request cancelled");
        }
        self.leave();
    }
}

/// Exclusive hold on the accelerator. Released on drop.
pub struct ExecutionPermit {
    guard: AcceleratorGuard,
    state: OwnedMutexGuard<GuardState>,
    ticket: u64,
    queue_wait: Duration,
}

impl ExecutionPermit {
    fn new(
        guard: AcceleratorGuard,
        mut state: OwnedMutexGuard<GuardState>,
        ticket: u64,
        queue_wait: Duration,
    ) -> Self {
        state.holder = Some(ticket);
        state.executions += 1;
        guard.inner.publish(&state);
        tracing::debug!(
            ticket,
            queue_wait_ms = queue_wait.as_secs_f32() * 1000.0,
            "accelerator acquired"
        );
        Self {
            guard,
            state,
            ticket,
            queue_wait,
        }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }

    /// Process every frame of `request` in order on a blocking thread.
    ///
    /// If the returned future is dropped, execution stops at the next frame
    /// boundary and the permit is released from the worker thread.
    pub async fn run(
        self,
        backend: Arc<dyn Backend>,
        request: RecognitionRequest,
    ) -> Result<RecognitionResult> {
        let cancel = CancelOnDrop::default();
        let flag = cancel.flag.clone();
        let handle =
            tokio::task::spawn_blocking(move || run_frames(self, backend.as_ref(), request, &flag));
        let result = handle
            .await
            .map_err(|e| OcrError::Internal(format!("execution task failed: {e}")))?;
        cancel.disarm();
        result.ok_or_else(|| OcrError::Internal("execution cancelled".into()))
    }

    fn record_occupancy(&mut self) {
        let occupancy = self.guard.inner.device.occupancy();
        self.state.occupancy = occupancy;
        self.state.peak_occupancy = self.state.peak_occupancy.max(occupancy);
        self.guard.inner.publish(&self.state);
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.state.holder = None;
        self.state.occupancy = self.guard.inner.device.occupancy();
        self.guard.inner.publish(&self.state);
        tracing::debug!(ticket = self.ticket, "accelerator released");
    }
}

/// Raises a cancellation flag unless disarmed before drop.
#[derive(Default)]
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    disarmed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.disarmed = true;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.disarmed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

fn run_frames(
    mut permit: ExecutionPermit,
    backend: &dyn Backend,
    request: RecognitionRequest,
    cancelled: &AtomicBool,
) -> Option<RecognitionResult> {
    let guard = permit.guard.clone();
    let inner = &guard.inner;
    let start = Instant::now();
    let frames_total = request.frames.len() as u32;
    let mut results = Vec::with_capacity(request.frames.len());
    let mut timed_out = false;

    for frame in request.frames {
        if cancelled.load(Ordering::Acquire) {
            let busy = start.elapsed();
            inner.telemetry.record_cancelled(busy);
            tracing::debug!(
                document_id = %request.document_id,
                processed = results.len(),
                "execution cancelled by caller"
            );
            return None;
        }
        if request.deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            break;
        }

        let result = process_frame(inner, backend, &frame, &request.options);
        drop(frame);
        permit.record_occupancy();
        inner.telemetry.record_frame(&result);
        results.push(result);
    }

    let status = if timed_out {
        tracing::warn!(
            document_id = %request.document_id,
            processed = results.len(),
            total = frames_total,
            "request deadline expired"
        );
        RequestStatus::TimedOut
    } else if results.iter().all(|r| r.outcome.is_success()) {
        RequestStatus::Completed
    } else {
        RequestStatus::PartiallyFailed
    };

    let busy = start.elapsed();
    inner.telemetry.record_request(status, busy);
    Some(assemble(
        request.document_id,
        &request.backend,
        frames_total,
        results,
        status,
        permit.queue_wait,
        busy,
    ))
}

fn assemble(
    document_id: DocumentId,
    backend: &str,
    frames_total: u32,
    frames: Vec<FrameResult>,
    status: RequestStatus,
    queue_wait: Duration,
    busy: Duration,
) -> RecognitionResult {
    let queue_ms = queue_wait.as_secs_f32() * 1000.0;
    let execute_ms = busy.as_secs_f32() * 1000.0;
    RecognitionResult {
        document_id,
        backend: backend.to_string(),
        status,
        frames_total,
        frames,
        timing: TimingInfo {
            normalize_ms: 0.0,
            queue_ms,
            execute_ms,
            total_ms: queue_ms + execute_ms,
        },
    }
}

fn process_frame(
    inner: &GuardInner,
    backend: &dyn Backend,
    frame: &Frame,
    options: &RecognitionOptions,
) -> FrameResult {
    let device = inner.device.as_ref();
    let start = Instant::now();
    let before = device.occupancy();
    let mut retry = RetryState::new(&inner.config);
    let mut backend_metrics = BackendMetrics::default();

    let outcome = loop {
        let mut ctx = FrameContext::new(device, options, retry.scale(), retry.retries());
        let attempt = catch_unwind(AssertUnwindSafe(|| backend.process(frame, &mut ctx)));
        cleanup_barrier(inner, backend, ctx);

        match attempt {
            Ok(Ok(output)) => {
                backend_metrics = output.metrics;
                break FrameOutcome::Text { text: output.text };
            }
            Ok(Err(FrameError::ResourceExhausted(reason))) => {
                inner.telemetry.record_exhaustion();
                if let Err(e) = device.reclaim() {
                    tracing::warn!(error = %e, "device reclaim failed");
                }
                match retry.on_exhausted() {
                    RetryStep::Retry { attempt, scale } => {
                        tracing::warn!(
                            backend = backend.name(),
                            page = frame.page_index(),
                            attempt,
                            scale,
                            reason = %reason,
                            "resource exhausted, retrying with reduced working set"
                        );
                    }
                    RetryStep::GiveUp => {
                        tracing::warn!(
                            backend = backend.name(),
                            page = frame.page_index(),
                            retries = retry.retries(),
                            reason = %reason,
                            "resource exhausted, giving up on frame"
                        );
                        break FrameOutcome::Failed {
                            reason: FailureReason::ResourceExhausted,
                        };
                    }
                }
            }
            Ok(Err(FrameError::Processing(reason))) => {
                tracing::debug!(page = frame.page_index(), reason = %reason, "frame processing failed");
                break FrameOutcome::Failed {
                    reason: FailureReason::Processing(reason),
                };
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(
                    backend = backend.name(),
                    page = frame.page_index(),
                    panic = %message,
                    "backend panicked"
                );
                break FrameOutcome::Failed {
                    reason: FailureReason::Panicked(message),
                };
            }
        }
    };

    let duration_ms = start.elapsed().as_secs_f32() * 1000.0;
    tracing::debug!(
        page = frame.page_index(),
        success = outcome.is_success(),
        retries = retry.retries(),
        duration_ms,
        "frame processed"
    );

    FrameResult {
        page_index: frame.page_index(),
        outcome,
        metrics: FrameMetrics {
            duration_ms,
            occupancy_delta: device.occupancy() as i64 - before as i64,
            retries: retry.retries(),
            scale: retry.scale(),
            backend: backend_metrics,
        },
    }
}

/// Runs after every attempt: drop scratch buffers, let the backend drop its
/// own transient state, wait for the device and flush its cache.
fn cleanup_barrier(inner: &GuardInner, backend: &dyn Backend, mut ctx: FrameContext<'_>) {
    let released = ctx.release_transient();
    drop(ctx);

    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| backend.release_transient())) {
        tracing::warn!(
            backend = backend.name(),
            panic = %panic_message(&*panic),
            "backend panicked while releasing transient state"
        );
    }
    if let Err(e) = inner.device.synchronize() {
        tracing::warn!(error = %e, "device synchronize failed");
    }
    let flushed = inner.device.empty_cache();
    inner.telemetry.record_cleanup();
    tracing::trace!(released, flushed, "cleanup barrier");
}
