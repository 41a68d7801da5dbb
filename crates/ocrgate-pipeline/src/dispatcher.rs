use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use ocrgate_core::{DocumentId, InputKind, OcrError, RecognitionOptions, RecognitionResult, Result};
use ocrgate_decode::Normalizer;
use ocrgate_device::{DeviceContext, DeviceStats};

use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::guard::{AcceleratorGuard, GuardSnapshot, RecognitionRequest};
use crate::lifecycle::{PhaseCounters, PhaseSnapshot, RequestLifecycle, RequestState};
use crate::registry::{BackendDescriptor, BackendRegistry, BackendState, BackendStatus, CatalogEntry};
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// At least one backend failed to load.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorHealth {
    #[serde(flatten)]
    pub guard: GuardSnapshot,
    pub device: DeviceStats,
}

/// Point-in-time service health. Built without touching the execution mutex.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub requests: PhaseSnapshot,
    pub accelerator: AcceleratorHealth,
    pub backends: Vec<BackendStatus>,
    pub telemetry: TelemetrySnapshot,
}

/// Public entry point: resolves the backend, normalizes the input and runs
/// it through the accelerator guard.
pub struct Dispatcher {
    config: GatewayConfig,
    registry: Arc<BackendRegistry>,
    normalizer: Arc<Normalizer>,
    guard: AcceleratorGuard,
    requests: Arc<PhaseCounters>,
    started: Instant,
    shut_down: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(config: GatewayConfig, registry: BackendRegistry, normalizer: Normalizer) -> Result<Self> {
        config.validate()?;
        let guard = AcceleratorGuard::new(
            registry.device().clone(),
            config.guard.clone(),
            config.max_queue_depth,
        );

        tracing::info!(
            backends = registry.len(),
            max_queue_depth = config.max_queue_depth,
            timeout_secs = config.request_timeout_secs,
            max_retries = config.guard.max_retries,
            "dispatcher ready"
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            normalizer: Arc::new(normalizer),
            guard,
            requests: Arc::new(PhaseCounters::default()),
            started: Instant::now(),
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build device, registry and normalizer from `config`, registering the
    /// enabled entries of `catalog`.
    pub fn from_config(config: GatewayConfig, catalog: Vec<CatalogEntry>) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(DeviceContext::new(config.device.clone()));
        let registry = BackendRegistry::from_catalog(device, catalog, &config.enabled_backends)?;
        let normalizer = Normalizer::new(config.normalize.clone());
        Self::new(config, registry, normalizer)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn guard(&self) -> &AcceleratorGuard {
        &self.guard
    }

    /// Recognize `data` with the backend called `backend_name`.
    ///
    /// Unknown backends, unsupported kinds and undecodable input fail before
    /// the accelerator is touched. Dropping the returned future cancels the
    /// request: while queued with no side effects, while executing at the
    /// next frame boundary.
    pub async fn handle(
        &self,
        data: Vec<u8>,
        kind: InputKind,
        backend_name: &str,
        options: RecognitionOptions,
    ) -> Result<RecognitionResult> {
        let arrived = Instant::now();
        // A timeout too large to represent means no deadline.
        let deadline =
            arrived.checked_add(options.timeout().unwrap_or_else(|| self.config.request_timeout()));
        let mut lifecycle = RequestLifecycle::begin(self.requests.clone());
        metrics::counter!("ocrgate_requests_total").increment(1);

        if self.is_shut_down() {
            return Err(lifecycle.terminate(shut_down_error()));
        }

        let descriptor = self
            .registry
            .descriptor(backend_name)
            .cloned()
            .map_err(|e| lifecycle.terminate(e))?;
        if !descriptor.supports(kind) {
            return Err(lifecycle.terminate(OcrError::UnsupportedFormat {
                format: kind.to_string(),
                supported: descriptor.kinds().iter().map(ToString::to_string).collect(),
            }));
        }
        let backend = self
            .resolve(&descriptor)
            .await
            .map_err(|e| lifecycle.terminate(e))?;

        lifecycle.advance(RequestState::Normalizing);
        let normalize_start = Instant::now();
        let document_id = DocumentId::new();
        let normalizer = self.normalizer.clone();
        let pages = options.pages.clone();
        let frames = tokio::task::spawn_blocking(move || {
            normalizer.normalize_document(document_id, &data, kind, pages.as_deref())
        })
        .await
        .map_err(|e| OcrError::Internal(format!("normalization task failed: {e}")))
        .and_then(|frames| frames)
        .map_err(|e| {
            metrics::counter!("ocrgate_rejections_total", "reason" => "input").increment(1);
            lifecycle.terminate(e)
        })?;
        let normalize_ms = normalize_start.elapsed().as_secs_f32() * 1000.0;

        tracing::debug!(
            request_id = %lifecycle.id(),
            document_id = %document_id,
            backend = descriptor.name(),
            frames = frames.len(),
            normalize_ms,
            "request queued"
        );

        lifecycle.advance(RequestState::Queued);
        let slot = self.guard.enqueue().map_err(|e| lifecycle.terminate(e))?;
        let permit = slot.acquire().await;
        // Shutdown may have unloaded the backend while this request was
        // normalizing or queued.
        if self.is_shut_down() || descriptor.is_unloaded() {
            drop(permit);
            return Err(lifecycle.terminate(shut_down_error()));
        }
        lifecycle.advance(RequestState::Executing);

        let request = RecognitionRequest {
            document_id,
            backend: descriptor.name().to_string(),
            frames,
            options,
            deadline,
        };
        let mut result = permit.run(backend, request).await?;
        lifecycle.advance(result.status.into());

        result.timing.normalize_ms = normalize_ms;
        result.timing.total_ms = arrived.elapsed().as_secs_f32() * 1000.0;
        metrics::histogram!("ocrgate_request_latency_ms").record(f64::from(result.timing.total_ms));

        tracing::info!(
            request_id = %lifecycle.id(),
            document_id = %document_id,
            backend = %result.backend,
            pages = result.frames.len(),
            failed = result.failed_frames(),
            retries = result.total_retries(),
            status = ?result.status,
            total_ms = result.timing.total_ms,
            "recognition complete"
        );
        Ok(result)
    }

    /// Same as [`Dispatcher::handle`].
    pub async fn submit(
        &self,
        data: Vec<u8>,
        kind: InputKind,
        backend_name: &str,
        options: RecognitionOptions,
    ) -> Result<RecognitionResult> {
        self.handle(data, kind, backend_name, options).await
    }

    /// Loaded instance of `descriptor`. A first load holds the execution
    /// mutex, so its device allocations never overlap a running frame.
    async fn resolve(&self, descriptor: &Arc<BackendDescriptor>) -> Result<Arc<dyn Backend>> {
        if let Some(outcome) = descriptor.resolved() {
            return outcome;
        }
        let descriptor = descriptor.clone();
        let device = self.registry.device().clone();
        let shut_down = self.shut_down.clone();
        self.guard
            .exclusive(move || {
                if shut_down.load(Ordering::Acquire) {
                    return Err(shut_down_error());
                }
                descriptor.resolve(&device)
            })
            .await
            .and_then(|outcome| outcome)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn list_backends(&self) -> Vec<BackendStatus> {
        self.registry.list()
    }

    pub fn health(&self) -> HealthReport {
        let backends = self.registry.list();
        let status = if backends.iter().any(|b| b.state == BackendState::Failed) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        let guard = self.guard.snapshot();
        HealthReport {
            status,
            uptime_secs: self.started.elapsed().as_secs(),
            queue_depth: guard.queue_depth,
            max_queue_depth: guard.max_queue_depth,
            requests: self.requests.snapshot(),
            accelerator: AcceleratorHealth {
                guard,
                device: self.registry.device().stats(),
            },
            backends,
            telemetry: self.guard.telemetry(),
        }
    }

    /// Load every registered backend now instead of on first request.
    /// Load failures leave the backend `Failed`; they are not returned.
    pub async fn warmup(&self) -> Vec<BackendStatus> {
        let start = Instant::now();
        for descriptor in self.registry.descriptors() {
            if let Err(e) = self.resolve(descriptor).await {
                tracing::warn!(backend = descriptor.name(), error = %e, "warmup load failed");
            }
        }
        let statuses = self.registry.list();
        tracing::info!(
            ready = statuses.iter().filter(|s| s.state == BackendState::Ready).count(),
            total = statuses.len(),
            elapsed_ms = start.elapsed().as_secs_f32() * 1000.0,
            "warmup complete"
        );
        statuses
    }

    /// Stop accepting requests, wait for the accelerator to go idle and
    /// unload every ready backend. Returns how many were unloaded.
    pub async fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let registry = self.registry.clone();
        let unloaded = self
            .guard
            .exclusive(move || registry.unload_all())
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "backend unload failed");
                0
            });
        tracing::info!(unloaded, "dispatcher shut down");
        unloaded
    }
}

fn shut_down_error() -> OcrError {
    OcrError::Internal("dispatcher is shut down".into())
}
