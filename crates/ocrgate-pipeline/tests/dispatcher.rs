mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ocrgate_core::{InputKind, OcrError, RawImage, RecognitionOptions, RequestStatus, Result};
use ocrgate_decode::{select_pages, NormalizeConfig, Normalizer, PageRasterizer, RasterPage};
use ocrgate_pipeline::{
    loader_fn, Backend, BackendRegistry, BackendState, Dispatcher, GatewayConfig, HealthStatus,
};

use common::{device, gif_bytes, png_bytes, sharing_loader, Script, ScriptedBackend};

const ALL_KINDS: &[InputKind] = &[InputKind::Image, InputKind::Animated, InputKind::Document];

/// Stands in for pdfium: every document has `pages` blank pages, rendered
/// after `delay`.
struct CountingRasterizer {
    pages: u32,
    delay: Duration,
    calls: AtomicUsize,
}

impl PageRasterizer for CountingRasterizer {
    fn rasterize(
        &self,
        _data: &[u8],
        _dpi: f32,
        pages: Option<&[u32]>,
        _max_pages: usize,
    ) -> Result<Vec<RasterPage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let selected = select_pages(self.pages, pages)?;
        Ok(selected
            .into_iter()
            .map(|index| RasterPage {
                index,
                image: RawImage {
                    data: vec![255; 8 * 8 * 3],
                    width: 8,
                    height: 8,
                    channels: 3,
                },
            })
            .collect())
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    rasterizer: Arc<CountingRasterizer>,
    backend: Arc<ScriptedBackend>,
    loads: Arc<AtomicU32>,
}

fn fixture_with(config: GatewayConfig, script: Script, kinds: &[InputKind]) -> Fixture {
    fixture_rasterizing_after(config, script, kinds, Duration::ZERO)
}

fn fixture_rasterizing_after(
    config: GatewayConfig,
    script: Script,
    kinds: &[InputKind],
    raster_delay: Duration,
) -> Fixture {
    let backend = ScriptedBackend::new(script);
    let loads = Arc::new(AtomicU32::new(0));
    let mut registry = BackendRegistry::new(device(config.device.capacity_bytes));
    registry
        .register("scripted", sharing_loader(backend.clone(), kinds, loads.clone()))
        .unwrap();
    registry
        .register(
            "broken",
            loader_fn(ALL_KINDS, |_| -> Result<Arc<dyn Backend>> {
                Err(OcrError::Internal("model file missing".into()))
            }),
        )
        .unwrap();

    let rasterizer = Arc::new(CountingRasterizer {
        pages: 3,
        delay: raster_delay,
        calls: AtomicUsize::new(0),
    });
    let normalizer = Normalizer::with_rasterizer(NormalizeConfig::default(), rasterizer.clone());
    let dispatcher = Dispatcher::new(config, registry, normalizer).unwrap();
    Fixture {
        dispatcher,
        rasterizer,
        backend,
        loads,
    }
}

fn fixture() -> Fixture {
    fixture_with(GatewayConfig::default(), Script::default(), ALL_KINDS)
}

fn pdf() -> Vec<u8> {
    b"%PDF-1.7\n%fake".to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_page_document_completes_in_order() {
    let fx = fixture();

    let result = fx
        .dispatcher
        .handle(pdf(), InputKind::Document, "scripted", RecognitionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(result.backend, "scripted");
    let texts: Vec<&str> = result.frames.iter().filter_map(|f| f.outcome.text()).collect();
    assert_eq!(texts, vec!["text of page 0", "text of page 1", "text of page 2"]);
    assert_eq!(result.text(), "text of page 0\n\ntext of page 1\n\ntext of page 2");
    assert!(result.timing.total_ms >= result.timing.execute_ms);

    let health = fx.dispatcher.health();
    assert_eq!(health.requests.completed, 1);
    assert_eq!(health.telemetry.frames_succeeded, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_backend_fails_before_normalizing() {
    let fx = fixture();

    let err = fx
        .dispatcher
        .submit(pdf(), InputKind::Document, "foo", RecognitionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OcrError::NotFound(ref name) if name == "foo"));
    assert_eq!(err.status_code(), 404);
    assert_eq!(fx.rasterizer.calls.load(Ordering::SeqCst), 0);
    let health = fx.dispatcher.health();
    assert_eq!(health.requests.rejected, 1);
    assert_eq!(health.accelerator.guard.executions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undeclared_kind_is_unsupported() {
    let fx = fixture_with(GatewayConfig::default(), Script::default(), &[InputKind::Image]);

    let err = fx
        .dispatcher
        .handle(pdf(), InputKind::Document, "scripted", RecognitionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OcrError::UnsupportedFormat { ref format, .. } if format == "document"));
    assert_eq!(fx.rasterizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_input_never_reaches_the_accelerator() {
    let fx = fixture();

    let err = fx
        .dispatcher
        .handle(b"not an image at all".to_vec(), InputKind::Image, "scripted", RecognitionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OcrError::MalformedInput { .. }));
    assert_eq!(err.status_code(), 422);
    assert!(fx.backend.seen().is_empty());
    assert_eq!(fx.dispatcher.guard().snapshot().executions, 0);
    assert_eq!(fx.dispatcher.health().requests.rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn animated_frames_respect_page_filter() {
    let fx = fixture();

    let all = fx
        .dispatcher
        .handle(gif_bytes(4), InputKind::Animated, "scripted", RecognitionOptions::default())
        .await
        .unwrap();
    assert_eq!(all.frames_total, 4);

    let options = RecognitionOptions {
        pages: Some(vec![3, 1]),
        ..RecognitionOptions::default()
    };
    let some = fx
        .dispatcher
        .handle(gif_bytes(4), InputKind::Animated, "scripted", options)
        .await
        .unwrap();
    let pages: Vec<u32> = some.frames.iter().map(|f| f.page_index).collect();
    assert_eq!(pages, vec![1, 3]);

    let options = RecognitionOptions {
        pages: Some(vec![9]),
        ..RecognitionOptions::default()
    };
    let err = fx
        .dispatcher
        .handle(png_bytes(), InputKind::Image, "scripted", options)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::InvalidInput(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overloaded_queue_rejects_new_submissions() {
    let config = GatewayConfig {
        max_queue_depth: 1,
        ..GatewayConfig::default()
    };
    let fx = Arc::new(fixture_with(config, Script::default(), ALL_KINDS));
    fx.dispatcher.warmup().await;
    let permit = fx.dispatcher.guard().enqueue().unwrap().acquire().await;

    let queued = {
        let fx = fx.clone();
        tokio::spawn(async move {
            fx.dispatcher
                .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
                .await
        })
    };
    let start = Instant::now();
    while fx.dispatcher.guard().queue_depth() < 1 {
        assert!(start.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let started = Instant::now();
    let err = fx
        .dispatcher
        .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, OcrError::Overloaded { depth: 1, limit: 1 }));
    assert_eq!(err.status_code(), 503);

    let health = fx.dispatcher.health();
    assert_eq!(health.queue_depth, 1);
    assert_eq!(health.requests.queued, 1);
    assert_eq!(health.requests.rejected, 1);
    assert!(health.accelerator.guard.busy);

    drop(permit);
    let result = queued.await.unwrap().unwrap();
    assert_eq!(result.status, RequestStatus::Completed);
    assert!(result.timing.queue_ms > 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_returns_partial_result() {
    let script = Script {
        delay: HashMap::from([(1, Duration::from_millis(1500))]),
        ..Script::default()
    };
    let fx = fixture_with(GatewayConfig::default(), script, ALL_KINDS);
    let options = RecognitionOptions {
        timeout_secs: Some(1),
        ..RecognitionOptions::default()
    };

    let result = fx
        .dispatcher
        .handle(gif_bytes(5), InputKind::Animated, "scripted", options)
        .await
        .unwrap();

    assert_eq!(result.status, RequestStatus::TimedOut);
    assert_eq!(result.frames.len(), 2);
    assert_eq!(result.frames_total, 5);
    let health = fx.dispatcher.health();
    assert_eq!(health.requests.timed_out, 1);
    assert!(!health.accelerator.guard.busy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_backend_degrades_health() {
    let fx = fixture();

    for _ in 0..2 {
        let err = fx
            .dispatcher
            .handle(png_bytes(), InputKind::Image, "broken", RecognitionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::BackendLoad { .. }));
        assert_eq!(err.status_code(), 503);
    }

    let health = fx.dispatcher.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.requests.failed, 2);
    let broken = health.backends.iter().find(|b| b.name == "broken").unwrap();
    assert_eq!(broken.state, BackendState::Failed);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["backends"][1]["state"], "failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_load_once() {
    let fx = Arc::new(fixture());
    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let fx = fx.clone();
            tokio::spawn(async move {
                fx.dispatcher
                    .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.backend.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warmup_and_shutdown_manage_backend_lifetimes() {
    let fx = fixture();
    assert!(fx
        .dispatcher
        .list_backends()
        .iter()
        .all(|b| b.state == BackendState::Unregistered));

    let statuses = fx.dispatcher.warmup().await;
    assert_eq!(statuses[0].state, BackendState::Ready);
    assert_eq!(statuses[1].state, BackendState::Failed);
    assert_eq!(fx.loads.load(Ordering::SeqCst), 1);

    assert_eq!(fx.dispatcher.shutdown().await, 1);
    assert_eq!(fx.dispatcher.shutdown().await, 0);
    assert_eq!(fx.backend.unloads.load(Ordering::SeqCst), 1);

    let err = fx
        .dispatcher
        .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::Internal(_)));
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    let start = Instant::now();
    while !ready() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition never held");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrepresentable_timeout_means_no_deadline() {
    let fx = fixture();
    let options = RecognitionOptions {
        timeout_secs: Some(u64::MAX),
        ..RecognitionOptions::default()
    };

    let result = fx
        .dispatcher
        .handle(gif_bytes(3), InputKind::Animated, "scripted", options)
        .await
        .unwrap();

    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(result.frames.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_while_normalizing_fails_the_request() {
    let fx = Arc::new(fixture_rasterizing_after(
        GatewayConfig::default(),
        Script::default(),
        ALL_KINDS,
        Duration::from_millis(300),
    ));
    fx.dispatcher.warmup().await;

    let pending = {
        let fx = fx.clone();
        tokio::spawn(async move {
            fx.dispatcher
                .handle(pdf(), InputKind::Document, "scripted", RecognitionOptions::default())
                .await
        })
    };
    wait_until(|| fx.dispatcher.health().requests.normalizing == 1).await;

    assert_eq!(fx.dispatcher.shutdown().await, 1);
    let err = pending.await.unwrap().unwrap_err();

    assert!(matches!(err, OcrError::Internal(_)));
    assert!(fx.backend.seen().is_empty());
    assert_eq!(fx.backend.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
    let health = fx.dispatcher.health();
    assert_eq!(health.requests.failed, 1);
    assert_eq!(health.backends[0].state, BackendState::Unloaded);
    assert!(!health.accelerator.guard.busy);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_load_waits_for_the_running_execution() {
    let fx = Arc::new(fixture());
    let permit = fx.dispatcher.guard().enqueue().unwrap().acquire().await;

    let first = {
        let fx = fx.clone();
        tokio::spawn(async move {
            fx.dispatcher
                .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fx.loads.load(Ordering::SeqCst), 0);
    assert_eq!(fx.dispatcher.list_backends()[0].state, BackendState::Unregistered);
    assert_eq!(fx.dispatcher.health().queue_depth, 0);

    drop(permit);
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.dispatcher.list_backends()[0].state, BackendState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn caller_dropping_a_queued_request_leaves_no_trace() {
    let fx = Arc::new(fixture());
    fx.dispatcher.warmup().await;
    let permit = fx.dispatcher.guard().enqueue().unwrap().acquire().await;

    let queued = {
        let fx = fx.clone();
        tokio::spawn(async move {
            fx.dispatcher
                .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
                .await
        })
    };
    wait_until(|| fx.dispatcher.guard().queue_depth() == 1).await;
    assert_eq!(fx.dispatcher.health().requests.queued, 1);

    queued.abort();
    assert!(queued.await.unwrap_err().is_cancelled());

    let health = fx.dispatcher.health();
    assert_eq!(health.queue_depth, 0);
    assert_eq!(health.requests.queued, 0);
    assert_eq!(health.requests.abandoned, 1);
    assert_eq!(health.requests.rejected + health.requests.failed, 0);

    drop(permit);
    let result = fx
        .dispatcher
        .handle(png_bytes(), InputKind::Image, "scripted", RecognitionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, RequestStatus::Completed);
    assert_eq!(fx.backend.seen(), vec![0]);
}
