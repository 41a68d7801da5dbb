#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::gif::GifEncoder;
use image::{Frame as GifFrame, Rgba, RgbaImage};
use parking_lot::Mutex;

use ocrgate_core::{DocumentId, Frame, FrameError, FrameOutput, InputKind, RawImage};
use ocrgate_device::{DeviceConfig, DeviceContext};
use ocrgate_pipeline::{
    loader_fn, AcceleratorGuard, Backend, BackendLoader, FrameContext, GuardConfig,
};

/// Scripted backend: per-page behaviour plus counters the tests inspect.
#[derive(Default)]
pub struct Script {
    /// Page -> number of ResourceExhausted errors before success.
    pub exhaust: HashMap<u32, u32>,
    /// Pages that fail with a processing error.
    pub fail: Vec<u32>,
    /// Pages that panic.
    pub panic: Vec<u32>,
    /// Page -> how long `process` blocks.
    pub delay: HashMap<u32, Duration>,
    /// Sleep applied to every page.
    pub base_delay: Duration,
}

pub struct ScriptedBackend {
    script: Script,
    pub attempts: Mutex<HashMap<u32, u32>>,
    pub seen: Mutex<Vec<u32>>,
    pub scales: Mutex<Vec<f32>>,
    pub cleanups: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub unloads: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            attempts: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
            scales: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Script::default())
    }

    pub fn seen(&self) -> Vec<u32> {
        self.seen.lock().clone()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn process(
        &self,
        frame: &Frame,
        ctx: &mut FrameContext<'_>,
    ) -> Result<FrameOutput, FrameError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let page = frame.page_index();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(page).or_insert(0);
            *n += 1;
            *n
        };
        self.seen.lock().push(page);
        self.scales.lock().push(ctx.scale());
        let _ = ctx.scratch(1024);

        let delay = self.script.delay.get(&page).copied().unwrap_or(self.script.base_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = if self.script.panic.contains(&page) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            panic!("scripted panic on page {page}");
        } else if self.script.fail.contains(&page) {
            Err(FrameError::Processing(format!("cannot read page {page}")))
        } else if attempt <= self.script.exhaust.get(&page).copied().unwrap_or(0) {
            Err(FrameError::ResourceExhausted(format!("attempt {attempt}")))
        } else {
            Ok(FrameOutput::text(format!("text of page {page}")))
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn release_transient(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader handing out `backend`, counting how often it ran.
pub fn sharing_loader(
    backend: Arc<ScriptedBackend>,
    kinds: &[InputKind],
    loads: Arc<AtomicU32>,
) -> impl BackendLoader {
    loader_fn(kinds, move |_device| {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok(backend.clone() as Arc<dyn Backend>)
    })
}

pub fn device(capacity_bytes: u64) -> Arc<DeviceContext> {
    Arc::new(DeviceContext::new(DeviceConfig {
        label: "test-accel".into(),
        capacity_bytes,
    }))
}

pub fn guard(max_queue_depth: usize) -> AcceleratorGuard {
    AcceleratorGuard::new(device(64 * 1024 * 1024), GuardConfig::default(), max_queue_depth)
}

pub fn frames(n: u32) -> Vec<Frame> {
    let document_id = DocumentId::new();
    (0..n)
        .map(|i| {
            Frame::new(
                document_id,
                i,
                RawImage {
                    data: vec![i as u8; 4 * 4 * 3],
                    width: 4,
                    height: 4,
                    channels: 3,
                },
            )
        })
        .collect()
}

pub fn gif_bytes(frames: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = (0..frames).map(|i| GifFrame::new(RgbaImage::from_pixel(6, 4, Rgba([i * 30, 20, 20, 255]))));
        encoder.encode_frames(frames).expect("encode gif");
    }
    buf
}

pub fn png_bytes() -> Vec<u8> {
    let img = RgbaImage::from_pixel(5, 5, Rgba([1, 2, 3, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).expect("encode png");
    buf.into_inner()
}
