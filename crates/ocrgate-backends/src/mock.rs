//! Deterministic backend for development and tests.
//!
//! Text is derived from frame content, and each frame stages its pixels in a
//! scratch tensor sized by the working-set scale. A device that is too small
//! therefore produces real exhaustion that the guard's degrade policy resolves.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ocrgate_core::{BackendMetrics, Frame, FrameError, FrameOutput, InputKind, Result};
use ocrgate_device::{DeviceBuffer, DeviceContext};
use ocrgate_pipeline::{Backend, BackendLoader, FrameContext};

pub const NAME: &str = "mock";

const KINDS: &[InputKind] = &[InputKind::Image, InputKind::Animated, InputKind::Document];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Device memory held from load until unload.
    pub weights_bytes: u64,
    /// Bytes per staged sample (4 = f32 tensor).
    pub bytes_per_sample: usize,
    /// Simulated inference time per frame.
    pub latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            weights_bytes: 16 * 1024 * 1024,
            bytes_per_sample: 4,
            latency_ms: 0,
        }
    }
}

pub struct MockLoader {
    config: MockConfig,
}

impl MockLoader {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }
}

impl BackendLoader for MockLoader {
    fn supported_kinds(&self) -> &[InputKind] {
        KINDS
    }

    fn load(&self, device: &DeviceContext) -> Result<Arc<dyn Backend>> {
        let weights = match self.config.weights_bytes {
            0 => None,
            bytes => Some(device.alloc(bytes as usize)?),
        };
        tracing::info!(
            device = device.label(),
            weights_mb = self.config.weights_bytes as f64 / (1024.0 * 1024.0),
            "mock backend loaded"
        );
        Ok(Arc::new(MockBackend {
            config: self.config.clone(),
            weights: Mutex::new(weights),
        }))
    }
}

pub struct MockBackend {
    config: MockConfig,
    weights: Mutex<Option<DeviceBuffer>>,
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn process(
        &self,
        frame: &Frame,
        ctx: &mut FrameContext<'_>,
    ) -> std::result::Result<FrameOutput, FrameError> {
        let image = frame.image();
        let (w, h, c) = (
            image.width as usize,
            image.height as usize,
            image.channels as usize,
        );
        if w == 0 || h == 0 || c == 0 {
            return Err(FrameError::Processing(format!(
                "empty frame {}x{}x{}",
                w, h, c
            )));
        }
        if image.data.len() < w * h * c {
            return Err(FrameError::Processing(format!(
                "frame holds {} bytes, expected {}",
                image.data.len(),
                w * h * c
            )));
        }

        // Stage a downsampled copy at the working scale.
        let scale = ctx.scale();
        let sw = ((w as f32 * scale).ceil() as usize).clamp(1, w);
        let sh = ((h as f32 * scale).ceil() as usize).clamp(1, h);
        let bps = self.config.bytes_per_sample.max(1);
        let tensor = ctx.scratch(sw * sh * c * bps)?;

        let mut sum = 0u64;
        for y in 0..sh {
            let sy = y * h / sh;
            for x in 0..sw {
                let sx = x * w / sw;
                for ch in 0..c {
                    let v = image.data[(sy * w + sx) * c + ch];
                    sum += u64::from(v);
                    tensor[((y * sw + x) * c + ch) * bps] = v;
                }
            }
        }
        let mean = sum as f64 / (sw * sh * c) as f64;

        if self.config.latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.latency_ms));
        }

        tracing::trace!(page = frame.page_index(), scale, sw, sh, "mock frame staged");

        Ok(FrameOutput {
            text: format!(
                "[mock] page {}: {}x{} mean={:.1}",
                frame.page_index(),
                w,
                h,
                mean
            ),
            metrics: BackendMetrics {
                confidence: Some(1.0),
                tokens: None,
            },
        })
    }

    fn unload(&self) {
        if let Some(weights) = self.weights.lock().take() {
            tracing::info!(released = weights.reserved_bytes(), "mock weights released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocrgate_core::{DocumentId, RawImage, RecognitionOptions};
    use ocrgate_device::DeviceConfig;

    fn device(capacity_bytes: u64) -> DeviceContext {
        DeviceContext::new(DeviceConfig {
            label: "mock-test".into(),
            capacity_bytes,
        })
    }

    fn frame(w: u32, h: u32, value: u8) -> Frame {
        Frame::new(
            DocumentId::new(),
            2,
            RawImage {
                data: vec![value; (w * h * 3) as usize],
                width: w,
                height: h,
                channels: 3,
            },
        )
    }

    fn no_weights() -> MockConfig {
        MockConfig {
            weights_bytes: 0,
            ..MockConfig::default()
        }
    }

    #[test]
    fn text_describes_the_frame() {
        let device = device(1 << 20);
        let backend = MockLoader::new(no_weights()).load(&device).unwrap();
        let options = RecognitionOptions::default();
        let mut ctx = FrameContext::new(&device, &options, 1.0, 0);

        let out = backend.process(&frame(10, 4, 200), &mut ctx).unwrap();
        assert_eq!(out.text, "[mock] page 2: 10x4 mean=200.0");
        assert_eq!(out.metrics.confidence, Some(1.0));
    }

    #[test]
    fn scratch_shrinks_with_scale() {
        let device = device(1 << 20);
        let backend = MockLoader::new(no_weights()).load(&device).unwrap();
        let options = RecognitionOptions::default();

        let mut full = FrameContext::new(&device, &options, 1.0, 0);
        backend.process(&frame(64, 64, 1), &mut full).unwrap();
        assert_eq!(full.transient_bytes(), 64 * 64 * 3 * 4);

        let mut half = FrameContext::new(&device, &options, 0.5, 1);
        backend.process(&frame(64, 64, 1), &mut half).unwrap();
        assert_eq!(half.transient_bytes(), 32 * 32 * 3 * 4);
    }

    #[test]
    fn small_device_exhausts_at_full_scale() {
        let device = device(32 * 1024);
        let backend = MockLoader::new(no_weights()).load(&device).unwrap();
        let options = RecognitionOptions::default();

        let mut ctx = FrameContext::new(&device, &options, 1.0, 0);
        let err = backend.process(&frame(64, 64, 1), &mut ctx).unwrap_err();
        assert!(matches!(err, FrameError::ResourceExhausted(_)));

        let mut ctx = FrameContext::new(&device, &options, 0.5, 1);
        assert!(backend.process(&frame(64, 64, 1), &mut ctx).is_ok());
    }

    #[test]
    fn weights_live_until_unload() {
        let device = device(1 << 20);
        let loader = MockLoader::new(MockConfig {
            weights_bytes: 4096,
            ..MockConfig::default()
        });
        let backend = loader.load(&device).unwrap();
        assert_eq!(device.allocated(), 4096);

        backend.unload();
        assert_eq!(device.allocated(), 0);
    }

    #[test]
    fn oversized_weights_fail_the_load() {
        let device = device(1024);
        let loader = MockLoader::new(MockConfig::default());
        assert!(loader.load(&device).is_err());
    }
}
