use std::any::Any;
use std::sync::Arc;

use ocrgate_core::{Frame, FrameError, FrameOutput, InputKind, RecognitionOptions, Result};
use ocrgate_device::{DeviceBuffer, DeviceContext};

/// A loaded recognition capability.
///
/// Instances are shared read-only between requests once loaded. `process`
/// is only ever called from the accelerator guard, one frame at a time.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize one frame.
    ///
    /// Return [`FrameError::ResourceExhausted`] when the accelerator ran out of
    /// memory; the guard reclaims memory, shrinks `ctx.scale()` and retries.
    /// Any other error is terminal for this frame.
    fn process(
        &self,
        frame: &Frame,
        ctx: &mut FrameContext<'_>,
    ) -> std::result::Result<FrameOutput, FrameError>;

    /// Drop any per-frame state the backend keeps outside `FrameContext`.
    /// Called after every attempt, successful or not.
    fn release_transient(&self) {}

    /// Release weights and other long-lived resources. Called at most once.
    fn unload(&self) {}
}

/// Constructs a backend on first use.
pub trait BackendLoader: Send + Sync {
    /// Input kinds the backend accepts.
    fn supported_kinds(&self) -> &[InputKind];

    fn load(&self, device: &DeviceContext) -> Result<Arc<dyn Backend>>;
}

impl<L: BackendLoader + ?Sized> BackendLoader for Box<L> {
    fn supported_kinds(&self) -> &[InputKind] {
        (**self).supported_kinds()
    }

    fn load(&self, device: &DeviceContext) -> Result<Arc<dyn Backend>> {
        (**self).load(device)
    }
}

/// Loader built from a closure.
pub struct FnLoader<F> {
    kinds: Vec<InputKind>,
    load: F,
}

/// Wrap a closure as a [`BackendLoader`] accepting `kinds`.
pub fn loader_fn<F>(kinds: &[InputKind], load: F) -> FnLoader<F>
where
    F: Fn(&DeviceContext) -> Result<Arc<dyn Backend>> + Send + Sync,
{
    FnLoader {
        kinds: kinds.to_vec(),
        load,
    }
}

impl<F> BackendLoader for FnLoader<F>
where
    F: Fn(&DeviceContext) -> Result<Arc<dyn Backend>> + Send + Sync,
{
    fn supported_kinds(&self) -> &[InputKind] {
        &self.kinds
    }

    fn load(&self, device: &DeviceContext) -> Result<Arc<dyn Backend>> {
        (self.load)(device)
    }
}

/// Per-attempt view of the accelerator handed to [`Backend::process`].
///
/// Scratch buffers allocated through the context live until the end of the
/// attempt; the guard's cleanup barrier returns them to the pool.
pub struct FrameContext<'a> {
    device: &'a DeviceContext,
    options: &'a RecognitionOptions,
    scale: f32,
    attempt: u32,
    transient: Vec<DeviceBuffer>,
}

impl<'a> FrameContext<'a> {
    pub fn new(
        device: &'a DeviceContext,
        options: &'a RecognitionOptions,
        scale: f32,
        attempt: u32,
    ) -> Self {
        Self {
            device,
            options,
            scale,
            attempt,
            transient: Vec::new(),
        }
    }

    pub fn device(&self) -> &DeviceContext {
        self.device
    }

    pub fn options(&self) -> &RecognitionOptions {
        self.options
    }

    /// Working-set scale in `(0, 1]`. Starts at 1.0 and shrinks on retry.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Zero-based attempt number for the current frame.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Allocate `len` bytes of attempt-scoped device memory.
    pub fn scratch(&mut self, len: usize) -> std::result::Result<&mut [u8], FrameError> {
        let buffer = self.device.alloc(len)?;
        let index = self.transient.len();
        self.transient.push(buffer);
        Ok(self.transient[index].as_mut_slice())
    }

    /// Bytes currently held by scratch buffers.
    pub fn transient_bytes(&self) -> usize {
        self.transient.iter().map(DeviceBuffer::reserved_bytes).sum()
    }

    /// Return every scratch buffer to the pool. Returns the bytes released.
    pub fn release_transient(&mut self) -> usize {
        let released = self.transient_bytes();
        self.transient.clear();
        released
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
