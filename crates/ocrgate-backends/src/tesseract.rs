//! Tesseract LSTM backend via runtime library loading.
//!
//! Loads the Tesseract shared library with `libloading`, resolves the C API
//! symbols and recognizes whole frames with automatic page segmentation.
//! The accelerator guard runs one frame at a time, so a single API handle
//! behind a mutex is enough.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ocrgate_core::{
    BackendMetrics, Frame, FrameError, FrameOutput, InputKind, OcrError, RawImage, Result,
};
use ocrgate_device::DeviceContext;
use ocrgate_pipeline::{Backend, BackendLoader, FrameContext};

pub const NAME: &str = "tesseract";

const KINDS: &[InputKind] = &[InputKind::Image, InputKind::Animated, InputKind::Document];

/// Page segmentation mode: fully automatic, no OSD.
const PSM_AUTO: c_int = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    /// Path to the shared library (`libtesseract.so.5`, `tesseract55.dll`).
    pub library: PathBuf,
    /// Directory containing `.traineddata` files.
    pub tessdata: String,
    /// Model used when a request carries no language hint.
    pub language: String,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            library: PathBuf::from("libtesseract.so.5"),
            tessdata: "/usr/share/tesseract-ocr/5/tessdata".to_string(),
            language: "eng".to_string(),
        }
    }
}

/// Loaded Tesseract C API function pointers.
struct TessApi {
    _lib: libloading::Library,
    create: unsafe extern "C" fn() -> *mut c_void,
    init3: unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> c_int,
    set_image: unsafe extern "C" fn(*mut c_void, *const u8, c_int, c_int, c_int, c_int),
    set_page_seg_mode: unsafe extern "C" fn(*mut c_void, c_int),
    recognize: unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int,
    get_utf8_text: unsafe extern "C" fn(*mut c_void) -> *mut c_char,
    mean_text_conf: unsafe extern "C" fn(*mut c_void) -> c_int,
    clear: unsafe extern "C" fn(*mut c_void),
    end: unsafe extern "C" fn(*mut c_void),
    delete: unsafe extern "C" fn(*mut c_void),
    delete_text: unsafe extern "C" fn(*mut c_char),
}

// Safety: the function pointers stay valid for the lifetime of `_lib` and
// carry no state of their own.
unsafe impl Send for TessApi {}
unsafe impl Sync for TessApi {}

/// Resolve one exported C symbol.
///
/// Safety: `T` must match the symbol's real signature.
unsafe fn symbol<T: Copy>(lib: &libloading::Library, name: &str) -> Result<T> {
    let mut raw = name.as_bytes().to_vec();
    raw.push(0);
    lib.get::<T>(&raw)
        .map(|sym| *sym)
        .map_err(|e| OcrError::Internal(format!("{name}: {e}")))
}

impl TessApi {
    fn load(config: &TesseractConfig) -> Result<Self> {
        // Safety: loading a library runs its initializers; the configured
        // path is trusted to be a Tesseract build.
        let lib = unsafe { libloading::Library::new(&config.library) }.map_err(|e| {
            OcrError::Config(format!(
                "failed to load Tesseract library '{}': {e}",
                config.library.display()
            ))
        })?;

        // Safety: signatures match the Tesseract 5 C API.
        unsafe {
            Ok(Self {
                create: symbol(&lib, "TessBaseAPICreate")?,
                init3: symbol(&lib, "TessBaseAPIInit3")?,
                set_image: symbol(&lib, "TessBaseAPISetImage")?,
                set_page_seg_mode: symbol(&lib, "TessBaseAPISetPageSegMode")?,
                recognize: symbol(&lib, "TessBaseAPIRecognize")?,
                get_utf8_text: symbol(&lib, "TessBaseAPIGetUTF8Text")?,
                mean_text_conf: symbol(&lib, "TessBaseAPIMeanTextConf")?,
                clear: symbol(&lib, "TessBaseAPIClear")?,
                end: symbol(&lib, "TessBaseAPIEnd")?,
                delete: symbol(&lib, "TessBaseAPIDelete")?,
                delete_text: symbol(&lib, "TessDeleteText")?,
                _lib: lib,
            })
        }
    }
}

/// One initialized `TessBaseAPI` handle.
struct TessInstance {
    handle: *mut c_void,
    language: String,
    api: Arc<TessApi>,
}

// Safety: the handle is only touched while holding the backend's mutex.
unsafe impl Send for TessInstance {}

impl TessInstance {
    fn new(api: Arc<TessApi>, tessdata: &CStr, language: &str) -> Result<Self> {
        let lang = CString::new(language)
            .map_err(|e| OcrError::InvalidInput(format!("invalid language name: {e}")))?;
        let handle = unsafe { (api.create)() };
        if handle.is_null() {
            return Err(OcrError::Internal("TessBaseAPICreate returned null".into()));
        }
        let rc = unsafe { (api.init3)(handle, tessdata.as_ptr(), lang.as_ptr()) };
        if rc != 0 {
            unsafe { (api.delete)(handle) };
            return Err(OcrError::Internal(format!(
                "TessBaseAPIInit3 failed (rc={rc}), tessdata={tessdata:?} lang={language}"
            )));
        }
        // Persists across Clear() calls.
        unsafe { (api.set_page_seg_mode)(handle, PSM_AUTO) };
        Ok(Self {
            handle,
            language: language.to_string(),
            api,
        })
    }

    fn recognize(&self, image: &RawImage) -> Result<(String, f32)> {
        let bpp = image.channels as usize;
        if image.data.len() < image.width as usize * image.height as usize * bpp {
            return Err(OcrError::InvalidInput("frame buffer shorter than its dimensions".into()));
        }
        unsafe {
            (self.api.set_image)(
                self.handle,
                image.data.as_ptr(),
                image.width as c_int,
                image.height as c_int,
                bpp as c_int,
                (image.width as usize * bpp) as c_int,
            );
            let rc = (self.api.recognize)(self.handle, std::ptr::null_mut());
            if rc != 0 {
                (self.api.clear)(self.handle);
                return Err(OcrError::Internal(format!("TessBaseAPIRecognize failed (rc={rc})")));
            }

            let text_ptr = (self.api.get_utf8_text)(self.handle);
            let conf = (self.api.mean_text_conf)(self.handle);
            let text = if text_ptr.is_null() {
                String::new()
            } else {
                let s = CStr::from_ptr(text_ptr).to_string_lossy().trim().to_string();
                (self.api.delete_text)(text_ptr);
                s
            };
            (self.api.clear)(self.handle);

            Ok((text, conf.max(0) as f32 / 100.0))
        }
    }
}

impl Drop for TessInstance {
    fn drop(&mut self) {
        unsafe {
            (self.api.end)(self.handle);
            (self.api.delete)(self.handle);
        }
    }
}

pub struct TesseractLoader {
    config: TesseractConfig,
}

impl TesseractLoader {
    pub fn new(config: TesseractConfig) -> Self {
        Self { config }
    }
}

impl BackendLoader for TesseractLoader {
    fn supported_kinds(&self) -> &[InputKind] {
        KINDS
    }

    fn load(&self, _device: &DeviceContext) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(TesseractBackend::new(self.config.clone())?))
    }
}

/// Tesseract recognizer. Re-initializes its handle when a request asks for
/// a different language than the one currently loaded.
pub struct TesseractBackend {
    api: Arc<TessApi>,
    tessdata: CString,
    default_language: String,
    instance: Mutex<Option<TessInstance>>,
    unloaded: AtomicBool,
}

impl TesseractBackend {
    pub fn new(config: TesseractConfig) -> Result<Self> {
        let api = Arc::new(TessApi::load(&config)?);
        let tessdata = CString::new(config.tessdata.as_str())
            .map_err(|e| OcrError::Config(format!("invalid tessdata path: {e}")))?;

        // Validate the model eagerly so a bad install fails the load.
        let instance = TessInstance::new(api.clone(), &tessdata, &config.language)?;

        tracing::info!(
            library = %config.library.display(),
            tessdata = %config.tessdata,
            lang = %config.language,
            "Tesseract backend initialized"
        );

        Ok(Self {
            api,
            tessdata,
            default_language: config.language,
            instance: Mutex::new(Some(instance)),
            unloaded: AtomicBool::new(false),
        })
    }
}

impl Backend for TesseractBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn process(
        &self,
        frame: &Frame,
        ctx: &mut FrameContext<'_>,
    ) -> std::result::Result<FrameOutput, FrameError> {
        let language = ctx
            .options()
            .language
            .as_deref()
            .unwrap_or(&self.default_language);

        let mut slot = self.instance.lock();
        if self.unloaded.load(Ordering::Acquire) {
            return Err(FrameError::Processing("Tesseract backend is unloaded".into()));
        }
        if slot.as_ref().map(|i| i.language.as_str()) != Some(language) {
            // Release the old handle before loading the new model.
            *slot = None;
            *slot = Some(TessInstance::new(self.api.clone(), &self.tessdata, language)?);
            tracing::debug!(lang = language, "Tesseract re-initialized");
        }
        let Some(instance) = slot.as_ref() else {
            return Err(FrameError::Processing("Tesseract handle missing".into()));
        };

        let (text, confidence) = instance.recognize(frame.image())?;
        Ok(FrameOutput {
            text,
            metrics: BackendMetrics {
                confidence: Some(confidence),
                tokens: None,
            },
        })
    }

    fn unload(&self) {
        let mut slot = self.instance.lock();
        self.unloaded.store(true, Ordering::Release);
        slot.take();
        tracing::info!("Tesseract backend unloaded");
    }
}
