use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OcrError, Result};

/// Default prompt handed to generative recognition backends.
pub const DEFAULT_PROMPT: &str = "Extract all text from this document image, preserving the original reading order and layout structure. Return the plain text representation.";

/// Default generation budget for generative backends.
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 8096;

/// File extensions accepted by [`InputKind::from_extension`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "png", "apng", "jpg", "jpeg", "bmp", "webp", "gif", "tif", "tiff",
];

/// Declared kind of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Single still image (PNG, JPEG, BMP, WebP).
    Image,
    /// Multi-frame container (GIF, APNG, multi-page TIFF).
    Animated,
    /// Paginated document (PDF).
    Document,
}

impl InputKind {
    pub const ALL: [InputKind; 3] = [InputKind::Image, InputKind::Animated, InputKind::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Image => "image",
            InputKind::Animated => "animated",
            InputKind::Document => "document",
        }
    }

    /// Map a file extension (with or without the leading dot) to a kind.
    pub fn from_extension(ext: &str) -> Result<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Ok(InputKind::Document),
            "gif" | "apng" | "tif" | "tiff" => Ok(InputKind::Animated),
            "png" | "jpg" | "jpeg" | "bmp" | "webp" => Ok(InputKind::Image),
            _ => Err(unsupported(&ext)),
        }
    }

    /// Map a MIME type to a kind.
    pub fn from_mime(mime: &str) -> Result<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/pdf" => Ok(InputKind::Document),
            "image/gif" | "image/apng" | "image/tiff" => Ok(InputKind::Animated),
            "image/png" | "image/jpeg" | "image/bmp" | "image/webp" => Ok(InputKind::Image),
            other => Err(unsupported(other)),
        }
    }

    /// Guess the kind from magic bytes. Returns `None` for unknown payloads.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"%PDF") {
            return Some(InputKind::Document);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(InputKind::Animated);
        }
        // TIFF magic: II*\0 or MM\0*
        if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
            return Some(InputKind::Animated);
        }
        if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            // APNG carries an acTL chunk ahead of the first IDAT.
            let idat = find(data, b"IDAT");
            return match (find(data, b"acTL"), idat) {
                (Some(actl), Some(idat)) if actl < idat => Some(InputKind::Animated),
                _ => Some(InputKind::Image),
            };
        }
        let still = data.starts_with(&[0xFF, 0xD8])
            || data.starts_with(b"BM")
            || (data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP");
        still.then_some(InputKind::Image)
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InputKind {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(InputKind::Image),
            "animated" => Ok(InputKind::Animated),
            "document" => Ok(InputKind::Document),
            other => InputKind::from_extension(other),
        }
    }
}

fn unsupported(format: &str) -> OcrError {
    OcrError::UnsupportedFormat {
        format: format.to_string(),
        supported: SUPPORTED_EXTENSIONS.iter().map(|s| format!(".{s}")).collect(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Location hint attached to malformed-input errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputHint {
    /// Zero-based page or frame index.
    Page(u32),
    /// Byte offset into the payload.
    Byte(u64),
}

impl fmt::Display for InputHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputHint::Page(p) => write!(f, "page {p}"),
            InputHint::Byte(b) => write!(f, "byte {b}"),
        }
    }
}

/// Identifier of one submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Decoded raster image, always 8-bit interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawImage {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// One page or image unit extracted from a document.
///
/// Frames are immutable once built; the accelerator guard drops each one as
/// soon as its result has been collected.
#[derive(Debug)]
pub struct Frame {
    document_id: DocumentId,
    page_index: u32,
    image: RawImage,
}

impl Frame {
    pub fn new(document_id: DocumentId, page_index: u32, image: RawImage) -> Self {
        Self {
            document_id,
            page_index,
            image,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn image(&self) -> &RawImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }
}

/// Caller-supplied options carried to every backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionOptions {
    /// Prompt for generative backends. `None` uses [`DEFAULT_PROMPT`].
    pub prompt: Option<String>,
    /// Token budget for generative backends.
    pub max_new_tokens: u32,
    /// Language hint (e.g. "eng", "swe").
    pub language: Option<String>,
    /// Zero-based pages to process. `None` = all.
    pub pages: Option<Vec<u32>>,
    /// Per-request timeout override in seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            prompt: None,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            language: None,
            pages: None,
            timeout_secs: None,
        }
    }
}

impl RecognitionOptions {
    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Extra measurements a backend may report for a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub confidence: Option<f32>,
    pub tokens: Option<u32>,
}

/// Successful output of one backend `process` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutput {
    pub text: String,
    pub metrics: BackendMetrics,
}

impl FrameOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metrics: BackendMetrics::default(),
        }
    }
}

/// Why a frame has no text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Still exhausted after the configured number of retries.
    ResourceExhausted,
    /// Backend reported a terminal processing error.
    Processing(String),
    /// Backend panicked while processing the frame.
    Panicked(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ResourceExhausted => f.write_str("resource exhausted"),
            FailureReason::Processing(msg) => write!(f, "processing error: {msg}"),
            FailureReason::Panicked(msg) => write!(f, "backend panicked: {msg}"),
        }
    }
}

/// Outcome of a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    Text { text: String },
    Failed { reason: FailureReason },
}

impl FrameOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FrameOutcome::Text { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            FrameOutcome::Text { text } => Some(text),
            FrameOutcome::Failed { .. } => None,
        }
    }
}

/// Per-frame telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    /// Wall time across all attempts, cleanup included.
    pub duration_ms: f32,
    /// Change in device reservation from before the first attempt to after
    /// the last cleanup.
    pub occupancy_delta: i64,
    /// Number of retries after resource exhaustion.
    pub retries: u32,
    /// Working-set scale used by the last attempt.
    pub scale: f32,
    pub backend: BackendMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub page_index: u32,
    #[serde(flatten)]
    pub outcome: FrameOutcome,
    pub metrics: FrameMetrics,
}

/// Overall status of an executed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Every frame produced text.
    Completed,
    /// At least one frame failed.
    PartiallyFailed,
    /// The deadline expired before all frames were processed.
    TimedOut,
}

/// Timing information for the stages of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingInfo {
    pub normalize_ms: f32,
    pub queue_ms: f32,
    pub execute_ms: f32,
    pub total_ms: f32,
}

/// Aggregated result of one recognition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub document_id: DocumentId,
    pub backend: String,
    pub status: RequestStatus,
    /// Number of frames the document was normalized into.
    pub frames_total: u32,
    /// Results in page order; shorter than `frames_total` after a timeout.
    pub frames: Vec<FrameResult>,
    pub timing: TimingInfo,
}

impl RecognitionResult {
    /// Text of all successful frames, in page order, separated by blank lines.
    pub fn text(&self) -> String {
        self.frames
            .iter()
            .filter_map(|f| f.outcome.text())
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn failed_frames(&self) -> usize {
        self.frames.iter().filter(|f| !f.outcome.is_success()).count()
    }

    pub fn total_retries(&self) -> u32 {
        self.frames.iter().map(|f| f.metrics.retries).sum()
    }
}
