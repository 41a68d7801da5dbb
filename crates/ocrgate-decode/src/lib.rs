pub mod image;
pub mod pdf;

pub use self::image::ImageDecoder;
pub use pdf::{PageRasterizer, PdfDecoder, PdfiumRasterizer, RasterPage};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use ocrgate_core::{DocumentId, Frame, InputHint, InputKind, OcrError, RawImage, Result};

/// Input normalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Rasterization resolution for paginated documents.
    pub render_dpi: f32,
    /// Upper bound on frames produced from one document.
    pub max_frames: usize,
    /// Directory holding the pdfium shared library. `None` searches the
    /// working directory, then the system library path.
    pub pdfium_library: Option<PathBuf>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            render_dpi: 300.0,
            max_frames: 1000,
            pdfium_library: None,
        }
    }
}

/// Turns raw document bytes into an ordered sequence of frames.
///
/// Pure with respect to its input: nothing here touches the accelerator, and
/// the same bytes always produce the same frames.
pub struct Normalizer {
    config: NormalizeConfig,
    image_decoder: ImageDecoder,
    pdf_decoder: PdfDecoder,
}

impl Normalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        let rasterizer = Arc::new(PdfiumRasterizer::new(config.pdfium_library.clone()));
        Self::with_rasterizer(config, rasterizer)
    }

    /// Build a normalizer with a custom page rasterizer for documents.
    pub fn with_rasterizer(config: NormalizeConfig, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        Self {
            image_decoder: ImageDecoder::new(config.max_frames),
            pdf_decoder: PdfDecoder::new(config.render_dpi, config.max_frames, rasterizer),
            config,
        }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    /// Normalize a whole document under a fresh document id.
    pub fn normalize(&self, data: &[u8], kind: InputKind) -> Result<Vec<Frame>> {
        self.normalize_document(DocumentId::new(), data, kind, None)
    }

    /// Normalize `data`, keeping only the zero-based `pages` when given.
    ///
    /// Frames come back in page order with `page_index` set to their
    /// position in the source document.
    pub fn normalize_document(
        &self,
        document_id: DocumentId,
        data: &[u8],
        kind: InputKind,
        pages: Option<&[u32]>,
    ) -> Result<Vec<Frame>> {
        let start = Instant::now();
        if data.is_empty() {
            return Err(OcrError::malformed("empty payload", Some(InputHint::Byte(0))));
        }

        let pages: Vec<(u32, RawImage)> = match kind {
            InputKind::Image => {
                let image = self.image_decoder.decode_still(data)?;
                filter_decoded(vec![image], pages)?
            }
            InputKind::Animated => {
                let images = self.image_decoder.decode_frames(data)?;
                filter_decoded(images, pages)?
            }
            InputKind::Document => self
                .pdf_decoder
                .render_pages(data, pages)?
                .into_iter()
                .map(|page| (page.index, page.image))
                .collect(),
        };

        tracing::debug!(
            document_id = %document_id,
            kind = %kind,
            frames = pages.len(),
            elapsed_ms = start.elapsed().as_secs_f32() * 1000.0,
            "input normalized"
        );

        Ok(pages
            .into_iter()
            .map(|(index, image)| Frame::new(document_id, index, image))
            .collect())
    }
}

/// Resolve a page filter against a document with `count` pages.
///
/// `None` selects every page. Indices are deduplicated and sorted; any
/// index past the end is rejected.
pub fn select_pages(count: u32, pages: Option<&[u32]>) -> Result<Vec<u32>> {
    let Some(pages) = pages else {
        return Ok((0..count).collect());
    };
    if pages.is_empty() {
        return Err(OcrError::InvalidInput("page filter selects no pages".into()));
    }
    if let Some(&bad) = pages.iter().find(|&&p| p >= count) {
        return Err(OcrError::InvalidInput(format!(
            "page {bad} out of range (document has {count} pages)"
        )));
    }
    let mut selected = pages.to_vec();
    selected.sort_unstable();
    selected.dedup();
    Ok(selected)
}

fn filter_decoded(images: Vec<RawImage>, pages: Option<&[u32]>) -> Result<Vec<(u32, RawImage)>> {
    let selected = select_pages(images.len() as u32, pages)?;
    Ok(images
        .into_iter()
        .zip(0u32..)
        .filter(|(_, index)| selected.binary_search(index).is_ok())
        .map(|(image, index)| (index, image))
        .collect())
}
