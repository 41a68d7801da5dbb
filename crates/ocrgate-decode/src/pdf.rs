use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use pdfium_render::prelude::*;

use ocrgate_core::{InputHint, OcrError, RawImage, Result};

use crate::select_pages;

/// One rendered page of a paginated document.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// Zero-based index of the page in the source document.
    pub index: u32,
    pub image: RawImage,
}

/// Renders selected pages of a PDF to RGB8 rasters.
pub trait PageRasterizer: Send + Sync {
    /// Render the pages picked by `pages` (all when `None`) in page order.
    ///
    /// Implementations resolve the filter with [`select_pages`] once the
    /// page count is known, and refuse to render more than `max_pages`.
    fn rasterize(
        &self,
        data: &[u8],
        dpi: f32,
        pages: Option<&[u32]>,
        max_pages: usize,
    ) -> Result<Vec<RasterPage>>;
}

/// Renders PDF pages for recognition at a fixed DPI.
pub struct PdfDecoder {
    render_dpi: f32,
    max_pages: usize,
    rasterizer: Arc<dyn PageRasterizer>,
}

impl PdfDecoder {
    pub fn new(render_dpi: f32, max_pages: usize, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        Self {
            render_dpi,
            max_pages,
            rasterizer,
        }
    }

    /// Render all pages (or a subset) of a PDF.
    pub fn render_pages(&self, pdf_data: &[u8], page_indices: Option<&[u32]>) -> Result<Vec<RasterPage>> {
        if !pdf_data.starts_with(b"%PDF") {
            return Err(OcrError::malformed("missing %PDF header", Some(InputHint::Byte(0))));
        }

        let pages = self
            .rasterizer
            .rasterize(pdf_data, self.render_dpi, page_indices, self.max_pages)?;
        if pages.is_empty() {
            return Err(OcrError::malformed("document has no pages", None));
        }
        Ok(pages)
    }
}

/// Page limit check shared by rasterizer implementations.
pub fn check_page_budget(selected: usize, max_pages: usize) -> Result<()> {
    if selected > max_pages {
        return Err(OcrError::malformed(
            format!("document selects {selected} pages, limit is {max_pages}"),
            Some(InputHint::Page(max_pages as u32)),
        ));
    }
    Ok(())
}

/// [`PageRasterizer`] backed by the pdfium shared library.
///
/// The library is bound per call and calls are serialized: pdfium keeps
/// global state and is not safe to drive from several threads at once.
pub struct PdfiumRasterizer {
    library_dir: Option<PathBuf>,
    lock: Mutex<()>,
}

impl PdfiumRasterizer {
    pub fn new(library_dir: Option<PathBuf>) -> Self {
        Self {
            library_dir,
            lock: Mutex::new(()),
        }
    }

    fn bind(&self) -> Result<Pdfium> {
        let dir = self.library_dir.clone().unwrap_or_else(|| PathBuf::from("./"));
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| OcrError::PdfRender(format!("failed to bind pdfium library: {e}")))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        data: &[u8],
        dpi: f32,
        pages: Option<&[u32]>,
        max_pages: usize,
    ) -> Result<Vec<RasterPage>> {
        let _serial = self.lock.lock();
        let pdfium = self.bind()?;

        let document = pdfium
            .load_pdf_from_byte_slice(data, None)
            .map_err(|e| OcrError::malformed(format!("cannot open PDF: {e}"), Some(InputHint::Byte(0))))?;

        let count = document.pages().len() as u32;
        let selected = select_pages(count, pages)?;
        check_page_budget(selected.len(), max_pages)?;

        // PDF user space is 72 points per inch.
        let scale = dpi / 72.0;
        let mut rendered = Vec::with_capacity(selected.len());
        for index in selected {
            let page_error = |e: PdfiumError| OcrError::malformed(e.to_string(), Some(InputHint::Page(index)));

            let page = document.pages().get(index as u16).map_err(page_error)?;
            let width = (page.width().value * scale).round().max(1.0) as i32;
            let height = (page.height().value * scale).round().max(1.0) as i32;

            let bitmap = page
                .render_with_config(
                    &PdfRenderConfig::new()
                        .set_target_width(width)
                        .set_target_height(height)
                        .render_form_data(true)
                        .render_annotations(true),
                )
                .map_err(page_error)?;

            let rgb = bitmap.as_image().to_rgb8();
            let (width, height) = rgb.dimensions();
            rendered.push(RasterPage {
                index,
                image: RawImage {
                    data: rgb.into_raw(),
                    width,
                    height,
                    channels: 3,
                },
            });
        }

        tracing::debug!(pages = rendered.len(), total = count, dpi, "PDF pages rendered");
        Ok(rendered)
    }
}
