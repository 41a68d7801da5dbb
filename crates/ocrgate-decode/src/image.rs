use std::io::{Cursor, Read, Seek};

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, ImageBuffer, ImageFormat};
use tiff::decoder::{Decoder as TiffDecoder, DecodingResult};
use tiff::ColorType;

use ocrgate_core::{InputHint, OcrError, RawImage, Result};

/// Decodes still images and multi-frame containers into RGB8 rasters.
///
/// Still formats go through the `image` crate. GIF and APNG frames come out
/// fully composited on the logical canvas; multi-page TIFF is walked page by
/// page with the `tiff` decoder.
pub struct ImageDecoder {
    max_frames: usize,
}

impl ImageDecoder {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }

    /// Decode a single still image.
    pub fn decode_still(&self, data: &[u8]) -> Result<RawImage> {
        let format = image::guess_format(data)
            .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Byte(0))))?;
        let img = image::load_from_memory_with_format(data, format)
            .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Page(0))))?;
        Ok(to_raw(img))
    }

    /// Decode every frame of a multi-frame container, in order.
    ///
    /// Containers without animation support decode as a single frame.
    pub fn decode_frames(&self, data: &[u8]) -> Result<Vec<RawImage>> {
        let format = image::guess_format(data)
            .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Byte(0))))?;

        match format {
            ImageFormat::Gif => {
                let decoder = GifDecoder::new(Cursor::new(data)).map_err(header_error)?;
                self.collect_frames(decoder.into_frames())
            }
            ImageFormat::Png => {
                let decoder = PngDecoder::new(Cursor::new(data)).map_err(header_error)?;
                if decoder.is_apng().map_err(header_error)? {
                    let apng = decoder.apng().map_err(header_error)?;
                    self.collect_frames(apng.into_frames())
                } else {
                    Ok(vec![self.decode_still(data)?])
                }
            }
            ImageFormat::Tiff => self.decode_tiff_pages(data),
            _ => Ok(vec![self.decode_still(data)?]),
        }
    }

    fn collect_frames(&self, frames: Frames<'_>) -> Result<Vec<RawImage>> {
        let mut images = Vec::new();
        for (index, frame) in frames.enumerate() {
            if index >= self.max_frames {
                return Err(too_many_frames(self.max_frames));
            }
            let frame = frame
                .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Page(index as u32))))?;
            images.push(to_raw(DynamicImage::ImageRgba8(frame.into_buffer())));
        }
        if images.is_empty() {
            return Err(OcrError::malformed("container holds no frames", None));
        }
        Ok(images)
    }

    fn decode_tiff_pages(&self, data: &[u8]) -> Result<Vec<RawImage>> {
        let mut decoder = TiffDecoder::new(Cursor::new(data))
            .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Byte(0))))?;

        let mut pages = Vec::new();
        loop {
            if pages.len() >= self.max_frames {
                return Err(too_many_frames(self.max_frames));
            }
            let index = pages.len() as u32;
            pages.push(read_tiff_page(&mut decoder, index)?);

            if !decoder.more_images() {
                break;
            }
            decoder
                .next_image()
                .map_err(|e| OcrError::malformed(e.to_string(), Some(InputHint::Page(index + 1))))?;
        }
        Ok(pages)
    }
}

fn read_tiff_page<R: Read + Seek>(decoder: &mut TiffDecoder<R>, index: u32) -> Result<RawImage> {
    let hint = Some(InputHint::Page(index));
    let page_error = |e: tiff::TiffError| OcrError::malformed(e.to_string(), hint);

    let (width, height) = decoder.dimensions().map_err(page_error)?;
    let color = decoder.colortype().map_err(page_error)?;
    let buf = match decoder.read_image().map_err(page_error)? {
        DecodingResult::U8(buf) => buf,
        _ => return Err(unsupported_tiff(color)),
    };

    let img = match color {
        ColorType::Gray(8) => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma8),
        ColorType::GrayA(8) => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8),
        ColorType::RGB(8) => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
        ColorType::RGBA(8) => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba8),
        other => return Err(unsupported_tiff(other)),
    };

    img.map(to_raw)
        .ok_or_else(|| OcrError::malformed("pixel buffer shorter than page dimensions", hint))
}

fn to_raw(img: DynamicImage) -> RawImage {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    RawImage {
        data: rgb.into_raw(),
        width,
        height,
        channels: 3,
    }
}

fn header_error(err: image::ImageError) -> OcrError {
    OcrError::malformed(err.to_string(), Some(InputHint::Byte(0)))
}

fn too_many_frames(limit: usize) -> OcrError {
    OcrError::malformed(
        format!("container exceeds {limit} frames"),
        Some(InputHint::Page(limit as u32)),
    )
}

fn unsupported_tiff(color: ColorType) -> OcrError {
    OcrError::UnsupportedFormat {
        format: format!("tiff {color:?}"),
        supported: vec!["8-bit gray, gray+alpha, rgb, rgba".into()],
    }
}
