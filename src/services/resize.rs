use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

/// Produces encoded bytes for an image scaled to a target size.
///
/// Implementations are CPU-bound and are run on the blocking pool.
pub trait ResizeTransform: Send + Sync {
    fn resize(&self, original: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TransformError>;
}

/// Resizer backed by the `image` crate.
///
/// The result fits within the requested box, keeps the aspect ratio of the
/// original and is encoded in the original's format.
pub struct ImageResizer {
    filter: FilterType,
}

impl Default for ImageResizer {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl ImageResizer {
    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TransformError> {
        let mut out = Cursor::new(Vec::new());
        match format {
            // The JPEG encoder rejects alpha channels.
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut out, format)?,
            ImageFormat::Png | ImageFormat::WebP => image.write_to(&mut out, format)?,
            other => return Err(TransformError::Unsupported(format!("{other:?}"))),
        }
        Ok(out.into_inner())
    }
}

impl ResizeTransform for ImageResizer {
    fn resize(&self, original: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TransformError> {
        if width == 0 || height == 0 {
            return Err(TransformError::InvalidSize { width, height });
        }

        let format = image::guess_format(original)?;
        let decoded = image::load_from_memory_with_format(original, format)?;
        let (orig_w, orig_h) = decoded.dimensions();

        let resized = decoded.resize(width, height, self.filter);
        tracing::debug!(
            original_width = orig_w,
            original_height = orig_h,
            width = resized.width(),
            height = resized.height(),
            "Image resized"
        );

        Self::encode(&resized, format)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported output format: {0}")]
    Unsupported(String),

    #[error("Invalid target size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}
