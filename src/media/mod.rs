//! Attachment preprocessing
//!
//! Chat attachments arrive as raw bytes in whatever format the sender used.
//! Before they go to a model they are decoded, shrunk to half their width
//! and height, and re-encoded as JPEG so the request payload stays bounded.

use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use thiserror::Error;

/// Both dimensions are multiplied by this before submission.
pub const DOWNSCALE_FACTOR: f64 = 0.5;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to decode attachment '{}': {source}", .name.as_deref().unwrap_or("unnamed"))]
    Decode {
        name: Option<String>,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to read attachment: {0}")]
    Io(#[from] std::io::Error),
}

/// A binary attachment as received from the chat transport
#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub name: Option<String>,

    /// Declared MIME type; the decoder sniffs the content regardless
    pub mime_type: Option<String>,

    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Model-ready image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct AttachmentPreprocessor {
    factor: f64,
    filter: FilterType,
}

impl Default for AttachmentPreprocessor {
    fn default() -> Self {
        Self {
            factor: DOWNSCALE_FACTOR,
            filter: FilterType::Lanczos3,
        }
    }
}

impl AttachmentPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode, downsample and re-encode one attachment
    pub fn process(&self, attachment: &Attachment) -> Result<ImageInput, MediaError> {
        let decode_err = |source| MediaError::Decode {
            name: attachment.name.clone(),
            source,
        };

        let img = ImageReader::new(Cursor::new(attachment.data.as_slice()))
            .with_guessed_format()?
            .decode()
            .map_err(decode_err)?;

        let (width, height) = self.target_dimensions(img.dimensions());
        let scaled = img.resize_exact(width, height, self.filter);

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgb8(scaled.to_rgb8());
        let mut output = Cursor::new(Vec::new());
        rgb.write_to(&mut output, ImageFormat::Jpeg)
            .map_err(MediaError::Encode)?;

        tracing::debug!(
            name = ?attachment.name,
            original = ?img.dimensions(),
            scaled = ?(width, height),
            "Preprocessed attachment"
        );

        Ok(ImageInput {
            data: output.into_inner(),
            mime_type: "image/jpeg".to_string(),
            width,
            height,
        })
    }

    /// Process every attachment, failing on the first one that does not decode
    pub fn process_all(&self, attachments: &[Attachment]) -> Result<Vec<ImageInput>, MediaError> {
        attachments.iter().map(|a| self.process(a)).collect()
    }

    fn target_dimensions(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let scale = |d: u32| ((d as f64 * self.factor) as u32).max(1);
        (scale(width), scale(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_halves_dimensions() {
        let pre = AttachmentPreprocessor::new();
        let input = pre.process(&Attachment::new(png_bytes(64, 40))).unwrap();

        assert_eq!((input.width, input.height), (32, 20));
        assert_eq!(input.mime_type, "image/jpeg");

        let decoded = image::load_from_memory(&input.data).unwrap();
        assert_eq!(decoded.dimensions(), (32, 20));
    }

    #[test]
    fn test_odd_dimensions_truncate() {
        let pre = AttachmentPreprocessor::new();
        let input = pre.process(&Attachment::new(png_bytes(33, 9))).unwrap();
        assert_eq!((input.width, input.height), (16, 4));
    }

    #[test]
    fn test_single_pixel_stays_single_pixel() {
        let pre = AttachmentPreprocessor::new();
        let input = pre.process(&Attachment::new(png_bytes(1, 1))).unwrap();
        assert_eq!((input.width, input.height), (1, 1));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let pre = AttachmentPreprocessor::new();
        let attachment = Attachment::new(b"definitely not an image".to_vec()).with_name("notes.txt");

        let err = pre.process(&attachment).unwrap_err();
        assert!(matches!(err, MediaError::Decode { .. }));
        assert!(err.to_string().contains("notes.txt"));
    }

    #[test]
    fn test_process_all_stops_on_bad_attachment() {
        let pre = AttachmentPreprocessor::new();
        let attachments = vec![
            Attachment::new(png_bytes(8, 8)),
            Attachment::new(vec![0, 1, 2, 3]),
        ];
        assert!(pre.process_all(&attachments).is_err());
    }
}
