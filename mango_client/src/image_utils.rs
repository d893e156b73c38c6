use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, GenericImageView};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Failed to encode image: {0}")]
    Encode(String),
    #[error("Invalid data URL: {0}")]
    DataUrl(String),
}

/// A raw image as handed to the submission pipeline.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Encoded file contents (JPEG, PNG, WebP).
    Encoded(Bytes),
    /// A `data:image/...;base64,` string as produced by a camera capture.
    DataUrl(String),
    /// An already decoded bitmap.
    Bitmap(DynamicImage),
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Encoded(Bytes::from(bytes))
    }
}

impl From<Bytes> for ImageInput {
    fn from(bytes: Bytes) -> Self {
        ImageInput::Encoded(bytes)
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Bitmap(image)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedImage {
    image: DynamicImage,
}

impl PreparedImage {
    pub fn decode(input: ImageInput) -> Result<Self, ImageError> {
        match input {
            ImageInput::Encoded(bytes) => Self::from_bytes(&bytes),
            ImageInput::DataUrl(url) => Self::from_data_url(&url),
            ImageInput::Bitmap(image) => Ok(Self { image }),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let image = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ImageError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        Ok(Self { image })
    }

    /// Accepts `data:<mime>;base64,<payload>` as well as a bare base64 payload.
    pub fn from_data_url(data_url: &str) -> Result<Self, ImageError> {
        let payload = match data_url.split_once(',') {
            Some((header, payload)) => {
                if !header.starts_with("data:") || !header.ends_with(";base64") {
                    return Err(ImageError::DataUrl(format!(
                        "unsupported header `{}`",
                        header
                    )));
                }
                payload
            }
            None => data_url,
        };
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| ImageError::DataUrl(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Downscales so the long edge is at most `max_long_edge`, keeping the
    /// aspect ratio. Smaller images are left untouched.
    pub fn fit_within(self, max_long_edge: u32) -> Self {
        let (width, height) = self.dimensions();
        let long_edge = width.max(height);
        if long_edge <= max_long_edge {
            return self;
        }
        let scale = max_long_edge as f64 / long_edge as f64;
        let new_width = ((width as f64 * scale).round() as u32).clamp(1, max_long_edge);
        let new_height = ((height as f64 * scale).round() as u32).clamp(1, max_long_edge);
        tracing::debug!(
            "Downscaling image from {}x{} to {}x{}",
            width,
            height,
            new_width,
            new_height
        );
        Self {
            image: self
                .image
                .resize_exact(new_width, new_height, FilterType::Triangle),
        }
    }

    pub fn resize_exact(self, width: u32, height: u32) -> Self {
        if self.dimensions() == (width, height) {
            return self;
        }
        Self {
            image: self.image.resize_exact(width, height, FilterType::Triangle),
        }
    }

    /// JPEG has no alpha channel, so the image is flattened to RGB first.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, ImageError> {
        let rgb = self.image.to_rgb8();
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
            .encode_image(&rgb)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        Ok(buf)
    }
}
