// Payload decoding — turns raw cached or fetched bytes into the artifact handed to callers.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use image::RgbaImage;

use crate::detect::image::{detect_image, ImageKind};

/// Interprets raw bytes as an artifact. Runs on a blocking thread.
pub trait Decode: Send + Sync + 'static {
    type Artifact: Clone + Send + Sync + 'static;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Artifact>;
}

/// Passes the payload through untouched; only an empty payload is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decode for RawDecoder {
    type Artifact = Bytes;

    fn decode(&self, bytes: &[u8]) -> Result<Bytes> {
        if bytes.is_empty() {
            return Err(anyhow!("empty payload"));
        }
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// A fully decoded RGBA8 bitmap.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    kind: ImageKind,
    pixels: Arc<RgbaImage>,
}

impl DecodedImage {
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }
}

/// Decodes PNG, JPEG, GIF, WebP and BMP payloads into RGBA8 bitmaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl Decode for ImageDecoder {
    type Artifact = DecodedImage;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage> {
        let kind = detect_image(bytes);
        let format = kind
            .image_format()
            .ok_or_else(|| anyhow!("unrecognized image payload ({} bytes)", bytes.len()))?;

        let img = image::load_from_memory_with_format(bytes, format)
            .with_context(|| format!("failed to decode {} payload", kind.mime_type()))?;
        let pixels = img.to_rgba8();
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(anyhow!("image has zero size"));
        }

        Ok(DecodedImage {
            kind,
            pixels: Arc::new(pixels),
        })
    }
}
