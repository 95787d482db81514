use image::ImageFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Unknown,
}

impl ImageKind {
    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            ImageKind::Png => Some(ImageFormat::Png),
            ImageKind::Jpeg => Some(ImageFormat::Jpeg),
            ImageKind::Gif => Some(ImageFormat::Gif),
            ImageKind::WebP => Some(ImageFormat::WebP),
            ImageKind::Bmp => Some(ImageFormat::Bmp),
            ImageKind::Unknown => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Gif => "image/gif",
            ImageKind::WebP => "image/webp",
            ImageKind::Bmp => "image/bmp",
            ImageKind::Unknown => "application/octet-stream",
        }
    }
}

/// Detect the image format from the payload's leading magic bytes.
pub fn detect_image(header: &[u8]) -> ImageKind {
    // PNG: 8-byte signature
    if header.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return ImageKind::Png;
    }

    // JPEG: SOI marker followed by another marker
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return ImageKind::Jpeg;
    }

    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return ImageKind::Gif;
    }

    // WebP: RIFF container with "WEBP" form type at offset 8
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return ImageKind::WebP;
    }

    // BMP: "BM" plus a 14-byte file header
    if header.len() >= 14 && &header[0..2] == b"BM" {
        return ImageKind::Bmp;
    }

    ImageKind::Unknown
}
