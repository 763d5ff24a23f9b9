//! Image helpers shared by the canonicalization path: shrink-to-fit
//! sizing, EXIF orientation correction, and cache encoding.

use crate::error::{Error, Result};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;

/// Cache encodings the canonicalizer can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheFormat {
    #[default]
    Png,
    Webp,
}

impl CacheFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "png" => Ok(CacheFormat::Png),
            "webp" => Ok(CacheFormat::Webp),
            other => Err(Error::Config(format!("unknown cache format {other:?}"))),
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            CacheFormat::Png => "png",
            CacheFormat::Webp => "webp",
        }
    }
}

/// Fits `(ox, oy)` inside `(tx, ty)` preserving aspect ratio, never
/// enlarging. Scales the X axis first, then the Y axis if the result is
/// still too tall; each result dimension is the floor of the scaled
/// value.
pub fn shrink_to_fit(orig: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (ox, oy) = orig;
    let (tx, ty) = target;
    if ox == 0 || oy == 0 || (ox <= tx && oy <= ty) {
        return orig;
    }
    let (mut nx, mut ny) = (ox as f64, oy as f64);
    if nx > tx as f64 {
        let by = tx as f64 / nx;
        nx = tx as f64;
        ny = (ny * by).floor();
    }
    if ny > ty as f64 {
        let by = ty as f64 / ny;
        ny = ty as f64;
        nx = (nx * by).floor();
    }
    (nx as u32, ny as u32)
}

/// Decodes an image from raw bytes and applies EXIF orientation.
pub fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| Error::entity("image", err))?
        .decode()
        .map_err(|err| Error::entity("image", err))?;
    Ok(apply_orientation(img, orientation(bytes)))
}

/// The EXIF orientation value (1..=8), defaulting to 1 when absent or
/// unreadable. Only formats carrying EXIF yield anything but 1.
fn orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let Ok(meta) = exif::Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };
    meta.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .filter(|v| (1..=8).contains(v))
        .unwrap_or(1)
}

pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

pub fn resize(img: &DynamicImage, size: (u32, u32)) -> DynamicImage {
    img.resize_exact(size.0, size.1, FilterType::Lanczos3)
}

/// Encodes into the cache format. WebP output is lossless.
pub fn encode(img: &DynamicImage, format: CacheFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match format {
        CacheFormat::Png => img
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|err| Error::entity("image", err))?,
        CacheFormat::Webp => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_with_encoder(WebPEncoder::new_lossless(&mut out))
                .map_err(|err| Error::entity("image", err))?;
        }
    }
    Ok(out.into_inner())
}
