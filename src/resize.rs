//! Resize step: decode, force RGB, bilinear resize, JPEG round-trip.
//!
//! The JPEG round-trip matches how the network's training set was produced,
//! so the intermediate encoding is part of the scoring contract.

use std::io::Cursor;

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType, DynamicImage};

use crate::error::{Error, Result};

/// Default resize target.
pub const DEFAULT_SIZE: (u32, u32) = (256, 256);

/// Default JPEG quality, the same value the common encoders pick.
pub const DEFAULT_QUALITY: u8 = 75;

/// Resize raw image bytes to exactly `size` (width, height) and re-encode as JPEG.
///
/// The returned cursor is positioned at the start of the encoded image.
///
/// # Errors
///
/// Returns [`Error::Decode`] if `data` is not a supported image and
/// [`Error::Encode`] if the JPEG encoder fails.
pub fn resize_image(data: &[u8], size: (u32, u32), quality: u8) -> Result<Cursor<Vec<u8>>> {
    let img = image::load_from_memory(data).map_err(Error::Decode)?;
    let img = into_rgb(img);

    let (width, height) = size;
    let resized = img.resize_exact(width, height, FilterType::Triangle);
    tracing::debug!(width, height, "resized image");

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    resized.write_with_encoder(encoder).map_err(Error::Encode)?;

    Ok(Cursor::new(buf))
}

/// Convert to 8-bit RGB before any resampling so channels never mix with alpha.
fn into_rgb(img: DynamicImage) -> DynamicImage {
    if img.color() == ColorType::Rgb8 {
        img
    } else {
        tracing::debug!(color = ?img.color(), "converting image to RGB");
        DynamicImage::ImageRgb8(img.into_rgb8())
    }
}
