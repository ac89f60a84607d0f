//! Decoding of client-supplied image payloads.
//!
//! Clients send base64 strings, usually browser data URLs
//! (`data:image/png;base64,...`). Everything is decoded under dimension
//! limits so an oversized payload fails fast instead of allocating.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageReader, Limits, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Largest accepted width or height, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("could not read image header: {0}")]
    Io(#[from] std::io::Error),
    #[error("image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

/// Strip an optional data-URL prefix and base64-decode the remainder.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let b64 = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let b64 = b64.trim();
    if b64.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(STANDARD.decode(b64)?)
}

/// Decode encoded image bytes (PNG, JPEG, ...) with dimension limits.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);

    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    Ok(reader.decode()?)
}

/// Decode to 8-bit RGB, the channel order the extractor requires.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    Ok(decode_image(bytes)?.to_rgb8())
}

/// Decode to single-channel 8-bit luminance.
pub fn decode_luma(bytes: &[u8]) -> Result<GrayImage, DecodeError> {
    Ok(decode_image(bytes)?.to_luma8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_payload_plain_base64() {
        assert_eq!(decode_payload("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_decode_payload_strips_data_url_prefix() {
        let bytes = decode_payload("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_decode_payload_rejects_garbage() {
        let err = decode_payload("data:image/png;base64,@@not base64@@").unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn test_decode_payload_rejects_empty() {
        assert!(matches!(decode_payload("data:image/png;base64,"), Err(DecodeError::Empty)));
        assert!(matches!(decode_payload(""), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_rgb_roundtrips_pixels() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let decoded = decode_rgb(&png_bytes(img)).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(2, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_luma_single_channel() {
        let img = RgbImage::from_pixel(2, 2, Rgb([200, 200, 200]));
        let decoded = decode_luma(&png_bytes(img)).unwrap();
        assert_eq!(decoded.as_raw().len(), 4);
        assert!(decoded.as_raw().iter().all(|&p| p == 200));
    }

    #[test]
    fn test_decode_image_rejects_non_image_bytes() {
        assert!(decode_rgb(b"definitely not an image").is_err());
        assert!(matches!(decode_rgb(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_image_enforces_dimension_limit() {
        let img = RgbImage::new(MAX_IMAGE_DIMENSION + 1, 1);
        assert!(matches!(decode_rgb(&png_bytes(img)), Err(DecodeError::Image(_))));
    }
}
