//! Shared test utilities for the avifier test suite.
//!
//! Provides synthetic image writers and byte builders so tests can exercise
//! conversion logic without real photographs.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let source = tmp.path().join("photo.jpg");
//! write_jpeg(&source, 64, 48);
//!
//! std::fs::write(tmp.path().join("photo.avif"), fake_avif_bytes(200)).unwrap();
//! ```

use image::{ImageEncoder, RgbImage, RgbaImage};
use std::path::Path;

// =========================================================================
// Synthetic sources
// =========================================================================

/// Write a small gradient JPEG with the given dimensions.
pub fn write_jpeg(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let file = std::fs::File::create(path).unwrap();
    let writer = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new(writer)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
}

/// Write a small gradient WebP (lossless) with the given dimensions.
pub fn write_webp(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, 64])
    });
    img.save_with_format(path, image::ImageFormat::WebP).unwrap();
}

/// Write a PNG with a real alpha channel (transparent left half).
pub fn write_png_rgba(path: &Path, width: u32, height: u32) {
    let img = RgbaImage::from_fn(width, height, |x, _| {
        let alpha = if x < width / 2 { 0 } else { 255 };
        image::Rgba([200, 40, 40, alpha])
    });
    img.save_with_format(path, image::ImageFormat::Png).unwrap();
}

/// A PNG of roughly `len` bytes whose header claims `width`×`height`.
///
/// The signature, IHDR, and the IDAT chunk framing are well-formed; the
/// pixel data is zero padding. Enough for dimension reads and size checks
/// without allocating a real image of that size, but not decodable.
pub fn fake_png_bytes(width: u32, height: u32, len: usize) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();

    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);
    push_chunk(&mut bytes, b"IHDR", &ihdr);

    let padding = len.saturating_sub(bytes.len() + 12);
    push_chunk(&mut bytes, b"IDAT", &vec![0; padding]);
    bytes
}

fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let crc = crc32(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

/// Bitwise CRC-32 (IEEE), as PNG chunk checksums require.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

// =========================================================================
// Synthetic outputs
// =========================================================================

/// AVIF-looking bytes: an `ftyp` box with the `avif` brand, padded to `len`.
pub fn fake_avif_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"\0\0\0\x1cftypavif\0\0\0\0avifmif1miaf".to_vec();
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}

/// WEBP-looking bytes: a RIFF header with the WEBP form type, padded to `len`.
pub fn fake_webp_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"RIFF".to_vec();
    bytes.extend_from_slice(&(len.saturating_sub(8) as u32).to_le_bytes());
    bytes.extend_from_slice(b"WEBPVP8 ");
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}
