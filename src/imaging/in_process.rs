//! In-process backend: the `image` crate's codecs, statically linked.
//!
//! ## Crate mapping
//!
//! | Step | Crate / function |
//! |---|---|
//! | Container sniffing | `image::guess_format` via [`SourceContainer`] |
//! | Decode (JPEG, PNG, WebP, GIF) | `image::ImageReader::with_format` |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Memory ceiling | `libc::getrlimit` / `setrlimit` on `RLIMIT_AS` |
//!
//! The crate's WebP encoder is lossless-only and cannot honour a quality
//! setting, so this backend does not claim WEBP output.

use super::backend::{BackendError, Capability, ConversionBackend};
use super::format::{SourceContainer, TargetFormat};
use super::operations::get_dimensions;
use super::params::ConversionParams;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::path::Path;

/// Decode-memory estimate when dimensions cannot be read.
const FALLBACK_ESTIMATE: u64 = 64 * 1024 * 1024;

/// Headroom added on top of the decode estimate before comparing with the
/// process ceiling.
const CEILING_HEADROOM: u64 = 32 * 1024 * 1024;

/// rav1e speed preset: 6 trades a little size for reasonable throughput.
const AVIF_SPEED: u8 = 6;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct InProcessBackend;

impl InProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Working-memory estimate for decoding a source: pixels × channels × 1.5.
pub fn estimate_decode_memory(dimensions: Option<(u32, u32)>, container: SourceContainer) -> u64 {
    match dimensions {
        Some((w, h)) => {
            let raw = w as u64 * h as u64 * container.channels();
            raw + raw / 2
        }
        None => FALLBACK_ESTIMATE,
    }
}

/// Raise the soft address-space limit if it cannot hold `needed` bytes plus
/// headroom. Unlimited ceilings are left alone; the soft limit never exceeds
/// the hard limit.
///
/// Returns the new soft limit when it was raised.
#[cfg(unix)]
pub fn ensure_memory_ceiling(needed: u64) -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) } != 0 {
        return None;
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }

    let required = needed.saturating_add(CEILING_HEADROOM);
    let current = limit.rlim_cur as u64;
    if current >= required {
        return None;
    }

    let raised = if limit.rlim_max == libc::RLIM_INFINITY {
        required
    } else {
        required.min(limit.rlim_max as u64)
    };
    if raised <= current {
        return None;
    }
    limit.rlim_cur = raised as libc::rlim_t;
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
        tracing::warn!(required, "could not raise process memory ceiling");
        return None;
    }
    tracing::info!(limit_mb = raised.div_ceil(1024 * 1024), "raised process memory ceiling");
    Some(raised)
}

#[cfg(not(unix))]
pub fn ensure_memory_ceiling(_needed: u64) -> Option<u64> {
    None
}

/// Decode with the decoder selected from the source container.
fn decode(path: &Path, container: SourceContainer) -> Result<DynamicImage, BackendError> {
    let mut reader = ImageReader::open(path).map_err(BackendError::Io)?;
    reader.set_format(container.image_format());
    let img = reader.decode().map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
    })?;
    Ok(prepare_pixels(img))
}

/// Normalise decoded pixels to 8-bit for the encoder.
///
/// Alpha is carried through as-is, never composited onto a background, so
/// transparent PNGs stay transparent.
fn prepare_pixels(img: DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

/// Encode and save as AVIF using rav1e.
fn save_avif(img: &DynamicImage, path: &Path, quality: u32) -> Result<(), BackendError> {
    let file = std::fs::File::create(path).map_err(BackendError::Io)?;
    let writer = std::io::BufWriter::new(file);
    let encoder =
        image::codecs::avif::AvifEncoder::new_with_speed_quality(writer, AVIF_SPEED, quality as u8);
    img.write_with_encoder(encoder)
        .map_err(|e| BackendError::ProcessingFailed(format!("AVIF encode failed: {}", e)))
}

impl ConversionBackend for InProcessBackend {
    fn capability(&self) -> Capability {
        Capability::InProcess
    }

    fn supports(&self, format: TargetFormat) -> bool {
        match format {
            TargetFormat::Avif => ImageFormat::Avif.writing_enabled(),
            TargetFormat::Webp => false,
        }
    }

    fn convert(&self, params: &ConversionParams) -> Result<(), BackendError> {
        if !self.supports(params.format) {
            return Err(BackendError::UnsupportedFormat(params.format));
        }
        let container = SourceContainer::detect(&params.source).ok_or_else(|| {
            BackendError::UnsupportedSource(params.source.display().to_string())
        })?;

        let dimensions = get_dimensions(&params.source).ok();
        ensure_memory_ceiling(estimate_decode_memory(dimensions, container));

        let img = decode(&params.source, container)?;
        save_avif(&img, &params.output, params.quality.value())
    }
}
