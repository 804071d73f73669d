//! High-level image operations that are not conversions.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** (AVIF) | `avif-parse` container metadata, no decode |
//! | **Identify** (others) | `image::image_dimensions` |
//! | **Resize copy** | Lanczos3, saved in the source's own container |

use super::backend::BackendError;
use super::calculations::scale_to_fit;
use super::format::{HEADER_WINDOW, SourceContainer, TargetFormat, read_header};
use crate::naming::resized_path;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// JPEG quality used when writing resized copies.
const RESIZE_JPEG_QUALITY: u8 = 90;

/// Pixel dimensions of an image file.
///
/// The format is sniffed from content, not the extension. AVIF files are
/// identified from their container metadata since the `image` crate only
/// encodes AVIF.
pub fn get_dimensions(path: &Path) -> Result<(u32, u32)> {
    let header = read_header(path, HEADER_WINDOW)?;
    if TargetFormat::Avif.has_signature(&header) {
        return identify_avif(path);
    }
    let failed = |e: image::ImageError| {
        BackendError::ProcessingFailed(format!("Failed to identify {}: {}", path.display(), e))
    };
    ImageReader::open(path)?
        .with_guessed_format()?
        .into_dimensions()
        .map_err(failed)
}

fn identify_avif(path: &Path) -> Result<(u32, u32)> {
    let file_data = std::fs::read(path)?;
    let avif = avif_parse::read_avif(&mut std::io::Cursor::new(&file_data)).map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to parse AVIF {}: {e:?}", path.display()))
    })?;
    let meta = avif.primary_item_metadata().map_err(|e| {
        BackendError::ProcessingFailed(format!(
            "Failed to read AVIF metadata {}: {e:?}",
            path.display()
        ))
    })?;
    Ok((meta.max_frame_width.get(), meta.max_frame_height.get()))
}

/// Produce a proportionally scaled copy of `source` next to it.
///
/// Returns the source itself when no scaling is needed (the requested box is
/// at least as large as the image). An existing copy is reused as-is.
pub fn resize_copy(source: &Path, width: Option<u32>, height: Option<u32>) -> Result<PathBuf> {
    let original = get_dimensions(source)?;
    let (w, h) = scale_to_fit(original, width, height);
    if (w, h) == original {
        return Ok(source.to_path_buf());
    }

    let target = resized_path(source, w, h);
    if target.exists() {
        return Ok(target);
    }

    let container = SourceContainer::detect(source)
        .ok_or_else(|| BackendError::UnsupportedSource(source.display().to_string()))?;
    let mut reader = ImageReader::open(source)?;
    reader.set_format(container.image_format());
    let img = reader.decode().map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to decode {}: {}", source.display(), e))
    })?;
    let resized = img.resize_exact(w, h, FilterType::Lanczos3);

    let written = match container {
        SourceContainer::Jpeg => {
            let file = std::fs::File::create(&target)?;
            let writer = std::io::BufWriter::new(file);
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(writer, RESIZE_JPEG_QUALITY);
            DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder)
        }
        _ => resized.save_with_format(&target, container.image_format()),
    };
    if let Err(e) = written {
        let _ = std::fs::remove_file(&target);
        return Err(BackendError::ProcessingFailed(format!(
            "Failed to write {}: {}",
            target.display(),
            e
        )));
    }

    tracing::debug!(source = %source.display(), width = w, height = h, "created resized copy");
    Ok(target)
}
