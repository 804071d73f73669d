//! Library backend: libwebp through the `webp` crate.
//!
//! Resource ceilings are fixed before any decode work: the decoder's
//! allocation limit bounds memory, and decode plus encode run on a worker
//! thread the caller stops waiting for once the time limit passes. A worker
//! that overruns is abandoned; it never touches the output path, which is
//! written only by the caller after a result arrives in time.
//!
//! Decoding to a bare pixel buffer drops EXIF/ICC/XMP, and the encoder
//! writes no metadata chunks, so output carries nothing beyond what is
//! needed to render. The encoded buffer is owned by libwebp and freed when
//! `WebPMemory` drops, on every exit path.

use super::backend::{BackendError, Capability, ConversionBackend};
use super::format::{SourceContainer, TargetFormat};
use super::params::ConversionParams;
use image::{ImageReader, Limits};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Formats this library can write.
const SUPPORTED_FORMATS: &[TargetFormat] = &[TargetFormat::Webp];

pub struct LibWebpBackend {
    memory_limit: u64,
    time_limit: Duration,
}

impl LibWebpBackend {
    pub fn new(memory_limit: u64, time_limit: Duration) -> Self {
        Self {
            memory_limit,
            time_limit,
        }
    }
}

impl Default for LibWebpBackend {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024, Duration::from_secs(60))
    }
}

impl ConversionBackend for LibWebpBackend {
    fn capability(&self) -> Capability {
        Capability::Library
    }

    fn supports(&self, format: TargetFormat) -> bool {
        SUPPORTED_FORMATS.contains(&format)
    }

    fn convert(&self, params: &ConversionParams) -> Result<(), BackendError> {
        if !self.supports(params.format) {
            return Err(BackendError::UnsupportedFormat(params.format));
        }
        let container = SourceContainer::detect(&params.source).ok_or_else(|| {
            BackendError::UnsupportedSource(params.source.display().to_string())
        })?;

        let (tx, rx) = mpsc::channel();
        let source = params.source.clone();
        let memory_limit = self.memory_limit;
        let quality = params.quality.value() as f32;
        thread::Builder::new()
            .name("avifier-libwebp".into())
            .spawn(move || {
                let _ = tx.send(encode(&source, container, memory_limit, quality));
            })?;

        let encoded = match rx.recv_timeout(self.time_limit) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    source = %params.source.display(),
                    limit_secs = self.time_limit.as_secs(),
                    "libwebp encode abandoned"
                );
                return Err(BackendError::ResourceLimit(format!(
                    "encode exceeded {}s",
                    self.time_limit.as_secs()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(BackendError::ProcessingFailed(format!(
                    "encoder worker for {} exited without a result",
                    params.source.display()
                )));
            }
        };

        std::fs::write(&params.output, encoded)?;
        Ok(())
    }
}

/// Decode `source` under the allocation ceiling and encode it to WEBP.
fn encode(
    source: &Path,
    container: SourceContainer,
    memory_limit: u64,
    quality: f32,
) -> Result<Vec<u8>, BackendError> {
    let mut reader = ImageReader::open(source)?;
    reader.set_format(container.image_format());
    let mut limits = Limits::default();
    limits.max_alloc = Some(memory_limit);
    reader.limits(limits);

    let img = reader.decode().map_err(|e| match e {
        image::ImageError::Limits(l) => BackendError::ResourceLimit(l.to_string()),
        other => BackendError::ProcessingFailed(format!(
            "Failed to decode {}: {}",
            source.display(),
            other
        )),
    })?;

    let (width, height) = (img.width(), img.height());
    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(&rgba, width, height).encode(quality)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(&rgb, width, height).encode(quality)
    };
    Ok(encoded.to_vec())
}
