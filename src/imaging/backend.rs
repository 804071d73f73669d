//! Conversion backend trait and shared types.
//!
//! The [`ConversionBackend`] trait is the common contract for the three
//! strategies a host may offer, listed in probing priority:
//!
//! | Capability | Implementation | Mechanism |
//! |---|---|---|
//! | `InProcess` | [`InProcessBackend`](super::in_process::InProcessBackend) | `image` crate codecs, statically linked |
//! | `Library` | [`LibWebpBackend`](super::library::LibWebpBackend) | libwebp via the `webp` crate |
//! | `External` | [`ExternalBackend`](super::external::ExternalBackend) | ImageMagick command-line tool |
//!
//! A backend writes `params.output` on success. On failure it may leave a
//! partial file behind; the caller deletes it.

use super::format::TargetFormat;
use super::params::{ConversionParams, Quality};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported source container: {0}")]
    UnsupportedSource(String),
    #[error("{0} output is not supported by this backend")]
    UnsupportedFormat(TargetFormat),
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Which strategy (if any) can produce a format on this host.
///
/// Variant order is probing priority: fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    InProcess,
    Library,
    External,
    None,
}

impl Capability {
    pub fn is_none(self) -> bool {
        self == Capability::None
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::InProcess => "in-process",
            Capability::Library => "library",
            Capability::External => "external",
            Capability::None => "none",
        })
    }
}

/// One conversion strategy.
///
/// Implementations must be `Send + Sync`: bulk conversion shares them across
/// rayon workers, and an [`Engine`](crate::Engine) may move between threads.
pub trait ConversionBackend: Send + Sync {
    /// The capability this backend provides when it works.
    fn capability(&self) -> Capability;

    /// Cheap availability check (codec compiled in, library loaded,
    /// executable on `PATH`). A `true` here is still confirmed by [`probe`].
    ///
    /// [`probe`]: ConversionBackend::probe
    fn supports(&self, format: TargetFormat) -> bool;

    /// Convert `params.source` into `params.output`.
    fn convert(&self, params: &ConversionParams) -> Result<(), BackendError>;

    /// Real 1×1 round-trip through temporary files.
    ///
    /// Returns `false` on any failure; never propagates an error.
    fn probe(&self, format: TargetFormat) -> bool {
        probe_round_trip(self, format).unwrap_or(false)
    }
}

fn probe_round_trip<B: ConversionBackend + ?Sized>(
    backend: &B,
    format: TargetFormat,
) -> Result<bool, BackendError> {
    let dir = tempfile::Builder::new().prefix("avifier-probe-").tempdir()?;
    let source = dir.path().join("probe.png");
    let output = dir.path().join(format!("probe.{}", format.extension()));
    write_probe_image(&source)?;

    backend.convert(&ConversionParams {
        source,
        output: output.clone(),
        quality: Quality::new(80),
        format,
    })?;

    let bytes = std::fs::read(&output)?;
    Ok(!bytes.is_empty() && format.has_signature(&bytes))
}

fn write_probe_image(path: &Path) -> Result<(), BackendError> {
    image::RgbImage::from_pixel(1, 1, image::Rgb([255, 255, 255]))
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| BackendError::ProcessingFailed(format!("probe image: {e}")))
}
