//! Conversion orchestration: the one place a request becomes a file.
//!
//! [`Engine::convert`] walks a request through a fixed sequence of states and
//! leaves early, serving the original URL, the moment the request is
//! disqualified:
//!
//! ```text
//! RESOLVING → POLICY_CHECK → CACHE_CHECK → LOCKING → CONVERTING
//!           → VALIDATING → SIZE_POLICY → RECORDING → DONE
//! ```
//!
//! | State | Exit condition | Outcome |
//! |---|---|---|
//! | Resolving | no local file | `SourceUnresolvable` |
//! | Policy check | no capability, file too large, too many pixels | `PolicyRejected` |
//! | Destination | the source already is its own variant | `PolicyRejected` |
//! | Cache check | valid destination exists (no `force`) | cache hit, no lock |
//! | Locking | another worker holds the destination | `LockBusy` |
//! | Converting | backend error or panic | `BackendFailure` |
//! | Validating | missing magic bytes | `ValidationFailed` |
//! | Size policy | output not smaller than source | `SizePolicyViolation` |
//!
//! Internally every state returns `Result<_, ConversionError>` and the states
//! chain with `?`. The public call folds the error into a [`Conversion`] that
//! carries the URL to serve, so callers never handle an `Err`: the worst case
//! is serving the unconverted original.
//!
//! The lock guard lives for the rest of the attempt once taken, so it is
//! released on every exit, including a backend panic.
//!
//! A conversion failure with the detected backend is final for the call.
//! No lower-priority backend is tried until capabilities are re-detected.

use crate::capability::CapabilityDetector;
use crate::config::Settings;
use crate::imaging::{
    BackendError, Capability, ConversionBackend, ConversionParams, ExternalBackend, InProcessBackend,
    LibWebpBackend, Quality, TargetFormat, get_dimensions, is_valid_output,
};
use crate::lock::{LockError, LockManager};
use crate::naming;
use crate::registry::VariantRegistry;
use crate::source::{SourceImage, SourceRef, SourceResolver};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Why a request was turned down before any conversion work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoCapability(TargetFormat),
    FileTooLarge { size: u64, limit: u64 },
    DimensionsTooLarge { width: u32, height: u32, limit: u32 },
    /// The source already sits at the destination: same format, default
    /// quality.
    AlreadyInFormat(TargetFormat),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoCapability(format) => write!(f, "no backend can produce {format}"),
            Rejection::FileTooLarge { size, limit } => {
                write!(f, "source is {size} bytes, limit is {limit}")
            }
            Rejection::DimensionsTooLarge {
                width,
                height,
                limit,
            } => write!(f, "source is {width}x{height}, limit is {limit}px"),
            Rejection::AlreadyInFormat(format) => write!(f, "source is already {format}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("source not locally addressable: {0}")]
    SourceUnresolvable(String),
    #[error("policy rejected: {0}")]
    PolicyRejected(Rejection),
    #[error("conversion already in progress for {}", .0.display())]
    LockBusy(PathBuf),
    #[error("backend failed: {0}")]
    BackendFailure(String),
    #[error("{format} output failed validation: {}", path.display())]
    ValidationFailed { path: PathBuf, format: TargetFormat },
    #[error("output is {produced} bytes, source is {original}")]
    SizePolicyViolation { produced: u64, original: u64 },
}

/// How loudly a [`ConversionError`] is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl ConversionError {
    pub fn severity(&self) -> Severity {
        match self {
            ConversionError::PolicyRejected(_)
            | ConversionError::LockBusy(_)
            | ConversionError::SizePolicyViolation { .. } => Severity::Info,
            ConversionError::SourceUnresolvable(_) => Severity::Warn,
            ConversionError::BackendFailure(_) | ConversionError::ValidationFailed { .. } => {
                Severity::Error
            }
        }
    }

    fn log(&self, url: &str, format: TargetFormat) {
        match self.severity() {
            Severity::Info => tracing::info!(%url, %format, reason = %self, "serving original"),
            Severity::Warn => tracing::warn!(%url, %format, reason = %self, "serving original"),
            Severity::Error => tracing::error!(%url, %format, reason = %self, "serving original"),
        }
    }
}

impl From<BackendError> for ConversionError {
    fn from(e: BackendError) -> Self {
        ConversionError::BackendFailure(e.to_string())
    }
}

/// One conversion request. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub source: SourceRef,
    pub format: TargetFormat,
    /// Explicit quality. `None` resolves from settings.
    pub quality: Option<u32>,
    /// Ignore a valid cached destination and convert again.
    pub force: bool,
}

impl ConversionRequest {
    pub fn new(source: impl Into<SourceRef>, format: TargetFormat) -> Self {
        Self {
            source: source.into(),
            format,
            quality: None,
            force: false,
        }
    }

    pub fn quality(mut self, quality: u32) -> Self {
        self.quality = Some(quality.clamp(1, 100));
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A backend produced the variant during this call.
    Converted,
    /// A valid variant was already on disk.
    Cached,
    /// The original is served instead.
    Fallback(ConversionError),
}

/// Result of [`Engine::convert`]: always a URL to serve.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// Variant URL on success, the original (or empty) URL otherwise.
    pub url: String,
    /// The variant file on success.
    pub path: Option<PathBuf>,
    pub outcome: Outcome,
}

impl Conversion {
    pub fn is_variant(&self) -> bool {
        matches!(self.outcome, Outcome::Converted | Outcome::Cached)
    }

    pub fn error(&self) -> Option<&ConversionError> {
        match &self.outcome {
            Outcome::Fallback(e) => Some(e),
            _ => None,
        }
    }
}

struct Produced {
    path: PathBuf,
    url: String,
    cached: bool,
}

/// The conversion engine: detected capabilities plus the variant registry.
///
/// Settings are not owned; every call takes the snapshot to use.
pub struct Engine {
    detector: CapabilityDetector,
    registry: VariantRegistry,
}

impl Engine {
    pub fn new(detector: CapabilityDetector, registry: VariantRegistry) -> Self {
        Self { detector, registry }
    }

    /// Engine with the three standard backends and state under
    /// `settings.state_dir`.
    pub fn from_settings(settings: &Settings) -> Self {
        let b = &settings.backends;
        let backends: Vec<Box<dyn ConversionBackend>> = vec![
            Box::new(InProcessBackend::new()),
            Box::new(LibWebpBackend::new(
                b.library_memory_mb * 1024 * 1024,
                Duration::from_secs(b.library_time_limit),
            )),
            Box::new(ExternalBackend::new(
                b.external_primary.clone(),
                b.external_legacy.clone(),
                Duration::from_secs(b.external_timeout),
            )),
        ];
        Self::new(
            CapabilityDetector::new(backends, Some(&settings.state_dir)),
            VariantRegistry::open(&settings.state_dir),
        )
    }

    pub fn detector(&self) -> &CapabilityDetector {
        &self.detector
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    pub fn resolve(&self, settings: &Settings, source: &SourceRef) -> SourceImage {
        SourceResolver::new(&settings.roots, &self.registry).resolve(source)
    }

    /// Resolve and convert. Never fails: see [`Conversion`].
    pub fn convert(&self, settings: &Settings, request: &ConversionRequest) -> Conversion {
        let image = self.resolve(settings, &request.source);
        self.convert_image(settings, &image, request)
    }

    /// Convert an already resolved source.
    pub fn convert_image(
        &self,
        settings: &Settings,
        image: &SourceImage,
        request: &ConversionRequest,
    ) -> Conversion {
        match self.run(settings, image, request) {
            Ok(produced) => {
                if produced.cached {
                    tracing::debug!(url = %produced.url, "variant cache hit");
                } else {
                    tracing::info!(
                        path = %produced.path.display(),
                        format = %request.format,
                        "converted"
                    );
                }
                Conversion {
                    url: produced.url,
                    path: Some(produced.path),
                    outcome: if produced.cached {
                        Outcome::Cached
                    } else {
                        Outcome::Converted
                    },
                }
            }
            Err(e) => {
                e.log(&image.url, request.format);
                Conversion {
                    url: image.url.clone(),
                    path: None,
                    outcome: Outcome::Fallback(e),
                }
            }
        }
    }

    /// Resolve and policy-check `image` for `format` without writing
    /// anything.
    ///
    /// Capability comes first so an incapable host touches nothing on disk,
    /// then the file size, then the pixel dimensions.
    pub(crate) fn admit<'i>(
        &self,
        settings: &Settings,
        image: &'i SourceImage,
        format: TargetFormat,
    ) -> Result<Admission<'i>, ConversionError> {
        let source = image
            .path
            .as_deref()
            .filter(|p| p.is_file())
            .ok_or_else(|| ConversionError::SourceUnresolvable(image.url.clone()))?;

        let capability = self.detector.detect(format);
        if capability.is_none() {
            return Err(ConversionError::PolicyRejected(Rejection::NoCapability(
                format,
            )));
        }
        let byte_size = std::fs::metadata(source)
            .map_err(|e| ConversionError::SourceUnresolvable(format!("{}: {e}", image.url)))?
            .len();
        let limit = settings.max_file_size_bytes();
        if byte_size > limit {
            return Err(ConversionError::PolicyRejected(Rejection::FileTooLarge {
                size: byte_size,
                limit,
            }));
        }
        let (width, height) = get_dimensions(source)?;
        let max = settings.limits.max_dimension;
        if width > max || height > max {
            return Err(ConversionError::PolicyRejected(
                Rejection::DimensionsTooLarge {
                    width,
                    height,
                    limit: max,
                },
            ));
        }

        Ok(Admission {
            source,
            capability,
            byte_size,
            dimensions: (width, height),
        })
    }

    fn run(
        &self,
        settings: &Settings,
        image: &SourceImage,
        request: &ConversionRequest,
    ) -> Result<Produced, ConversionError> {
        let format = request.format;
        let Admission {
            source,
            capability,
            byte_size: original_size,
            dimensions,
        } = self.admit(settings, image, format)?;

        let quality = settings.resolve_quality(format, request.quality, dimensions);
        let destination =
            naming::destination_path(source, format, quality, settings.default_quality(format));
        let url = match destination.file_name() {
            Some(name) => image.sibling_url(&name.to_string_lossy()),
            None => return Err(ConversionError::SourceUnresolvable(image.url.clone())),
        };
        // Past this point outputs get deleted; the source must never be one.
        if same_file(source, &destination) {
            return Err(ConversionError::PolicyRejected(
                Rejection::AlreadyInFormat(format),
            ));
        }

        // Cache check
        if !request.force && check_cached(&destination, format) {
            return Ok(Produced {
                path: destination,
                url,
                cached: true,
            });
        }

        // Locking
        let _lock = LockManager::new(settings.stale_lock_timeout())
            .acquire(&destination)
            .map_err(|e| match e {
                LockError::Busy => ConversionError::LockBusy(destination.clone()),
                LockError::Io(e) => ConversionError::BackendFailure(format!("lock: {e}")),
            })?;

        // A worker that held the lock until just now may have finished the job.
        if !request.force && is_valid_output(&destination, format) {
            return Ok(Produced {
                path: destination,
                url,
                cached: true,
            });
        }

        // Converting
        let backend = self.detector.backend(capability).ok_or_else(|| {
            ConversionError::BackendFailure(format!("{capability} backend is not configured"))
        })?;
        let params = ConversionParams {
            source: source.to_path_buf(),
            output: destination.clone(),
            quality: Quality::new(quality),
            format,
        };
        tracing::debug!(
            source = %source.display(),
            %format,
            quality,
            backend = %capability,
            "converting"
        );
        match catch_unwind(AssertUnwindSafe(|| backend.convert(&params))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                discard(&destination);
                return Err(e.into());
            }
            Err(_) => {
                discard(&destination);
                return Err(ConversionError::BackendFailure(format!(
                    "{capability} backend panicked"
                )));
            }
        }

        // Validating
        if !is_valid_output(&destination, format) {
            discard(&destination);
            return Err(ConversionError::ValidationFailed {
                path: destination,
                format,
            });
        }

        // Size policy
        if settings.policy.only_if_smaller {
            let produced = std::fs::metadata(&destination)
                .map(|m| m.len())
                .unwrap_or(u64::MAX);
            if produced >= original_size {
                discard(&destination);
                return Err(ConversionError::SizePolicyViolation {
                    produced,
                    original: original_size,
                });
            }
        }

        // Recording
        if let Err(e) = self
            .registry
            .record(&image.identity, format, &destination, &url)
        {
            tracing::warn!(path = %destination.display(), error = %e, "could not record variant");
        }

        Ok(Produced {
            path: destination,
            url,
            cached: false,
        })
    }
}

/// A source that passed the policy check.
pub(crate) struct Admission<'i> {
    pub(crate) source: &'i Path,
    pub(crate) capability: Capability,
    pub(crate) byte_size: u64,
    pub(crate) dimensions: (u32, u32),
}

/// Whether `a` and `b` name the same file, allowing for a case-insensitive
/// filesystem (`photo.WEBP` and `photo.webp`).
fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    if let (Ok(a), Ok(b)) = (a.canonicalize(), b.canonicalize())
        && a == b
    {
        return true;
    }
    a.parent() == b.parent()
        && match (a.file_name(), b.file_name()) {
            (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
            _ => false,
        }
}

/// True when `destination` holds a valid variant. An invalid file is removed.
fn check_cached(destination: &Path, format: TargetFormat) -> bool {
    if !destination.exists() {
        return false;
    }
    if is_valid_output(destination, format) {
        return true;
    }
    tracing::warn!(path = %destination.display(), %format, "removing corrupt cached variant");
    discard(destination);
    false
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "could not remove output");
    }
}
