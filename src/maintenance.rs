//! Operator actions over many sources at once.
//!
//! | Action | What it does |
//! |---|---|
//! | [`register_upload`] | Register an original (and its size files), convert them when `uploads.auto_convert` |
//! | [`bulk_convert`] | Convert every registered attachment, or every JPEG/PNG/GIF under the roots, in parallel |
//! | [`purge`] | Delete every generated AVIF/WEBP, forget recorded variants |
//! | [`sweep_invalid`] | Delete generated AVIF/WEBP that fail validation |
//!
//! Registered originals and their registered sizes are never deleted, even
//! when they are themselves AVIF or WEBP files.
//!
//! Bulk conversion reports progress through an optional channel so the CLI
//! can print as work completes, and returns totals as [`BulkStats`].

use crate::config::Settings;
use crate::convert::{Conversion, ConversionRequest, Engine, Outcome, Severity};
use crate::imaging::{TargetFormat, breakpoint_sizes, get_dimensions, is_valid_output, resize_copy};
use crate::registry::{Attachment, RegistryError, normalize_path};
use crate::source::{SourceImage, sibling_url, url_identity};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use walkdir::WalkDir;

/// Per-format result of converting one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantStatus {
    Converted,
    Cached,
    /// Disqualified by policy, busy, or unproductive.
    Skipped,
    /// A backend or validation failure.
    Failed,
}

impl VariantStatus {
    pub fn of(conversion: &Conversion) -> Self {
        match &conversion.outcome {
            Outcome::Converted => VariantStatus::Converted,
            Outcome::Cached => VariantStatus::Cached,
            Outcome::Fallback(e) if e.severity() == Severity::Error => VariantStatus::Failed,
            Outcome::Fallback(_) => VariantStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatResult {
    pub format: TargetFormat,
    pub status: VariantStatus,
    /// Served URL.
    pub url: String,
    /// Reason the original is served, if it is.
    pub reason: Option<String>,
}

/// Progress events from [`bulk_convert`].
#[derive(Debug, Clone)]
pub enum BulkEvent {
    Started { total: usize },
    SourceDone {
        source: PathBuf,
        results: Vec<FormatResult>,
    },
}

/// Totals over a batch of conversions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkStats {
    pub converted: u32,
    pub cached: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl BulkStats {
    pub fn add(&mut self, status: VariantStatus) {
        match status {
            VariantStatus::Converted => self.converted += 1,
            VariantStatus::Cached => self.cached += 1,
            VariantStatus::Skipped => self.skipped += 1,
            VariantStatus::Failed => self.failed += 1,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            converted: self.converted + other.converted,
            cached: self.cached + other.cached,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }

    pub fn total(&self) -> u32 {
        self.converted + self.cached + self.skipped + self.failed
    }
}

impl fmt::Display for BulkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} converted, {} cached", self.converted, self.cached)?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        write!(f, " ({} total)", self.total())
    }
}

/// Files removed by [`purge`] or [`sweep_invalid`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub examined: u32,
    pub removed: u32,
    pub bytes: u64,
    /// Generated-looking files kept because they are registered originals.
    pub protected: u32,
}

impl fmt::Display for CleanupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} files removed ({:.1} MB)",
            self.removed,
            self.examined,
            self.bytes as f64 / (1024.0 * 1024.0)
        )?;
        if self.protected > 0 {
            write!(f, ", {} protected", self.protected)?;
        }
        Ok(())
    }
}

// =============================================================================
// Conversion
// =============================================================================

/// Convert one source into every enabled format.
pub fn convert_source(
    engine: &Engine,
    settings: &Settings,
    image: &SourceImage,
    force: bool,
) -> Vec<FormatResult> {
    settings
        .formats()
        .into_iter()
        .map(|format| {
            let request = ConversionRequest::new(image.url.as_str(), format).force(force);
            let conversion = engine.convert_image(settings, image, &request);
            FormatResult {
                format,
                status: VariantStatus::of(&conversion),
                reason: conversion.error().map(ToString::to_string),
                url: conversion.url,
            }
        })
        .collect()
}

/// Sources to convert for one attachment: the original, its registered
/// sizes, and breakpoint copies when pre-generation is on.
pub fn attachment_sources(settings: &Settings, attachment: &Attachment) -> Vec<SourceImage> {
    let identity = attachment.identity();
    let source_for = |path: &Path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        SourceImage {
            path: Some(path.to_path_buf()),
            url: sibling_url(&attachment.url, &name),
            identity: identity.clone(),
        }
    };

    let mut paths: Vec<PathBuf> = attachment.files().map(Path::to_path_buf).collect();
    if settings.uploads.pregenerate {
        paths.extend(breakpoint_copies(&attachment.path, &settings.uploads.breakpoints));
    }
    let mut seen = BTreeSet::new();
    paths
        .iter()
        .filter(|p| seen.insert(p.to_path_buf()))
        .map(|p| source_for(p))
        .collect()
}

fn breakpoint_copies(original: &Path, breakpoints: &[u32]) -> Vec<PathBuf> {
    let dimensions = match get_dimensions(original) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(path = %original.display(), error = %e, "cannot pre-generate sizes");
            return Vec::new();
        }
    };
    breakpoint_sizes(dimensions, breakpoints)
        .into_iter()
        .filter_map(|(w, _)| match resize_copy(original, Some(w), None) {
            Ok(copy) => Some(copy),
            Err(e) => {
                tracing::warn!(path = %original.display(), width = w, error = %e, "resize failed");
                None
            }
        })
        .collect()
}

/// Register an uploaded original and, when enabled, convert it now.
pub fn register_upload(
    engine: &Engine,
    settings: &Settings,
    url: &str,
    path: &Path,
    sizes: Vec<PathBuf>,
) -> Result<(Attachment, BulkStats), RegistryError> {
    let attachment = engine.registry().register_attachment(url, path, sizes)?;
    tracing::info!(id = attachment.id, path = %path.display(), "registered upload");

    let mut stats = BulkStats::default();
    if settings.uploads.auto_convert {
        for source in attachment_sources(settings, &attachment) {
            for result in convert_source(engine, settings, &source, false) {
                stats.add(result.status);
            }
        }
    }
    Ok((attachment, stats))
}

/// Convertible sources under the configured content roots.
pub fn scan_roots(settings: &Settings) -> Vec<SourceImage> {
    let mut sources = Vec::new();
    for root in &settings.roots {
        for entry in WalkDir::new(&root.path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !has_source_extension(path) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&root.path) else {
                continue;
            };
            let relative: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let url = format!("{}/{}", root.url.trim_end_matches('/'), relative.join("/"));
            sources.push(SourceImage {
                path: Some(path.to_path_buf()),
                identity: url_identity(&url),
                url,
            });
        }
    }
    sources
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "gif"))
}

/// Convert every registered attachment, or every source under the roots
/// when nothing is registered.
pub fn bulk_convert(
    engine: &Engine,
    settings: &Settings,
    force: bool,
    progress: Option<Sender<BulkEvent>>,
) -> BulkStats {
    let attachments = engine.registry().attachments();
    let sources: Vec<SourceImage> = if attachments.is_empty() {
        scan_roots(settings)
    } else {
        attachments
            .iter()
            .flat_map(|a| attachment_sources(settings, a))
            .collect()
    };

    if let Some(tx) = &progress {
        tx.send(BulkEvent::Started {
            total: sources.len(),
        })
        .ok();
    }
    tracing::info!(sources = sources.len(), "bulk conversion started");

    sources
        .par_iter()
        .map(|source| {
            let results = convert_source(engine, settings, source, force);
            let mut stats = BulkStats::default();
            for r in &results {
                stats.add(r.status);
            }
            if let (Some(tx), Some(path)) = (&progress, &source.path) {
                tx.send(BulkEvent::SourceDone {
                    source: path.clone(),
                    results,
                })
                .ok();
            }
            stats
        })
        .reduce(BulkStats::default, BulkStats::merge)
}

// =============================================================================
// Cleanup
// =============================================================================

/// AVIF/WEBP files under the roots (recursively) and in each attachment's
/// own directory.
fn managed_files(engine: &Engine, settings: &Settings) -> Vec<(PathBuf, TargetFormat)> {
    let mut walks: Vec<WalkDir> = settings
        .roots
        .iter()
        .map(|r| WalkDir::new(&r.path))
        .collect();
    let attachment_dirs: BTreeSet<PathBuf> = engine
        .registry()
        .attachments()
        .iter()
        .filter_map(|a| a.path.parent().map(Path::to_path_buf))
        .collect();
    walks.extend(attachment_dirs.iter().map(|d| WalkDir::new(d).max_depth(1)));

    let mut seen = BTreeSet::new();
    walks
        .into_iter()
        .flat_map(|w| w.into_iter().filter_map(Result::ok))
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let format = e
                .path()
                .extension()
                .and_then(|x| x.to_str())
                .and_then(TargetFormat::from_extension)?;
            Some((e.into_path(), format))
        })
        .filter(|(p, _)| seen.insert(normalize_path(p)))
        .collect()
}

fn cleanup(
    engine: &Engine,
    settings: &Settings,
    mut should_remove: impl FnMut(&Path, TargetFormat) -> bool,
) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let protected = engine.registry().protected_paths();
    for (path, format) in managed_files(engine, settings) {
        stats.examined += 1;
        if protected.contains(&normalize_path(&path)) {
            stats.protected += 1;
            continue;
        }
        if !should_remove(&path, format) {
            continue;
        }
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed");
                stats.removed += 1;
                stats.bytes += size;
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove"),
        }
    }
    stats
}

/// Delete every generated variant and forget what the registry recorded.
pub fn purge(engine: &Engine, settings: &Settings) -> Result<CleanupStats, RegistryError> {
    let stats = cleanup(engine, settings, |_, _| true);
    engine.registry().clear_variants()?;
    tracing::info!(removed = stats.removed, "purged generated variants");
    Ok(stats)
}

/// Delete generated variants that fail magic-byte validation.
pub fn sweep_invalid(engine: &Engine, settings: &Settings) -> CleanupStats {
    let stats = cleanup(engine, settings, |path, format| !is_valid_output(path, format));
    tracing::info!(removed = stats.removed, "swept invalid variants");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDetector;
    use crate::config::ContentRoot;
    use crate::imaging::Capability;
    use crate::imaging::backend::tests::{MockBackend, MockOutput};
    use crate::registry::VariantRegistry;
    use crate::test_helpers::{fake_avif_bytes, fake_webp_bytes, write_jpeg, write_png_rgba};
    use std::fs;
    use tempfile::TempDir;

    fn setup(output: MockOutput) -> (TempDir, Engine, Settings) {
        let tmp = TempDir::new().unwrap();
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(uploads.join("2024")).unwrap();
        let state = tmp.path().join("state");
        let engine = Engine::new(
            CapabilityDetector::new(
                vec![Box::new(MockBackend::producing(Capability::InProcess, output))],
                None,
            ),
            VariantRegistry::open(&state),
        );
        let settings = Settings {
            state_dir: state,
            roots: vec![ContentRoot {
                url: "https://x.test/uploads/".into(),
                path: uploads,
            }],
            ..Settings::default()
        };
        (tmp, engine, settings)
    }

    fn uploads(tmp: &TempDir) -> PathBuf {
        tmp.path().join("uploads")
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn stats_display() {
        let stats = BulkStats {
            converted: 3,
            cached: 1,
            skipped: 0,
            failed: 2,
        };
        assert_eq!(stats.to_string(), "3 converted, 1 cached, 2 failed (6 total)");
        assert_eq!(
            BulkStats::default().to_string(),
            "0 converted, 0 cached (0 total)"
        );
    }

    #[test]
    fn stats_merge() {
        let mut a = BulkStats::default();
        a.add(VariantStatus::Converted);
        let mut b = BulkStats::default();
        b.add(VariantStatus::Skipped);
        b.add(VariantStatus::Converted);
        assert_eq!(
            a.merge(b),
            BulkStats {
                converted: 2,
                cached: 0,
                skipped: 1,
                failed: 0
            }
        );
    }

    // =========================================================================
    // Scanning and bulk conversion
    // =========================================================================

    #[test]
    fn scan_finds_sources_and_maps_urls() {
        let (tmp, _, settings) = setup(MockOutput::Valid(60));
        write_jpeg(&uploads(&tmp).join("2024/a.jpg"), 16, 16);
        write_png_rgba(&uploads(&tmp).join("b.PNG"), 16, 16);
        fs::write(uploads(&tmp).join("a.avif"), fake_avif_bytes(80)).unwrap();
        fs::write(uploads(&tmp).join("notes.txt"), b"hi").unwrap();

        let sources = scan_roots(&settings);
        let urls: Vec<&str> = sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://x.test/uploads/2024/a.jpg", "https://x.test/uploads/b.PNG"]
        );
        assert_eq!(sources[0].identity, url_identity("https://x.test/uploads/2024/a.jpg"));
    }

    #[test]
    fn bulk_converts_roots_then_hits_cache() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        write_jpeg(&uploads(&tmp).join("a.jpg"), 32, 32);
        write_jpeg(&uploads(&tmp).join("2024/b.jpg"), 32, 32);

        let first = bulk_convert(&engine, &settings, false, None);
        assert_eq!(first.converted, 4);
        assert!(uploads(&tmp).join("2024/b.webp").exists());

        let second = bulk_convert(&engine, &settings, false, None);
        assert_eq!(second.cached, 4);
        assert_eq!(second.converted, 0);
    }

    #[test]
    fn bulk_respects_disabled_webp() {
        let (tmp, engine, mut settings) = setup(MockOutput::Valid(60));
        settings.policy.webp = false;
        write_jpeg(&uploads(&tmp).join("a.jpg"), 32, 32);

        let stats = bulk_convert(&engine, &settings, false, None);
        assert_eq!(stats.total(), 1);
        assert!(!uploads(&tmp).join("a.webp").exists());
    }

    #[test]
    fn bulk_reports_progress_and_failures() {
        let (tmp, engine, settings) = setup(MockOutput::Fail);
        write_jpeg(&uploads(&tmp).join("a.jpg"), 32, 32);

        let (tx, rx) = std::sync::mpsc::channel();
        let stats = bulk_convert(&engine, &settings, false, Some(tx));
        assert_eq!(stats.failed, 2);

        let events: Vec<BulkEvent> = rx.iter().collect();
        assert!(matches!(events[0], BulkEvent::Started { total: 1 }));
        match &events[1] {
            BulkEvent::SourceDone { source, results } => {
                assert_eq!(source, &uploads(&tmp).join("a.jpg"));
                assert!(results.iter().all(|r| r.status == VariantStatus::Failed));
                assert!(results[0].reason.is_some());
                assert_eq!(results[0].url, "https://x.test/uploads/a.jpg");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    #[test]
    fn upload_converts_original_and_sizes() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        let original = uploads(&tmp).join("photo.jpg");
        let thumb = uploads(&tmp).join("photo-150x75.jpg");
        write_jpeg(&original, 300, 150);
        write_jpeg(&thumb, 150, 75);

        let (attachment, stats) = register_upload(
            &engine,
            &settings,
            "https://x.test/uploads/photo.jpg",
            &original,
            vec![thumb],
        )
        .unwrap();
        assert_eq!(attachment.id, 1);
        assert_eq!(stats.converted, 4);
        assert!(uploads(&tmp).join("photo-150x75.avif").exists());
    }

    #[test]
    fn upload_without_auto_convert_only_registers() {
        let (tmp, engine, mut settings) = setup(MockOutput::Valid(60));
        settings.uploads.auto_convert = false;
        let original = uploads(&tmp).join("photo.jpg");
        write_jpeg(&original, 64, 64);

        let (_, stats) =
            register_upload(&engine, &settings, "u/photo.jpg", &original, vec![]).unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(engine.registry().attachments().len(), 1);
    }

    #[test]
    fn pregenerate_creates_breakpoint_copies() {
        let (tmp, _, mut settings) = setup(MockOutput::Valid(60));
        settings.uploads.pregenerate = true;
        settings.uploads.breakpoints = vec![100, 150, 400];
        let original = uploads(&tmp).join("photo.jpg");
        write_jpeg(&original, 200, 100);
        let attachment = Attachment {
            id: 1,
            url: "https://x.test/uploads/photo.jpg".into(),
            path: original,
            sizes: vec![],
        };

        let sources = attachment_sources(&settings, &attachment);
        let urls: Vec<&str> = sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://x.test/uploads/photo.jpg",
                "https://x.test/uploads/photo-100x50.jpg",
                "https://x.test/uploads/photo-150x75.jpg",
            ]
        );
        assert!(sources.iter().all(|s| s.identity == "attachment:1"));
    }

    #[test]
    fn bulk_prefers_registered_attachments() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        let original = uploads(&tmp).join("photo.jpg");
        write_jpeg(&original, 64, 64);
        write_jpeg(&uploads(&tmp).join("unregistered.jpg"), 64, 64);
        engine
            .registry()
            .register_attachment("https://x.test/uploads/photo.jpg", &original, vec![])
            .unwrap();

        let stats = bulk_convert(&engine, &settings, false, None);
        assert_eq!(stats.converted, 2);
        assert!(!uploads(&tmp).join("unregistered.avif").exists());
    }

    // =========================================================================
    // Purge and sweep
    // =========================================================================

    #[test]
    fn purge_spares_registered_files() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        let dir = uploads(&tmp);
        fs::write(dir.join("photo.avif"), fake_avif_bytes(100)).unwrap();
        fs::write(dir.join("2024/other.webp"), fake_webp_bytes(100)).unwrap();
        // An original that happens to be a WEBP, with an AVIF thumbnail.
        fs::write(dir.join("art.webp"), fake_webp_bytes(100)).unwrap();
        fs::write(dir.join("art-150x150.avif"), fake_avif_bytes(100)).unwrap();
        write_jpeg(&dir.join("photo.jpg"), 16, 16);
        engine
            .registry()
            .register_attachment(
                "https://x.test/uploads/art.webp",
                &dir.join("art.webp"),
                vec![dir.join("art-150x150.avif")],
            )
            .unwrap();

        let stats = purge(&engine, &settings).unwrap();
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.protected, 2);
        assert!(!dir.join("photo.avif").exists());
        assert!(!dir.join("2024/other.webp").exists());
        assert!(dir.join("art.webp").exists());
        assert!(dir.join("art-150x150.avif").exists());
        assert!(dir.join("photo.jpg").exists());
        assert!(engine.registry().snapshot().variants.is_empty());
    }

    /// `path` spelled relative to the working directory.
    fn relative_to_cwd(path: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        let depth = cwd.components().count() - 1;
        let mut relative: PathBuf = std::iter::repeat_n("..", depth).collect();
        relative.push(path.strip_prefix("/").unwrap());
        relative
    }

    #[test]
    fn purge_spares_original_registered_by_relative_path() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        let dir = uploads(&tmp);
        fs::write(dir.join("art.webp"), fake_webp_bytes(100)).unwrap();
        fs::write(dir.join("art.avif"), fake_avif_bytes(100)).unwrap();
        let relative = relative_to_cwd(&dir.join("art.webp"));
        assert!(relative.is_relative());
        let mut quiet = settings.clone();
        quiet.uploads.auto_convert = false;
        register_upload(
            &engine,
            &quiet,
            "https://x.test/uploads/art.webp",
            &relative,
            vec![],
        )
        .unwrap();

        let stats = purge(&engine, &settings).unwrap();
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.protected, 1);
        assert_eq!(stats.removed, 1);
        assert!(dir.join("art.webp").exists());
        assert!(!dir.join("art.avif").exists());
    }

    #[test]
    fn sweep_removes_only_invalid_variants() {
        let (tmp, engine, settings) = setup(MockOutput::Valid(60));
        let dir = uploads(&tmp);
        fs::write(dir.join("good.avif"), fake_avif_bytes(100)).unwrap();
        fs::write(dir.join("bad.avif"), vec![b'x'; 100]).unwrap();
        fs::write(dir.join("tiny.webp"), &fake_webp_bytes(100)[..20]).unwrap();

        let stats = sweep_invalid(&engine, &settings);
        assert_eq!(stats.examined, 3);
        assert_eq!(stats.removed, 2);
        assert!(dir.join("good.avif").exists());
        assert!(!dir.join("bad.avif").exists());
        assert!(!dir.join("tiny.webp").exists());
    }
}
