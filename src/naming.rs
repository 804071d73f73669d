//! Derived filename scheme.
//!
//! Every generated file sits next to its source and is named from it:
//!
//! | Kind | Pattern | Example |
//! |---|---|---|
//! | Converted variant | `{stem}[-q{quality}].{avif,webp}` | `photo.avif`, `photo-q65.avif` |
//! | Resized copy | `{stem}-{W}x{H}.{ext}` | `photo-800x600.jpg` |
//!
//! The quality suffix appears only when the quality differs from the format's
//! configured default, so the common case keeps a stable filename. Destination
//! paths are a pure function of their inputs.

use crate::imaging::TargetFormat;
use std::path::{Path, PathBuf};

/// Dimension key recorded for a variant whose own size is unknown, or for
/// the variant of the unresized original.
pub const ORIGINAL_KEY: &str = "original";

/// Where the converted variant of `source` lives.
pub fn destination_path(
    source: &Path,
    format: TargetFormat,
    quality: u32,
    default_quality: u32,
) -> PathBuf {
    let stem = file_stem(source);
    let suffix = if quality != default_quality {
        format!("-q{quality}")
    } else {
        String::new()
    };
    source.with_file_name(format!("{stem}{suffix}.{}", format.extension()))
}

/// Where a proportionally resized copy of `source` lives.
pub fn resized_path(source: &Path, width: u32, height: u32) -> PathBuf {
    let stem = file_stem(source);
    let name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{width}x{height}.{ext}"),
        None => format!("{stem}-{width}x{height}"),
    };
    source.with_file_name(name)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Split a trailing `-WxH` size suffix off a file stem.
///
/// - `"photo-800x600"` → `("photo", Some((800, 600)))`
/// - `"photo-800"` → `("photo-800", None)`
/// - `"2024-01x02"` → `("2024", Some((1, 2)))`
pub fn split_size_suffix(stem: &str) -> (&str, Option<(u32, u32)>) {
    if let Some(dash) = stem.rfind('-')
        && let Some((w, h)) = stem[dash + 1..].split_once('x')
        && let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>())
    {
        return (&stem[..dash], Some((w, h)));
    }
    (stem, None)
}

/// File name with any `-WxH` size suffix removed: `a-800x600.jpg` → `a.jpg`.
pub fn strip_size_suffix(file_name: &str) -> String {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file_name, None),
    };
    let (base, _) = split_size_suffix(stem);
    match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    }
}

/// True if the file name carries a `-WxH` size suffix.
pub fn has_size_suffix(path: &Path) -> bool {
    split_size_suffix(&file_stem(path)).1.is_some()
}

/// Registry key for a variant's dimensions.
pub fn dimension_key(dimensions: Option<(u32, u32)>) -> String {
    match dimensions {
        Some((w, h)) => format!("{w}x{h}"),
        None => ORIGINAL_KEY.to_string(),
    }
}

/// Inverse of [`dimension_key`]; `None` for the original sentinel.
pub fn parse_dimension_key(key: &str) -> Option<(u32, u32)> {
    let (w, h) = key.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
