//! Settings module.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a user file only needs the keys it wants to change. The
//! result is an immutable [`Settings`] value built once per operation and
//! passed by reference into every conversion call.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! state_dir = ".avifier"     # Variant registry + capability cache
//! log_level = "info"         # Overridden by RUST_LOG
//! debug_logging = false      # true raises log_level to debug
//!
//! [quality]
//! avif = 80                  # 1-100
//! webp = 85                  # 1-100
//! smart = false              # Pick quality by image size (rules below)
//!
//! [[quality.rules]]
//! max_dimension = 1000       # Applies when the longer edge is <= this
//! avif = 85
//! webp = 90
//!
//! [[quality.rules]]
//! max_dimension = 2000
//! avif = 80
//! webp = 85
//!
//! [[quality.rules]]          # No max_dimension: any size
//! avif = 75
//! webp = 80
//!
//! [limits]
//! max_dimension = 4096       # 1000-8192 px
//! max_file_size_mb = 50      # 1-500 MB
//! stale_lock_timeout = 300   # 60-3600 s
//!
//! [policy]
//! only_if_smaller = true     # Keep a variant only if smaller than its source
//! webp = true                # Generate WEBP alongside AVIF
//!
//! [backends]
//! library_memory_mb = 256
//! library_time_limit = 60
//! external_timeout = 120
//! external_primary = "magick"
//! external_legacy = "convert"
//!
//! [uploads]
//! auto_convert = true
//! pregenerate = false
//! breakpoints = [800, 1200, 1600, 2400]
//!
//! [[roots]]
//! url = "https://example.com/uploads"
//! path = "/var/www/uploads"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::TargetFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Engine settings loaded from `config.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory holding the variant registry and capability cache.
    pub state_dir: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Raise the log filter to `debug`.
    pub debug_logging: bool,
    /// Encoding quality defaults and smart-quality rules.
    pub quality: QualityConfig,
    /// Safety ceilings checked before any conversion.
    pub limits: LimitsConfig,
    /// Output retention and format policy.
    pub policy: PolicyConfig,
    /// Resource bounds and command names for the backends.
    pub backends: BackendsConfig,
    /// Upload-time conversion.
    pub uploads: UploadsConfig,
    /// Local content roots: public URL prefix → filesystem prefix.
    pub roots: Vec<ContentRoot>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".avifier"),
            log_level: "info".to_string(),
            debug_logging: false,
            quality: QualityConfig::default(),
            limits: LimitsConfig::default(),
            policy: PolicyConfig::default(),
            backends: BackendsConfig::default(),
            uploads: UploadsConfig::default(),
            roots: Vec::new(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Validation(format!(
            "{name} must be {min}-{max} (got {value})"
        )));
    }
    Ok(())
}

impl Settings {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("quality.avif", self.quality.avif, 1, 100)?;
        check_range("quality.webp", self.quality.webp, 1, 100)?;
        for (i, rule) in self.quality.rules.iter().enumerate() {
            check_range(&format!("quality.rules[{i}].avif"), rule.avif, 1, 100)?;
            check_range(&format!("quality.rules[{i}].webp"), rule.webp, 1, 100)?;
            if rule.max_dimension == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "quality.rules[{i}].max_dimension must be non-zero"
                )));
            }
        }
        check_range("limits.max_dimension", self.limits.max_dimension, 1000, 8192)?;
        check_range("limits.max_file_size_mb", self.limits.max_file_size_mb, 1, 500)?;
        check_range(
            "limits.stale_lock_timeout",
            self.limits.stale_lock_timeout,
            60,
            3600,
        )?;
        if self.backends.library_memory_mb == 0 || self.backends.library_time_limit == 0 {
            return Err(ConfigError::Validation(
                "backends library limits must be non-zero".into(),
            ));
        }
        if self.backends.external_timeout == 0 {
            return Err(ConfigError::Validation(
                "backends.external_timeout must be non-zero".into(),
            ));
        }
        if self.uploads.breakpoints.contains(&0) {
            return Err(ConfigError::Validation(
                "uploads.breakpoints must be non-zero".into(),
            ));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "log_level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    /// The configured default quality for a format.
    pub fn default_quality(&self, format: TargetFormat) -> u32 {
        match format {
            TargetFormat::Avif => self.quality.avif,
            TargetFormat::Webp => self.quality.webp,
        }
    }

    /// Quality for one conversion.
    ///
    /// An explicit quality wins. Otherwise the first smart-quality rule
    /// covering the image's longer edge applies (when enabled), else the
    /// format default.
    pub fn resolve_quality(
        &self,
        format: TargetFormat,
        explicit: Option<u32>,
        dimensions: (u32, u32),
    ) -> u32 {
        if let Some(q) = explicit {
            return q.clamp(1, 100);
        }
        if self.quality.smart
            && let Some(q) = self.quality.smart_quality(format, dimensions.0.max(dimensions.1))
        {
            return q;
        }
        self.default_quality(format)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.limits.max_file_size_mb * 1024 * 1024
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.stale_lock_timeout)
    }

    /// Formats generated for each source, AVIF first.
    pub fn formats(&self) -> Vec<TargetFormat> {
        let mut formats = vec![TargetFormat::Avif];
        if self.policy.webp {
            formats.push(TargetFormat::Webp);
        }
        formats
    }

    /// Effective log filter before `RUST_LOG` is considered.
    pub fn effective_log_level(&self) -> &str {
        if self.debug_logging {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Encoding quality settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    /// Default AVIF quality (1 = worst, 100 = best).
    pub avif: u32,
    /// Default WEBP quality (1 = worst, 100 = best).
    pub webp: u32,
    /// Enable dimension-tiered quality selection.
    pub smart: bool,
    /// Smart-quality tiers. Order in the file does not matter.
    pub rules: Vec<QualityRule>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            avif: 80,
            webp: 85,
            smart: false,
            rules: vec![
                QualityRule {
                    max_dimension: Some(1000),
                    avif: 85,
                    webp: 90,
                },
                QualityRule {
                    max_dimension: Some(2000),
                    avif: 80,
                    webp: 85,
                },
                QualityRule {
                    max_dimension: None,
                    avif: 75,
                    webp: 80,
                },
            ],
        }
    }
}

impl QualityConfig {
    /// First rule covering `longest_edge`, evaluated in ascending
    /// `max_dimension` order with unbounded rules last.
    pub fn smart_quality(&self, format: TargetFormat, longest_edge: u32) -> Option<u32> {
        let mut rules: Vec<&QualityRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.max_dimension.unwrap_or(u32::MAX));
        rules
            .into_iter()
            .find(|r| r.max_dimension.is_none_or(|max| max >= longest_edge))
            .map(|r| match format {
                TargetFormat::Avif => r.avif,
                TargetFormat::Webp => r.webp,
            })
    }
}

/// One smart-quality tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityRule {
    /// Longer-edge ceiling in pixels. Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dimension: Option<u32>,
    pub avif: u32,
    pub webp: u32,
}

/// Safety ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest accepted pixel width or height.
    pub max_dimension: u32,
    /// Largest accepted source file, in megabytes.
    pub max_file_size_mb: u64,
    /// Age in seconds after which a lock marker is treated as abandoned.
    pub stale_lock_timeout: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_dimension: 4096,
            max_file_size_mb: 50,
            stale_lock_timeout: 300,
        }
    }
}

/// Output policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Keep a variant only when it is strictly smaller than its source.
    pub only_if_smaller: bool,
    /// Generate WEBP variants alongside AVIF.
    pub webp: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            only_if_smaller: true,
            webp: true,
        }
    }
}

/// Backend resource bounds and external command names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendsConfig {
    /// Decoder allocation ceiling for the library backend, in megabytes.
    pub library_memory_mb: u64,
    /// Wall-clock bound for one library conversion, in seconds.
    pub library_time_limit: u64,
    /// Wall-clock bound for one external tool run, in seconds.
    pub external_timeout: u64,
    /// Command tried first.
    pub external_primary: String,
    /// Command tried when the primary fails.
    pub external_legacy: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            library_memory_mb: 256,
            library_time_limit: 60,
            external_timeout: 120,
            external_primary: "magick".to_string(),
            external_legacy: "convert".to_string(),
        }
    }
}

/// Upload-time conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadsConfig {
    /// Convert new uploads as they are registered.
    pub auto_convert: bool,
    /// Also create resized copies at each breakpoint and convert them.
    pub pregenerate: bool,
    /// Widths used when `pregenerate` is on.
    pub breakpoints: Vec<u32>,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            auto_convert: true,
            pregenerate: false,
            breakpoints: vec![800, 1200, 1600, 2400],
        }
    }
}

/// A locally addressable content directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentRoot {
    /// Public URL prefix, e.g. `https://example.com/uploads`.
    pub url: String,
    /// Filesystem directory serving that prefix.
    pub path: PathBuf,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(Settings::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, including
///   arrays such as `quality.rules`.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a `config.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if no `config.toml` exists in the directory.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = dir.join("config.toml");
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<Settings, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: Settings = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load settings from `config.toml` in the given directory.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result. A relative `state_dir` or root `path` is
/// resolved against `dir`.
pub fn load_config(dir: &Path) -> Result<Settings, ConfigError> {
    let base = stock_defaults_value();
    let overlay = load_raw_config(dir)?;
    let mut settings = resolve_config(base, overlay)?;
    if settings.state_dir.is_relative() {
        settings.state_dir = dir.join(&settings.state_dir);
    }
    for root in &mut settings.roots {
        if root.path.is_relative() {
            root.path = dir.join(&root.path);
        }
    }
    Ok(settings)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Avifier Configuration
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Unknown keys will cause an error.

# Directory for the variant registry and the capability cache.
# Relative paths are resolved against the directory holding this file.
state_dir = ".avifier"

# Log filter used when RUST_LOG is not set: error, warn, info, debug, trace.
log_level = "info"

# Raise the log filter to debug.
debug_logging = false

# ---------------------------------------------------------------------------
# Quality
# ---------------------------------------------------------------------------
[quality]
# Default encoding quality per format (1 = worst, 100 = best).
# Files converted at the default quality get a plain name (photo.avif);
# any other quality is embedded in the name (photo-q65.avif).
avif = 80
webp = 85

# Pick quality by image size using the rules below.
# Rules are matched in ascending max_dimension order against the image's
# longer edge; the first match wins. A rule without max_dimension covers
# any size.
smart = false

[[quality.rules]]
max_dimension = 1000
avif = 85
webp = 90

[[quality.rules]]
max_dimension = 2000
avif = 80
webp = 85

[[quality.rules]]
avif = 75
webp = 80

# ---------------------------------------------------------------------------
# Limits
# ---------------------------------------------------------------------------
[limits]
# Sources wider or taller than this are served unconverted (1000-8192).
max_dimension = 4096

# Sources larger than this many megabytes are served unconverted (1-500).
max_file_size_mb = 50

# Seconds after which a leftover .lock marker is treated as abandoned
# by a crashed worker and removed (60-3600).
stale_lock_timeout = 300

# ---------------------------------------------------------------------------
# Policy
# ---------------------------------------------------------------------------
[policy]
# Keep a converted file only if it is strictly smaller than its source.
only_if_smaller = true

# Generate WEBP alongside AVIF.
webp = true

# ---------------------------------------------------------------------------
# Backends
# ---------------------------------------------------------------------------
[backends]
# Decoder memory ceiling (MB) and time limit (s) for the libwebp backend.
library_memory_mb = 256
library_time_limit = 60

# Wall-clock bound (s) for one run of the external tool.
external_timeout = 120

# External commands: the legacy command is tried when the primary fails.
external_primary = "magick"
external_legacy = "convert"

# ---------------------------------------------------------------------------
# Uploads
# ---------------------------------------------------------------------------
[uploads]
# Convert new uploads as they are registered.
auto_convert = true

# Also create resized copies at each breakpoint width and convert them.
pregenerate = false
breakpoints = [800, 1200, 1600, 2400]

# ---------------------------------------------------------------------------
# Content roots
# ---------------------------------------------------------------------------
# Map public URL prefixes to local directories so bare URLs can be
# converted. Repeat the block for each root. A relative path is resolved
# against the directory holding this file.
#
# [[roots]]
# url = "https://example.com/wp-content/uploads"
# path = "/var/www/html/wp-content/uploads"
"##
}
