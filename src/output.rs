//! CLI output formatting for operator actions.
//!
//! # Information-First Display
//!
//! Each source leads with its file name; per-format outcomes follow as
//! indented context lines. Full paths and failure reasons are secondary and
//! shown only where they help trace a problem back to a file.
//!
//! # Output Format
//!
//! ## Detect
//!
//! ```text
//! Capabilities
//!     avif: in-process
//!     webp: library
//! ```
//!
//! ## Convert / Bulk
//!
//! ```text
//! 001 photo.jpg
//!     Source: /srv/uploads/2024/photo.jpg
//!     avif: converted → https://example.com/uploads/2024/photo.avif
//!     webp: skipped (policy rejected: source is 5000x3000, limit is 4096px)
//! ```
//!
//! # Architecture
//!
//! Each action has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::convert::{Conversion, Outcome};
use crate::imaging::{Capability, TargetFormat};
use crate::maintenance::{BulkEvent, FormatResult, VariantStatus};
use std::path::Path;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn status_label(status: VariantStatus) -> &'static str {
    match status {
        VariantStatus::Converted => "converted",
        VariantStatus::Cached => "cached",
        VariantStatus::Skipped => "skipped",
        VariantStatus::Failed => "failed",
    }
}

/// One indented line per format: a URL for variants, a reason otherwise.
fn result_line(result: &FormatResult) -> String {
    let label = status_label(result.status);
    match &result.reason {
        Some(reason) => format!("    {}: {} ({})", result.format, label, reason),
        None => format!("    {}: {} \u{2192} {}", result.format, label, result.url),
    }
}

// ============================================================================
// Detect
// ============================================================================

pub fn format_capabilities(verdicts: &[(TargetFormat, Capability)]) -> Vec<String> {
    let mut lines = vec!["Capabilities".to_string()];
    for (format, capability) in verdicts {
        lines.push(format!("    {}: {}", format, capability));
    }
    lines
}

pub fn print_capabilities(verdicts: &[(TargetFormat, Capability)]) {
    for line in format_capabilities(verdicts) {
        println!("{}", line);
    }
}

// ============================================================================
// Convert
// ============================================================================

/// Format a single conversion result.
pub fn format_conversion(format: TargetFormat, conversion: &Conversion) -> Vec<String> {
    let line = match &conversion.outcome {
        Outcome::Converted => format!("{}: converted \u{2192} {}", format, conversion.url),
        Outcome::Cached => format!("{}: cached \u{2192} {}", format, conversion.url),
        Outcome::Fallback(e) => format!("{}: original \u{2192} {} ({})", format, conversion.url, e),
    };
    vec![line]
}

pub fn print_conversion(format: TargetFormat, conversion: &Conversion) {
    for line in format_conversion(format, conversion) {
        println!("{}", line);
    }
}

// ============================================================================
// Bulk
// ============================================================================

/// Format a single bulk progress event. `index` is the 1-based position of
/// a completed source, ignored for other events.
pub fn format_bulk_event(index: usize, event: &BulkEvent) -> Vec<String> {
    match event {
        BulkEvent::Started { total } => vec![format!("Converting {} sources", total)],
        BulkEvent::SourceDone { source, results } => {
            let mut lines = vec![
                format!("{} {}", format_index(index), file_name(source)),
                format!("    Source: {}", source.display()),
            ];
            lines.extend(results.iter().map(result_line));
            lines
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ConversionError;
    use std::path::PathBuf;

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(1), "001");
        assert_eq!(format_index(100), "100");
    }

    #[test]
    fn capabilities_listing() {
        let lines = format_capabilities(&[
            (TargetFormat::Avif, Capability::InProcess),
            (TargetFormat::Webp, Capability::None),
        ]);
        assert_eq!(lines, vec!["Capabilities", "    avif: in-process", "    webp: none"]);
    }

    #[test]
    fn conversion_lines() {
        let converted = Conversion {
            url: "u/photo.avif".into(),
            path: Some(PathBuf::from("/up/photo.avif")),
            outcome: Outcome::Converted,
        };
        assert_eq!(
            format_conversion(TargetFormat::Avif, &converted),
            vec!["avif: converted \u{2192} u/photo.avif"]
        );

        let busy = Conversion {
            url: "u/photo.jpg".into(),
            path: None,
            outcome: Outcome::Fallback(ConversionError::BackendFailure("boom".into())),
        };
        assert_eq!(
            format_conversion(TargetFormat::Webp, &busy),
            vec!["webp: original \u{2192} u/photo.jpg (backend failed: boom)"]
        );
    }

    #[test]
    fn bulk_source_block() {
        let event = BulkEvent::SourceDone {
            source: PathBuf::from("/up/2024/photo.jpg"),
            results: vec![
                FormatResult {
                    format: TargetFormat::Avif,
                    status: VariantStatus::Converted,
                    url: "u/photo.avif".into(),
                    reason: None,
                },
                FormatResult {
                    format: TargetFormat::Webp,
                    status: VariantStatus::Skipped,
                    url: "u/photo.jpg".into(),
                    reason: Some("too big".into()),
                },
            ],
        };
        assert_eq!(
            format_bulk_event(3, &event),
            vec![
                "003 photo.jpg",
                "    Source: /up/2024/photo.jpg",
                "    avif: converted \u{2192} u/photo.avif",
                "    webp: skipped (too big)",
            ]
        );
    }

    #[test]
    fn bulk_started_line() {
        assert_eq!(
            format_bulk_event(0, &BulkEvent::Started { total: 12 }),
            vec!["Converting 12 sources"]
        );
    }
}
