//! Target formats, source containers, and output validation.
//!
//! A converted file is only trusted if its header carries the format's
//! signature. Validation looks at a small window at the start of the file and
//! rejects anything too small to be a real image, regardless of markers.
//!
//! | Format | Required markers (first [`HEADER_WINDOW`] bytes) |
//! |---|---|
//! | AVIF | `ftyp` and `avif` |
//! | WEBP | `RIFF` and `WEBP` |

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Number of leading bytes inspected for format markers.
pub const HEADER_WINDOW: usize = 32;

/// Files smaller than this are never valid output.
pub const MIN_VALID_BYTES: u64 = 50;

/// A derivative format this crate can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Avif,
    Webp,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 2] = [TargetFormat::Avif, TargetFormat::Webp];

    /// File extension, also used as the registry key.
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Avif => "avif",
            TargetFormat::Webp => "webp",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            TargetFormat::Avif => "image/avif",
            TargetFormat::Webp => "image/webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case("avif") {
            Some(TargetFormat::Avif)
        } else if ext.eq_ignore_ascii_case("webp") {
            Some(TargetFormat::Webp)
        } else {
            None
        }
    }

    /// True if `header` carries this format's signature.
    ///
    /// Only the first [`HEADER_WINDOW`] bytes are considered.
    pub fn has_signature(self, header: &[u8]) -> bool {
        let window = &header[..header.len().min(HEADER_WINDOW)];
        match self {
            TargetFormat::Avif => contains(window, b"ftyp") && contains(window, b"avif"),
            TargetFormat::Webp => contains(window, b"RIFF") && contains(window, b"WEBP"),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unknown target format: {s}"))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Container format of a source image, detected from its bytes.
///
/// Only these containers have decoders wired into the conversion backends;
/// anything else is an immediate conversion failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceContainer {
    Jpeg,
    Png,
    Webp,
    Gif,
}

impl SourceContainer {
    /// Sniff the container from the file's leading bytes.
    pub fn detect(path: &Path) -> Option<Self> {
        let header = read_header(path, HEADER_WINDOW).ok()?;
        Self::from_header(&header)
    }

    pub fn from_header(header: &[u8]) -> Option<Self> {
        match image::guess_format(header).ok()? {
            ImageFormat::Jpeg => Some(SourceContainer::Jpeg),
            ImageFormat::Png => Some(SourceContainer::Png),
            ImageFormat::WebP => Some(SourceContainer::Webp),
            ImageFormat::Gif => Some(SourceContainer::Gif),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            SourceContainer::Jpeg => ImageFormat::Jpeg,
            SourceContainer::Png => ImageFormat::Png,
            SourceContainer::Webp => ImageFormat::WebP,
            SourceContainer::Gif => ImageFormat::Gif,
        }
    }

    /// Channels assumed when estimating decode memory.
    pub fn channels(self) -> u64 {
        match self {
            SourceContainer::Png => 4,
            _ => 3,
        }
    }
}

/// Read up to `len` bytes from the start of a file.
pub fn read_header(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut header = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut header)?;
    Ok(header)
}

/// Magic-byte validation of a produced (or cached) file.
///
/// Missing files, unreadable files, and files under [`MIN_VALID_BYTES`] are
/// invalid.
pub fn is_valid_output(path: &Path, format: TargetFormat) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() || meta.len() < MIN_VALID_BYTES {
        return false;
    }
    match read_header(path, HEADER_WINDOW) {
        Ok(header) => format.has_signature(&header),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{fake_avif_bytes, fake_webp_bytes};
    use std::fs;
    use tempfile::TempDir;

    // =========================================================================
    // Signatures
    // =========================================================================

    #[test]
    fn avif_signature_requires_both_markers() {
        assert!(TargetFormat::Avif.has_signature(b"\0\0\0\x1cftypavif\0\0\0\0"));
        assert!(!TargetFormat::Avif.has_signature(b"\0\0\0\x1cftypheic\0\0\0\0"));
        assert!(!TargetFormat::Avif.has_signature(b"avif without box"));
    }

    #[test]
    fn webp_signature_requires_riff_and_webp() {
        assert!(TargetFormat::Webp.has_signature(b"RIFF\x24\0\0\0WEBPVP8 "));
        assert!(!TargetFormat::Webp.has_signature(b"RIFF\x24\0\0\0WAVEfmt "));
    }

    #[test]
    fn markers_past_the_window_are_ignored() {
        let mut header = vec![0u8; HEADER_WINDOW];
        header.extend_from_slice(b"ftypavif");
        assert!(!TargetFormat::Avif.has_signature(&header));
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("AVIF".parse::<TargetFormat>(), Ok(TargetFormat::Avif));
        assert_eq!("webp".parse::<TargetFormat>(), Ok(TargetFormat::Webp));
        assert!("jpeg".parse::<TargetFormat>().is_err());
    }

    // =========================================================================
    // File validation
    // =========================================================================

    #[test]
    fn valid_files_pass() {
        let tmp = TempDir::new().unwrap();
        let avif = tmp.path().join("a.avif");
        let webp = tmp.path().join("a.webp");
        fs::write(&avif, fake_avif_bytes(200)).unwrap();
        fs::write(&webp, fake_webp_bytes(200)).unwrap();

        assert!(is_valid_output(&avif, TargetFormat::Avif));
        assert!(is_valid_output(&webp, TargetFormat::Webp));
        assert!(!is_valid_output(&avif, TargetFormat::Webp));
    }

    #[test]
    fn tiny_file_is_invalid_even_with_markers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tiny.avif");
        fs::write(&path, fake_avif_bytes(40)).unwrap();
        assert!(!is_valid_output(&path, TargetFormat::Avif));
    }

    #[test]
    fn missing_file_is_invalid() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_valid_output(
            &tmp.path().join("nope.webp"),
            TargetFormat::Webp
        ));
    }

    // =========================================================================
    // Source containers
    // =========================================================================

    #[test]
    fn detects_source_containers() {
        assert_eq!(
            SourceContainer::from_header(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(SourceContainer::Png)
        );
        assert_eq!(
            SourceContainer::from_header(b"\xff\xd8\xff\xe0\0\x10JFIF\0"),
            Some(SourceContainer::Jpeg)
        );
        assert_eq!(
            SourceContainer::from_header(b"GIF89a\x01\0\x01\0"),
            Some(SourceContainer::Gif)
        );
        assert_eq!(SourceContainer::from_header(b"plain text"), None);
    }

    #[test]
    fn png_assumes_four_channels() {
        assert_eq!(SourceContainer::Png.channels(), 4);
        assert_eq!(SourceContainer::Jpeg.channels(), 3);
    }
}
