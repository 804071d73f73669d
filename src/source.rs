//! Source resolution: from an image reference to a file and a public URL.
//!
//! A reference is either a handle that already knows its file
//! ([`SourceRef::File`]) or a bare URL ([`SourceRef::Url`]). Resolution order:
//!
//! 1. A handle's path is used verbatim.
//! 2. A URL under a configured content root is rewritten to the root's
//!    directory.
//! 3. A URL owned by a registered attachment maps to that attachment's
//!    directory.
//! 4. Anything else resolves without a path: the engine cannot convert it and
//!    passes the URL through unchanged.
//!
//! Resolution never fails. An unconvertible source is an expected degraded
//! case, reported by `path` being `None`.
//!
//! Every resolved source also gets an identity for the variant registry:
//! `attachment:{id}` for registered originals (and their resized copies),
//! otherwise `url:{sha256}` of the URL with any `-WxH` suffix removed.

use crate::config::ContentRoot;
use crate::imaging::{BackendError, get_dimensions};
use crate::naming;
use crate::registry::{VariantRegistry, strip_query, url_file_name};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

/// An opaque image reference as handed in by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// A handle that carries its own resolved file and URL.
    File { path: PathBuf, url: String },
    /// A bare URL string.
    Url(String),
}

impl SourceRef {
    pub fn url(&self) -> &str {
        match self {
            SourceRef::File { url, .. } => url,
            SourceRef::Url(url) => url,
        }
    }
}

impl From<&str> for SourceRef {
    fn from(url: &str) -> Self {
        SourceRef::Url(url.to_string())
    }
}

/// A resolved source image. Size and dimensions are read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Local file, or `None` when the URL is not locally addressable.
    pub path: Option<PathBuf>,
    /// Canonical public URL.
    pub url: String,
    /// Registry key for this source's variants.
    pub identity: String,
}

impl SourceImage {
    pub fn byte_size(&self) -> io::Result<u64> {
        match &self.path {
            Some(p) => Ok(std::fs::metadata(p)?.len()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "source has no local file")),
        }
    }

    pub fn dimensions(&self) -> Result<(u32, u32), BackendError> {
        match &self.path {
            Some(p) => get_dimensions(p),
            None => Err(BackendError::UnsupportedSource(self.url.clone())),
        }
    }

    /// URL of a file sitting next to this source.
    pub fn sibling_url(&self, file_name: &str) -> String {
        sibling_url(&self.url, file_name)
    }
}

/// Replace the last segment of `url` with `file_name`, dropping any query.
pub fn sibling_url(url: &str, file_name: &str) -> String {
    let base = strip_query(url);
    match base.rfind('/') {
        Some(slash) => format!("{}{}", &base[..=slash], file_name),
        None => file_name.to_string(),
    }
}

/// Stable identity for a source not registered as an attachment.
pub fn url_identity(url: &str) -> String {
    let url = strip_query(url);
    let canonical = match url_file_name(url) {
        Some(name) => sibling_url(url, &naming::strip_size_suffix(name)),
        None => url.to_string(),
    };
    format!("url:{:x}", Sha256::digest(canonical.as_bytes()))
}

pub struct SourceResolver<'a> {
    roots: &'a [ContentRoot],
    registry: &'a VariantRegistry,
}

impl<'a> SourceResolver<'a> {
    pub fn new(roots: &'a [ContentRoot], registry: &'a VariantRegistry) -> Self {
        Self { roots, registry }
    }

    pub fn resolve(&self, source: &SourceRef) -> SourceImage {
        let attachment = self.registry.find_attachment_by_url(source.url());
        let identity = match &attachment {
            Some(a) => a.identity(),
            None => url_identity(source.url()),
        };

        let path = match source {
            SourceRef::File { path, .. } => Some(path.clone()),
            SourceRef::Url(url) => self.from_roots(url).or_else(|| {
                attachment
                    .as_ref()
                    .and_then(|a| sibling_file(&a.path, url))
            }),
        };

        SourceImage {
            path,
            url: strip_query(source.url()).to_string(),
            identity,
        }
    }

    /// Rewrite a URL under a content root to the matching local file.
    fn from_roots(&self, url: &str) -> Option<PathBuf> {
        let url = strip_query(url);
        self.roots.iter().find_map(|root| {
            let prefix = root.url.trim_end_matches('/');
            let rest = url.strip_prefix(prefix)?.strip_prefix('/')?;
            if rest.split('/').any(|seg| seg == "..") {
                return None;
            }
            let candidate = root.path.join(rest);
            candidate.is_file().then_some(candidate)
        })
    }
}

/// The file named by `url`'s last segment in the directory of `owner`.
fn sibling_file(owner: &Path, url: &str) -> Option<PathBuf> {
    let name = url_file_name(url)?;
    let candidate = owner.with_file_name(name);
    candidate.is_file().then_some(candidate)
}
