//! Variant registry: which derivative files exist for which source.
//!
//! Template call sites ask "is there an AVIF of this image at 800x600?". The
//! registry answers from a persisted index instead of re-deriving paths, and
//! also holds the registered originals (attachments) that upload conversion,
//! bulk conversion, and purge work from.
//!
//! # Design
//!
//! ## Keys
//!
//! Variants are keyed by source identity, then format, then dimension key:
//!
//! ```text
//! "attachment:7" → avif → "800x600"  → https://…/photo-800x600.avif
//!                       → "1600x1200" → https://…/photo.avif
//!                       → "original"  → https://…/photo.avif
//! ```
//!
//! The dimension key comes from the produced file itself, not from the
//! request, so the index reflects what is actually on disk. The variant of an
//! unresized source is also recorded under `"original"`.
//!
//! ## Storage
//!
//! A versioned JSON file at `<state_dir>/variants.json`, replaced atomically
//! on save. A missing file loads as empty. A corrupt or outdated file is
//! renamed to `variants.json.<unix-seconds>.bad` and the registry starts
//! empty, so the attachments it held can still be recovered by hand. Every
//! mutation reloads the file, applies the change, and saves, so concurrent
//! processes mostly see each other's records; two processes writing at the
//! same instant can still lose one update, which only costs a later
//! re-lookup.
//!
//! ## Paths
//!
//! Attachment paths are stored absolute. Protection checks compare
//! canonical paths, so `./uploads/a.webp` and `/srv/uploads/a.webp` are the
//! same file.

use crate::imaging::{TargetFormat, get_dimensions};
use crate::naming::{self, ORIGINAL_KEY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Name of the registry file within the state directory.
const REGISTRY_FILENAME: &str = "variants.json";

/// Version of the registry format. Bump this to discard existing registries
/// when the layout changes.
const REGISTRY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A registered original image and its registered size files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: u64,
    pub url: String,
    pub path: PathBuf,
    /// Derivative size files (thumbnails) registered with the original.
    #[serde(default)]
    pub sizes: Vec<PathBuf>,
}

impl Attachment {
    /// Identity under which this attachment's variants are recorded.
    pub fn identity(&self) -> String {
        format!("attachment:{}", self.id)
    }

    /// The original followed by its registered sizes.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path()).chain(self.sizes.iter().map(PathBuf::as_path))
    }
}

/// `dimension key → URL`.
pub type DimensionMap = BTreeMap<String, String>;

/// On-disk registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub version: u32,
    #[serde(default)]
    pub attachments: BTreeMap<u64, Attachment>,
    #[serde(default)]
    pub variants: BTreeMap<String, BTreeMap<TargetFormat, DimensionMap>>,
}

impl RegistryManifest {
    pub fn empty() -> Self {
        Self {
            version: REGISTRY_VERSION,
            attachments: BTreeMap::new(),
            variants: BTreeMap::new(),
        }
    }

    /// Load from the state directory. Returns an empty registry if the file
    /// doesn't exist. A file that can't be used (corruption, version
    /// mismatch) is moved aside first so the next save cannot overwrite it.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(REGISTRY_FILENAME);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(m) if m.version == REGISTRY_VERSION => m,
            Ok(m) => {
                set_aside(&path, &format!("version {} is not {REGISTRY_VERSION}", m.version));
                Self::empty()
            }
            Err(e) => {
                set_aside(&path, &e.to_string());
                Self::empty()
            }
        }
    }

    /// Save to the state directory, creating it if needed. The file is
    /// replaced in one rename, so readers never see a partial write.
    pub fn save(&self, state_dir: &Path) -> Result<(), RegistryError> {
        std::fs::create_dir_all(state_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(state_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(state_dir.join(REGISTRY_FILENAME))
            .map_err(|e| e.error)?;
        Ok(())
    }

    fn insert(&mut self, identity: &str, format: TargetFormat, key: String, url: String) {
        self.variants
            .entry(identity.to_string())
            .or_default()
            .entry(format)
            .or_default()
            .insert(key, url);
    }

    /// Lookup precedence: exact `WxH` when both sides are given, then the
    /// first entry whose width matches a given width, then `"original"`.
    pub fn lookup(
        &self,
        identity: &str,
        format: TargetFormat,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Option<&str> {
        let entries = self.variants.get(identity)?.get(&format)?;

        if let (Some(w), Some(h)) = (width, height)
            && let Some(url) = entries.get(&naming::dimension_key(Some((w, h))))
        {
            return Some(url);
        }
        if let Some(w) = width {
            let by_width = entries.iter().find(|(key, _)| {
                naming::parse_dimension_key(key).is_some_and(|(kw, _)| kw == w)
            });
            if let Some((_, url)) = by_width {
                return Some(url);
            }
        }
        entries.get(ORIGINAL_KEY).map(String::as_str)
    }

    /// Find the attachment owning `url`.
    ///
    /// Tries an exact URL match, then a file-name match, then the file name
    /// with any `-WxH` size suffix removed so resized copies map to their
    /// parent.
    pub fn find_attachment_by_url(&self, url: &str) -> Option<&Attachment> {
        let url = strip_query(url);
        if let Some(a) = self.attachments.values().find(|a| a.url == url) {
            return Some(a);
        }
        let name = url_file_name(url)?;
        if let Some(a) = self
            .attachments
            .values()
            .find(|a| url_file_name(&a.url) == Some(name))
        {
            return Some(a);
        }
        let stripped = naming::strip_size_suffix(name);
        self.attachments
            .values()
            .find(|a| url_file_name(&a.url) == Some(stripped.as_str()))
    }

    /// Canonical paths of every registered original and registered size.
    pub fn protected_paths(&self) -> BTreeSet<PathBuf> {
        self.attachments
            .values()
            .flat_map(Attachment::files)
            .map(normalize_path)
            .collect()
    }

    /// True if `path` is a registered original or one of its registered sizes.
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected_paths().contains(&normalize_path(path))
    }
}

/// Canonical form of `path` for comparisons. A path that does not exist is
/// made absolute without resolving links.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Rename an unusable registry file out of the way.
fn set_aside(path: &Path, reason: &str) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let aside = path.with_file_name(format!("{REGISTRY_FILENAME}.{secs}.bad"));
    match std::fs::rename(path, &aside) {
        Ok(()) => tracing::warn!(
            path = %path.display(),
            moved_to = %aside.display(),
            %reason,
            "variant registry unreadable, starting empty"
        ),
        Err(e) => tracing::error!(
            path = %path.display(),
            %reason,
            error = %e,
            "variant registry unreadable and could not be moved aside"
        ),
    }
}

/// The URL without its query string or fragment.
pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Last path segment of a URL, if it has one.
pub fn url_file_name(url: &str) -> Option<&str> {
    let url = strip_query(url);
    url.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Process-shared handle to the registry file.
///
/// The mutex serializes reload-modify-save cycles within this process.
pub struct VariantRegistry {
    state_dir: PathBuf,
    manifest: Mutex<RegistryManifest>,
}

impl VariantRegistry {
    pub fn open(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            manifest: Mutex::new(RegistryManifest::load(state_dir)),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn locked(&self) -> MutexGuard<'_, RegistryManifest> {
        // A panic while holding the guard cannot leave the manifest half
        // written in memory: every mutation replaces it wholesale.
        self.manifest.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload from disk, apply `f`, save.
    fn update<T>(&self, f: impl FnOnce(&mut RegistryManifest) -> T) -> Result<T, RegistryError> {
        let mut manifest = self.locked();
        *manifest = RegistryManifest::load(&self.state_dir);
        let out = f(&mut manifest);
        manifest.save(&self.state_dir)?;
        Ok(out)
    }

    /// Snapshot of the current in-memory registry.
    pub fn snapshot(&self) -> RegistryManifest {
        self.locked().clone()
    }

    /// Record a produced variant of `identity`.
    ///
    /// The dimension key is read back from `output` itself, or from its
    /// `-WxH` name suffix when the file cannot be identified. Outputs whose
    /// name carries no `-WxH` suffix are the variant of the original and are
    /// also recorded under `"original"`.
    pub fn record(
        &self,
        identity: &str,
        format: TargetFormat,
        output: &Path,
        url: &str,
    ) -> Result<(), RegistryError> {
        let dimensions = get_dimensions(output).ok().or_else(|| {
            output
                .file_stem()
                .and_then(|s| naming::split_size_suffix(&s.to_string_lossy()).1)
        });
        let key = naming::dimension_key(dimensions);
        let of_original = !naming::has_size_suffix(output);
        self.update(|m| {
            if of_original && key != ORIGINAL_KEY {
                m.insert(identity, format, ORIGINAL_KEY.to_string(), url.to_string());
            }
            m.insert(identity, format, key, url.to_string());
        })
    }

    pub fn lookup(
        &self,
        identity: &str,
        format: TargetFormat,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Option<String> {
        self.locked()
            .lookup(identity, format, width, height)
            .map(str::to_string)
    }

    /// Register an original. Re-registering the same path updates it in place
    /// and keeps its id. Relative paths are stored absolute.
    pub fn register_attachment(
        &self,
        url: &str,
        path: &Path,
        sizes: Vec<PathBuf>,
    ) -> Result<Attachment, RegistryError> {
        let absolute = |p: &Path| std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        let path = absolute(path);
        let sizes: Vec<PathBuf> = sizes.iter().map(|p| absolute(p.as_path())).collect();
        self.update(|m| {
            let id = m
                .attachments
                .values()
                .find(|a| a.path == path)
                .map(|a| a.id)
                .unwrap_or_else(|| m.attachments.keys().next_back().map_or(1, |k| k + 1));
            let attachment = Attachment {
                id,
                url: url.to_string(),
                path: path.clone(),
                sizes,
            };
            m.attachments.insert(id, attachment.clone());
            attachment
        })
    }

    pub fn attachment(&self, id: u64) -> Option<Attachment> {
        self.locked().attachments.get(&id).cloned()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.locked().attachments.values().cloned().collect()
    }

    pub fn find_attachment_by_url(&self, url: &str) -> Option<Attachment> {
        self.locked().find_attachment_by_url(url).cloned()
    }

    pub fn protected_paths(&self) -> BTreeSet<PathBuf> {
        self.locked().protected_paths()
    }

    /// Drop every recorded variant, keeping attachments.
    pub fn clear_variants(&self) -> Result<(), RegistryError> {
        self.update(|m| m.variants.clear())
    }
}
