//! Capability detection: which backend, if any, can produce each format.
//!
//! Backends are probed in priority order (in-process, library, external).
//! A backend counts only if it claims the format *and* a real 1×1 round-trip
//! through temporary files succeeds; the first such backend wins. Probe
//! errors and panics mean "this strategy does not work" and never propagate.
//!
//! Verdicts are held in process memory for the life of the detector and in
//! a durable cache at `<state_dir>/capabilities.json` for one week, so other
//! workers skip probing. Two workers probing at once merely duplicate work.
//! [`CapabilityDetector::clear`] wipes both layers and re-detects at once.

use crate::imaging::{Capability, ConversionBackend, TargetFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Name of the durable cache file within the state directory.
const CACHE_FILENAME: &str = "capabilities.json";

const CACHE_VERSION: u32 = 1;

/// How long a durable verdict stays trusted.
pub const CAPABILITY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CachedVerdict {
    capability: Capability,
    /// Unix seconds.
    detected_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CapabilityCache {
    version: u32,
    formats: BTreeMap<TargetFormat, CachedVerdict>,
}

impl CapabilityCache {
    fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|c| serde_json::from_str::<Self>(&c).ok())
            .filter(|c| c.version == CACHE_VERSION)
            .unwrap_or_default()
    }

    fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct CapabilityDetector {
    backends: Vec<Box<dyn ConversionBackend>>,
    cache_path: Option<PathBuf>,
    ttl: Duration,
    memo: Mutex<HashMap<TargetFormat, Capability>>,
}

impl CapabilityDetector {
    /// `state_dir = None` disables the durable cache.
    pub fn new(mut backends: Vec<Box<dyn ConversionBackend>>, state_dir: Option<&Path>) -> Self {
        backends.sort_by_key(|b| b.capability());
        Self {
            backends,
            cache_path: state_dir.map(|d| d.join(CACHE_FILENAME)),
            ttl: CAPABILITY_TTL,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The backend providing `capability`, if one is configured.
    pub fn backend(&self, capability: Capability) -> Option<&dyn ConversionBackend> {
        self.backends
            .iter()
            .find(|b| b.capability() == capability)
            .map(|b| b.as_ref())
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<TargetFormat, Capability>> {
        self.memo.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Best capability for `format`: memory, then durable cache, then probing.
    pub fn detect(&self, format: TargetFormat) -> Capability {
        if let Some(&cap) = self.memo().get(&format) {
            return cap;
        }

        let capability = match self.cached(format) {
            Some(cap) => cap,
            None => {
                let cap = self.probe(format);
                self.store(format, cap);
                cap
            }
        };
        self.memo().insert(format, capability);
        capability
    }

    /// Verdicts for every format.
    pub fn detect_all(&self) -> Vec<(TargetFormat, Capability)> {
        TargetFormat::ALL
            .iter()
            .map(|&f| (f, self.detect(f)))
            .collect()
    }

    /// Forget every verdict, in memory and on disk, and detect again now.
    pub fn clear(&self) -> Vec<(TargetFormat, Capability)> {
        self.memo().clear();
        if let Some(path) = &self.cache_path
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "could not remove capability cache");
        }
        self.detect_all()
    }

    /// A fresh durable verdict naming a backend this detector still has.
    fn cached(&self, format: TargetFormat) -> Option<Capability> {
        let path = self.cache_path.as_ref()?;
        let verdict = *CapabilityCache::load(path).formats.get(&format)?;
        let age = now_secs().saturating_sub(verdict.detected_at);
        if age > self.ttl.as_secs() {
            return None;
        }
        if !verdict.capability.is_none() && self.backend(verdict.capability).is_none() {
            return None;
        }
        Some(verdict.capability)
    }

    fn store(&self, format: TargetFormat, capability: Capability) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let mut cache = CapabilityCache::load(path);
        cache.version = CACHE_VERSION;
        cache.formats.insert(
            format,
            CachedVerdict {
                capability,
                detected_at: now_secs(),
            },
        );
        if let Err(e) = cache.save(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not save capability cache");
        }
    }

    /// Run the probes in priority order. First round-trip success wins.
    pub fn probe(&self, format: TargetFormat) -> Capability {
        for backend in &self.backends {
            let cap = backend.capability();
            if !backend.supports(format) {
                tracing::debug!(%format, backend = %cap, "backend does not claim format");
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| backend.probe(format))) {
                Ok(true) => {
                    tracing::info!(%format, backend = %cap, "capability detected");
                    return cap;
                }
                Ok(false) => tracing::debug!(%format, backend = %cap, "probe failed"),
                Err(_) => tracing::debug!(%format, backend = %cap, "probe panicked"),
            }
        }
        tracing::info!(%format, "no backend can produce format");
        Capability::None
    }
}
