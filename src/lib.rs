//! # Avifier
//!
//! Serve the smallest valid AVIF or WEBP variant of an image, falling back
//! to the original whenever conversion is unavailable, unsafe, or
//! unproductive.
//!
//! Callers ask one question: "what URL should I serve for this image?" The
//! answer is always usable. A variant URL when a valid variant exists or
//! can be made now, the original's URL otherwise. Nothing in the conversion
//! path returns an error to its caller.
//!
//! # Architecture: One Request, One State Machine
//!
//! ```text
//! SourceRef ─▶ SourceResolver ─▶ policy ─▶ cache ─▶ lock ─▶ backend ─▶ validate ─▶ size ─▶ registry
//!   (url or       (file + URL     (caps,    (file    (flock   (best      (magic     (only    (format ×
//!    handle)       + identity)    limits)   exists)  marker)  detected)  bytes)     smaller)  WxH → URL)
//! ```
//!
//! Every stage can end the request early by serving the original. See
//! [`convert`] for the full state table.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`source`] | Maps a URL or file handle to a local file, public URL, and registry identity |
//! | [`capability`] | Probes which backend can produce each format; caches verdicts in memory and on disk |
//! | [`imaging`] | Backend trait and the in-process, library, and external strategies; identify and resize |
//! | [`lock`] | Non-blocking cross-process locks keyed by destination path, with stale eviction |
//! | [`convert`] | The orchestrator: policy, cache, lock, convert, validate, size policy, record |
//! | [`registry`] | Persisted index of produced variants and registered originals |
//! | [`config`] | `config.toml` loading, stock defaults, merging, and validation |
//! | [`naming`] | Derived file names: `{stem}[-q{quality}].{ext}` and `{stem}-{W}x{H}.{ext}` |
//! | [`variants`] | `.avif` / `.webp` / `.best` accessors for template call sites |
//! | [`maintenance`] | Operator actions: upload conversion, bulk convert, purge, sweep |
//! | [`logging`] | `tracing-subscriber` setup for the binary |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Capability Decides, Once
//!
//! Backends are probed in a fixed priority (in-process, library, external)
//! with a real 1×1 round-trip, and the first that works is the one used for
//! that format. A conversion failure at run time is reported, not retried
//! with the next backend: the probe already said which strategy this host
//! has, and a second attempt would double the latency of every bad source.
//!
//! ## Paths Are the Cache
//!
//! A variant's location is a pure function of source path, format, and
//! quality. The quality suffix is omitted at the configured default so the
//! common file name never changes. A file at that path that passes
//! magic-byte validation *is* the cache entry; there is no separate index to
//! drift out of sync. The [`registry`] is a lookup aid, not the source of
//! truth.
//!
//! ## Never Wait
//!
//! Lock contention is answered by serving the original right away. No
//! request queues behind another worker's encode.

pub mod capability;
pub mod config;
pub mod convert;
pub mod imaging;
pub mod lock;
pub mod logging;
pub mod maintenance;
pub mod naming;
pub mod output;
pub mod registry;
pub mod source;
pub mod variants;

pub use config::Settings;
pub use convert::{Conversion, ConversionError, ConversionRequest, Engine, Outcome};
pub use source::SourceRef;

#[cfg(test)]
pub(crate) mod test_helpers;
