//! Image conversion backends and the image operations around them.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::ImageReader` (format sniffed from content), `avif-parse` for AVIF |
//! | **Convert → AVIF** (in-process) | rav1e via `image::codecs::avif` |
//! | **Convert → WEBP** (library) | libwebp via the `webp` crate |
//! | **Convert → either** (external) | ImageMagick `magick` / `convert` |
//! | **Resize copy** | Lanczos3 |
//! | **Validate output** | magic bytes in the file header |
//!
//! The module is split into:
//! - **Format**: Target formats, source containers, magic-byte validation
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing one conversion
//! - **Backend**: [`ConversionBackend`] trait + the three implementations
//! - **Operations**: Identify and resize, shared by every backend

pub mod backend;
mod calculations;
pub mod external;
mod format;
pub mod in_process;
pub mod library;
pub mod operations;
mod params;

pub use backend::{BackendError, Capability, ConversionBackend};
pub use calculations::{breakpoint_sizes, scale_to_fit};
pub use external::ExternalBackend;
pub use format::{
    HEADER_WINDOW, MIN_VALID_BYTES, SourceContainer, TargetFormat, is_valid_output, read_header,
};
pub use in_process::InProcessBackend;
pub use library::LibWebpBackend;
pub use operations::{get_dimensions, resize_copy};
pub use params::{ConversionParams, Quality};
