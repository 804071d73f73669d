//! Parameter types for conversion operations.
//!
//! These structs describe *what* to produce, not *how*. They are the interface
//! between the orchestrator (which decides paths, quality, and policy) and a
//! [`backend`](super::backend) (which does the pixel work). This separation
//! allows swapping backends (e.g. for testing with a mock) without changing
//! orchestration logic.

use super::format::TargetFormat;
use std::path::PathBuf;

/// Quality setting for lossy encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Everything one backend call needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionParams {
    pub source: PathBuf,
    pub output: PathBuf,
    pub quality: Quality,
    pub format: TargetFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(65).value(), 65);
        assert_eq!(Quality::new(150).value(), 100);
    }
}
