//! Reftest Common Library
//!
//! Shared types, manifest loading and on-disk layout for the reftest
//! orchestrator.

pub mod error;
pub mod layout;
pub mod manifest;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use layout::{platform_name, RefLayout};
pub use manifest::{Manifest, ManifestFilter};
pub use types::*;

/// Reftest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Manifest file name the runner and master mode expect
pub const DEFAULT_MANIFEST_FILE: &str = "test_manifest.json";
