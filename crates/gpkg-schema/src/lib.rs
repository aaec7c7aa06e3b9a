//! Shared wire-format types for gpkg binary package containers.
//!
//! A container is an outer tar holding, in order: the version marker, the
//! metadata sub-archive (plus optional detached signature), the image
//! sub-archive (plus optional detached signature), the `Manifest` ledger and
//! an optional `Manifest.sig`.

pub mod hash;
pub mod manifest;
pub mod types;

// Re-exports
pub use hash::*;
pub use manifest::{MANIFEST_PREFIX, Manifest, ManifestError, ManifestRecord};
pub use types::*;

/// Name of the zero-length version-marker entry.
pub const GPKG_VERSION: &str = "gpkg-1";

/// Name of the Manifest ledger entry.
pub const MANIFEST_NAME: &str = "Manifest";

/// Suffix of a detached signature entry.
pub const SIGNATURE_SUFFIX: &str = ".sig";

/// Stem of the metadata sub-archive entry.
pub const METADATA_STEM: &str = "metadata";

/// Stem of the image sub-archive entry.
pub const IMAGE_STEM: &str = "image";

/// Name of the detached signature entry covering `entry`.
pub fn signature_name(entry: &str) -> String {
    format!("{entry}{SIGNATURE_SUFFIX}")
}

/// Whether `entry` is a detached signature entry.
pub fn is_signature_name(entry: &str) -> bool {
    entry.ends_with(SIGNATURE_SUFFIX)
}
