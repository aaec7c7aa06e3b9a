//! Signed, checksummed binary package containers.
//!
//! [`BinaryPackage`] builds and opens containers, [`ManifestVerifier`]
//! reconciles them with their Manifest, and the [`io`] modules provide the
//! streaming entry writer/reader and the checksum signer they share.

pub mod config;
pub mod error;
pub mod format;
pub mod image;
pub mod io;
pub mod package;
pub mod verify;

pub use config::{CodecCommand, GpkgConfig, Settings, SignMode, TrustPolicy};
pub use error::{GpkgError, Result};
pub use format::{FormatChoice, ImageStats, select_formats};
pub use image::{ContentKind, Contents, parse_contents};
pub use package::{BinaryPackage, Metadata, metadata_from_dir};
pub use verify::{ManifestVerifier, VerifiedEntry, VerifyReport};

/// User Agent string for remote reads
pub const USER_AGENT: &str = concat!("gpkg-core/", env!("CARGO_PKG_VERSION"));
