//! Error taxonomy for container operations.
//!
//! Every variant is terminal to the operation in progress. A build either
//! seals a container or leaves nothing at the target path, and a verify
//! either reconciles every entry or rejects.

use gpkg_schema::ManifestError;
use thiserror::Error;

/// Errors raised by container build, verify and read operations.
#[derive(Error, Debug)]
pub enum GpkgError {
    /// Not a recognized archive, missing version marker, or unparseable Manifest.
    #[error("Invalid gpkg format: {0}")]
    InvalidFormat(String),

    /// Unknown compression method, or its program is not installed.
    #[error("Unsupported compression: {0}")]
    UnsupportedCodec(String),

    /// An external compressor or decompressor exited non-success.
    #[error("{command} failed: {status}")]
    CodecOperationFailed {
        /// Program name.
        command: String,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// A signature required by the trust policy is absent.
    #[error("Missing signature: {0}")]
    MissingSignature(String),

    /// A signature is present but failed structural or trust verification.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Recorded and recomputed digests or sizes disagree, or the Manifest
    /// does not reconcile with the container's entries.
    #[error("Digest mismatch: {0}")]
    DigestMismatch(String),

    /// I/O error from the filesystem or a child process pipe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A settings value could not be interpreted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external signer or unlock command failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The container file, or a required inner entry, does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller-supplied input is unusable (e.g. a content path outside the root).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP transport error during a remote metadata read.
    #[cfg(feature = "network")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<ManifestError> for GpkgError {
    fn from(err: ManifestError) -> Self {
        Self::InvalidFormat(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GpkgError>;
