#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]

//! gpkg - signed binary package containers
//!
//! Command line front end over `gpkg-core`: build a container from a staged
//! tree, verify it against its Manifest, unpack it, and read or replace its
//! metadata (locally or over HTTP ranges).

pub mod cmd;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gpkg_core::{GpkgConfig, Metadata, Settings};

/// User Agent string (re-exported from gpkg_core)
pub use gpkg_core::USER_AGENT;

#[derive(Debug, Parser)]
#[command(name = "gpkg")]
#[command(author, version, about = "gpkg - signed binary package containers")]
pub struct Cli {
    /// TOML settings file, applied before BINPKG_* environment variables
    #[arg(long, global = true, env = "GPKG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a container from a staged install tree
    Create {
        /// Staged tree to pack
        #[arg(long)]
        root: PathBuf,
        /// Container to write
        #[arg(short, long)]
        output: PathBuf,
        /// Directory name of the inner entries, e.g. foo-1.0
        #[arg(long)]
        base_name: String,
        /// Directory whose files become metadata keys
        #[arg(long)]
        metadata_dir: Option<PathBuf>,
        /// Extra metadata key, may be repeated
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
        /// Contents listing; only listed paths are packed
        #[arg(long)]
        contents: Option<PathBuf>,
        /// Path prefix whose files are replaced by a placeholder (needs --contents)
        #[arg(long, value_name = "PREFIX", requires = "contents")]
        protect: Vec<String>,
    },
    /// Verify and unpack the image into a directory
    Extract {
        /// Container to read
        file: PathBuf,
        /// Destination directory
        dest: PathBuf,
        /// Expected directory name of the inner entries
        #[arg(long)]
        base_name: Option<String>,
    },
    /// Check a container against its Manifest and signatures
    Verify {
        /// Container to read
        file: PathBuf,
        /// Skip hashing the image entry
        #[arg(long)]
        metadata_only: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print metadata keys, or unpack them into a directory
    Metadata {
        /// Container path or http(s) URL
        source: String,
        /// Only these keys, may be repeated
        #[arg(long = "want", value_name = "KEY")]
        want: Vec<String>,
        /// Write one file per key instead of printing
        #[arg(long, conflicts_with = "want")]
        dest: Option<PathBuf>,
        /// Expected directory name of the inner entries
        #[arg(long)]
        base_name: Option<String>,
    },
    /// Replace the metadata of an existing container, keeping the image bytes
    #[command(name = "update-metadata")]
    UpdateMetadata {
        /// Container to rewrite
        file: PathBuf,
        /// Directory whose files become metadata keys
        #[arg(long)]
        metadata_dir: PathBuf,
        /// Extra metadata key, may be repeated
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
        /// Expected directory name of the inner entries
        #[arg(long)]
        base_name: Option<String>,
    },
}

/// Resolve defaults, the optional settings file and the environment.
pub fn load_config(file: Option<&Path>) -> Result<GpkgConfig> {
    let mut settings = Settings::default();
    if let Some(path) = file {
        settings
            .load_toml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    }
    settings.merge_vars(std::env::vars());
    GpkgConfig::from_settings(&settings).context("Invalid configuration")
}

/// Collect metadata from an optional directory plus `KEY=VALUE` overrides.
///
/// Values from `--meta` get a trailing newline, matching how metadata files
/// are usually written.
pub fn collect_metadata(dir: Option<&Path>, pairs: &[String]) -> Result<Metadata> {
    let mut metadata = match dir {
        Some(dir) => gpkg_core::metadata_from_dir(dir)
            .with_context(|| format!("Failed to read metadata from {}", dir.display()))?,
        None => Metadata::new(),
    };
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid --meta '{pair}', expected KEY=VALUE");
        };
        if key.is_empty() || key.contains('/') {
            bail!("Invalid metadata key '{key}'");
        }
        metadata.insert(key.to_string(), format!("{value}\n").into_bytes());
    }
    Ok(metadata)
}

/// Whether a metadata source names a remote container.
///
/// # Example
///
/// ```
/// use gpkg_cli::is_url;
///
/// assert!(is_url("https://example.com/foo-1.0.gpkg.tar"));
/// assert!(!is_url("/var/cache/binpkgs/foo-1.0.gpkg.tar"));
/// ```
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}
