//! Update-metadata command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gpkg_core::{BinaryPackage, GpkgConfig};
use tracing::info;

use crate::collect_metadata;

/// Replace the metadata of an existing container
pub fn update_metadata(
    config: GpkgConfig,
    file: PathBuf,
    metadata_dir: &Path,
    meta: &[String],
    base_name: Option<String>,
) -> Result<()> {
    let metadata = collect_metadata(Some(metadata_dir), meta)?;

    if config.trust.create {
        config.unlock().context("Failed to unlock signing key")?;
    }

    let package = BinaryPackage::new(file, base_name, config);
    package
        .update_metadata(&metadata)
        .with_context(|| format!("Failed to update {}", package.path().display()))?;

    info!(path = %package.path().display(), keys = metadata.len(), "Updated metadata");
    println!("{}", package.path().display());
    Ok(())
}
