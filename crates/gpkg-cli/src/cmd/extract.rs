//! Extract command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gpkg_core::{BinaryPackage, GpkgConfig};

/// Verify a container, then unpack its image into `dest`
pub fn extract(
    config: GpkgConfig,
    file: PathBuf,
    dest: &Path,
    base_name: Option<String>,
) -> Result<()> {
    let package = BinaryPackage::new(file, base_name, config);
    let report = package
        .decompress(dest)
        .with_context(|| format!("Failed to extract {}", package.path().display()))?;

    let signed = if report.signatures_checked {
        "signed"
    } else {
        "unsigned"
    };
    println!(
        "{} -> {} ({} entries verified, {signed})",
        package.path().display(),
        dest.display(),
        report.entries.len()
    );
    Ok(())
}
