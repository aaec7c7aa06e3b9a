//! Metadata command

use std::path::Path;

use anyhow::{Context, Result};
use gpkg_core::io::remote::get_metadata_url;
use gpkg_core::{BinaryPackage, GpkgConfig, Metadata};

use crate::is_url;

/// Print (or unpack) the metadata of a local or remote container
pub async fn metadata(
    config: GpkgConfig,
    source: &str,
    want: &[String],
    dest: Option<&Path>,
    base_name: Option<String>,
) -> Result<()> {
    let want = (!want.is_empty()).then_some(want);

    let metadata = if is_url(source) {
        let client = reqwest::Client::new();
        get_metadata_url(&client, source, base_name.as_deref(), &config, want)
            .await
            .with_context(|| format!("Failed to fetch metadata from {source}"))?
    } else {
        let package = BinaryPackage::new(source, base_name, config);
        if let Some(dest) = dest {
            package
                .unpack_metadata(dest)
                .with_context(|| format!("Failed to unpack metadata of {source}"))?;
            println!("{}", dest.display());
            return Ok(());
        }
        package
            .get_metadata(want)
            .with_context(|| format!("Failed to read metadata of {source}"))?
    };

    match dest {
        Some(dest) => write_dir(&metadata, dest)?,
        None => print_metadata(&metadata),
    }
    Ok(())
}

fn write_dir(metadata: &Metadata, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    for (key, value) in metadata {
        let path = dest.join(key);
        std::fs::write(&path, value)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    println!("{}", dest.display());
    Ok(())
}

fn print_metadata(metadata: &Metadata) {
    for (key, value) in metadata {
        let text = String::from_utf8_lossy(value);
        let text = text.strip_suffix('\n').unwrap_or(&text);
        if text.contains('\n') || value.len() > 4096 {
            println!("{key}: <{} bytes>", value.len());
        } else {
            println!("{key}={text}");
        }
    }
}
