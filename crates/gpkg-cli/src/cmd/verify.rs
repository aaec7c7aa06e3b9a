//! Verify command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gpkg_core::{BinaryPackage, GpkgConfig, VerifyReport};
use serde::Serialize;

#[derive(Serialize)]
struct VerifyOutput<'a> {
    path: &'a Path,
    metadata_only: bool,
    #[serde(flatten)]
    report: &'a VerifyReport,
}

/// Check a container against its Manifest and print what was verified
pub fn verify(config: GpkgConfig, file: PathBuf, metadata_only: bool, json: bool) -> Result<()> {
    let package = BinaryPackage::new(file, None, config);
    let report = package
        .verify(metadata_only)
        .with_context(|| format!("Verification of {} failed", package.path().display()))?;

    if json {
        let output = VerifyOutput {
            path: package.path(),
            metadata_only,
            report: &report,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}: OK", package.path().display());
    for entry in &report.entries {
        let state = if entry.hashed {
            entry
                .matched
                .iter()
                .map(|algorithm| algorithm.name())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            "not hashed".to_string()
        };
        let sig = if entry.signature_verified {
            ", signature ok"
        } else {
            ""
        };
        println!("  {:<32} {:>10}  {state}{sig}", entry.name, entry.size);
    }
    Ok(())
}
