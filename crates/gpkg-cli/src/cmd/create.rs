//! Create command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use gpkg_core::{BinaryPackage, GpkgConfig, parse_contents};
use tracing::info;

use crate::collect_metadata;

/// Arguments of `gpkg create`.
#[derive(Debug)]
pub struct CreateArgs {
    pub root: PathBuf,
    pub output: PathBuf,
    pub base_name: String,
    pub metadata_dir: Option<PathBuf>,
    pub meta: Vec<String>,
    pub contents: Option<PathBuf>,
    pub protect: Vec<String>,
}

/// Build a container from a staged tree
pub fn create(config: GpkgConfig, args: &CreateArgs) -> Result<()> {
    if !args.root.is_dir() {
        bail!("Root {} is not a directory", args.root.display());
    }
    if args.base_name.is_empty() || args.base_name.contains('/') {
        bail!("Invalid base name '{}'", args.base_name);
    }

    let metadata = collect_metadata(args.metadata_dir.as_deref(), &args.meta)?;

    if config.trust.create {
        config.unlock().context("Failed to unlock signing key")?;
    }

    let package = BinaryPackage::new(&args.output, Some(args.base_name.clone()), config);

    match &args.contents {
        Some(listing) => {
            let text = std::fs::read_to_string(listing)
                .with_context(|| format!("Failed to read {}", listing.display()))?;
            let contents = parse_contents(&text, &args.root)
                .with_context(|| format!("Invalid contents listing {}", listing.display()))?;
            let prefixes: Vec<PathBuf> = args
                .protect
                .iter()
                .map(|prefix| args.root.join(prefix.trim_start_matches('/')))
                .collect();
            let protect = |path: &Path| prefixes.iter().any(|prefix| path.starts_with(prefix));
            package
                .compress_contents(&args.root, &contents, &metadata, &protect)
                .with_context(|| format!("Failed to create {}", args.output.display()))?;
        }
        None => package
            .compress(&args.root, &metadata)
            .with_context(|| format!("Failed to create {}", args.output.display()))?,
    }

    info!(path = %args.output.display(), keys = metadata.len(), "Created container");
    println!("{}", args.output.display());
    Ok(())
}
