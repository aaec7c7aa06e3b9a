//! gpkg - signed binary package containers

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gpkg_cli::cmd;
use gpkg_cli::{Cli, Commands, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Create {
            root,
            output,
            base_name,
            metadata_dir,
            meta,
            contents,
            protect,
        } => cmd::create::create(
            config,
            &cmd::create::CreateArgs {
                root,
                output,
                base_name,
                metadata_dir,
                meta,
                contents,
                protect,
            },
        ),
        Commands::Extract {
            file,
            dest,
            base_name,
        } => cmd::extract::extract(config, file, &dest, base_name),
        Commands::Verify {
            file,
            metadata_only,
            json,
        } => cmd::verify::verify(config, file, metadata_only, json),
        Commands::Metadata {
            source,
            want,
            dest,
            base_name,
        } => cmd::metadata::metadata(config, &source, &want, dest.as_deref(), base_name).await,
        Commands::UpdateMetadata {
            file,
            metadata_dir,
            meta,
            base_name,
        } => cmd::update_metadata::update_metadata(config, file, &metadata_dir, &meta, base_name),
    }
}
