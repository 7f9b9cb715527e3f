// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{format::payload::Extractor, source};

/// Extract partition images from an Android A/B OTA payload.
///
/// The payload may be a full OTA or, with --diff, a delta OTA applied against
/// previously extracted images.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path or URL to the payload.
    ///
    /// This may be a payload.bin file, a ZIP archive containing a payload.bin
    /// member (eg. a full OTA package), or an http(s) URL to either.
    #[arg(long, value_name = "PATH_OR_URL")]
    payload: String,

    /// Output directory for extracted images.
    #[arg(long, value_name = "DIR", default_value = "output")]
    out: PathBuf,

    /// Directory containing the prior images that a delta OTA applies to.
    ///
    /// Images are looked up as <DIR>/<partition>.img. Only consulted with
    /// --diff.
    #[arg(long, value_name = "DIR", default_value = "old")]
    old: PathBuf,

    /// Extract a delta OTA against the images in the --old directory.
    #[arg(long)]
    diff: bool,

    /// Comma-separated list of partitions to extract.
    ///
    /// When omitted, every partition in the payload is extracted.
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    images: Vec<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    fs::create_dir_all(&cli.out)
        .with_context(|| format!("Failed to create directory: {:?}", cli.out))?;

    let reader = source::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;

    let mut extractor = Extractor::new(reader, &cli.out, &cli.old, cli.diff)
        .with_context(|| format!("Failed to read payload header: {:?}", cli.payload))?;

    let header = extractor.header();
    info!(
        "Payload contains {} partitions ({} OTA, block size {})",
        header.manifest.partitions.len(),
        if header.is_full_ota() { "full" } else { "delta" },
        header.block_size(),
    );

    let images = cli
        .images
        .iter()
        .map(|n| n.trim().to_owned())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>();

    extractor
        .extract(&images)
        .context("Failed to extract payload")?;

    info!("Extraction completed successfully");

    Ok(())
}
