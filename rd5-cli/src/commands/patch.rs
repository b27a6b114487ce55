use anyhow::{bail, Context, Result};
use rd5::{patch_region, DeltaReader};
use std::path::PathBuf;

use super::{format_size, store_builder};

pub fn run(
    section_cache_size: Option<u64>,
    older: PathBuf,
    delta: PathBuf,
    output: PathBuf,
) -> Result<()> {
    if output == older {
        bail!("Refusing to overwrite the input region: {}", older.display());
    }

    let store = store_builder(section_cache_size)
        .open(&older)
        .with_context(|| format!("Failed to open region: {}", older.display()))?;
    let mut reader = DeltaReader::open(&delta)
        .with_context(|| format!("Failed to open delta file: {}", delta.display()))?;

    let stats = patch_region(&store, &mut reader, &output).context("Failed to apply delta")?;

    println!(
        "Patched {} tiles ({} records), copied {} unchanged",
        stats.tiles_patched, stats.records_applied, stats.tiles_copied
    );
    println!(
        "Output written to: {} ({})",
        output.display(),
        format_size(stats.bytes_written)
    );
    Ok(())
}
