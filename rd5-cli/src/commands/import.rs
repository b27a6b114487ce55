use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rd5::{decode_raster, encode_raster, load_grid};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub fn run(input: PathBuf, output: PathBuf) -> Result<()> {
    if !input.is_dir() {
        bail!("Input directory not found: {}", input.display());
    }
    fs::create_dir_all(&output)
        .with_context(|| format!("Failed to create output directory: {}", output.display()))?;

    let archives = find_archives(&input)?;
    if archives.is_empty() {
        println!("No .zip grids found in {}", input.display());
        return Ok(());
    }

    info!(
        count = archives.len(),
        input = %input.display(),
        "Importing elevation grids"
    );

    let pb = ProgressBar::new(archives.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    for archive in &archives {
        let name = archive
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Archive name is not valid UTF-8")?;
        pb.set_message(name.to_string());

        let target = output.join(format!("{}.bef", name));
        import_one(archive, &target)?;
        pb.inc(1);
    }

    pb.finish_with_message("done");
    println!(
        "Imported {} grids into {}",
        archives.len(),
        output.display()
    );
    Ok(())
}

/// All `.zip` files directly inside `dir`, sorted by name.
fn find_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip && path.is_file() {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Convert one archive and check the written file reads back bit-exactly.
fn import_one(archive: &Path, target: &Path) -> Result<()> {
    let raster =
        load_grid(archive).with_context(|| format!("Failed to parse {}", archive.display()))?;

    let file = File::create(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    encode_raster(&raster, file).with_context(|| format!("Failed to write {}", target.display()))?;

    let file = File::open(target)?;
    let reread =
        decode_raster(file).with_context(|| format!("Failed to re-read {}", target.display()))?;
    if let Some(difference) = raster.first_difference(&reread) {
        bail!(
            "Verification failed for {}: {}",
            target.display(),
            difference
        );
    }

    debug!(
        target = %target.display(),
        samples = raster.values().len(),
        "Grid imported"
    );
    Ok(())
}
