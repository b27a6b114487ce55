use anyhow::{Context, Result};
use rd5::{DeltaWriter, DiffConfig, DiffEngine, DiffStats, RegionStore};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::store_builder;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiffResponse {
    older: String,
    newer: String,
    nodes_total: u64,
    nodes_diff: u64,
    bytes_diff: u64,
    changed_tiles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<String>,
}

pub fn run(
    section_cache_size: Option<u64>,
    older: PathBuf,
    newer: PathBuf,
    output: Option<PathBuf>,
    parallel: bool,
    full_verify: bool,
    json: bool,
) -> Result<()> {
    let builder = store_builder(section_cache_size);
    let old_store = builder
        .open(&older)
        .with_context(|| format!("Failed to open region: {}", older.display()))?;
    let new_store = builder
        .open(&newer)
        .with_context(|| format!("Failed to open region: {}", newer.display()))?;

    let mut config = DiffConfig::from_env().full_verify(full_verify);
    if parallel {
        config = config.parallel(true);
    }
    let engine = DiffEngine::new(config);

    let stats = match &output {
        Some(path) => write_artifact(&engine, &old_store, &new_store, path)?,
        None => engine
            .diff(&old_store, &new_store)
            .context("Delta verification failed")?,
    };

    if json {
        let response = to_response(&older, &newer, output.as_ref(), stats);
        println!("{}", serde_json::to_string(&response)?);
    } else {
        println!(
            "nodesTotal={} nodesDiff={} bytesDiff={}",
            stats.total_nodes, stats.diff_nodes, stats.diff_bytes
        );
        if let Some(path) = &output {
            println!(
                "Delta written to: {} ({} tiles)",
                path.display(),
                stats.changed_tiles
            );
        }
    }

    Ok(())
}

/// Diff into `<path>.tmp` and move it into place only once it is complete.
fn write_artifact(
    engine: &DiffEngine,
    older: &RegionStore,
    newer: &RegionStore,
    path: &Path,
) -> Result<DiffStats> {
    let tmp = temp_path(path);
    match stream_artifact(engine, older, newer, &tmp) {
        Ok(stats) => {
            fs::rename(&tmp, path)
                .with_context(|| format!("Failed to move delta file to {}", path.display()))?;
            info!(path = %path.display(), tiles = stats.changed_tiles, "Delta artifact written");
            Ok(stats)
        }
        Err(e) => {
            if let Err(remove) = fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), error = %remove, "Failed to remove partial delta file");
            }
            Err(e)
        }
    }
}

fn stream_artifact(
    engine: &DiffEngine,
    older: &RegionStore,
    newer: &RegionStore,
    path: &Path,
) -> Result<DiffStats> {
    let mut writer = DeltaWriter::create(path, older.divisor())
        .with_context(|| format!("Failed to create delta file: {}", path.display()))?;
    let stats = engine
        .diff_into(older, newer, &mut writer)
        .context("Delta verification failed")?;
    writer.finish()?;
    Ok(stats)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn to_response(
    older: &PathBuf,
    newer: &PathBuf,
    output: Option<&PathBuf>,
    stats: DiffStats,
) -> DiffResponse {
    DiffResponse {
        older: older.display().to_string(),
        newer: newer.display().to_string(),
        nodes_total: stats.total_nodes,
        nodes_diff: stats.diff_nodes,
        bytes_diff: stats.diff_bytes,
        changed_tiles: stats.changed_tiles,
        delta: output.map(|p| p.display().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rd5::{Node, NodeId, RegionAddress, RegionWriter, ScratchBuffers, TileAddress, TileCache};
    use tempfile::TempDir;

    const DIVISOR: u32 = 4;

    fn tile_cache(tile: TileAddress, elevation: i16) -> TileCache {
        let origin = tile.origin(DIVISOR);
        let nodes = vec![Node::new(NodeId::new(origin.ilon + 7, origin.ilat + 7), elevation)];
        TileCache::from_nodes(tile, DIVISOR, nodes)
    }

    /// Older and newer regions that differ in cell (0, 0); the newer one
    /// also holds an undecodable tile in the last cell.
    fn corrupt_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let mut scratch = ScratchBuffers::with_capacity(1 << 16);
        let first = RegionAddress::new(0, 0).tiles(DIVISOR).next().unwrap();
        let last = RegionAddress::new(4, 4).tiles(DIVISOR).next().unwrap();

        let older = dir.join("old.rd5");
        let mut writer = RegionWriter::new(DIVISOR, (5, 45)).unwrap();
        writer.insert(&tile_cache(first, 10), &mut scratch).unwrap();
        writer.insert(&tile_cache(last, 10), &mut scratch).unwrap();
        writer.write(&older).unwrap();

        let newer = dir.join("new.rd5");
        let mut writer = RegionWriter::new(DIVISOR, (5, 45)).unwrap();
        writer.insert(&tile_cache(first, 11), &mut scratch).unwrap();
        writer.insert_encoded(last, vec![0xff, 0x00]).unwrap();
        writer.write(&newer).unwrap();

        (older, newer)
    }

    #[test]
    fn test_failed_diff_leaves_no_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let (older, newer) = corrupt_pair(temp_dir.path());
        let delta = temp_dir.path().join("E5_N45.rd5d");

        let result = run(None, older, newer, Some(delta.clone()), false, false, false);

        assert!(result.is_err());
        assert!(!delta.exists());
        assert!(!temp_path(&delta).exists());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("out/E5_N45.rd5d")),
            PathBuf::from("out/E5_N45.rd5d.tmp")
        );
    }

    #[test]
    fn test_json_field_names() {
        let stats = DiffStats {
            total_nodes: 10,
            diff_nodes: 2,
            diff_bytes: 40,
            changed_tiles: 1,
        };
        let response = to_response(
            &PathBuf::from("a.rd5"),
            &PathBuf::from("b.rd5"),
            None,
            stats,
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"nodesTotal\":10"));
        assert!(json.contains("\"nodesDiff\":2"));
        assert!(json.contains("\"bytesDiff\":40"));
        assert!(!json.contains("delta"));
    }
}
