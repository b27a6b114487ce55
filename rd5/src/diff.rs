//! Delta computation and self-verification between two region versions.
//!
//! The [`DiffEngine`] walks every micro-tile address of a region, computes
//! the delta between the older and newer tile, encodes it, decodes it back
//! and checks that the round trip reproduced the delta. Totals are collected
//! in [`DiffStats`]; verified deltas can be streamed into a [`DeltaSink`].
//!
//! # Example
//!
//! ```ignore
//! use rd5::{DiffConfig, DiffEngine, RegionStore};
//!
//! let older = RegionStore::open("old/E5_N45.rd5")?;
//! let newer = RegionStore::open("new/E5_N45.rd5")?;
//!
//! let stats = DiffEngine::new(DiffConfig::from_env()).diff(&older, &newer)?;
//! println!("nodesTotal={} nodesDiff={} bytesDiff={}",
//!     stats.total_nodes, stats.diff_nodes, stats.diff_bytes);
//! ```

use std::ops::AddAssign;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bits::CodecResult;
use crate::delta::DeltaSink;
use crate::error::{Rd5Error, Result};
use crate::region::{RegionAddress, RegionStore};
use crate::tile::{ScratchBuffers, TileAddress, TileCache, DEFAULT_ENCODE_CAPACITY};

/// Environment variable enabling parallel traversal.
pub const PARALLEL_ENV: &str = "RD5_PARALLEL";

/// Totals accumulated over one diff run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Nodes in the newer region.
    pub total_nodes: u64,
    /// Records across all non-empty deltas.
    pub diff_nodes: u64,
    /// Encoded size of all non-empty deltas.
    pub diff_bytes: u64,
    /// Tiles with a non-empty delta.
    pub changed_tiles: u64,
}

impl AddAssign for DiffStats {
    fn add_assign(&mut self, other: Self) {
        self.total_nodes += other.total_nodes;
        self.diff_nodes += other.diff_nodes;
        self.diff_bytes += other.diff_bytes;
        self.changed_tiles += other.changed_tiles;
    }
}

/// Diff engine configuration.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Process whole-degree cells on the rayon thread pool.
    pub parallel: bool,
    /// Deep-compare every decoded delta, not only those failing the cheap
    /// size check.
    pub full_verify: bool,
    /// Size of each worker's encode buffer.
    pub scratch_capacity: usize,
}

impl DiffConfig {
    pub fn new() -> Self {
        Self {
            parallel: false,
            full_verify: false,
            scratch_capacity: DEFAULT_ENCODE_CAPACITY,
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `RD5_PARALLEL` | `true` or `1` for parallel traversal | false |
    pub fn from_env() -> Self {
        let parallel = std::env::var(PARALLEL_ENV)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        Self {
            parallel,
            ..Self::new()
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn full_verify(mut self, full_verify: bool) -> Self {
        self.full_verify = full_verify;
        self
    }

    pub fn scratch_capacity(mut self, capacity: usize) -> Self {
        self.scratch_capacity = capacity;
        self
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes and verifies tile deltas between two region stores.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Diff two regions and return the totals.
    ///
    /// # Errors
    ///
    /// Returns [`Rd5Error::Store`] if the regions use different divisors or
    /// a cell is corrupt, and [`Rd5Error::CodecMismatch`] if an encoded
    /// delta does not decode back to itself.
    pub fn diff(&self, older: &RegionStore, newer: &RegionStore) -> Result<DiffStats> {
        self.traverse(older, newer, None)
    }

    /// Diff two regions and pass every verified delta to `sink`, in
    /// traversal order.
    pub fn diff_into(
        &self,
        older: &RegionStore,
        newer: &RegionStore,
        sink: &mut dyn DeltaSink,
    ) -> Result<DiffStats> {
        self.traverse(older, newer, Some(sink))
    }

    fn traverse(
        &self,
        older: &RegionStore,
        newer: &RegionStore,
        sink: Option<&mut dyn DeltaSink>,
    ) -> Result<DiffStats> {
        if older.divisor() != newer.divisor() {
            return Err(Rd5Error::store(
                newer.path(),
                format!(
                    "divisor {} does not match {} of {}",
                    newer.divisor(),
                    older.divisor(),
                    older.path().display()
                ),
            ));
        }

        let started = Instant::now();
        let stats = if self.config.parallel {
            self.traverse_parallel(older, newer, sink)?
        } else {
            self.traverse_sequential(older, newer, sink)?
        };

        info!(
            total_nodes = stats.total_nodes,
            diff_nodes = stats.diff_nodes,
            diff_bytes = stats.diff_bytes,
            changed_tiles = stats.changed_tiles,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Diff complete"
        );
        Ok(stats)
    }

    fn traverse_sequential(
        &self,
        older: &RegionStore,
        newer: &RegionStore,
        mut sink: Option<&mut dyn DeltaSink>,
    ) -> Result<DiffStats> {
        let mut scratch = ScratchBuffers::with_capacity(self.config.scratch_capacity);
        let mut stats = DiffStats::default();
        for cell in RegionAddress::all() {
            stats += self.diff_cell(cell, older, newer, &mut scratch, &mut |tile, size, bytes| {
                match sink.as_mut() {
                    Some(sink) => sink.accept(tile, size, bytes),
                    None => Ok(()),
                }
            })?;
        }
        Ok(stats)
    }

    #[cfg(feature = "parallel")]
    fn traverse_parallel(
        &self,
        older: &RegionStore,
        newer: &RegionStore,
        mut sink: Option<&mut dyn DeltaSink>,
    ) -> Result<DiffStats> {
        use crate::delta::DeltaRecord;
        use rayon::prelude::*;

        let keep_records = sink.is_some();
        let cells: Vec<RegionAddress> = RegionAddress::all().collect();
        let outcomes: Vec<Result<(DiffStats, Vec<DeltaRecord>)>> = cells
            .par_iter()
            .map_init(
                || ScratchBuffers::with_capacity(self.config.scratch_capacity),
                |scratch, &cell| -> Result<(DiffStats, Vec<DeltaRecord>)> {
                    let mut records: Vec<DeltaRecord> = Vec::new();
                    let stats = self.diff_cell(cell, older, newer, scratch, &mut |tile, size, bytes| {
                        if keep_records {
                            records.accept(tile, size, bytes)?;
                        }
                        Ok(())
                    })?;
                    Ok((stats, records))
                },
            )
            .collect();

        // Reduce in traversal order so output and errors are deterministic
        let mut stats = DiffStats::default();
        for outcome in outcomes {
            let (cell_stats, records) = outcome?;
            stats += cell_stats;
            if let Some(sink) = sink.as_mut() {
                for record in records {
                    sink.accept(record.address, record.delta_size as usize, &record.bytes)?;
                }
            }
        }
        Ok(stats)
    }

    #[cfg(not(feature = "parallel"))]
    fn traverse_parallel(
        &self,
        older: &RegionStore,
        newer: &RegionStore,
        sink: Option<&mut dyn DeltaSink>,
    ) -> Result<DiffStats> {
        warn!("Built without the `parallel` feature, diffing sequentially");
        self.traverse_sequential(older, newer, sink)
    }

    fn diff_cell(
        &self,
        cell: RegionAddress,
        older: &RegionStore,
        newer: &RegionStore,
        scratch: &mut ScratchBuffers,
        emit: &mut dyn FnMut(TileAddress, usize, &[u8]) -> Result<()>,
    ) -> Result<DiffStats> {
        let mut stats = DiffStats::default();
        let old_section = older.section(cell)?;
        let new_section = newer.section(cell)?;
        if !old_section.has_data() && !new_section.has_data() {
            return Ok(stats);
        }

        let divisor = newer.divisor();
        for tile in cell.tiles(divisor) {
            let old_cache = old_section.materialize(tile, scratch)?;
            let new_cache = new_section.materialize(tile, scratch)?;
            stats.total_nodes += new_cache.size() as u64;

            let delta = TileCache::calc_delta(&old_cache, &new_cache);
            if delta.is_empty() {
                continue;
            }

            let len = delta.encode(scratch)?;
            stats.diff_bytes += len as u64;
            stats.diff_nodes += delta.size() as u64;
            stats.changed_tiles += 1;

            let decoded = scratch.decode_encoded(len, tile, divisor);
            check_roundtrip(&delta, decoded, self.config.full_verify)?;
            emit(tile, delta.size(), scratch.encoded(len))?;
        }

        if stats.changed_tiles > 0 {
            debug!(
                lon_degree = cell.lon_degree,
                lat_degree = cell.lat_degree,
                changed_tiles = stats.changed_tiles,
                diff_nodes = stats.diff_nodes,
                "Cell changed"
            );
        }
        Ok(stats)
    }
}

/// Check that `bytes` decode back to `delta`.
///
/// The cheap check compares record counts and payload volume; a deep
/// comparison runs when it fails or when `full` is set.
///
/// # Errors
///
/// Returns [`Rd5Error::CodecMismatch`] if decoding fails or the decoded tile
/// differs from `delta`.
pub fn verify_encoded(
    delta: &TileCache,
    bytes: &[u8],
    scratch: &mut ScratchBuffers,
    full: bool,
) -> Result<()> {
    let decoded = TileCache::decode(bytes, scratch, delta.address(), delta.divisor());
    check_roundtrip(delta, decoded, full)
}

pub(crate) fn check_roundtrip(
    expected: &TileCache,
    decoded: CodecResult<TileCache>,
    full: bool,
) -> Result<()> {
    let address = expected.address();
    let mismatch = |detail: String| Rd5Error::CodecMismatch {
        lon_index: address.lon_index,
        lat_index: address.lat_index,
        detail,
    };

    let decoded = decoded.map_err(|e| mismatch(format!("decode failed: {}", e)))?;
    let cheap_ok =
        decoded.size() == expected.size() && decoded.data_size() == expected.data_size();
    if cheap_ok && !full {
        return Ok(());
    }
    if let Some(difference) = expected.compare_with(&decoded) {
        warn!(
            lon_index = address.lon_index,
            lat_index = address.lat_index,
            %difference,
            "Decoded delta differs"
        );
        return Err(mismatch(difference.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaRecord;
    use crate::region::RegionWriter;
    use crate::tile::{Link, Node, NodeId};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const DIV: u32 = 4;

    fn tile_nodes(tile: TileAddress, count: u32, elevation: i16) -> Vec<Node> {
        let origin = tile.origin(DIV);
        (0..count)
            .map(|i| {
                let id = NodeId::new(origin.ilon + 10 * i, origin.ilat + 3);
                let mut node = Node::new(id, elevation);
                node.links.push(Link {
                    target: NodeId::new(id.ilon + 10, id.ilat),
                    tags: b"highway=service".to_vec(),
                    geometry: Vec::new(),
                });
                node
            })
            .collect()
    }

    fn write_region(path: &Path, divisor: u32, tiles: &[(TileAddress, Vec<Node>)]) -> PathBuf {
        let mut scratch = ScratchBuffers::with_capacity(64 * 1024);
        let mut writer = RegionWriter::new(divisor, (5, 45)).unwrap();
        for (tile, nodes) in tiles {
            let cache = TileCache::from_nodes(*tile, divisor, nodes.clone());
            writer.insert(&cache, &mut scratch).unwrap();
        }
        writer.write(path).unwrap();
        path.to_path_buf()
    }

    fn engine() -> DiffEngine {
        DiffEngine::new(DiffConfig::new().scratch_capacity(64 * 1024))
    }

    fn fixture(dir: &Path) -> (RegionStore, RegionStore) {
        let a = TileAddress::new(0, 0);
        let b = TileAddress::new(7, 13);
        let c = TileAddress::new(19, 19);

        let mut changed = tile_nodes(b, 4, 100);
        changed[1].elevation = 105;
        changed.remove(3);

        let older = write_region(
            &dir.join("old.rd5"),
            DIV,
            &[(a, tile_nodes(a, 3, 50)), (b, tile_nodes(b, 4, 100))],
        );
        let newer = write_region(
            &dir.join("new.rd5"),
            DIV,
            &[(a, tile_nodes(a, 3, 50)), (b, changed), (c, tile_nodes(c, 2, 0))],
        );
        (
            RegionStore::open(older).unwrap(),
            RegionStore::open(newer).unwrap(),
        )
    }

    #[test]
    fn test_identical_regions() {
        let temp_dir = TempDir::new().unwrap();
        let (older, _) = fixture(temp_dir.path());

        let stats = engine().diff(&older, &older).unwrap();
        assert_eq!(stats.total_nodes, 7);
        assert_eq!(stats.diff_nodes, 0);
        assert_eq!(stats.diff_bytes, 0);
        assert_eq!(stats.changed_tiles, 0);
    }

    #[test]
    fn test_changed_regions() {
        let temp_dir = TempDir::new().unwrap();
        let (older, newer) = fixture(temp_dir.path());

        let mut records: Vec<DeltaRecord> = Vec::new();
        let stats = engine().diff_into(&older, &newer, &mut records).unwrap();

        assert_eq!(stats.total_nodes, 3 + 3 + 2);
        // Tile b: one modified node, one removed node; tile c: two new nodes
        assert_eq!(stats.diff_nodes, 4);
        assert_eq!(stats.changed_tiles, 2);
        assert_eq!(
            stats.diff_bytes,
            records.iter().map(|r| r.bytes.len() as u64).sum::<u64>()
        );

        let addresses: Vec<TileAddress> = records.iter().map(|r| r.address).collect();
        assert_eq!(
            addresses,
            vec![TileAddress::new(7, 13), TileAddress::new(19, 19)]
        );
        assert_eq!(records[0].delta_size, 2);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_sequential() {
        let temp_dir = TempDir::new().unwrap();
        let (older, newer) = fixture(temp_dir.path());

        let mut sequential: Vec<DeltaRecord> = Vec::new();
        let seq_stats = engine().diff_into(&older, &newer, &mut sequential).unwrap();

        let parallel_engine = DiffEngine::new(
            DiffConfig::new()
                .parallel(true)
                .full_verify(true)
                .scratch_capacity(64 * 1024),
        );
        let mut parallel: Vec<DeltaRecord> = Vec::new();
        let par_stats = parallel_engine
            .diff_into(&older, &newer, &mut parallel)
            .unwrap();

        assert_eq!(seq_stats, par_stats);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_divisor_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let a = write_region(&temp_dir.path().join("a.rd5"), 4, &[]);
        let b = write_region(&temp_dir.path().join("b.rd5"), 8, &[]);
        let older = RegionStore::open(a).unwrap();
        let newer = RegionStore::open(b).unwrap();

        assert!(matches!(
            engine().diff(&older, &newer),
            Err(Rd5Error::Store { .. })
        ));
    }

    #[test]
    fn test_verify_encoded() {
        let tile = TileAddress::new(3, 3);
        let delta = TileCache::from_nodes(tile, DIV, tile_nodes(tile, 5, 20));
        let mut scratch = ScratchBuffers::with_capacity(64 * 1024);
        let len = delta.encode(&mut scratch).unwrap();
        let bytes = scratch.encoded(len).to_vec();

        assert!(verify_encoded(&delta, &bytes, &mut scratch, false).is_ok());
        assert!(verify_encoded(&delta, &bytes, &mut scratch, true).is_ok());

        let result = verify_encoded(&delta, &bytes[..len - 1], &mut scratch, false);
        assert!(matches!(
            result,
            Err(Rd5Error::CodecMismatch { lon_index: 3, lat_index: 3, .. })
        ));

        // Same shape, different elevation: only a deep comparison notices
        let mut nodes = tile_nodes(tile, 5, 20);
        nodes[2].elevation = 21;
        let other = TileCache::from_nodes(tile, DIV, nodes);
        assert!(matches!(
            verify_encoded(&other, &bytes, &mut scratch, true),
            Err(Rd5Error::CodecMismatch { .. })
        ));

        // Different record count is caught by the cheap check
        let shorter = TileCache::from_nodes(tile, DIV, tile_nodes(tile, 4, 20));
        assert!(matches!(
            verify_encoded(&shorter, &bytes, &mut scratch, false),
            Err(Rd5Error::CodecMismatch { .. })
        ));
    }

    #[test]
    fn test_config_from_env() {
        let original = std::env::var(PARALLEL_ENV).ok();

        std::env::set_var(PARALLEL_ENV, "TRUE");
        assert!(DiffConfig::from_env().parallel);
        std::env::set_var(PARALLEL_ENV, "0");
        assert!(!DiffConfig::from_env().parallel);

        match original {
            Some(v) => std::env::set_var(PARALLEL_ENV, v),
            None => std::env::remove_var(PARALLEL_ENV),
        }
    }
}
