//! Region files: memory-mapped containers of micro-tiles.
//!
//! A region covers 5° × 5°, split into 25 whole-degree cells. Each cell is
//! subdivided `divisor` times per axis into micro-tiles.
//!
//! # File Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! magic "RD5\x01" | divisor u32 | origin_lon i32 | origin_lat i32
//! cell_end[25] u64     absolute end offset of each cell block,
//!                      index = lat_degree * 5 + lon_degree
//! cell block:          tile_end[divisor²] u32, relative to the payload start,
//!                      index = local_lat * divisor + local_lon
//!                      payload bytes
//! ```
//!
//! Cell 0 starts right after the header, cell `k` at `cell_end[k - 1]`. An
//! empty block means the cell has no data.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use moka::sync::Cache;
use tracing::debug;

use crate::error::{Rd5Error, Result};
use crate::tile::{ScratchBuffers, TileAddress, TileCache, MICRO_DEGREES};

/// Whole degrees per region axis.
pub const REGION_DEGREES: u32 = 5;

/// Number of whole-degree cells in a region.
pub const CELL_COUNT: usize = (REGION_DEGREES * REGION_DEGREES) as usize;

/// Magic bytes at the start of every region file.
pub const REGION_MAGIC: [u8; 4] = *b"RD5\x01";

/// Default number of parsed cell index tables kept in memory.
pub const DEFAULT_SECTION_CACHE_SIZE: u64 = 25;

/// Environment variable overriding the section cache size.
pub const SECTION_CACHE_SIZE_ENV: &str = "RD5_SECTION_CACHE_SIZE";

const PREFIX_LEN: usize = 16;
const HEADER_LEN: usize = PREFIX_LEN + CELL_COUNT * 8;

/// A whole-degree cell within a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionAddress {
    /// Longitude offset from the region origin, `0..5`.
    pub lon_degree: u32,
    /// Latitude offset from the region origin, `0..5`.
    pub lat_degree: u32,
}

impl RegionAddress {
    pub fn new(lon_degree: u32, lat_degree: u32) -> Self {
        Self {
            lon_degree,
            lat_degree,
        }
    }

    /// All 25 cells, longitude-major.
    pub fn all() -> impl Iterator<Item = RegionAddress> {
        (0..REGION_DEGREES)
            .flat_map(|lon| (0..REGION_DEGREES).map(move |lat| RegionAddress::new(lon, lat)))
    }

    /// Every micro-tile of this cell, longitude-major.
    pub fn tiles(self, divisor: u32) -> impl Iterator<Item = TileAddress> {
        (0..divisor).flat_map(move |lon| {
            (0..divisor).map(move |lat| TileAddress::from_local(self, divisor, lon, lat))
        })
    }

    pub fn is_valid(&self) -> bool {
        self.lon_degree < REGION_DEGREES && self.lat_degree < REGION_DEGREES
    }

    /// Position in the cell directory.
    pub fn cell_index(&self) -> usize {
        (self.lat_degree * REGION_DEGREES + self.lon_degree) as usize
    }

    fn from_cell_index(index: usize) -> Self {
        let index = index as u32;
        Self::new(index % REGION_DEGREES, index / REGION_DEGREES)
    }
}

/// Check that `divisor` splits a degree into whole micro-degrees.
pub(crate) fn check_divisor(divisor: u32) -> std::result::Result<(), String> {
    if divisor == 0 || MICRO_DEGREES % divisor != 0 {
        return Err(format!(
            "invalid divisor {} (must divide {})",
            divisor, MICRO_DEGREES
        ));
    }
    Ok(())
}

/// Statistics about the section cache.
#[derive(Debug, Clone, Default)]
pub struct SectionCacheStats {
    /// Number of cell index tables currently cached.
    pub entry_count: u64,
    /// Number of lookups served from the cache.
    pub hit_count: u64,
    /// Number of cell index tables parsed from the file.
    pub miss_count: u64,
}

impl SectionCacheStats {
    /// Cache hit rate (0.0 to 1.0); 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Parsed tile table of one cell.
#[derive(Debug)]
struct CellIndex {
    /// Absolute byte range of the payload in the file.
    payload: Range<usize>,
    tile_ends: Vec<u32>,
}

impl CellIndex {
    fn tile_span(&self, slot: usize) -> Range<usize> {
        let start = match slot {
            0 => 0,
            _ => self.tile_ends[slot - 1] as usize,
        };
        let end = self.tile_ends[slot] as usize;
        self.payload.start + start..self.payload.start + end
    }

    fn populated_tiles(&self) -> usize {
        let mut prev = 0;
        self.tile_ends
            .iter()
            .filter(|&&end| {
                let populated = end > prev;
                prev = end;
                populated
            })
            .count()
    }
}

/// Read-only, random-access view of a region file.
///
/// The file is memory-mapped once; cell index tables are parsed on first use
/// and kept in a bounded cache. `RegionStore` is `Sync` and can be shared by
/// worker threads.
///
/// # Example
///
/// ```ignore
/// use rd5::{RegionAddress, RegionStore, ScratchBuffers, TileAddress};
///
/// let store = RegionStore::open("segments/E5_N45.rd5")?;
/// let mut scratch = ScratchBuffers::new();
///
/// let section = store.section(RegionAddress::new(2, 3))?;
/// if section.has_data() {
///     let tile = TileAddress::from_local(section.address(), store.divisor(), 0, 0);
///     let cache = section.materialize(tile, &mut scratch)?;
///     println!("{} nodes", cache.size());
/// }
/// ```
pub struct RegionStore {
    path: PathBuf,
    data: Mmap,
    divisor: u32,
    origin: (i32, i32),
    /// Absolute byte range of each cell block.
    cells: Vec<Range<usize>>,
    index_cache: Cache<usize, Arc<CellIndex>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl RegionStore {
    /// Open a region file with the default section cache size.
    ///
    /// # Errors
    ///
    /// Returns [`Rd5Error::FileNotFound`] if the file does not exist, and
    /// [`Rd5Error::Store`] if the header is corrupt.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        RegionStoreBuilder::new().open(path)
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> RegionStoreBuilder {
        RegionStoreBuilder::new()
    }

    fn open_with(path: &Path, section_cache_size: u64) -> Result<Self> {
        if !path.exists() {
            return Err(Rd5Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path)?;

        // SAFETY: Memory mapping is safe as long as the file is not modified
        // while mapped. We open the file read-only and don't expose the mapping.
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < HEADER_LEN {
            return Err(Rd5Error::store(
                path,
                format!("file too short for header: {} bytes", data.len()),
            ));
        }
        if data[..4] != REGION_MAGIC {
            return Err(Rd5Error::store(path, "bad magic"));
        }

        let divisor = be_u32(&data, 4);
        check_divisor(divisor).map_err(|reason| Rd5Error::store(path, reason))?;
        let origin = (be_u32(&data, 8) as i32, be_u32(&data, 12) as i32);

        let mut cells = Vec::with_capacity(CELL_COUNT);
        let mut start = HEADER_LEN as u64;
        for k in 0..CELL_COUNT {
            let end = be_u64(&data, PREFIX_LEN + 8 * k);
            if end < start || end > data.len() as u64 {
                return Err(Rd5Error::store(
                    path,
                    format!(
                        "cell {} ends at {}, outside {}..={}",
                        k,
                        end,
                        start,
                        data.len()
                    ),
                ));
            }
            cells.push(start as usize..end as usize);
            start = end;
        }

        debug!(
            path = %path.display(),
            divisor,
            origin_lon = origin.0,
            origin_lat = origin.1,
            "Opened region file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            data,
            divisor,
            origin,
            cells,
            index_cache: Cache::builder().max_capacity(section_cache_size).build(),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Micro-tiles per degree along each axis.
    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// South-west corner of the region as `(lon, lat)` in whole degrees.
    pub fn origin(&self) -> (i32, i32) {
        self.origin
    }

    /// Size of the file in bytes.
    pub fn file_len(&self) -> usize {
        self.data.len()
    }

    /// Size of a cell block in bytes, 0 for cells without data.
    pub fn cell_len(&self, address: RegionAddress) -> usize {
        if !address.is_valid() {
            return 0;
        }
        self.cells[address.cell_index()].len()
    }

    /// Cells holding data, in traversal order.
    pub fn populated_cells(&self) -> impl Iterator<Item = RegionAddress> + '_ {
        RegionAddress::all().filter(|a| !self.cells[a.cell_index()].is_empty())
    }

    /// Get a view over one whole-degree cell.
    ///
    /// The cell's tile table is parsed on first access and then served from
    /// the section cache.
    pub fn section(&self, address: RegionAddress) -> Result<TileSection<'_>> {
        if !address.is_valid() {
            return Err(Rd5Error::store(
                &self.path,
                format!(
                    "cell ({}, {}) outside region",
                    address.lon_degree, address.lat_degree
                ),
            ));
        }
        let key = address.cell_index();
        let block = self.cells[key].clone();
        let index = if block.is_empty() {
            None
        } else {
            Some(self.cell_index(key, block)?)
        };
        Ok(TileSection {
            store: self,
            address,
            index,
        })
    }

    /// Decode one micro-tile; tiles without data yield an empty cache.
    pub fn materialize(&self, tile: TileAddress, scratch: &mut ScratchBuffers) -> Result<TileCache> {
        self.section(tile.region_address(self.divisor))?
            .materialize(tile, scratch)
    }

    /// Get section cache statistics.
    pub fn cache_stats(&self) -> SectionCacheStats {
        SectionCacheStats {
            entry_count: self.index_cache.entry_count(),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
        }
    }

    /// Maximum number of cached cell tables.
    pub fn section_cache_capacity(&self) -> u64 {
        self.index_cache.policy().max_capacity().unwrap_or(0)
    }

    fn cell_index(&self, key: usize, block: Range<usize>) -> Result<Arc<CellIndex>> {
        if let Some(index) = self.index_cache.get(&key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(index);
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);

        let index = Arc::new(self.parse_cell(key, block)?);
        self.index_cache.insert(key, index.clone());
        Ok(index)
    }

    fn parse_cell(&self, key: usize, block: Range<usize>) -> Result<CellIndex> {
        let slots = (self.divisor as usize).pow(2);
        let table_len = slots * 4;
        if block.len() < table_len {
            return Err(Rd5Error::store(
                &self.path,
                format!(
                    "cell {} too short for {} tile offsets: {} bytes",
                    key,
                    slots,
                    block.len()
                ),
            ));
        }

        let payload = block.start + table_len..block.end;
        let mut tile_ends = Vec::with_capacity(slots);
        let mut prev = 0u32;
        for slot in 0..slots {
            let end = be_u32(&self.data, block.start + 4 * slot);
            if end < prev || end as usize > payload.len() {
                return Err(Rd5Error::store(
                    &self.path,
                    format!("cell {} tile {}: offset {} out of order", key, slot, end),
                ));
            }
            tile_ends.push(end);
            prev = end;
        }

        let address = RegionAddress::from_cell_index(key);
        debug!(
            lon_degree = address.lon_degree,
            lat_degree = address.lat_degree,
            payload_bytes = payload.len(),
            "Parsed cell index"
        );
        Ok(CellIndex { payload, tile_ends })
    }
}

/// Transient view over one whole-degree cell of a [`RegionStore`].
pub struct TileSection<'a> {
    store: &'a RegionStore,
    address: RegionAddress,
    index: Option<Arc<CellIndex>>,
}

impl<'a> TileSection<'a> {
    pub fn address(&self) -> RegionAddress {
        self.address
    }

    /// Whether the cell holds any data.
    pub fn has_data(&self) -> bool {
        self.index.is_some()
    }

    /// Number of micro-tiles with data.
    pub fn populated_tiles(&self) -> usize {
        self.index.as_ref().map_or(0, |i| i.populated_tiles())
    }

    /// Size of the payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.index.as_ref().map_or(0, |i| i.payload.len())
    }

    /// Encoded bytes of a micro-tile, `None` when it holds no data or lies
    /// outside this cell.
    pub fn tile_bytes(&self, tile: TileAddress) -> Option<&'a [u8]> {
        let divisor = self.store.divisor;
        if !self.contains(tile) {
            return None;
        }
        let index = self.index.as_ref()?;
        let (local_lon, local_lat) = tile.local(divisor);
        let span = index.tile_span((local_lat * divisor + local_lon) as usize);
        if span.is_empty() {
            return None;
        }
        let store: &'a RegionStore = self.store;
        Some(&store.data[span])
    }

    /// Decode a micro-tile of this cell; tiles without data yield an empty
    /// cache.
    pub fn materialize(&self, tile: TileAddress, scratch: &mut ScratchBuffers) -> Result<TileCache> {
        let divisor = self.store.divisor;
        if !self.contains(tile) {
            return Err(Rd5Error::store(
                &self.store.path,
                format!(
                    "tile ({}, {}) is not in cell ({}, {})",
                    tile.lon_index, tile.lat_index, self.address.lon_degree, self.address.lat_degree
                ),
            ));
        }
        match self.tile_bytes(tile) {
            None => Ok(TileCache::empty(tile, divisor)),
            Some(bytes) => Ok(TileCache::decode(bytes, scratch, tile, divisor)?),
        }
    }

    fn contains(&self, tile: TileAddress) -> bool {
        let divisor = self.store.divisor;
        tile.is_within(divisor) && tile.region_address(divisor) == self.address
    }
}

/// Builder for [`RegionStore`] with custom configuration.
#[derive(Debug, Clone)]
pub struct RegionStoreBuilder {
    section_cache_size: u64,
}

impl RegionStoreBuilder {
    pub fn new() -> Self {
        Self {
            section_cache_size: DEFAULT_SECTION_CACHE_SIZE,
        }
    }

    /// Create a builder configured from environment variables.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `RD5_SECTION_CACHE_SIZE` | Maximum cell tables in cache | 25 |
    pub fn from_env() -> Self {
        let section_cache_size = std::env::var(SECTION_CACHE_SIZE_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SECTION_CACHE_SIZE);
        Self { section_cache_size }
    }

    /// Set the maximum number of cell tables to keep in cache.
    pub fn section_cache_size(mut self, size: u64) -> Self {
        self.section_cache_size = size;
        self
    }

    /// Open a region file with this configuration.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<RegionStore> {
        RegionStore::open_with(path.as_ref(), self.section_cache_size)
    }
}

impl Default for RegionStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles a region file from encoded micro-tiles.
#[derive(Debug, Clone)]
pub struct RegionWriter {
    divisor: u32,
    origin: (i32, i32),
    tiles: BTreeMap<TileAddress, Vec<u8>>,
}

impl RegionWriter {
    /// Start an empty region.
    ///
    /// # Errors
    ///
    /// Returns [`Rd5Error::Format`] if `divisor` does not divide a degree
    /// into whole micro-degrees.
    pub fn new(divisor: u32, origin: (i32, i32)) -> Result<Self> {
        check_divisor(divisor).map_err(|reason| Rd5Error::format("region writer", reason))?;
        Ok(Self {
            divisor,
            origin,
            tiles: BTreeMap::new(),
        })
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Number of micro-tiles with data.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Encode and store a tile cache. An empty cache clears the tile.
    pub fn insert(&mut self, cache: &TileCache, scratch: &mut ScratchBuffers) -> Result<()> {
        if cache.divisor() != self.divisor {
            return Err(Rd5Error::format(
                "region writer",
                format!(
                    "tile divisor {} does not match region divisor {}",
                    cache.divisor(),
                    self.divisor
                ),
            ));
        }
        if cache.is_empty() {
            self.tiles.remove(&cache.address());
            return Ok(());
        }
        let len = cache.encode(scratch)?;
        self.insert_encoded(cache.address(), scratch.encoded(len).to_vec())
    }

    /// Store already encoded tile bytes. Empty bytes clear the tile.
    pub fn insert_encoded(&mut self, tile: TileAddress, bytes: Vec<u8>) -> Result<()> {
        if !tile.is_within(self.divisor) {
            return Err(Rd5Error::format(
                "region writer",
                format!(
                    "tile ({}, {}) outside region with divisor {}",
                    tile.lon_index, tile.lat_index, self.divisor
                ),
            ));
        }
        if bytes.is_empty() {
            self.tiles.remove(&tile);
        } else {
            self.tiles.insert(tile, bytes);
        }
        Ok(())
    }

    /// Write the region to `path`; returns the file size.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let mut out = BufWriter::new(File::create(path)?);
        let written = self.write_to(&mut out)?;
        out.flush()?;
        debug!(path = %path.display(), bytes = written, tiles = self.tiles.len(), "Wrote region file");
        Ok(written)
    }

    /// Serialize the region; returns the number of bytes written.
    pub fn write_to<W: Write>(&self, mut out: W) -> Result<u64> {
        let mut blocks: Vec<Vec<u8>> = vec![Vec::new(); CELL_COUNT];
        for address in RegionAddress::all() {
            blocks[address.cell_index()] = self.cell_block(address)?;
        }

        out.write_all(&REGION_MAGIC)?;
        out.write_all(&self.divisor.to_be_bytes())?;
        out.write_all(&self.origin.0.to_be_bytes())?;
        out.write_all(&self.origin.1.to_be_bytes())?;

        let mut end = HEADER_LEN as u64;
        for block in &blocks {
            end += block.len() as u64;
            out.write_all(&end.to_be_bytes())?;
        }
        for block in &blocks {
            out.write_all(block)?;
        }
        Ok(end)
    }

    fn cell_block(&self, address: RegionAddress) -> Result<Vec<u8>> {
        let divisor = self.divisor;
        let first = TileAddress::from_local(address, divisor, 0, 0);
        let last = TileAddress::from_local(address, divisor, divisor - 1, divisor - 1);
        let has_data = self
            .tiles
            .range(first..=last)
            .any(|(tile, _)| tile.region_address(divisor) == address);
        if !has_data {
            return Ok(Vec::new());
        }

        let slots = (divisor as usize).pow(2);
        let mut table = Vec::with_capacity(slots * 4);
        let mut payload = Vec::new();
        for slot in 0..slots {
            let (local_lon, local_lat) = (slot as u32 % divisor, slot as u32 / divisor);
            let tile = TileAddress::from_local(address, divisor, local_lon, local_lat);
            if let Some(bytes) = self.tiles.get(&tile) {
                payload.extend_from_slice(bytes);
            }
            let end = u32::try_from(payload.len()).map_err(|_| {
                Rd5Error::format(
                    "region writer",
                    format!(
                        "cell ({}, {}) payload exceeds 4 GiB",
                        address.lon_degree, address.lat_degree
                    ),
                )
            })?;
            table.extend_from_slice(&end.to_be_bytes());
        }
        table.extend_from_slice(&payload);
        Ok(table)
    }
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Link, Node, NodeId};
    use std::fs;
    use tempfile::TempDir;

    const DIV: u32 = 4;

    fn tile_cache(tile: TileAddress, nodes: u32, elevation: i16) -> TileCache {
        let origin = tile.origin(DIV);
        let nodes = (0..nodes)
            .map(|i| {
                let id = NodeId::new(origin.ilon + i * 100, origin.ilat + i * 7);
                let mut node = Node::new(id, elevation);
                node.links.push(Link {
                    target: NodeId::new(id.ilon + 50, id.ilat),
                    tags: b"highway=path".to_vec(),
                    geometry: Vec::new(),
                });
                node
            })
            .collect();
        TileCache::from_nodes(tile, DIV, nodes)
    }

    fn write_region(dir: &Path, tiles: &[TileCache]) -> PathBuf {
        let mut scratch = ScratchBuffers::with_capacity(64 * 1024);
        let mut writer = RegionWriter::new(DIV, (5, 45)).unwrap();
        for cache in tiles {
            writer.insert(cache, &mut scratch).unwrap();
        }
        let path = dir.join("E5_N45.rd5");
        writer.write(&path).unwrap();
        path
    }

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let tiles = [
            tile_cache(TileAddress::new(0, 0), 3, 100),
            tile_cache(TileAddress::new(9, 14), 5, 200),
            tile_cache(TileAddress::new(11, 14), 1, -3),
        ];
        let path = write_region(temp_dir.path(), &tiles);

        let store = RegionStore::open(&path).unwrap();
        assert_eq!(store.divisor(), DIV);
        assert_eq!(store.origin(), (5, 45));
        assert_eq!(store.file_len() as u64, fs::metadata(&path).unwrap().len());

        let mut scratch = ScratchBuffers::with_capacity(64 * 1024);
        for cache in &tiles {
            let read = store.materialize(cache.address(), &mut scratch).unwrap();
            assert_eq!(&read, cache);
        }

        let populated: Vec<RegionAddress> = store.populated_cells().collect();
        assert_eq!(
            populated,
            vec![RegionAddress::new(0, 0), RegionAddress::new(2, 3)]
        );
        assert_eq!(store.section(RegionAddress::new(2, 3)).unwrap().populated_tiles(), 2);
    }

    #[test]
    fn test_empty_cell_and_empty_tile() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[tile_cache(TileAddress::new(1, 1), 2, 0)]);
        let store = RegionStore::open(&path).unwrap();
        let mut scratch = ScratchBuffers::with_capacity(1024);

        let empty_cell = store.section(RegionAddress::new(4, 4)).unwrap();
        assert!(!empty_cell.has_data());
        let tile = TileAddress::new(17, 18);
        assert_eq!(empty_cell.materialize(tile, &mut scratch).unwrap().size(), 0);

        let section = store.section(RegionAddress::new(0, 0)).unwrap();
        assert!(section.has_data());
        assert!(section.tile_bytes(TileAddress::new(0, 0)).is_none());
        assert!(section.tile_bytes(TileAddress::new(1, 1)).is_some());
        // Tiles of other cells are not visible through this section
        assert!(section.tile_bytes(TileAddress::new(5, 1)).is_none());
        assert!(section.materialize(TileAddress::new(5, 1), &mut scratch).is_err());
    }

    #[test]
    fn test_region_without_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[]);
        let store = RegionStore::open(&path).unwrap();

        assert_eq!(store.file_len(), HEADER_LEN);
        assert_eq!(store.populated_cells().count(), 0);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = RegionStore::open(temp_dir.path().join("W10_S5.rd5"));
        assert!(matches!(result, Err(Rd5Error::FileNotFound { .. })));
    }

    #[test]
    fn test_corrupt_headers() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[tile_cache(TileAddress::new(2, 2), 2, 0)]);
        let good = fs::read(&path).unwrap();
        let bad_path = temp_dir.path().join("bad.rd5");

        let check = |bytes: &[u8]| {
            fs::write(&bad_path, bytes).unwrap();
            RegionStore::open(&bad_path)
        };

        // Bad magic
        let mut bytes = good.clone();
        bytes[0] = b'X';
        assert!(matches!(check(&bytes), Err(Rd5Error::Store { .. })));

        // Zero divisor
        let mut bytes = good.clone();
        bytes[4..8].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(check(&bytes), Err(Rd5Error::Store { .. })));

        // Divisor not dividing a degree
        let mut bytes = good.clone();
        bytes[4..8].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(check(&bytes), Err(Rd5Error::Store { .. })));

        // Truncated header
        assert!(matches!(check(&good[..20]), Err(Rd5Error::Store { .. })));

        // Truncated payload: last cell end points past the file
        assert!(matches!(
            check(&good[..good.len() - 1]),
            Err(Rd5Error::Store { .. })
        ));

        // Non-monotonic cell ends
        let mut bytes = good.clone();
        bytes[PREFIX_LEN + 8..PREFIX_LEN + 16].copy_from_slice(&0u64.to_be_bytes());
        assert!(matches!(check(&bytes), Err(Rd5Error::Store { .. })));
    }

    #[test]
    fn test_corrupt_tile_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[tile_cache(TileAddress::new(2, 2), 2, 0)]);
        let mut bytes = fs::read(&path).unwrap();
        // First tile end of cell 0 beyond its payload
        bytes[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        fs::write(&path, &bytes).unwrap();

        let store = RegionStore::open(&path).unwrap();
        assert!(matches!(
            store.section(RegionAddress::new(0, 0)),
            Err(Rd5Error::Store { .. })
        ));
        assert!(store.section(RegionAddress::new(1, 0)).is_ok());
    }

    #[test]
    fn test_section_cache_stats() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[tile_cache(TileAddress::new(2, 2), 2, 0)]);
        let store = RegionStore::builder()
            .section_cache_size(8)
            .open(&path)
            .unwrap();
        assert_eq!(store.section_cache_capacity(), 8);

        store.section(RegionAddress::new(0, 0)).unwrap();
        store.section(RegionAddress::new(0, 0)).unwrap();
        // Empty cells bypass the cache
        store.section(RegionAddress::new(3, 3)).unwrap();

        let stats = store.cache_stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_section_out_of_region() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_region(temp_dir.path(), &[]);
        let store = RegionStore::open(&path).unwrap();
        assert!(store.section(RegionAddress::new(5, 0)).is_err());
    }

    #[test]
    fn test_writer_rejects_bad_input() {
        assert!(RegionWriter::new(0, (0, 0)).is_err());
        assert!(RegionWriter::new(7, (0, 0)).is_err());

        let mut writer = RegionWriter::new(DIV, (0, 0)).unwrap();
        assert!(writer
            .insert_encoded(TileAddress::new(20, 0), vec![1])
            .is_err());

        let mut scratch = ScratchBuffers::with_capacity(1024);
        let other = TileCache::empty(TileAddress::new(0, 0), 8);
        assert!(writer.insert(&other, &mut scratch).is_err());
    }

    #[test]
    fn test_traversal_order() {
        let cells: Vec<RegionAddress> = RegionAddress::all().take(3).collect();
        assert_eq!(
            cells,
            vec![
                RegionAddress::new(0, 0),
                RegionAddress::new(0, 1),
                RegionAddress::new(0, 2)
            ]
        );
        assert_eq!(RegionAddress::all().count(), CELL_COUNT);
        assert_eq!(RegionAddress::new(1, 2).cell_index(), 11);
        assert_eq!(RegionAddress::from_cell_index(11), RegionAddress::new(1, 2));

        let tiles: Vec<TileAddress> = RegionAddress::new(1, 2).tiles(2).collect();
        assert_eq!(
            tiles,
            vec![
                TileAddress::new(2, 4),
                TileAddress::new(2, 5),
                TileAddress::new(3, 4),
                TileAddress::new(3, 5)
            ]
        );
    }

    #[test]
    fn test_builder_from_env() {
        let original = std::env::var(SECTION_CACHE_SIZE_ENV).ok();

        std::env::set_var(SECTION_CACHE_SIZE_ENV, "7");
        assert_eq!(RegionStoreBuilder::from_env().section_cache_size, 7);

        std::env::set_var(SECTION_CACHE_SIZE_ENV, "not a number");
        assert_eq!(
            RegionStoreBuilder::from_env().section_cache_size,
            DEFAULT_SECTION_CACHE_SIZE
        );

        match original {
            Some(v) => std::env::set_var(SECTION_CACHE_SIZE_ENV, v),
            None => std::env::remove_var(SECTION_CACHE_SIZE_ENV),
        }
    }
}
