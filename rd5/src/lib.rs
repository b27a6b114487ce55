//! # rd5 - Tiled Routing Data Storage
//!
//! Binary storage and versioning layer for offline routing data:
//!
//! - **Rasters**: parse textual elevation grids (`.asc`, optionally zipped
//!   or gzipped) with exact fixed-point arithmetic and re-encode them into a
//!   compact, bit-exact binary raster format.
//! - **Region files**: memory-mapped 5° × 5° containers of micro-tiles, each
//!   holding the routing-graph nodes of a small square area.
//! - **Deltas**: compute what changed between two versions of a region, encode
//!   every tile delta, verify it by decoding it back, and persist or apply
//!   the result.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rd5::{DiffConfig, DiffEngine, RegionStore};
//!
//! let older = RegionStore::open("old/E5_N45.rd5")?;
//! let newer = RegionStore::open("new/E5_N45.rd5")?;
//!
//! let stats = DiffEngine::new(DiffConfig::default()).diff(&older, &newer)?;
//! println!("{} of {} nodes changed", stats.diff_nodes, stats.total_nodes);
//! ```
//!
//! ## Region Addressing
//!
//! A region is split into 25 whole-degree cells ([`RegionAddress`]). Each
//! cell is subdivided `divisor` times per axis into micro-tiles
//! ([`TileAddress`]), so a region holds `(5 * divisor)²` tiles. Empty cells
//! and tiles are legal and read back as empty [`TileCache`]s.

pub mod bits;
pub mod delta;
pub mod diff;
pub mod error;
pub mod filename;
pub mod grid;
pub mod raster;
pub mod region;
pub mod tile;

// Re-export main types at crate root for convenience
pub use delta::{patch_region, DeltaReader, DeltaRecord, DeltaSink, DeltaWriter, PatchStats};
pub use diff::{verify_encoded, DiffConfig, DiffEngine, DiffStats};
pub use error::{CodecError, Rd5Error, Result};
pub use grid::{load_grid, parse_grid};
pub use raster::{decode_raster, encode_raster, Raster, RasterHeader, Sample};
pub use region::{RegionAddress, RegionStore, RegionStoreBuilder, RegionWriter, TileSection};
pub use tile::{Link, Mismatch, Node, NodeId, Record, ScratchBuffers, TileAddress, TileCache, TransferPoint};
