//! Micro-tiles: addressing, routing-graph records and the tile cache.
//!
//! A region covers 5°×5° and each whole degree is subdivided `divisor` times
//! per axis. A [`TileAddress`] names one micro-tile by its absolute indices in
//! that subdivision grid. Node coordinates are region-local micro-degrees
//! (`0..5_000_000` on each axis), so a tile can be decoded from its address
//! and the divisor alone.

mod cache;
mod codec;

pub use cache::{Mismatch, Record, TileCache};
pub use codec::{ScratchBuffers, DEFAULT_ENCODE_CAPACITY};

use crate::region::{RegionAddress, REGION_DEGREES};

/// Micro-degrees per degree.
pub const MICRO_DEGREES: u32 = 1_000_000;

/// Absolute position of a micro-tile in a region's subdivision grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileAddress {
    /// Longitude index, `0..5*divisor`.
    pub lon_index: u32,
    /// Latitude index, `0..5*divisor`.
    pub lat_index: u32,
}

impl TileAddress {
    /// Create an address from absolute indices.
    pub fn new(lon_index: u32, lat_index: u32) -> Self {
        Self {
            lon_index,
            lat_index,
        }
    }

    /// Compose an address from a whole-degree cell and local indices.
    pub fn from_local(region: RegionAddress, divisor: u32, local_lon: u32, local_lat: u32) -> Self {
        Self {
            lon_index: region.lon_degree * divisor + local_lon,
            lat_index: region.lat_degree * divisor + local_lat,
        }
    }

    /// Whether both indices fall inside a region with this divisor.
    pub fn is_within(&self, divisor: u32) -> bool {
        match REGION_DEGREES.checked_mul(divisor) {
            Some(bound) => self.lon_index < bound && self.lat_index < bound,
            None => false,
        }
    }

    /// The whole-degree cell holding this tile.
    pub fn region_address(&self, divisor: u32) -> RegionAddress {
        let divisor = divisor.max(1);
        RegionAddress::new(self.lon_index / divisor, self.lat_index / divisor)
    }

    /// Indices within the whole-degree cell.
    pub fn local(&self, divisor: u32) -> (u32, u32) {
        let divisor = divisor.max(1);
        (self.lon_index % divisor, self.lat_index % divisor)
    }

    /// South-west corner of the tile in region-local micro-degrees.
    ///
    /// Saturates for tiles outside the region; see [`TileAddress::checked_origin`].
    pub fn origin(&self, divisor: u32) -> NodeId {
        let step = MICRO_DEGREES / divisor.max(1);
        NodeId::new(
            self.lon_index.saturating_mul(step),
            self.lat_index.saturating_mul(step),
        )
    }

    /// South-west corner, or `None` unless `divisor` splits a degree into
    /// whole micro-degrees and the tile lies inside the region.
    pub fn checked_origin(&self, divisor: u32) -> Option<NodeId> {
        if divisor == 0 || MICRO_DEGREES % divisor != 0 || !self.is_within(divisor) {
            return None;
        }
        Some(self.origin(divisor))
    }
}

/// Node identity: region-local position in micro-degrees.
///
/// Ordering is by longitude, then latitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub ilon: u32,
    pub ilat: u32,
}

impl NodeId {
    pub fn new(ilon: u32, ilat: u32) -> Self {
        Self { ilon, ilat }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ilon, self.ilat)
    }
}

/// A routing-graph node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// Elevation in decimeters, `i16::MIN` when unknown.
    pub elevation: i16,
    /// Encoded node description (barriers, crossings, ...).
    pub tags: Vec<u8>,
    pub links: Vec<Link>,
}

impl Node {
    /// A node without tags or links.
    pub fn new(id: NodeId, elevation: i16) -> Self {
        Self {
            id,
            elevation,
            tags: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Structural equality that ignores link order.
    pub fn same_content(&self, other: &Node) -> bool {
        self.id == other.id
            && self.elevation == other.elevation
            && self.tags == other.tags
            && self.links.len() == other.links.len()
            && self.sorted_links() == other.sorted_links()
    }

    pub(crate) fn sorted_links(&self) -> Vec<&Link> {
        let mut links: Vec<&Link> = self.links.iter().collect();
        links.sort();
        links
    }
}

/// A directed edge from its owning node to `target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Link {
    pub target: NodeId,
    /// Encoded way description.
    pub tags: Vec<u8>,
    /// Intermediate shape points between the two nodes.
    pub geometry: Vec<TransferPoint>,
}

/// A shape point on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferPoint {
    pub ilon: u32,
    pub ilat: u32,
    pub elevation: i16,
}
