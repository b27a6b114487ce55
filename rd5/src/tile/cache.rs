//! Decoded micro-tile payloads and tile deltas.

use std::cmp::Ordering;
use std::fmt;

use super::{Node, NodeId, TileAddress};

/// One entry of a tile cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A node with its full content.
    Present(Node),
    /// A node removed relative to the older version (delta caches only).
    Removed(NodeId),
}

impl Record {
    /// The node id this record refers to.
    pub fn id(&self) -> NodeId {
        match self {
            Record::Present(node) => node.id,
            Record::Removed(id) => *id,
        }
    }
}

/// The decoded payload of one micro-tile.
///
/// Records are kept sorted by [`NodeId`] with no duplicates. A cache built
/// from a region file holds only [`Record::Present`]; a delta built by
/// [`TileCache::calc_delta`] may also hold [`Record::Removed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCache {
    address: TileAddress,
    divisor: u32,
    records: Vec<Record>,
}

impl TileCache {
    /// The canonical zero-size cache.
    pub fn empty(address: TileAddress, divisor: u32) -> Self {
        Self {
            address,
            divisor,
            records: Vec::new(),
        }
    }

    /// Build a cache from nodes in any order.
    ///
    /// When two nodes share an id, the later one wins.
    pub fn from_nodes(address: TileAddress, divisor: u32, mut nodes: Vec<Node>) -> Self {
        nodes.sort_by_key(|n| n.id);
        let mut records: Vec<Record> = Vec::with_capacity(nodes.len());
        for node in nodes {
            match records.last_mut() {
                Some(last) if last.id() == node.id => *last = Record::Present(node),
                _ => records.push(Record::Present(node)),
            }
        }
        Self {
            address,
            divisor,
            records,
        }
    }

    /// Build a cache from records already sorted by id.
    pub(crate) fn from_sorted_records(
        address: TileAddress,
        divisor: u32,
        records: Vec<Record>,
    ) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].id() < w[1].id()));
        Self {
            address,
            divisor,
            records,
        }
    }

    /// Number of records.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn address(&self) -> TileAddress {
        self.address
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Present nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.records.iter().filter_map(|r| match r {
            Record::Present(node) => Some(node),
            Record::Removed(_) => None,
        })
    }

    /// Look up a present node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        let idx = self.records.binary_search_by_key(&id, Record::id).ok()?;
        match &self.records[idx] {
            Record::Present(node) => Some(node),
            Record::Removed(_) => None,
        }
    }

    /// Cheap fingerprint of the payload volume: links, shape points and tag
    /// bytes summed over all records. Independent of link order.
    pub fn data_size(&self) -> usize {
        self.nodes()
            .map(|n| {
                n.tags.len()
                    + n.links
                        .iter()
                        .map(|l| 1 + l.tags.len() + l.geometry.len())
                        .sum::<usize>()
            })
            .sum()
    }

    /// Compute what changed going from `older` to `newer`.
    ///
    /// Added and modified nodes are carried with their `newer` content, nodes
    /// only present in `older` become [`Record::Removed`], identical nodes are
    /// skipped. The result lives at `newer`'s address.
    pub fn calc_delta(older: &TileCache, newer: &TileCache) -> TileCache {
        let mut records = Vec::new();
        let mut old_iter = older.nodes().peekable();
        let mut new_iter = newer.nodes().peekable();

        loop {
            let order = match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(o), Some(n)) => o.id.cmp(&n.id),
            };
            match order {
                Ordering::Less => {
                    if let Some(old) = old_iter.next() {
                        records.push(Record::Removed(old.id));
                    }
                }
                Ordering::Greater => {
                    if let Some(new) = new_iter.next() {
                        records.push(Record::Present(new.clone()));
                    }
                }
                Ordering::Equal => {
                    if let (Some(old), Some(new)) = (old_iter.next(), new_iter.next()) {
                        if !old.same_content(new) {
                            records.push(Record::Present(new.clone()));
                        }
                    }
                }
            }
        }

        Self::from_sorted_records(newer.address, newer.divisor, records)
    }

    /// Apply a delta produced by [`TileCache::calc_delta`] to `older`.
    pub fn apply_delta(older: &TileCache, delta: &TileCache) -> TileCache {
        let mut records = Vec::with_capacity(older.size() + delta.size());
        let mut old_iter = older.nodes().peekable();
        let mut delta_iter = delta.records.iter().peekable();

        loop {
            let order = match (old_iter.peek(), delta_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(o), Some(d)) => o.id.cmp(&d.id()),
            };
            if order == Ordering::Less {
                if let Some(old) = old_iter.next() {
                    records.push(Record::Present(old.clone()));
                }
                continue;
            }
            if order == Ordering::Equal {
                old_iter.next();
            }
            if let Some(Record::Present(node)) = delta_iter.next() {
                records.push(Record::Present(node.clone()));
            }
        }

        Self::from_sorted_records(delta.address, delta.divisor, records)
    }

    /// Deep structural comparison; link order is not significant.
    ///
    /// Returns `None` when both caches hold the same records, otherwise the
    /// first mismatch found.
    pub fn compare_with(&self, other: &TileCache) -> Option<Mismatch> {
        if self.size() != other.size() {
            return Some(Mismatch::RecordCount {
                expected: self.size(),
                actual: other.size(),
            });
        }

        for (index, (a, b)) in self.records.iter().zip(&other.records).enumerate() {
            if a.id() != b.id() {
                return Some(Mismatch::NodeId {
                    index,
                    expected: a.id(),
                    actual: b.id(),
                });
            }
            let (a, b) = match (a, b) {
                (Record::Present(a), Record::Present(b)) => (a, b),
                (Record::Removed(_), Record::Removed(_)) => continue,
                _ => return Some(Mismatch::RecordKind { id: a.id() }),
            };
            if a.elevation != b.elevation {
                return Some(Mismatch::Elevation {
                    id: a.id,
                    expected: a.elevation,
                    actual: b.elevation,
                });
            }
            if a.tags != b.tags {
                return Some(Mismatch::NodeTags { id: a.id });
            }
            if a.links.len() != b.links.len() {
                return Some(Mismatch::LinkCount {
                    id: a.id,
                    expected: a.links.len(),
                    actual: b.links.len(),
                });
            }
            for (la, lb) in a.sorted_links().into_iter().zip(b.sorted_links()) {
                if la != lb {
                    return Some(Mismatch::Link {
                        id: a.id,
                        target: la.target,
                    });
                }
            }
        }
        None
    }
}

/// First difference reported by [`TileCache::compare_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    RecordCount { expected: usize, actual: usize },
    NodeId { index: usize, expected: NodeId, actual: NodeId },
    RecordKind { id: NodeId },
    Elevation { id: NodeId, expected: i16, actual: i16 },
    NodeTags { id: NodeId },
    LinkCount { id: NodeId, expected: usize, actual: usize },
    Link { id: NodeId, target: NodeId },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::RecordCount { expected, actual } => {
                write!(f, "record count {} <---> {}", expected, actual)
            }
            Mismatch::NodeId {
                index,
                expected,
                actual,
            } => write!(f, "node #{}: id {} <---> {}", index, expected, actual),
            Mismatch::RecordKind { id } => write!(f, "node {}: removed vs present", id),
            Mismatch::Elevation {
                id,
                expected,
                actual,
            } => write!(f, "node {}: elevation {} <---> {}", id, expected, actual),
            Mismatch::NodeTags { id } => write!(f, "node {}: tags differ", id),
            Mismatch::LinkCount {
                id,
                expected,
                actual,
            } => write!(f, "node {}: link count {} <---> {}", id, expected, actual),
            Mismatch::Link { id, target } => {
                write!(f, "node {}: link to {} differs", id, target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Link, TransferPoint};
    use proptest::prelude::*;

    const DIV: u32 = 4;

    fn addr() -> TileAddress {
        TileAddress::new(1, 2)
    }

    fn node(ilon: u32, ilat: u32, elevation: i16) -> Node {
        let mut n = Node::new(NodeId::new(ilon, ilat), elevation);
        n.tags = vec![1, 2];
        n.links.push(Link {
            target: NodeId::new(ilon + 10, ilat),
            tags: b"highway=track".to_vec(),
            geometry: vec![TransferPoint {
                ilon: ilon + 5,
                ilat: ilat + 1,
                elevation,
            }],
        });
        n
    }

    fn cache(nodes: Vec<Node>) -> TileCache {
        TileCache::from_nodes(addr(), DIV, nodes)
    }

    #[test]
    fn test_from_nodes_sorts_and_dedups() {
        let c = cache(vec![node(30, 0, 1), node(10, 0, 1), node(30, 0, 9)]);
        let ids: Vec<NodeId> = c.records().iter().map(Record::id).collect();

        assert_eq!(ids, vec![NodeId::new(10, 0), NodeId::new(30, 0)]);
        assert_eq!(c.node(NodeId::new(30, 0)).unwrap().elevation, 9);
    }

    #[test]
    fn test_delta_of_identical_is_empty() {
        let a = cache(vec![node(10, 0, 1), node(20, 0, 2)]);
        let mut b = a.clone();
        if let Some(Record::Present(n)) = b.records.first_mut() {
            n.links.push(Link {
                target: NodeId::new(0, 0),
                tags: vec![],
                geometry: vec![],
            });
            n.links.reverse();
        }
        let mut a2 = a.clone();
        if let Some(Record::Present(n)) = a2.records.first_mut() {
            n.links.push(Link {
                target: NodeId::new(0, 0),
                tags: vec![],
                geometry: vec![],
            });
        }

        assert_eq!(TileCache::calc_delta(&a, &a).size(), 0);
        assert_eq!(a2.compare_with(&b), None);
        assert_eq!(TileCache::calc_delta(&a2, &b).size(), 0);
    }

    #[test]
    fn test_delta_records_changes() {
        let older = cache(vec![node(10, 0, 1), node(20, 0, 2), node(30, 0, 3)]);
        let newer = cache(vec![node(10, 0, 1), node(20, 0, 5), node(40, 0, 4)]);
        let delta = TileCache::calc_delta(&older, &newer);

        assert_eq!(delta.size(), 3);
        assert!(delta.size() <= older.size() + newer.size());
        assert_eq!(
            delta.records()[1],
            Record::Removed(NodeId::new(30, 0))
        );
        assert_eq!(delta.node(NodeId::new(20, 0)).unwrap().elevation, 5);
        assert!(delta.node(NodeId::new(10, 0)).is_none());
    }

    #[test]
    fn test_delta_against_empty() {
        let newer = cache(vec![node(10, 0, 1), node(20, 0, 2)]);
        let empty = TileCache::empty(addr(), DIV);

        assert_eq!(TileCache::calc_delta(&empty, &newer).size(), 2);

        let removal = TileCache::calc_delta(&newer, &empty);
        assert_eq!(removal.size(), 2);
        assert!(removal.records().iter().all(|r| matches!(r, Record::Removed(_))));
    }

    #[test]
    fn test_apply_delta_reproduces_newer() {
        let older = cache(vec![node(10, 0, 1), node(20, 0, 2), node(30, 0, 3)]);
        let newer = cache(vec![node(5, 0, 0), node(20, 0, 5), node(30, 0, 3), node(40, 0, 4)]);
        let delta = TileCache::calc_delta(&older, &newer);
        let patched = TileCache::apply_delta(&older, &delta);

        assert_eq!(patched.compare_with(&newer), None);
    }

    #[test]
    fn test_compare_reports_first_mismatch() {
        let a = cache(vec![node(10, 0, 1), node(20, 0, 2)]);

        let b = cache(vec![node(10, 0, 1)]);
        assert_eq!(
            a.compare_with(&b),
            Some(Mismatch::RecordCount {
                expected: 2,
                actual: 1
            })
        );

        let c = cache(vec![node(10, 0, 1), node(20, 0, 7)]);
        assert!(matches!(
            a.compare_with(&c),
            Some(Mismatch::Elevation { expected: 2, actual: 7, .. })
        ));

        let d = cache(vec![node(10, 0, 1), node(21, 0, 2)]);
        assert!(matches!(a.compare_with(&d), Some(Mismatch::NodeId { index: 1, .. })));

        let mut e = a.clone();
        if let Some(Record::Present(n)) = e.records.last_mut() {
            n.links[0].geometry.clear();
        }
        let mismatch = a.compare_with(&e).unwrap();
        assert!(mismatch.to_string().contains("link to"));
    }

    #[test]
    fn test_data_size_ignores_order() {
        let a = cache(vec![node(10, 0, 1)]);
        assert_eq!(a.data_size(), 2 + 1 + 13 + 1);
        assert_eq!(TileCache::empty(addr(), DIV).data_size(), 0);
    }

    /// Nodes drawn from a small id space so versions overlap often.
    fn arb_nodes() -> impl Strategy<Value = Vec<Node>> {
        let link = (0u32..4, prop::collection::vec(0u8..2, 0..2)).prop_map(|(dlon, tags)| Link {
            target: NodeId::new(dlon, 0),
            tags,
            geometry: Vec::new(),
        });
        let node = (
            0u32..6,
            0u32..6,
            0i16..3,
            prop::collection::vec(0u8..2, 0..2),
            prop::collection::vec(link, 0..3),
        )
            .prop_map(|(ilon, ilat, elevation, tags, links)| Node {
                id: NodeId::new(ilon, ilat),
                elevation,
                tags,
                links,
            });
        prop::collection::vec(node, 0..12)
    }

    proptest! {
        #[test]
        fn prop_delta_size_bounds(
            older in arb_nodes(),
            newer in arb_nodes(),
            identical in any::<bool>(),
        ) {
            let older = cache(older);
            let newer = if identical { older.clone() } else { cache(newer) };

            let delta = TileCache::calc_delta(&older, &newer);
            prop_assert!(delta.size() <= older.size() + newer.size());
            prop_assert_eq!(delta.size() == 0, older.compare_with(&newer).is_none());

            let patched = TileCache::apply_delta(&older, &delta);
            prop_assert!(patched.compare_with(&newer).is_none());
        }
    }
}
