//! Tile payload encoding.
//!
//! The first byte of an encoded tile selects the mode:
//!
//! - `1` adaptive: counts and zigzag deltas as variable-length bit codes, tag
//!   byte strings through move-to-front dictionaries.
//! - `2` fixed-width: every field in a fixed number of bits.
//!
//! The encoder writes the adaptive form and falls back to the fixed-width
//! form when that is shorter, so an encoded tile never exceeds
//! [`TileCache::raw_encoded_len`].

use super::{Link, Node, NodeId, Record, TileAddress, TileCache, TransferPoint};
use crate::bits::{BitReader, BitWriter, CodecResult};
use crate::error::CodecError;

const MODE_ADAPTIVE: u8 = 1;
const MODE_FIXED: u8 = 2;

const MODE_BITS: u32 = 8;
const RECORD_COUNT_BITS: u32 = 32;
const COUNT_BITS: u32 = 16;
const COORD_BITS: u32 = 32;
const ELEVATION_BITS: u32 = 16;
const FLAG_BITS: u32 = 8;

/// Entries kept by each move-to-front tag dictionary.
const DICTIONARY_SIZE: usize = 64;

/// Default size of the encode buffer (10 MiB).
pub const DEFAULT_ENCODE_CAPACITY: usize = 10 * 1024 * 1024;

/// Caller-owned working memory for encoding and decoding tiles.
///
/// Holds the encode output buffer and the tag dictionaries. Reusing one
/// instance across calls avoids allocating per tile. Not shared between
/// threads; give each worker its own.
#[derive(Debug)]
pub struct ScratchBuffers {
    encode: Vec<u8>,
    tags: TagDictionaries,
}

impl ScratchBuffers {
    /// Scratch space with the default encode capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ENCODE_CAPACITY)
    }

    /// Scratch space able to hold an encoded tile of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            encode: vec![0; capacity],
            tags: TagDictionaries::default(),
        }
    }

    /// Size of the encode buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.encode.len()
    }

    /// The first `len` bytes of the encode buffer.
    pub fn encoded(&self, len: usize) -> &[u8] {
        &self.encode[..len.min(self.encode.len())]
    }
}

impl Default for ScratchBuffers {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct TagDictionaries {
    node: TagDictionary,
    way: TagDictionary,
}

impl TagDictionaries {
    fn clear(&mut self) {
        self.node.clear();
        self.way.clear();
    }
}

/// Move-to-front list of recently seen tag strings.
#[derive(Debug, Default)]
struct TagDictionary {
    entries: Vec<Vec<u8>>,
}

impl TagDictionary {
    fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, tags: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.as_slice() == tags)
    }

    fn get(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(Vec::as_slice)
    }

    fn promote(&mut self, index: usize) {
        if index > 0 && index < self.entries.len() {
            let entry = self.entries.remove(index);
            self.entries.insert(0, entry);
        }
    }

    fn insert(&mut self, tags: &[u8]) {
        let mut slot = if self.entries.len() >= DICTIONARY_SIZE {
            self.entries.pop().unwrap_or_default()
        } else {
            Vec::new()
        };
        slot.clear();
        slot.extend_from_slice(tags);
        self.entries.insert(0, slot);
    }
}

/// How each field of a record is put into bits.
trait FieldModel {
    const MODE: u8;

    fn put_count(w: &mut BitWriter<'_>, field: &'static str, value: usize, width: u32)
        -> CodecResult<()>;
    fn get_count(r: &mut BitReader<'_>, width: u32) -> CodecResult<usize>;

    fn put_flag(w: &mut BitWriter<'_>, set: bool) -> CodecResult<()>;
    fn get_flag(r: &mut BitReader<'_>) -> CodecResult<bool>;

    fn put_coord(w: &mut BitWriter<'_>, value: u32, base: u32) -> CodecResult<()>;
    fn get_coord(r: &mut BitReader<'_>, field: &'static str, base: u32) -> CodecResult<u32>;

    fn put_elevation(w: &mut BitWriter<'_>, value: i16, base: i16) -> CodecResult<()>;
    fn get_elevation(r: &mut BitReader<'_>, base: i16) -> CodecResult<i16>;

    fn put_tags(w: &mut BitWriter<'_>, dict: &mut TagDictionary, tags: &[u8]) -> CodecResult<()>;
    fn get_tags(r: &mut BitReader<'_>, dict: &mut TagDictionary) -> CodecResult<Vec<u8>>;
}

struct Adaptive;

impl FieldModel for Adaptive {
    const MODE: u8 = MODE_ADAPTIVE;

    fn put_count(w: &mut BitWriter<'_>, _: &'static str, value: usize, _: u32) -> CodecResult<()> {
        w.write_var_bits(value as u64)
    }

    fn get_count(r: &mut BitReader<'_>, _: u32) -> CodecResult<usize> {
        let value = r.read_var_bits()?;
        usize::try_from(value).map_err(|_| CodecError::InvalidValue {
            field: "count",
            value,
        })
    }

    fn put_flag(w: &mut BitWriter<'_>, set: bool) -> CodecResult<()> {
        w.write_bit(set)
    }

    fn get_flag(r: &mut BitReader<'_>) -> CodecResult<bool> {
        r.read_bit()
    }

    fn put_coord(w: &mut BitWriter<'_>, value: u32, base: u32) -> CodecResult<()> {
        w.write_signed_var_bits(i64::from(value) - i64::from(base))
    }

    fn get_coord(r: &mut BitReader<'_>, field: &'static str, base: u32) -> CodecResult<u32> {
        let delta = r.read_signed_var_bits()?;
        i64::from(base)
            .checked_add(delta)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(CodecError::InvalidValue {
                field,
                value: delta as u64,
            })
    }

    fn put_elevation(w: &mut BitWriter<'_>, value: i16, base: i16) -> CodecResult<()> {
        w.write_signed_var_bits(i64::from(value) - i64::from(base))
    }

    fn get_elevation(r: &mut BitReader<'_>, base: i16) -> CodecResult<i16> {
        let delta = r.read_signed_var_bits()?;
        i64::from(base)
            .checked_add(delta)
            .and_then(|v| i16::try_from(v).ok())
            .ok_or(CodecError::InvalidValue {
                field: "elevation",
                value: delta as u64,
            })
    }

    fn put_tags(w: &mut BitWriter<'_>, dict: &mut TagDictionary, tags: &[u8]) -> CodecResult<()> {
        // 0 introduces a literal, n > 0 refers to dictionary entry n - 1
        match dict.position(tags) {
            Some(index) => {
                w.write_var_bits(index as u64 + 1)?;
                dict.promote(index);
            }
            None => {
                w.write_var_bits(0)?;
                w.write_var_bits(tags.len() as u64)?;
                for &b in tags {
                    w.write_bits(u64::from(b), 8)?;
                }
                dict.insert(tags);
            }
        }
        Ok(())
    }

    fn get_tags(r: &mut BitReader<'_>, dict: &mut TagDictionary) -> CodecResult<Vec<u8>> {
        let code = r.read_var_bits()?;
        if code == 0 {
            let len = Self::get_count(r, 0)?;
            let tags = read_bytes(r, len)?;
            dict.insert(&tags);
            return Ok(tags);
        }
        let index = usize::try_from(code - 1).unwrap_or(usize::MAX);
        let tags = dict
            .get(index)
            .ok_or(CodecError::InvalidValue {
                field: "tag index",
                value: code,
            })?
            .to_vec();
        dict.promote(index);
        Ok(tags)
    }
}

struct FixedWidth;

impl FieldModel for FixedWidth {
    const MODE: u8 = MODE_FIXED;

    fn put_count(
        w: &mut BitWriter<'_>,
        field: &'static str,
        value: usize,
        width: u32,
    ) -> CodecResult<()> {
        check_width(field, value, width)?;
        w.write_bits(value as u64, width)
    }

    fn get_count(r: &mut BitReader<'_>, width: u32) -> CodecResult<usize> {
        let value = r.read_bits(width)?;
        usize::try_from(value).map_err(|_| CodecError::InvalidValue {
            field: "count",
            value,
        })
    }

    fn put_flag(w: &mut BitWriter<'_>, set: bool) -> CodecResult<()> {
        w.write_bits(u64::from(set), FLAG_BITS)
    }

    fn get_flag(r: &mut BitReader<'_>) -> CodecResult<bool> {
        match r.read_bits(FLAG_BITS)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidValue {
                field: "record flag",
                value,
            }),
        }
    }

    fn put_coord(w: &mut BitWriter<'_>, value: u32, _: u32) -> CodecResult<()> {
        w.write_bits(u64::from(value), COORD_BITS)
    }

    fn get_coord(r: &mut BitReader<'_>, _: &'static str, _: u32) -> CodecResult<u32> {
        Ok(r.read_bits(COORD_BITS)? as u32)
    }

    fn put_elevation(w: &mut BitWriter<'_>, value: i16, _: i16) -> CodecResult<()> {
        w.write_bits(u64::from(value as u16), ELEVATION_BITS)
    }

    fn get_elevation(r: &mut BitReader<'_>, _: i16) -> CodecResult<i16> {
        Ok(r.read_bits(ELEVATION_BITS)? as u16 as i16)
    }

    fn put_tags(w: &mut BitWriter<'_>, _: &mut TagDictionary, tags: &[u8]) -> CodecResult<()> {
        Self::put_count(w, "tag length", tags.len(), COUNT_BITS)?;
        for &b in tags {
            w.write_bits(u64::from(b), 8)?;
        }
        Ok(())
    }

    fn get_tags(r: &mut BitReader<'_>, _: &mut TagDictionary) -> CodecResult<Vec<u8>> {
        let len = Self::get_count(r, COUNT_BITS)?;
        read_bytes(r, len)
    }
}

fn check_width(field: &'static str, value: usize, width: u32) -> CodecResult<()> {
    let value = value as u64;
    if width < 64 && value >> width != 0 {
        return Err(CodecError::FieldOverflow { field, value });
    }
    Ok(())
}

fn read_bytes(r: &mut BitReader<'_>, len: usize) -> CodecResult<Vec<u8>> {
    if len.saturating_mul(8) > r.remaining_bits() {
        return Err(CodecError::UnexpectedEnd {
            bit: r.bit_position() + r.remaining_bits(),
        });
    }
    let mut bytes = Vec::with_capacity(len);
    for _ in 0..len {
        bytes.push(r.read_bits(8)? as u8);
    }
    Ok(bytes)
}

fn write_records<M: FieldModel>(
    cache: &TileCache,
    w: &mut BitWriter<'_>,
    tags: &mut TagDictionaries,
) -> CodecResult<()> {
    tags.clear();
    w.write_bits(u64::from(M::MODE), MODE_BITS)?;
    M::put_count(w, "record count", cache.size(), RECORD_COUNT_BITS)?;

    let mut prev = tile_origin(cache.address(), cache.divisor())?;
    let mut prev_elevation = 0i16;
    for record in cache.records() {
        let id = record.id();
        M::put_coord(w, id.ilon, prev.ilon)?;
        M::put_coord(w, id.ilat, prev.ilat)?;
        prev = id;

        let node = match record {
            Record::Removed(_) => {
                M::put_flag(w, true)?;
                continue;
            }
            Record::Present(node) => node,
        };
        M::put_flag(w, false)?;
        M::put_elevation(w, node.elevation, prev_elevation)?;
        prev_elevation = node.elevation;
        M::put_tags(w, &mut tags.node, &node.tags)?;

        M::put_count(w, "link count", node.links.len(), COUNT_BITS)?;
        for link in &node.links {
            M::put_coord(w, link.target.ilon, id.ilon)?;
            M::put_coord(w, link.target.ilat, id.ilat)?;
            M::put_tags(w, &mut tags.way, &link.tags)?;

            M::put_count(w, "geometry count", link.geometry.len(), COUNT_BITS)?;
            let (mut lon, mut lat, mut elevation) = (id.ilon, id.ilat, node.elevation);
            for point in &link.geometry {
                M::put_coord(w, point.ilon, lon)?;
                M::put_coord(w, point.ilat, lat)?;
                M::put_elevation(w, point.elevation, elevation)?;
                lon = point.ilon;
                lat = point.ilat;
                elevation = point.elevation;
            }
        }
    }
    Ok(())
}

fn read_records<M: FieldModel>(
    r: &mut BitReader<'_>,
    origin: NodeId,
    tags: &mut TagDictionaries,
) -> CodecResult<Vec<Record>> {
    tags.clear();
    let count = M::get_count(r, RECORD_COUNT_BITS)?;
    // Every record costs at least one bit
    let mut records = Vec::with_capacity(count.min(r.remaining_bits()));

    let mut prev = origin;
    let mut prev_elevation = 0i16;
    for i in 0..count {
        let ilon = M::get_coord(r, "node lon", prev.ilon)?;
        let ilat = M::get_coord(r, "node lat", prev.ilat)?;
        let id = NodeId::new(ilon, ilat);
        if i > 0 && id <= prev {
            return Err(CodecError::InvalidValue {
                field: "node order",
                value: u64::from(id.ilon),
            });
        }
        prev = id;

        if M::get_flag(r)? {
            records.push(Record::Removed(id));
            continue;
        }
        let elevation = M::get_elevation(r, prev_elevation)?;
        prev_elevation = elevation;
        let mut node = Node::new(id, elevation);
        node.tags = M::get_tags(r, &mut tags.node)?;

        let link_count = M::get_count(r, COUNT_BITS)?;
        node.links.reserve(link_count.min(r.remaining_bits()));
        for _ in 0..link_count {
            let target = NodeId::new(
                M::get_coord(r, "link lon", id.ilon)?,
                M::get_coord(r, "link lat", id.ilat)?,
            );
            let link_tags = M::get_tags(r, &mut tags.way)?;

            let point_count = M::get_count(r, COUNT_BITS)?;
            let mut geometry = Vec::with_capacity(point_count.min(r.remaining_bits()));
            let (mut lon, mut lat, mut elev) = (id.ilon, id.ilat, elevation);
            for _ in 0..point_count {
                lon = M::get_coord(r, "point lon", lon)?;
                lat = M::get_coord(r, "point lat", lat)?;
                elev = M::get_elevation(r, elev)?;
                geometry.push(TransferPoint {
                    ilon: lon,
                    ilat: lat,
                    elevation: elev,
                });
            }
            node.links.push(Link {
                target,
                tags: link_tags,
                geometry,
            });
        }
        records.push(Record::Present(node));
    }
    Ok(records)
}

fn encode_with<M: FieldModel>(
    cache: &TileCache,
    out: &mut [u8],
    tags: &mut TagDictionaries,
) -> CodecResult<usize> {
    let mut w = BitWriter::new(out);
    write_records::<M>(cache, &mut w, tags)?;
    Ok(w.finish())
}

fn encode_tile(cache: &TileCache, out: &mut [u8], tags: &mut TagDictionaries) -> CodecResult<usize> {
    let raw_len = cache.raw_encoded_len();
    match (encode_with::<Adaptive>(cache, out, tags), raw_len) {
        (Ok(len), Ok(raw)) if raw < len => encode_with::<FixedWidth>(cache, out, tags),
        (Ok(len), _) => Ok(len),
        (Err(CodecError::BufferTooSmall { .. }), Ok(raw)) if raw <= out.len() => {
            encode_with::<FixedWidth>(cache, out, tags)
        }
        (Err(e), _) => Err(e),
    }
}

/// Coordinate base of a tile, rejecting addresses the region cannot hold.
fn tile_origin(address: TileAddress, divisor: u32) -> CodecResult<NodeId> {
    address.checked_origin(divisor).ok_or(CodecError::InvalidValue {
        field: "tile address",
        value: u64::from(address.lon_index.max(address.lat_index)),
    })
}

fn decode_tile(
    bytes: &[u8],
    tags: &mut TagDictionaries,
    address: TileAddress,
    divisor: u32,
) -> CodecResult<TileCache> {
    let origin = tile_origin(address, divisor)?;
    let mut r = BitReader::new(bytes);
    let records = match r.read_bits(MODE_BITS)? as u8 {
        MODE_ADAPTIVE => read_records::<Adaptive>(&mut r, origin, tags)?,
        MODE_FIXED => read_records::<FixedWidth>(&mut r, origin, tags)?,
        mode => return Err(CodecError::UnknownMode(mode)),
    };

    let consumed = r.bytes_consumed();
    if consumed < bytes.len() {
        return Err(CodecError::TrailingBytes {
            count: bytes.len() - consumed,
        });
    }
    Ok(TileCache::from_sorted_records(address, divisor, records))
}

impl ScratchBuffers {
    /// Decode the first `len` bytes of the encode buffer in place.
    pub(crate) fn decode_encoded(
        &mut self,
        len: usize,
        address: TileAddress,
        divisor: u32,
    ) -> CodecResult<TileCache> {
        let Self { encode, tags } = self;
        decode_tile(&encode[..len.min(encode.len())], tags, address, divisor)
    }
}

impl TileCache {
    /// Encode into the scratch encode buffer; returns the encoded length.
    ///
    /// Read the bytes back with [`ScratchBuffers::encoded`].
    pub fn encode(&self, scratch: &mut ScratchBuffers) -> CodecResult<usize> {
        let ScratchBuffers { encode, tags } = scratch;
        encode_tile(self, encode, tags)
    }

    /// Encode into a caller-provided buffer; returns the encoded length.
    pub fn encode_into(&self, out: &mut [u8], scratch: &mut ScratchBuffers) -> CodecResult<usize> {
        encode_tile(self, out, &mut scratch.tags)
    }

    /// Decode an encoded tile. All of `bytes` must be consumed.
    pub fn decode(
        bytes: &[u8],
        scratch: &mut ScratchBuffers,
        address: TileAddress,
        divisor: u32,
    ) -> CodecResult<TileCache> {
        decode_tile(bytes, &mut scratch.tags, address, divisor)
    }

    /// Size of the fixed-width encoding, the upper bound of [`TileCache::encode`].
    ///
    /// Fails with [`CodecError::FieldOverflow`] when a count or tag length
    /// does not fit its fixed-width field.
    pub fn raw_encoded_len(&self) -> CodecResult<usize> {
        check_width("record count", self.size(), RECORD_COUNT_BITS)?;
        let point_bits = (2 * COORD_BITS + ELEVATION_BITS) as usize;

        let mut bits = (MODE_BITS + RECORD_COUNT_BITS) as usize;
        for record in self.records() {
            bits += (2 * COORD_BITS + FLAG_BITS) as usize;
            let Record::Present(node) = record else {
                continue;
            };
            check_width("tag length", node.tags.len(), COUNT_BITS)?;
            check_width("link count", node.links.len(), COUNT_BITS)?;
            bits += (ELEVATION_BITS + 2 * COUNT_BITS) as usize + 8 * node.tags.len();
            for link in &node.links {
                check_width("tag length", link.tags.len(), COUNT_BITS)?;
                check_width("geometry count", link.geometry.len(), COUNT_BITS)?;
                bits += (2 * COORD_BITS + 2 * COUNT_BITS) as usize
                    + 8 * link.tags.len()
                    + point_bits * link.geometry.len();
            }
        }
        Ok(bits / 8)
    }
}
