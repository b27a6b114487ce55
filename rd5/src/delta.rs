//! Delta artifacts: persisted tile deltas between two region versions.
//!
//! # File Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! magic "RD5D" | version u8 (2) | divisor u32
//! record*:  tag u8 (1) | lon_index u32 | lat_index u32 | delta_size u32 | len u32 | bytes[len]
//! end:      tag u8 (0) | record_count u64
//! ```
//!
//! Records appear in traversal order. The end marker is written only by
//! [`DeltaWriter::finish`]; an artifact without it, or whose count does not
//! match, is rejected when read.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::diff::check_roundtrip;
use crate::error::{Rd5Error, Result};
use crate::region::{RegionStore, RegionWriter};
use crate::tile::{ScratchBuffers, TileAddress, TileCache};

/// Magic bytes at the start of every delta artifact.
pub const DELTA_MAGIC: [u8; 4] = *b"RD5D";

/// Current artifact version.
pub const DELTA_VERSION: u8 = 2;

const TAG_END: u8 = 0;
const TAG_RECORD: u8 = 1;

/// One encoded tile delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    pub address: TileAddress,
    /// Number of records in the decoded delta.
    pub delta_size: u32,
    /// Encoded delta tile.
    pub bytes: Vec<u8>,
}

impl DeltaRecord {
    /// Decode the delta tile.
    pub fn decode(&self, scratch: &mut ScratchBuffers, divisor: u32) -> Result<TileCache> {
        Ok(TileCache::decode(&self.bytes, scratch, self.address, divisor)?)
    }
}

/// Receives verified tile deltas from the diff engine.
pub trait DeltaSink {
    /// Accept the encoded delta of one tile.
    fn accept(&mut self, address: TileAddress, delta_size: usize, bytes: &[u8]) -> Result<()>;
}

impl DeltaSink for Vec<DeltaRecord> {
    fn accept(&mut self, address: TileAddress, delta_size: usize, bytes: &[u8]) -> Result<()> {
        self.push(DeltaRecord {
            address,
            delta_size: delta_size_field(delta_size)?,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

fn delta_size_field(delta_size: usize) -> Result<u32> {
    u32::try_from(delta_size).map_err(|_| {
        Rd5Error::format("delta artifact", format!("delta size {} exceeds u32", delta_size))
    })
}

/// Streams delta records into an artifact.
pub struct DeltaWriter<W: Write> {
    out: W,
    record_count: u64,
    bytes_written: u64,
}

impl DeltaWriter<BufWriter<File>> {
    /// Create an artifact file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, divisor: u32) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file), divisor)
    }
}

impl<W: Write> DeltaWriter<W> {
    /// Write the artifact header to `out`.
    pub fn new(mut out: W, divisor: u32) -> Result<Self> {
        out.write_all(&DELTA_MAGIC)?;
        out.write_all(&[DELTA_VERSION])?;
        out.write_all(&divisor.to_be_bytes())?;
        Ok(Self {
            out,
            record_count: 0,
            bytes_written: 9,
        })
    }

    /// Append one record.
    pub fn write_record(&mut self, address: TileAddress, delta_size: usize, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            Rd5Error::format(
                "delta artifact",
                format!("encoded delta of {} bytes exceeds u32", bytes.len()),
            )
        })?;
        self.out.write_all(&[TAG_RECORD])?;
        self.out.write_all(&address.lon_index.to_be_bytes())?;
        self.out.write_all(&address.lat_index.to_be_bytes())?;
        self.out.write_all(&delta_size_field(delta_size)?.to_be_bytes())?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(bytes)?;

        self.record_count += 1;
        self.bytes_written += 17 + bytes.len() as u64;
        Ok(())
    }

    /// Number of records written.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Artifact size so far, header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write the end marker, flush and return the underlying writer.
    ///
    /// A writer dropped without `finish` leaves an artifact that
    /// [`DeltaReader`] refuses.
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&[TAG_END])?;
        self.out.write_all(&self.record_count.to_be_bytes())?;
        self.bytes_written += 9;
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write> DeltaSink for DeltaWriter<W> {
    fn accept(&mut self, address: TileAddress, delta_size: usize, bytes: &[u8]) -> Result<()> {
        self.write_record(address, delta_size, bytes)
    }
}

/// Reads delta records back from an artifact.
///
/// Iterating yields records until the end marker. A partial record, a
/// missing end marker or a record count mismatch is a [`Rd5Error::Format`]
/// error.
pub struct DeltaReader<R: Read> {
    input: R,
    divisor: u32,
    record_index: u64,
    finished: bool,
}

impl DeltaReader<BufReader<File>> {
    /// Open an artifact file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Rd5Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> DeltaReader<R> {
    /// Read and validate the artifact header.
    pub fn new(mut input: R) -> Result<Self> {
        let mut header = [0u8; 9];
        input.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Rd5Error::format("delta header", "truncated header"),
            _ => Rd5Error::Io(e),
        })?;
        if header[..4] != DELTA_MAGIC {
            return Err(Rd5Error::format("delta header", "bad magic"));
        }
        if header[4] != DELTA_VERSION {
            return Err(Rd5Error::format(
                "delta header",
                format!("unsupported version {}", header[4]),
            ));
        }
        let divisor = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

        Ok(Self {
            input,
            divisor,
            record_index: 0,
            finished: false,
        })
    }

    /// Divisor of the regions this artifact was computed from.
    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Read the next record, `None` at the end of the artifact.
    pub fn next_record(&mut self) -> Result<Option<DeltaRecord>> {
        if self.finished {
            return Ok(None);
        }

        let mut tag = [0u8; 1];
        if self.fill(&mut tag)? == 0 {
            return Err(self.truncated("missing end marker".to_string()));
        }
        match tag[0] {
            TAG_RECORD => {}
            TAG_END => {
                self.read_end()?;
                return Ok(None);
            }
            other => {
                return Err(Rd5Error::format(
                    format!("delta record {}", self.record_index),
                    format!("unknown tag {}", other),
                ))
            }
        }

        let mut fixed = [0u8; 16];
        let n = self.fill(&mut fixed)?;
        if n != 16 {
            return Err(self.truncated(format!("{} of 16 record header bytes", n)));
        }

        let field = |i: usize| u32::from_be_bytes([fixed[i], fixed[i + 1], fixed[i + 2], fixed[i + 3]]);
        let address = TileAddress::new(field(0), field(4));
        let delta_size = field(8);
        let len = field(12) as usize;

        let mut bytes = Vec::new();
        (&mut self.input)
            .take(len as u64)
            .read_to_end(&mut bytes)?;
        if bytes.len() != len {
            return Err(self.truncated(format!("{} of {} payload bytes", bytes.len(), len)));
        }

        self.record_index += 1;
        Ok(Some(DeltaRecord {
            address,
            delta_size,
            bytes,
        }))
    }

    /// Check the end marker's record count and that nothing follows it.
    fn read_end(&mut self) -> Result<()> {
        let mut count = [0u8; 8];
        let n = self.fill(&mut count)?;
        if n != 8 {
            return Err(self.truncated(format!("{} of 8 end marker bytes", n)));
        }
        let count = u64::from_be_bytes(count);
        if count != self.record_index {
            return Err(Rd5Error::format(
                "delta end marker",
                format!("declares {} records, found {}", count, self.record_index),
            ));
        }
        let mut extra = [0u8; 1];
        if self.fill(&mut extra)? != 0 {
            return Err(Rd5Error::format(
                "delta end marker",
                "trailing bytes after end marker",
            ));
        }
        self.finished = true;
        Ok(())
    }

    /// Read as many bytes as available up to `buf.len()`.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn truncated(&self, reason: String) -> Rd5Error {
        Rd5Error::format(
            format!("delta record {}", self.record_index),
            format!("truncated: {}", reason),
        )
    }
}

impl<R: Read> Iterator for DeltaReader<R> {
    type Item = Result<DeltaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Statistics from applying a delta artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Tiles carried over unchanged from the older region.
    pub tiles_copied: u64,
    /// Tiles rewritten from a delta record.
    pub tiles_patched: u64,
    /// Delta records applied, summed over all tiles.
    pub records_applied: u64,
    /// Size of the written region file.
    pub bytes_written: u64,
}

/// Apply a delta artifact to `older` and write the newer region to `output`.
///
/// Each patched tile is re-encoded and verified by decoding it back.
///
/// # Errors
///
/// Returns [`Rd5Error::Store`] if the artifact was computed for a different
/// divisor, [`Rd5Error::Format`] for malformed or duplicate records, and
/// [`Rd5Error::CodecMismatch`] if a patched tile does not survive its round
/// trip.
pub fn patch_region<R: Read, P: AsRef<Path>>(
    older: &RegionStore,
    deltas: &mut DeltaReader<R>,
    output: P,
) -> Result<PatchStats> {
    let divisor = older.divisor();
    if deltas.divisor() != divisor {
        return Err(Rd5Error::store(
            older.path(),
            format!(
                "delta divisor {} does not match region divisor {}",
                deltas.divisor(),
                divisor
            ),
        ));
    }

    let mut writer = RegionWriter::new(divisor, older.origin())?;
    let mut stats = PatchStats::default();

    for cell in older.populated_cells() {
        let section = older.section(cell)?;
        for tile in cell.tiles(divisor) {
            if let Some(bytes) = section.tile_bytes(tile) {
                writer.insert_encoded(tile, bytes.to_vec())?;
                stats.tiles_copied += 1;
            }
        }
    }

    let mut scratch = ScratchBuffers::new();
    let mut seen = BTreeSet::new();
    for record in deltas {
        let record = record?;
        let tile = record.address;
        if !tile.is_within(divisor) || !seen.insert(tile) {
            return Err(Rd5Error::format(
                "delta artifact",
                format!(
                    "unexpected record for tile ({}, {})",
                    tile.lon_index, tile.lat_index
                ),
            ));
        }

        let delta = record.decode(&mut scratch, divisor)?;
        if delta.size() != record.delta_size as usize {
            return Err(Rd5Error::format(
                "delta artifact",
                format!(
                    "tile ({}, {}) declares {} records, decoded {}",
                    tile.lon_index,
                    tile.lat_index,
                    record.delta_size,
                    delta.size()
                ),
            ));
        }

        let section = older.section(tile.region_address(divisor))?;
        if section.tile_bytes(tile).is_some() {
            stats.tiles_copied -= 1;
        }
        let base = section.materialize(tile, &mut scratch)?;
        let patched = TileCache::apply_delta(&base, &delta);
        if patched.is_empty() {
            writer.insert_encoded(tile, Vec::new())?;
        } else {
            let len = patched.encode(&mut scratch)?;
            let decoded = scratch.decode_encoded(len, tile, divisor);
            check_roundtrip(&patched, decoded, true)?;
            writer.insert_encoded(tile, scratch.encoded(len).to_vec())?;
        }

        stats.tiles_patched += 1;
        stats.records_applied += delta.size() as u64;
        debug!(
            lon_index = tile.lon_index,
            lat_index = tile.lat_index,
            records = delta.size(),
            "Patched tile"
        );
    }

    stats.bytes_written = writer.write(output.as_ref())?;
    info!(
        output = %output.as_ref().display(),
        tiles_patched = stats.tiles_patched,
        tiles_copied = stats.tiles_copied,
        "Applied delta artifact"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::tile::{Node, NodeId};
    use std::io::Cursor;

    fn record(lon: u32, lat: u32, bytes: &[u8]) -> DeltaRecord {
        DeltaRecord {
            address: TileAddress::new(lon, lat),
            delta_size: 2,
            bytes: bytes.to_vec(),
        }
    }

    fn artifact(records: &[DeltaRecord]) -> Vec<u8> {
        let mut writer = DeltaWriter::new(Vec::new(), 32).unwrap();
        for r in records {
            writer
                .write_record(r.address, r.delta_size as usize, &r.bytes)
                .unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let records = vec![record(0, 0, &[1, 2, 3]), record(5, 159, &[9; 40])];
        let bytes = artifact(&records);
        assert_eq!(&bytes[..5], b"RD5D\x02");
        assert_eq!(bytes.len(), 9 + 17 + 3 + 17 + 40 + 9);

        let mut reader = DeltaReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.divisor(), 32);
        let read: Vec<DeltaRecord> = reader.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(read, records);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_empty_artifact() {
        let bytes = artifact(&[]);
        let mut reader = DeltaReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_bad_header() {
        let mut bytes = artifact(&[]);
        bytes[0] = b'X';
        assert!(matches!(
            DeltaReader::new(Cursor::new(bytes)),
            Err(Rd5Error::Format { .. })
        ));

        let mut bytes = artifact(&[]);
        bytes[4] = 1;
        assert!(matches!(
            DeltaReader::new(Cursor::new(bytes)),
            Err(Rd5Error::Format { .. })
        ));

        assert!(matches!(
            DeltaReader::new(Cursor::new(b"RD5D".to_vec())),
            Err(Rd5Error::Format { .. })
        ));
    }

    #[test]
    fn test_truncated_record() {
        let bytes = artifact(&[record(1, 1, &[7; 10])]);

        for cut in [9 + 17 + 9, 9 + 8] {
            let mut reader = DeltaReader::new(Cursor::new(bytes[..cut].to_vec())).unwrap();
            assert!(matches!(reader.next_record(), Err(Rd5Error::Format { .. })));
        }
    }

    #[test]
    fn test_unfinished_artifact_is_rejected() {
        let mut writer = DeltaWriter::new(Vec::new(), 32).unwrap();
        writer.write_record(TileAddress::new(1, 1), 2, &[7; 10]).unwrap();
        writer.out.flush().unwrap();
        let bytes = writer.out;

        let mut reader = DeltaReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(matches!(reader.next_record(), Err(Rd5Error::Format { .. })));
    }

    #[test]
    fn test_end_marker_checks() {
        let bytes = artifact(&[record(1, 1, &[7; 10])]);

        // Count patched to claim two records
        let mut wrong_count = bytes.clone();
        let last = wrong_count.len() - 1;
        wrong_count[last] = 2;
        let reader = DeltaReader::new(Cursor::new(wrong_count)).unwrap();
        assert!(reader.collect::<Result<Vec<_>>>().is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        let reader = DeltaReader::new(Cursor::new(trailing)).unwrap();
        assert!(reader.collect::<Result<Vec<_>>>().is_err());

        let mut bad_tag = bytes;
        bad_tag[9] = 7;
        let mut reader = DeltaReader::new(Cursor::new(bad_tag)).unwrap();
        assert!(matches!(reader.next_record(), Err(Rd5Error::Format { .. })));
    }

    #[test]
    fn test_vec_sink_and_decode() {
        let address = TileAddress::new(2, 3);
        let origin = address.origin(32);
        let delta = TileCache::from_nodes(
            address,
            32,
            vec![Node::new(NodeId::new(origin.ilon + 1, origin.ilat + 1), 42)],
        );
        let mut scratch = ScratchBuffers::with_capacity(1024);
        let len = delta.encode(&mut scratch).unwrap();

        let mut sink: Vec<DeltaRecord> = Vec::new();
        sink.accept(address, delta.size(), scratch.encoded(len)).unwrap();
        assert_eq!(sink[0].delta_size, 1);
        assert_eq!(sink[0].decode(&mut scratch, 32).unwrap(), delta);
    }

    #[test]
    fn test_record_outside_region_fails_to_decode() {
        let mut scratch = ScratchBuffers::with_capacity(1024);
        let far = record(u32::MAX, 0, &[1, 0]);
        assert!(matches!(
            far.decode(&mut scratch, 32),
            Err(Rd5Error::Codec(CodecError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            DeltaReader::open(temp_dir.path().join("missing.rd5d")),
            Err(Rd5Error::FileNotFound { .. })
        ));
    }
}
