//! Elevation rasters and their compact binary encoding.
//!
//! A [`Raster`] is an immutable grid of elevation samples in row-major order.
//! Samples below [`NO_DATA_THRESHOLD`] are stored as [`Sample::NoData`]; the
//! sentinel [`NO_DATA_SENTINEL`] only exists in serialized form.
//!
//! # Binary Layout
//!
//! ```text
//! magic "BEF1"
//! ncols u32 BE | nrows u32 BE
//! xll_corner f64 BE | yll_corner f64 BE | cell_size f64 BE
//! one LEB128 varint per sample, low two bits = kind:
//!   0  integral value, upper bits = zigzag(value - previous integral value)
//!   1  no data
//!   2  raw f64 bits follow (8 bytes BE)
//! ```
//!
//! SRTM grids are integral meters with smooth neighbourhoods, so most samples
//! take one or two bytes.

use std::fmt;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use crate::error::{Rd5Error, Result};

/// Readings below this value are treated as no data.
pub const NO_DATA_THRESHOLD: f64 = -250.0;

/// Serialized stand-in for [`Sample::NoData`] (`i16::MIN`).
pub const NO_DATA_SENTINEL: f64 = i16::MIN as f64;

/// Magic bytes at the start of an encoded raster.
pub const BEF_MAGIC: &[u8; 4] = b"BEF1";

const KIND_INTEGRAL: u64 = 0;
const KIND_NO_DATA: u64 = 1;
const KIND_RAW: u64 = 2;

/// Largest magnitude stored through the integral delta path.
const MAX_INTEGRAL: f64 = 2_147_483_648.0;

/// One elevation sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// A measured elevation.
    Value(f64),
    /// No measurement available.
    NoData,
}

impl Sample {
    /// Classify a raw reading, applying the no-data threshold.
    pub fn from_reading(value: f64) -> Self {
        if value < NO_DATA_THRESHOLD {
            Sample::NoData
        } else {
            Sample::Value(value)
        }
    }

    /// The serialized value, with [`NO_DATA_SENTINEL`] for no data.
    pub fn to_raw(self) -> f64 {
        match self {
            Sample::Value(v) => v,
            Sample::NoData => NO_DATA_SENTINEL,
        }
    }

    /// Returns the elevation, or `None` for no data.
    pub fn value(self) -> Option<f64> {
        match self {
            Sample::Value(v) => Some(v),
            Sample::NoData => None,
        }
    }

    /// Bit-exact equality (distinguishes `0.0` from `-0.0`).
    pub fn same_bits(self, other: Sample) -> bool {
        match (self, other) {
            (Sample::Value(a), Sample::Value(b)) => a.to_bits() == b.to_bits(),
            (Sample::NoData, Sample::NoData) => true,
            _ => false,
        }
    }
}

/// Georeferencing header of a raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterHeader {
    /// Number of columns.
    pub ncols: usize,
    /// Number of rows.
    pub nrows: usize,
    /// Longitude of the lower-left corner.
    pub xll_corner: f64,
    /// Latitude of the lower-left corner.
    pub yll_corner: f64,
    /// Cell size in degrees.
    pub cell_size: f64,
}

impl RasterHeader {
    /// Number of samples described by this header.
    pub fn sample_count(&self) -> Option<usize> {
        self.ncols.checked_mul(self.nrows)
    }

    fn same_bits(&self, other: &RasterHeader) -> bool {
        self.ncols == other.ncols
            && self.nrows == other.nrows
            && self.xll_corner.to_bits() == other.xll_corner.to_bits()
            && self.yll_corner.to_bits() == other.yll_corner.to_bits()
            && self.cell_size.to_bits() == other.cell_size.to_bits()
    }
}

/// An immutable elevation grid in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    header: RasterHeader,
    values: Vec<Sample>,
}

/// First difference found between two rasters.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterDifference {
    /// Header fields differ.
    Header {
        expected: RasterHeader,
        actual: RasterHeader,
    },
    /// A sample differs.
    Value {
        col: usize,
        row: usize,
        expected: Sample,
        actual: Sample,
    },
}

impl fmt::Display for RasterDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterDifference::Header { expected, actual } => {
                write!(f, "header {:?} <---> {:?}", expected, actual)
            }
            RasterDifference::Value {
                col,
                row,
                expected,
                actual,
            } => write!(
                f,
                "at {},{}: {} <---> {}",
                col,
                row,
                expected.to_raw(),
                actual.to_raw()
            ),
        }
    }
}

impl Raster {
    /// Build a raster from a header and row-major samples.
    ///
    /// # Errors
    ///
    /// Returns a format error if `values.len() != ncols * nrows`.
    pub fn new(header: RasterHeader, values: Vec<Sample>) -> Result<Self> {
        let expected = header
            .sample_count()
            .ok_or_else(|| Rd5Error::format("raster", "ncols * nrows overflows"))?;
        if values.len() != expected {
            return Err(Rd5Error::format(
                "raster",
                format!("expected {} samples, got {}", expected, values.len()),
            ));
        }
        Ok(Self { header, values })
    }

    /// Returns the georeferencing header.
    pub fn header(&self) -> &RasterHeader {
        &self.header
    }

    /// Returns all samples in row-major order.
    pub fn values(&self) -> &[Sample] {
        &self.values
    }

    /// Returns the sample at a column/row, or `None` outside the grid.
    pub fn get(&self, col: usize, row: usize) -> Option<Sample> {
        if col >= self.header.ncols || row >= self.header.nrows {
            return None;
        }
        self.values.get(row * self.header.ncols + col).copied()
    }

    /// Number of no-data samples.
    pub fn no_data_count(&self) -> usize {
        self.values
            .iter()
            .filter(|s| matches!(s, Sample::NoData))
            .count()
    }

    /// Compare bit-exactly against another raster, column by column.
    pub fn first_difference(&self, other: &Raster) -> Option<RasterDifference> {
        if !self.header.same_bits(&other.header) {
            return Some(RasterDifference::Header {
                expected: self.header,
                actual: other.header,
            });
        }
        let cols = self.header.ncols;
        for col in 0..cols {
            for row in 0..self.header.nrows {
                let idx = row * cols + col;
                let (expected, actual) = (self.values[idx], other.values[idx]);
                if !expected.same_bits(actual) {
                    return Some(RasterDifference::Value {
                        col,
                        row,
                        expected,
                        actual,
                    });
                }
            }
        }
        None
    }

    /// Encode into a freshly allocated byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        encode_raster(self, &mut out)?;
        Ok(out)
    }

    /// Decode from an in-memory encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_raster(bytes)
    }
}

/// Encode a raster into the binary raster format.
///
/// # Errors
///
/// Returns an error if the dimensions exceed `u32` or writing fails.
pub fn encode_raster<W: Write>(raster: &Raster, writer: W) -> Result<()> {
    let header = raster.header();
    let ncols = u32::try_from(header.ncols)
        .map_err(|_| Rd5Error::format("raster encode", "ncols exceeds u32"))?;
    let nrows = u32::try_from(header.nrows)
        .map_err(|_| Rd5Error::format("raster encode", "nrows exceeds u32"))?;

    let mut w = BufWriter::new(writer);
    w.write_all(BEF_MAGIC)?;
    w.write_all(&ncols.to_be_bytes())?;
    w.write_all(&nrows.to_be_bytes())?;
    w.write_all(&header.xll_corner.to_bits().to_be_bytes())?;
    w.write_all(&header.yll_corner.to_bits().to_be_bytes())?;
    w.write_all(&header.cell_size.to_bits().to_be_bytes())?;

    let mut previous = 0i64;
    for sample in raster.values() {
        match *sample {
            Sample::NoData => write_varint(&mut w, KIND_NO_DATA)?,
            Sample::Value(v) => match as_integral(v) {
                Some(i) => {
                    let word = (zigzag(i - previous) << 2) | KIND_INTEGRAL;
                    write_varint(&mut w, word)?;
                    previous = i;
                }
                None => {
                    write_varint(&mut w, KIND_RAW)?;
                    w.write_all(&v.to_bits().to_be_bytes())?;
                }
            },
        }
    }
    w.flush()?;
    Ok(())
}

/// Decode a raster from the binary raster format.
///
/// # Errors
///
/// Returns a format error on bad magic, truncation, unknown sample kinds or
/// trailing bytes after the last sample.
pub fn decode_raster<R: Read>(reader: R) -> Result<Raster> {
    let mut r = BufReader::new(reader);

    let magic: [u8; 4] = read_array(&mut r)?;
    if &magic != BEF_MAGIC {
        return Err(Rd5Error::format("raster decode", "not a raster file"));
    }
    let ncols = u32::from_be_bytes(read_array(&mut r)?) as usize;
    let nrows = u32::from_be_bytes(read_array(&mut r)?) as usize;
    let header = RasterHeader {
        ncols,
        nrows,
        xll_corner: f64::from_bits(u64::from_be_bytes(read_array(&mut r)?)),
        yll_corner: f64::from_bits(u64::from_be_bytes(read_array(&mut r)?)),
        cell_size: f64::from_bits(u64::from_be_bytes(read_array(&mut r)?)),
    };
    let count = header
        .sample_count()
        .ok_or_else(|| Rd5Error::format("raster decode", "ncols * nrows overflows"))?;

    // Do not trust the header for the initial allocation
    let mut values = Vec::with_capacity(count.min(1 << 24));
    let mut previous = 0i64;
    for _ in 0..count {
        let word = read_varint(&mut r)?;
        let sample = match word & 3 {
            KIND_INTEGRAL => {
                previous = previous.wrapping_add(unzigzag(word >> 2));
                Sample::Value(previous as f64)
            }
            KIND_NO_DATA => Sample::NoData,
            KIND_RAW => {
                if word != KIND_RAW {
                    return Err(Rd5Error::format("raster decode", "corrupt raw sample tag"));
                }
                Sample::Value(f64::from_bits(u64::from_be_bytes(read_array(&mut r)?)))
            }
            kind => {
                return Err(Rd5Error::format(
                    "raster decode",
                    format!("unknown sample kind {}", kind),
                ))
            }
        };
        values.push(sample);
    }

    let mut extra = [0u8; 1];
    if r.read(&mut extra)? != 0 {
        return Err(Rd5Error::format("raster decode", "trailing bytes after samples"));
    }

    Raster::new(header, values)
}

fn as_integral(v: f64) -> Option<i64> {
    if v.abs() <= MAX_INTEGRAL {
        let i = v as i64;
        if (i as f64).to_bits() == v.to_bits() {
            return Some(i);
        }
    }
    None
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint<W: Write>(w: &mut W, mut v: u64) -> Result<()> {
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    w.write_all(&buf[..n])?;
    Ok(())
}

fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let [byte] = read_array::<R, 1>(r)?;
        if shift > 63 {
            return Err(Rd5Error::format("raster decode", "varint overflow"));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Rd5Error::format("raster decode", "unexpected end of stream")
        } else {
            Rd5Error::Io(e)
        }
    })?;
    Ok(buf)
}
