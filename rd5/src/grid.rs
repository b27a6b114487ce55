//! ASCII elevation grid parsing.
//!
//! Grids use the Arc/Info ASCII layout: six header lines followed by
//! whitespace-separated decimal samples in row-major order.
//!
//! ```text
//! ncols        6000
//! nrows        6000
//! xllcorner    5
//! yllcorner    45
//! cellsize     0.00083333333333333
//! NODATA_value -9999
//! 812 813 815 ...
//! ```
//!
//! Survey grids are large (36 million samples per 5°×5° region), so samples
//! are read with a dedicated fixed-point scanner instead of a general float
//! parser. The `NODATA_value` line is read but not enforced: any sample below
//! [`NO_DATA_THRESHOLD`](crate::raster::NO_DATA_THRESHOLD) becomes no data.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{Rd5Error, Result};
use crate::raster::{Raster, RasterHeader, Sample};

/// Fractional digits beyond this are ignored by the scanner.
const MAX_FRACTION_DIGITS: u32 = 18;

/// How a grid file is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridCompression {
    /// Plain `.asc` text.
    #[default]
    None,
    /// Gzip stream (`.asc.gz`).
    Gzip,
    /// ZIP archive holding one `.asc` member.
    Zip,
}

impl GridCompression {
    /// Detect the packaging from a file name.
    ///
    /// # Examples
    ///
    /// ```
    /// use rd5::grid::GridCompression;
    ///
    /// assert_eq!(GridCompression::from_path("srtm_38_03.zip"), GridCompression::Zip);
    /// assert_eq!(GridCompression::from_path("srtm_38_03.asc.gz"), GridCompression::Gzip);
    /// assert_eq!(GridCompression::from_path("srtm_38_03.asc"), GridCompression::None);
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let lower = path.as_ref().to_string_lossy().to_lowercase();
        if lower.ends_with(".gz") {
            GridCompression::Gzip
        } else if lower.ends_with(".zip") {
            GridCompression::Zip
        } else {
            GridCompression::None
        }
    }
}

/// Load a grid from a `.zip`, `.gz` or plain `.asc` file.
///
/// ZIP archives are scanned entry by entry until the first member whose name
/// ends in `.asc`.
///
/// # Errors
///
/// Returns an error if the file is missing, the archive holds no `.asc`
/// member, or the grid is malformed.
pub fn load_grid<P: AsRef<Path>>(path: P) -> Result<Raster> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Rd5Error::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Rd5Error::Io(e)
        }
    })?;

    match GridCompression::from_path(path) {
        GridCompression::None => parse_grid(BufReader::new(file)),
        GridCompression::Gzip => parse_grid(BufReader::new(GzDecoder::new(file))),
        GridCompression::Zip => {
            let context = path.display().to_string();
            let mut archive = ZipArchive::new(BufReader::new(file))
                .map_err(|e| Rd5Error::format(&context, format!("bad ZIP archive: {}", e)))?;

            for i in 0..archive.len() {
                let entry = archive
                    .by_index(i)
                    .map_err(|e| Rd5Error::format(&context, format!("bad ZIP entry: {}", e)))?;
                if entry.name().to_lowercase().ends_with(".asc") {
                    debug!(archive = %context, member = entry.name(), "Reading grid member");
                    return parse_grid(BufReader::with_capacity(1 << 16, entry));
                }
            }

            Err(Rd5Error::format(context, "no .asc member in archive"))
        }
    }
}

/// Parse an ASCII grid from a buffered reader.
///
/// # Errors
///
/// Returns a format error if:
/// - the stream ends before all six header lines
/// - a header value is missing or not numeric
/// - the body holds anything but digits, `-`, `.` and whitespace
/// - the last number is not followed by a separator
/// - the sample count differs from `ncols * nrows`
pub fn parse_grid<R: BufRead>(mut reader: R) -> Result<Raster> {
    let header = read_header(&mut reader)?;
    let count = header
        .sample_count()
        .ok_or_else(|| Rd5Error::format("grid header", "ncols * nrows overflows"))?;

    // Do not trust the header for the initial allocation
    let mut values = Vec::with_capacity(count.min(1 << 24));
    let mut scanner = FixedPointScanner::default();
    let mut offset = 0usize;

    loop {
        let consumed = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            for &byte in buf {
                if let Some(value) = scanner.feed(byte, offset)? {
                    if values.len() == count {
                        return Err(Rd5Error::format(
                            "grid body",
                            format!("more than {} samples", count),
                        ));
                    }
                    values.push(Sample::from_reading(value));
                }
                offset += 1;
            }
            buf.len()
        };
        reader.consume(consumed);
    }

    if scanner.in_token {
        return Err(Rd5Error::format(
            "grid body",
            "last number is not terminated by a separator",
        ));
    }
    if values.len() != count {
        return Err(Rd5Error::format(
            "grid body",
            format!("expected {} samples, found {}", count, values.len()),
        ));
    }

    debug!(
        ncols = header.ncols,
        nrows = header.nrows,
        "Parsed ASCII grid"
    );
    Raster::new(header, values)
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<RasterHeader> {
    let mut fields = [0.0f64; 5];
    let mut ints = [0usize; 2];
    let mut line = String::new();

    for line_nr in 1..=6 {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(Rd5Error::format(
                format!("grid header line {}", line_nr),
                "unexpected end of stream",
            ));
        }
        if line_nr == 6 {
            // NODATA_value: the threshold decides, not the declared value
            break;
        }

        let token = line.split_whitespace().nth(1).ok_or_else(|| {
            Rd5Error::format(format!("grid header line {}", line_nr), "missing value")
        })?;
        let bad = || {
            Rd5Error::format(
                format!("grid header line {}", line_nr),
                format!("invalid number '{}'", token),
            )
        };
        match line_nr {
            1 | 2 => ints[line_nr - 1] = token.parse().map_err(|_| bad())?,
            _ => fields[line_nr - 1] = token.parse().map_err(|_| bad())?,
        }
    }

    Ok(RasterHeader {
        ncols: ints[0],
        nrows: ints[1],
        xll_corner: fields[2],
        yll_corner: fields[3],
        cell_size: fields[4],
    })
}

/// Digit-by-digit decimal scanner.
///
/// The integer part accumulates directly; after a `.` the fractional digits
/// accumulate as an integer numerator over a power-of-ten denominator, so
/// `-12.75` is computed as `-(12 + 75/100)`.
#[derive(Debug, Default)]
struct FixedPointScanner {
    integer: f64,
    numerator: u64,
    denominator: f64,
    fraction_digits: u32,
    negative: bool,
    in_fraction: bool,
    has_digits: bool,
    in_token: bool,
}

impl FixedPointScanner {
    /// Feed one byte; returns a value when a separator completes a number.
    fn feed(&mut self, byte: u8, offset: usize) -> Result<Option<f64>> {
        match byte {
            b'0'..=b'9' => {
                let digit = u64::from(byte - b'0');
                if self.in_fraction {
                    if self.fraction_digits < MAX_FRACTION_DIGITS {
                        self.numerator = self.numerator * 10 + digit;
                        self.denominator *= 10.0;
                        self.fraction_digits += 1;
                    }
                } else {
                    self.integer = 10.0 * self.integer + digit as f64;
                }
                self.has_digits = true;
                self.in_token = true;
                Ok(None)
            }
            b'-' if !self.in_token => {
                self.negative = true;
                self.in_token = true;
                Ok(None)
            }
            b'.' if !self.in_fraction => {
                self.in_fraction = true;
                self.denominator = 1.0;
                self.in_token = true;
                Ok(None)
            }
            b' ' | b'\n' | b'\r' | b'\t' => {
                if !self.in_token {
                    return Ok(None);
                }
                if !self.has_digits {
                    return Err(unexpected(byte, offset, "number without digits"));
                }
                let mut number = self.integer;
                if self.fraction_digits > 0 {
                    number += self.numerator as f64 / self.denominator;
                }
                if self.negative {
                    number = -number;
                }
                *self = Self::default();
                Ok(Some(number))
            }
            _ => Err(unexpected(byte, offset, "unexpected character")),
        }
    }
}

fn unexpected(byte: u8, offset: usize, what: &str) -> Rd5Error {
    Rd5Error::format(
        "grid body",
        format!("{} {:?} at body offset {}", what, byte as char, offset),
    )
}
