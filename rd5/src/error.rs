//! Error types for the rd5 library.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading grids, region files or delta artifacts.
#[derive(Error, Debug)]
pub enum Rd5Error {
    /// IO error when reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or truncated textual/binary input.
    #[error("Format error in {context}: {reason}")]
    Format { context: String, reason: String },

    /// Region file is corrupt, or two region files are incompatible.
    #[error("Region store error ({path}): {reason}")]
    Store { path: PathBuf, reason: String },

    /// The required file was not found.
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// A tile payload could not be encoded or decoded.
    #[error("Tile codec error: {0}")]
    Codec(#[from] CodecError),

    /// Decoding an encoded delta did not reproduce the delta.
    #[error("Codec mismatch at tile ({lon_index}, {lat_index}): {detail}")]
    CodecMismatch {
        lon_index: u32,
        lat_index: u32,
        detail: String,
    },
}

impl Rd5Error {
    pub(crate) fn format(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Rd5Error::Format {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Rd5Error::Store {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the bit-level tile coder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The caller-provided output buffer cannot hold the encoded tile.
    #[error("Output buffer too small ({capacity} bytes)")]
    BufferTooSmall { capacity: usize },

    /// The input ended before the tile was fully decoded.
    #[error("Unexpected end of input at bit {bit}")]
    UnexpectedEnd { bit: usize },

    /// Unknown encoding mode byte.
    #[error("Unknown encoding mode {0}")]
    UnknownMode(u8),

    /// A field does not fit its fixed-width slot.
    #[error("Field {field} overflows fixed width: {value}")]
    FieldOverflow { field: &'static str, value: u64 },

    /// A decoded value is out of range for its field.
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },

    /// Bytes remain after the last record.
    #[error("{count} trailing bytes after tile payload")]
    TrailingBytes { count: usize },
}

/// Result type alias using [`Rd5Error`].
pub type Result<T> = std::result::Result<T, Rd5Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Rd5Error::format("header line 2", "missing value");
        assert!(err.to_string().contains("header line 2"));

        let err = Rd5Error::store("E5_N45.rd5", "bad magic");
        assert!(err.to_string().contains("E5_N45.rd5"));
        assert!(err.to_string().contains("bad magic"));

        let err = Rd5Error::CodecMismatch {
            lon_index: 12,
            lat_index: 7,
            detail: "node count 3 vs 2".into(),
        };
        assert!(err.to_string().contains("(12, 7)"));

        let err = Rd5Error::FileNotFound {
            path: PathBuf::from("W10_S5.rd5"),
        };
        assert!(err.to_string().contains("W10_S5.rd5"));
    }

    #[test]
    fn test_codec_error_converts() {
        let err: Rd5Error = CodecError::UnexpectedEnd { bit: 17 }.into();
        assert!(matches!(err, Rd5Error::Codec(CodecError::UnexpectedEnd { bit: 17 })));
    }
}
