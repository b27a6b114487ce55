//! Bit-level writer and reader over caller-provided buffers.
//!
//! Bits are packed MSB first. Variable-length integers use an exp-Golomb
//! style code: small values cost few bits, and there is no upper bound.

use crate::error::CodecError;

/// Result type for the bit coder.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Writes bits into a borrowed byte buffer without allocating.
pub struct BitWriter<'a> {
    buf: &'a mut [u8],
    bit_pos: usize,
}

impl<'a> BitWriter<'a> {
    /// Start writing at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// Write a single bit.
    pub fn write_bit(&mut self, bit: bool) -> CodecResult<()> {
        let byte = self.bit_pos >> 3;
        let Some(slot) = self.buf.get_mut(byte) else {
            return Err(CodecError::BufferTooSmall {
                capacity: self.buf.len(),
            });
        };
        let shift = 7 - (self.bit_pos & 7);
        if shift == 7 {
            // Buffers are reused, clear stale content
            *slot = 0;
        }
        if bit {
            *slot |= 1 << shift;
        }
        self.bit_pos += 1;
        Ok(())
    }

    /// Write the low `count` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, count: u32) -> CodecResult<()> {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1)?;
        }
        Ok(())
    }

    /// Write an unsigned integer with the variable-length code.
    pub fn write_var_bits(&mut self, mut value: u64) -> CodecResult<()> {
        let mut range = 0u64;
        while value > range {
            self.write_bit(false)?;
            value -= range + 1;
            range = 2 * range + 1;
        }
        self.write_bit(true)?;
        self.write_bits(value, bit_width(range))
    }

    /// Write a signed integer (zigzag) with the variable-length code.
    pub fn write_signed_var_bits(&mut self, value: i64) -> CodecResult<()> {
        self.write_var_bits(((value << 1) ^ (value >> 63)) as u64)
    }

    /// Number of bits written so far.
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Finish writing; returns the number of bytes used.
    pub fn finish(self) -> usize {
        self.bit_pos.div_ceil(8)
    }
}

/// Reads bits from a borrowed byte slice.
pub struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// Read a single bit.
    pub fn read_bit(&mut self) -> CodecResult<bool> {
        let byte = *self
            .buf
            .get(self.bit_pos >> 3)
            .ok_or(CodecError::UnexpectedEnd { bit: self.bit_pos })?;
        let bit = (byte >> (7 - (self.bit_pos & 7))) & 1 == 1;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Read `count` bits, most significant first.
    pub fn read_bits(&mut self, count: u32) -> CodecResult<u64> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Read an unsigned integer written by [`BitWriter::write_var_bits`].
    pub fn read_var_bits(&mut self) -> CodecResult<u64> {
        let mut range = 0u64;
        let mut value = 0u64;
        let mut prefix = 0;
        while !self.read_bit()? {
            prefix += 1;
            if prefix > 64 {
                return Err(CodecError::InvalidValue {
                    field: "var bits prefix",
                    value: prefix,
                });
            }
            value += range + 1;
            range = 2 * range + 1;
        }
        let tail = self.read_bits(bit_width(range))?;
        value.checked_add(tail).ok_or(CodecError::InvalidValue {
            field: "var bits",
            value: tail,
        })
    }

    /// Read a signed integer written by [`BitWriter::write_signed_var_bits`].
    pub fn read_signed_var_bits(&mut self) -> CodecResult<i64> {
        let v = self.read_var_bits()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    /// Number of bits read so far.
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Bits left before the end of the buffer.
    pub fn remaining_bits(&self) -> usize {
        (self.buf.len() * 8).saturating_sub(self.bit_pos)
    }

    /// Bytes touched so far, including a partially read last byte.
    pub fn bytes_consumed(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }
}

/// Bits needed for a range of the form `2^k - 1`.
fn bit_width(range: u64) -> u32 {
    64 - range.leading_zeros()
}
