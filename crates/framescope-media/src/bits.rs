//! Bit-granular cursor over a byte buffer.
//!
//! Used by the H.264 parameter-set parser, slice-header classification and
//! transport-stream packet field extraction. Reads are big-endian, MSB first.

use crate::{Error, Result};

/// Bit cursor with a 32-bit lookahead word.
///
/// The word is refilled from the backing buffer on demand. A read that spans
/// a refill boundary takes the high part from the current word and recurses
/// for the remainder. Reading past the end of the buffer fails and leaves the
/// cursor in an unspecified position.
#[derive(Debug, Clone)]
pub struct BitCursor<'a> {
    data: &'a [u8],
    /// Next byte of `data` to load into `word`.
    next_byte: usize,
    /// Unread bits, left-aligned.
    word: u32,
    /// Number of valid bits left in `word`.
    word_bits: u32,
}

impl<'a> BitCursor<'a> {
    /// Create a cursor positioned at the first bit of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next_byte: 0,
            word: 0,
            word_bits: 0,
        }
    }

    /// Number of bits not yet read.
    pub fn bits_available(&self) -> usize {
        (self.data.len() - self.next_byte) * 8 + self.word_bits as usize
    }

    /// Offset of the byte containing the next unread bit.
    pub fn byte_offset(&self) -> usize {
        (self.next_byte * 8 - self.word_bits as usize) / 8
    }

    /// Whether the cursor sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.word_bits % 8 == 0
    }

    fn load_word(&mut self) -> Result<()> {
        let remaining = self.data.len() - self.next_byte;
        if remaining == 0 {
            return Err(Error::BitstreamExhausted {
                need: 1,
                have: self.bits_available(),
            });
        }

        let take = remaining.min(4);
        let mut bytes = [0u8; 4];
        bytes[..take].copy_from_slice(&self.data[self.next_byte..self.next_byte + take]);
        self.word = u32::from_be_bytes(bytes);
        self.word_bits = take as u32 * 8;
        self.next_byte += take;
        Ok(())
    }

    /// Drop `count` bits from the front of the current word.
    fn consume_word_bits(&mut self, count: u32) {
        debug_assert!(count <= self.word_bits);
        self.word = if count >= 32 { 0 } else { self.word << count };
        self.word_bits -= count;
    }

    /// Read `count` bits (at most 32) as an unsigned value.
    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        if count > 32 {
            return Err(Error::invalid_bitstream(format!(
                "cannot read {count} bits at once"
            )));
        }
        if count == 0 {
            return Ok(0);
        }
        if count as usize > self.bits_available() {
            return Err(Error::BitstreamExhausted {
                need: count as usize,
                have: self.bits_available(),
            });
        }

        let take = count.min(self.word_bits);
        let high = if take == 0 {
            0
        } else {
            self.word >> (32 - take)
        };
        self.consume_word_bits(take);

        if take == count {
            return Ok(high);
        }

        let rest = count - take;
        self.load_word()?;
        let low = self.read_bits(rest)?;
        Ok((((high as u64) << rest) | low as u64) as u32)
    }

    /// Read a single bit as a flag.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Read a whole byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Skip `count` bits.
    pub fn skip_bits(&mut self, count: usize) -> Result<()> {
        if count > self.bits_available() {
            return Err(Error::BitstreamExhausted {
                need: count,
                have: self.bits_available(),
            });
        }

        let mut left = count;
        while left > 0 {
            if self.word_bits == 0 {
                self.load_word()?;
            }
            let step = left.min(self.word_bits as usize) as u32;
            self.consume_word_bits(step);
            left -= step as usize;
        }
        Ok(())
    }

    /// Skip `count` whole bytes.
    pub fn skip_bytes(&mut self, count: usize) -> Result<()> {
        self.skip_bits(count * 8)
    }

    /// Count and consume leading zero bits, stopping before the first one bit.
    fn skip_leading_zeros(&mut self) -> Result<u32> {
        let mut zeros = 0u32;
        loop {
            if self.word_bits == 0 {
                self.load_word()?;
            }
            // Bits below `word_bits` are zero padding, so clamp.
            let run = self.word.leading_zeros().min(self.word_bits);
            if run < self.word_bits {
                self.consume_word_bits(run);
                return Ok(zeros + run);
            }
            zeros += run;
            self.consume_word_bits(run);
            if zeros > 31 {
                return Err(Error::invalid_bitstream(
                    "Exp-Golomb prefix longer than 31 bits",
                ));
            }
        }
    }

    /// Read an unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_ue(&mut self) -> Result<u32> {
        let zeros = self.skip_leading_zeros()?;
        if zeros > 31 {
            return Err(Error::invalid_bitstream(
                "Exp-Golomb prefix longer than 31 bits",
            ));
        }
        let code = self.read_bits(zeros + 1)?;
        Ok(code - 1)
    }

    /// Read a signed Exp-Golomb code, `se(v)`.
    ///
    /// Code `k` maps to `(-1)^(k+1) * ceil(k / 2)`.
    pub fn read_se(&mut self) -> Result<i32> {
        let code = self.read_ue()? as i64;
        let magnitude = (code + 1) / 2;
        let value = if code & 1 == 1 { magnitude } else { -magnitude };
        Ok(value as i32)
    }

    /// Skip an unsigned Exp-Golomb code.
    pub fn skip_ue(&mut self) -> Result<()> {
        self.read_ue().map(|_| ())
    }

    /// Skip a signed Exp-Golomb code.
    pub fn skip_se(&mut self) -> Result<()> {
        self.read_se().map(|_| ())
    }
}
