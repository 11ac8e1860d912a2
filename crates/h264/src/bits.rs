//! Bit-level reading for H.264 RBSP payloads: plain bits, Exp-Golomb
//! codes, and emulation-prevention removal.

use rp_common::H264Error;

/// Remove emulation-prevention bytes from a NAL payload.
///
/// Inside a NAL unit the encoder escapes `00 00 00/01/02/03` sequences as
/// `00 00 03 xx`; parsing happens on the unescaped RBSP form.
pub fn strip_emulation_prevention(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut zeros = 0u32;
    for &b in payload {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// MSB-first bit reader over an RBSP slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Absolute bit position from the start of `data`.
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn exhausted() -> H264Error {
        H264Error::MalformedBitstream("bitstream exhausted".to_string())
    }

    /// Read a single bit.
    pub fn read_bit(&mut self) -> Result<u32, H264Error> {
        let byte = self.data.get(self.pos / 8).ok_or_else(Self::exhausted)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    /// Read `n` bits (n <= 32) as an unsigned value.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, H264Error> {
        debug_assert!(n <= 32);
        let mut val = 0u32;
        for _ in 0..n {
            val = (val << 1) | self.read_bit()?;
        }
        Ok(val)
    }

    /// Read an unsigned Exp-Golomb code (`ue(v)`).
    pub fn read_ue(&mut self) -> Result<u32, H264Error> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(H264Error::MalformedBitstream(
                    "oversized Exp-Golomb code".to_string(),
                ));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// Read a signed Exp-Golomb code (`se(v)`).
    pub fn read_se(&mut self) -> Result<i32, H264Error> {
        let k = self.read_ue()?;
        // se(v) maps 0,1,2,3,4.. to 0,1,-1,2,-2..
        if k % 2 == 1 {
            Ok(((k >> 1) + 1) as i32)
        } else {
            Ok(-((k >> 1) as i32))
        }
    }
}
