//! NAL unit framing: in-place AVCC to Annex-B rewriting of access units,
//! SEI location, and parameter-set prefixing for decoder configuration.

use byteorder::{BigEndian, ByteOrder};
use rp_common::H264Error;

/// Annex-B start code (4 bytes).
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type for H.264 (low 5 bits of the header byte).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalUnitType {
    Slice,
    SliceA,
    SliceB,
    SliceC,
    Idr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndSeq,
    EndStream,
    FillerData,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(val: u8) -> Self {
        match val & 0x1F {
            1 => Self::Slice,
            2 => Self::SliceA,
            3 => Self::SliceB,
            4 => Self::SliceC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndSeq,
            11 => Self::EndStream,
            12 => Self::FillerData,
            other => Self::Other(other),
        }
    }
}

/// NAL framing a decoder accepts on its input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitstreamFormat {
    /// Annex-B: NAL units separated by `00 00 00 01` start codes.
    ByteStream,
    /// AVCC: each NAL unit prefixed with its 4-byte big-endian length.
    Avcc,
}

/// The set of input framings a decoder declares.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitstreamFormatCaps {
    pub byte_stream: bool,
    pub avcc: bool,
}

impl BitstreamFormatCaps {
    pub const BYTE_STREAM: Self = Self {
        byte_stream: true,
        avcc: false,
    };
    pub const AVCC: Self = Self {
        byte_stream: false,
        avcc: true,
    };
    pub const BOTH: Self = Self {
        byte_stream: true,
        avcc: true,
    };

    pub fn supports(&self, format: BitstreamFormat) -> bool {
        match format {
            BitstreamFormat::ByteStream => self.byte_stream,
            BitstreamFormat::Avcc => self.avcc,
        }
    }

    /// Pick the format the engine will feed, byte-stream first.
    pub fn preferred(&self) -> Option<BitstreamFormat> {
        if self.byte_stream {
            Some(BitstreamFormat::ByteStream)
        } else if self.avcc {
            Some(BitstreamFormat::Avcc)
        } else {
            None
        }
    }
}

/// Position of a SEI NAL unit inside an access unit buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SeiNalu {
    /// Byte offset of the NAL header byte (after the prefix).
    pub offset: usize,
    /// NAL unit length in bytes, header included.
    pub len: usize,
}

/// Walk one access unit's 4-byte-length-prefixed NAL units, rewriting each
/// prefix to a start code when the decoder wants byte-stream framing.
///
/// Operates in place; AVCC targets leave the buffer untouched. Returns the
/// location of the last SEI NAL unit in the access unit, if any.
pub fn rewrite_access_unit(
    au: &mut [u8],
    target: BitstreamFormat,
) -> Result<Option<SeiNalu>, H264Error> {
    let mut offset = 0usize;
    let mut sei = None;

    while offset < au.len() {
        if offset + 4 > au.len() {
            return Err(H264Error::MalformedBitstream(format!(
                "truncated NAL length prefix at offset {offset}"
            )));
        }
        let len = BigEndian::read_u32(&au[offset..offset + 4]) as usize;
        let payload = offset + 4;
        if len == 0 {
            return Err(H264Error::MalformedBitstream(format!(
                "zero-length NAL unit at offset {offset}"
            )));
        }
        if len > au.len() - payload {
            return Err(H264Error::MalformedBitstream(format!(
                "NAL length {len} overruns access unit at offset {offset}"
            )));
        }

        if target == BitstreamFormat::ByteStream {
            au[offset..payload].copy_from_slice(&START_CODE);
        }
        if NalUnitType::from(au[payload]) == NalUnitType::Sei {
            sei = Some(SeiNalu {
                offset: payload,
                len,
            });
        }

        offset = payload + len;
    }

    Ok(sei)
}

/// Append a parameter set with the 4-byte prefix the decoder's framing
/// expects: a start code for byte-stream, the big-endian length for AVCC.
///
/// Used when handing SPS/PPS to `configure`; the destination is a reusable
/// scratch buffer that is cleared first.
pub fn write_prefixed_parameter_set(dst: &mut Vec<u8>, ps: &[u8], target: BitstreamFormat) {
    dst.clear();
    dst.reserve(ps.len() + 4);
    match target {
        BitstreamFormat::ByteStream => dst.extend_from_slice(&START_CODE),
        BitstreamFormat::Avcc => dst.extend_from_slice(&(ps.len() as u32).to_be_bytes()),
    }
    dst.extend_from_slice(ps);
}
