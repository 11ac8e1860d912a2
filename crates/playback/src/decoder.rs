//! The decoder-side contract the engine feeds into.
//!
//! The engine never sees a concrete decoder: it negotiates a bitstream
//! format from the declared caps, hands over prefixed SPS/PPS once, and
//! then queues buffers into the decoder's input source.

use rp_common::PlaybackError;
use rp_h264::nal::{BitstreamFormat, BitstreamFormatCaps};

use crate::buffer::{BufferPool, FrameQueue};

/// A decoder's input side: the pool its buffers come from and the queue
/// submissions go into.
#[derive(Clone)]
pub struct DecoderSource {
    pub pool: BufferPool,
    pub queue: FrameQueue,
}

/// An H.264 decoder back-end, by interface only.
pub trait AvcDecoder: Send {
    /// Input framings this decoder accepts; at least one must be set.
    fn input_bitstream_format_caps(&self) -> BitstreamFormatCaps;

    /// Configure with SPS and PPS, each already carrying the 4-byte
    /// prefix matching `format`.
    fn configure(
        &mut self,
        format: BitstreamFormat,
        sps: &[u8],
        pps: &[u8],
    ) -> Result<(), PlaybackError>;

    /// The input source to feed; available once configured.
    fn input_source(&mut self) -> Result<DecoderSource, PlaybackError>;
}
