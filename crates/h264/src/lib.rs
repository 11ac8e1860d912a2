//! `rp-h264` — just enough H.264 to feed a hardware decoder.
//!
//! No full bitstream decoder here: the playback engine needs three things
//! from the H.264 layer and this crate provides exactly those.
//!
//! - Rewrite an access unit's NAL framing in place (AVCC length prefixes
//!   to Annex-B start codes) and locate its SEI NAL ([`nal`]).
//! - Extract picture geometry (size, crop, aspect ratio) from a sequence
//!   parameter set ([`sps`]).
//! - Iterate SEI payloads and surface user-data-unregistered blobs
//!   ([`sei`]).

pub mod bits;
pub mod nal;
pub mod sei;
pub mod sps;

pub use nal::{BitstreamFormat, BitstreamFormatCaps, NalUnitType, SeiNalu, START_CODE};
pub use sps::parse_sps;
