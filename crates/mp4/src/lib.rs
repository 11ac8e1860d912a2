//! `rp-mp4` — custom ISO-BMFF (MP4) parser for AVC recordings.
//!
//! No FFmpeg dependency — fully custom parser. Parses the box hierarchy
//! once at open, pre-computes a flat sample index, and then serves the
//! playback engine's iteration primitives: next-sample, seek to a sync
//! sample, step back one sample, and sync-sample time queries.
//!
//! Only the first video track is consumed; an optional timed-metadata
//! track is read sample-aligned with the video track.

pub mod boxes;
pub mod sample;
pub mod track;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use sample::{SampleEntry, SampleTable};
pub use track::{MediaSource, Mp4Reader, TrackSample};
