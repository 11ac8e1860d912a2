//! `rp-common` — shared foundation for the rotorplay playback engine.
//!
//! Holds the types that cross crate boundaries: timestamps and video
//! geometry, the central error enums, per-frame telemetry metadata, and
//! the mutex-guarded session metadata stores.

pub mod error;
pub mod frame;
pub mod session;
pub mod types;

pub use error::{H264Error, Mp4Error, PlaybackError, PlayerError, PlayerResult};
pub use frame::{AccessUnitInfo, FrameMetadata, TELEMETRY_MIME_TYPE};
pub use session::{Location, PeerMetadata, SelfMetadata, SessionMeta};
pub use types::{ElementaryStreamType, VideoDimensions};
