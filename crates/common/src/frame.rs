//! Per-frame data attached to buffers travelling from demuxer to decoder:
//! the access-unit descriptor and the decoded sidecar telemetry record.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::session::Location;

/// MIME type of the timed-metadata track written by the recorder.
pub const TELEMETRY_MIME_TYPE: &str = "application/x-rotorplay-telemetry";

/// Magic tag opening every telemetry record ("RTM1").
const TELEMETRY_V1_MAGIC: u32 = 0x5254_4D31;

/// Byte length of a v1 telemetry record.
const TELEMETRY_V1_LEN: usize = 40;

/// Sentinel for "no GPS fix" in the recorded lat/lon fields.
const NO_FIX: i32 = i32::MIN;

/// Vehicle flying state as recorded in the telemetry track.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlyingState {
    #[default]
    Landed,
    TakingOff,
    Hovering,
    Flying,
    Landing,
    Emergency,
}

impl From<u8> for FlyingState {
    fn from(val: u8) -> Self {
        match val {
            1 => Self::TakingOff,
            2 => Self::Hovering,
            3 => Self::Flying,
            4 => Self::Landing,
            5 => Self::Emergency,
            _ => Self::Landed,
        }
    }
}

/// Telemetry decoded from one sample of the timed-metadata track.
///
/// Angles are radians, distances metres, speeds metres per second.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Vehicle attitude (yaw, pitch, roll).
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// Camera gimbal orientation.
    pub camera_pan: f32,
    pub camera_tilt: f32,
    /// GPS position, if the vehicle had a fix.
    pub location: Option<Location>,
    /// Number of GPS satellites used in the fix.
    pub sv_count: u8,
    pub battery_percentage: u8,
    pub flying_state: FlyingState,
    pub wifi_rssi_dbm: i8,
    /// Distance to the ground in metres.
    pub ground_distance: f64,
    /// NED speed vector.
    pub speed_north: f32,
    pub speed_east: f32,
    pub speed_down: f32,
}

impl FrameMetadata {
    /// Decode a telemetry record from the raw bytes of a metadata sample.
    ///
    /// `mime` is the declared MIME type of the metadata track; records are
    /// only decoded when it matches (or is absent, in which case the magic
    /// tag alone decides). Returns `None` on any mismatch rather than an
    /// error: a missing or foreign sidecar is not a playback failure.
    pub fn decode(data: &[u8], mime: Option<&str>) -> Option<Self> {
        if let Some(mime) = mime {
            if mime != TELEMETRY_MIME_TYPE {
                return None;
            }
        }
        if data.len() < TELEMETRY_V1_LEN {
            return None;
        }
        if BigEndian::read_u32(&data[0..4]) != TELEMETRY_V1_MAGIC {
            return None;
        }

        let angle = |off: usize| BigEndian::read_i16(&data[off..off + 2]) as f32 / 1e4;
        let lat_raw = BigEndian::read_i32(&data[14..18]);
        let lon_raw = BigEndian::read_i32(&data[18..22]);
        let alt_mm = BigEndian::read_i32(&data[22..26]);
        let location = if lat_raw == NO_FIX || lon_raw == NO_FIX {
            None
        } else {
            Some(Location {
                latitude: lat_raw as f64 / 1e7,
                longitude: lon_raw as f64 / 1e7,
                altitude: alt_mm as f64 / 1e3,
            })
        };

        Some(FrameMetadata {
            yaw: angle(4),
            pitch: angle(6),
            roll: angle(8),
            camera_pan: angle(10),
            camera_tilt: angle(12),
            location,
            sv_count: data[26],
            battery_percentage: data[27],
            flying_state: FlyingState::from(data[28]),
            wifi_rssi_dbm: data[29] as i8,
            ground_distance: BigEndian::read_u32(&data[30..34]) as f64 / 1e3,
            speed_north: BigEndian::read_i16(&data[34..36]) as f32 / 100.0,
            speed_east: BigEndian::read_i16(&data[36..38]) as f32 / 100.0,
            speed_down: BigEndian::read_i16(&data[38..40]) as f32 / 100.0,
        })
    }
}

/// Descriptor attached to every access unit queued for decoding.
///
/// Timestamps are microseconds; `au_ntp_timestamp*` carry the sample dts
/// while `au_ntp_timestamp_local` and `demux_output_timestamp` carry the
/// monotonic wall clock at queue time.
#[derive(Clone, Debug, Default)]
pub struct AccessUnitInfo {
    pub is_complete: bool,
    pub has_errors: bool,
    pub is_ref: bool,
    /// Decoder-priming sample emitted after an exact seek; not for display.
    pub is_silent: bool,
    pub au_ntp_timestamp: u64,
    pub au_ntp_timestamp_raw: u64,
    pub au_ntp_timestamp_local: u64,
    pub demux_output_timestamp: u64,
    pub metadata: Option<FrameMetadata>,
}

impl AccessUnitInfo {
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }
}
