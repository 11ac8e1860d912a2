//! Session-level metadata: what the recorder wrote about itself and the
//! vehicle, exposed to the application and the renderer.
//!
//! The stores are mutex-guarded because the render thread reads them while
//! the demuxer (on the playback loop) writes them; all reads return owned
//! values, never references into the guarded state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A geodetic position (WGS84 degrees, metres above takeoff).
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl Location {
    /// Parse the recorder's `"lat,lon,alt"` string form.
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(',').map(str::trim);
        let latitude = parts.next()?.parse().ok()?;
        let longitude = parts.next()?.parse().ok()?;
        let altitude = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
        Some(Location {
            latitude,
            longitude,
            altitude,
        })
    }
}

/// Session metadata read from a recording's container-level key/value
/// entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub friendly_name: String,
    pub maker: String,
    pub model: String,
    pub model_id: String,
    pub serial_number: String,
    pub software_version: String,
    pub build_id: String,
    pub title: String,
    pub comment: String,
    pub copyright: String,
    pub run_date: String,
    pub run_uuid: String,
    pub media_date: String,
    pub takeoff_location: Option<Location>,
    pub home_location: Option<Location>,
    /// Picture field of view in degrees (horizontal, vertical).
    pub picture_hfov: Option<f32>,
    pub picture_vfov: Option<f32>,
}

impl SessionMeta {
    /// Fold one container key/value entry into the session metadata.
    ///
    /// Unknown keys are ignored; a recording may carry arbitrary extra
    /// entries from other tools.
    pub fn read_entry(&mut self, key: &str, value: &str) {
        match key {
            "com.rotorplay.friendly.name" | "com.apple.quicktime.title" => {
                self.friendly_name = value.to_string();
            }
            "com.rotorplay.maker" | "com.apple.quicktime.make" => {
                self.maker = value.to_string();
            }
            "com.rotorplay.model" | "com.apple.quicktime.model" => {
                self.model = value.to_string();
            }
            "com.rotorplay.model.id" => self.model_id = value.to_string(),
            "com.rotorplay.serial" => self.serial_number = value.to_string(),
            "com.rotorplay.software.version" | "com.apple.quicktime.software" => {
                self.software_version = value.to_string();
            }
            "com.rotorplay.build.id" => self.build_id = value.to_string(),
            "com.rotorplay.title" => self.title = value.to_string(),
            "com.rotorplay.comment" => self.comment = value.to_string(),
            "com.rotorplay.copyright" => self.copyright = value.to_string(),
            "com.rotorplay.run.date" => self.run_date = value.to_string(),
            "com.rotorplay.run.uuid" => self.run_uuid = value.to_string(),
            "com.rotorplay.media.date" | "com.apple.quicktime.creationdate" => {
                self.media_date = value.to_string();
            }
            "com.rotorplay.takeoff.location" => {
                self.takeoff_location = Location::parse(value);
            }
            "com.rotorplay.home.location" => {
                self.home_location = Location::parse(value);
            }
            "com.rotorplay.picture.fov" => {
                let mut parts = value.split(',').map(str::trim);
                self.picture_hfov = parts.next().and_then(|p| p.parse().ok());
                self.picture_vfov = parts.next().and_then(|p| p.parse().ok());
            }
            _ => {}
        }
    }
}

/// Metadata about the remote peer (the vehicle that recorded the media),
/// shared between the demuxer and the render thread.
#[derive(Debug, Default)]
pub struct PeerMetadata {
    inner: Mutex<PeerState>,
}

#[derive(Debug, Default)]
struct PeerState {
    meta: SessionMeta,
    recording_duration_us: u64,
}

impl PeerMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the session metadata wholesale (demuxer side, at open).
    pub fn set(&self, meta: &SessionMeta) {
        debug!(model = %meta.model, serial = %meta.serial_number, "peer metadata updated");
        self.inner.lock().meta = meta.clone();
    }

    /// Snapshot of the full session metadata.
    pub fn get(&self) -> SessionMeta {
        self.inner.lock().meta.clone()
    }

    pub fn friendly_name(&self) -> String {
        self.inner.lock().meta.friendly_name.clone()
    }

    pub fn model(&self) -> String {
        self.inner.lock().meta.model.clone()
    }

    pub fn serial_number(&self) -> String {
        self.inner.lock().meta.serial_number.clone()
    }

    pub fn software_version(&self) -> String {
        self.inner.lock().meta.software_version.clone()
    }

    pub fn takeoff_location(&self) -> Option<Location> {
        self.inner.lock().meta.takeoff_location
    }

    pub fn home_location(&self) -> Option<Location> {
        self.inner.lock().meta.home_location
    }

    pub fn set_recording_duration(&self, duration_us: u64) {
        self.inner.lock().recording_duration_us = duration_us;
    }

    pub fn recording_duration(&self) -> u64 {
        self.inner.lock().recording_duration_us
    }
}

/// Metadata about the local viewer (controller) side of the session.
#[derive(Debug, Default)]
pub struct SelfMetadata {
    inner: Mutex<SelfState>,
}

#[derive(Debug, Default)]
struct SelfState {
    friendly_name: String,
    serial_number: String,
    software_version: String,
    is_pilot: bool,
    location: Option<Location>,
}

impl SelfMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn friendly_name(&self) -> String {
        self.inner.lock().friendly_name.clone()
    }

    pub fn set_friendly_name(&self, name: &str) {
        self.inner.lock().friendly_name = name.to_string();
    }

    pub fn serial_number(&self) -> String {
        self.inner.lock().serial_number.clone()
    }

    pub fn set_serial_number(&self, serial: &str) {
        self.inner.lock().serial_number = serial.to_string();
    }

    pub fn software_version(&self) -> String {
        self.inner.lock().software_version.clone()
    }

    pub fn set_software_version(&self, version: &str) {
        self.inner.lock().software_version = version.to_string();
    }

    pub fn is_pilot(&self) -> bool {
        self.inner.lock().is_pilot
    }

    pub fn set_pilot(&self, is_pilot: bool) {
        self.inner.lock().is_pilot = is_pilot;
    }

    pub fn location(&self) -> Option<Location> {
        self.inner.lock().location
    }

    pub fn set_location(&self, loc: Location) {
        self.inner.lock().location = Some(loc);
    }
}
