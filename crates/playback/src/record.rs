//! The record demuxer facade: open a recording, attach a decoder, and
//! drive playback through the transport API.
//!
//! Every transport method only mutates scheduler flags and arms the
//! one-shot timer; the actual work happens inside the timer tick (see
//! `scheduler`). All methods other than construction fail with
//! [`PlaybackError::NotConfigured`] until `open` has succeeded.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use rp_common::types::friendly_time_from_us;
use rp_common::{
    ElementaryStreamType, PeerMetadata, PlaybackError, PlayerResult, SessionMeta, VideoDimensions,
};
use rp_h264::nal::BitstreamFormat;
use rp_h264::parse_sps;
use rp_mp4::{MediaSource, Mp4Reader};

use crate::buffer::BufferRef;
use crate::clock::{Clock, MonotonicClock};
use crate::decoder::{AvcDecoder, DecoderSource};
use crate::timer::OneShotTimer;

/// Speed at or above which pacing is disabled and the engine runs as
/// fast as the decoder accepts its input.
pub const PLAY_SPEED_MAX: f32 = 1000.0;

/// Scratch capacity for one sidecar metadata sample.
const METADATA_BUFFER_SIZE: usize = 1024;

/// Scheduler state, mutated only from the timer tick and the transport
/// methods (all `&mut self`, same owner).
#[derive(Debug)]
pub(crate) struct SchedulerState {
    pub(crate) running: bool,
    pub(crate) frame_by_frame: bool,
    pub(crate) speed: f32,
    pub(crate) first_frame: bool,
    pub(crate) pending_seek_ts: Option<u64>,
    pub(crate) pending_seek_exact: bool,
    pub(crate) pending_seek_to_prev_sample: bool,
    /// dts of the most recently submitted sample (µs).
    pub(crate) current_time: u64,
    pub(crate) last_frame_output_time: u64,
    pub(crate) last_frame_duration: i64,
    pub(crate) last_output_error: i64,
    /// EWMA of the tick interval, alpha = 1/2.
    pub(crate) avg_output_interval: i64,
    /// Carry-over when a queue submission was refused.
    pub(crate) current_buffer: Option<BufferRef>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            running: false,
            frame_by_frame: false,
            speed: 1.0,
            first_frame: true,
            pending_seek_ts: None,
            pending_seek_exact: false,
            pending_seek_to_prev_sample: false,
            current_time: 0,
            last_frame_output_time: 0,
            last_frame_duration: 0,
            last_output_error: 0,
            avg_output_interval: 0,
            current_buffer: None,
        }
    }
}

/// Playback engine over one recording.
pub struct RecordDemuxer {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timer: OneShotTimer,
    pub(crate) configured: bool,
    pub(crate) mp4: Option<Mp4Reader>,
    pub(crate) metadata_mime: Option<String>,
    pub(crate) duration_us: u64,
    video_track_count: usize,
    dimensions: VideoDimensions,
    hfov: f32,
    vfov: f32,
    peer_meta: Arc<PeerMetadata>,
    pub(crate) decoder: Option<Box<dyn AvcDecoder>>,
    pub(crate) decoder_source: Option<DecoderSource>,
    pub(crate) bitstream_format: Option<BitstreamFormat>,
    pub(crate) state: SchedulerState,
    pub(crate) metadata_buf: Vec<u8>,
    pub(crate) sps_scratch: Vec<u8>,
    pub(crate) pps_scratch: Vec<u8>,
    pub(crate) sei_scratch: Vec<u8>,
}

impl RecordDemuxer {
    /// Create an engine driven by the real monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create an engine driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timer: OneShotTimer::new(),
            configured: false,
            mp4: None,
            metadata_mime: None,
            duration_us: 0,
            video_track_count: 0,
            dimensions: VideoDimensions::default(),
            hfov: 0.0,
            vfov: 0.0,
            peer_meta: Arc::new(PeerMetadata::new()),
            decoder: None,
            decoder_source: None,
            bitstream_format: None,
            state: SchedulerState::default(),
            metadata_buf: vec![0u8; METADATA_BUFFER_SIZE],
            sps_scratch: Vec::new(),
            pps_scratch: Vec::new(),
            sei_scratch: Vec::new(),
        }
    }

    // ── Opening ──────────────────────────────────────────────────

    /// Open a recording file and discover its video track.
    pub fn open(&mut self, path: impl AsRef<Path>) -> PlayerResult<()> {
        if self.configured {
            return Err(PlaybackError::AlreadyConfigured.into());
        }
        let mp4 = Mp4Reader::open(path)?;
        self.finish_open(mp4)
    }

    /// Open a recording from an in-memory or custom source.
    pub fn open_source(&mut self, src: Box<dyn MediaSource>) -> PlayerResult<()> {
        if self.configured {
            return Err(PlaybackError::AlreadyConfigured.into());
        }
        let mp4 = Mp4Reader::from_source(src)?;
        self.finish_open(mp4)
    }

    fn finish_open(&mut self, mp4: Mp4Reader) -> PlayerResult<()> {
        // Nothing is retained on failure: `mp4` is dropped and the
        // engine stays unconfigured.
        self.duration_us = mp4.duration_us();
        let (hrs, min, sec) = friendly_time_from_us(self.duration_us);
        info!(tracks = mp4.track_count(), "track count");
        info!("duration: {hrs:02}:{min:02}:{sec:02}");
        info!(track = mp4.video_track_id(), "video track");

        let (sps, _pps) = mp4.avc_decoder_config()?;
        self.dimensions = parse_sps(sps)?;
        debug!(dimensions = %self.dimensions, "video dimensions");

        let mut meta = SessionMeta::default();
        for (key, value) in mp4.metadata_entries() {
            meta.read_entry(key, value);
        }
        self.hfov = meta.picture_hfov.unwrap_or(0.0);
        self.vfov = meta.picture_vfov.unwrap_or(0.0);
        self.peer_meta.set(&meta);
        self.peer_meta.set_recording_duration(self.duration_us);

        self.metadata_mime = mp4.metadata_mime().map(String::from);
        self.video_track_count = 1;
        self.mp4 = Some(mp4);
        self.configured = true;
        info!("demuxer is configured");
        Ok(())
    }

    /// Stop playback and disarm the timer.
    pub fn close(&mut self) -> PlayerResult<()> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured.into());
        }
        self.state.running = false;
        self.timer.clear();
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────

    /// Number of elementary streams exposed by this demuxer.
    pub fn es_count(&self) -> usize {
        if !self.configured {
            return 0;
        }
        self.video_track_count
    }

    pub fn es_type(&self, index: usize) -> Result<ElementaryStreamType, PlaybackError> {
        self.check_es_index(index)?;
        Ok(ElementaryStreamType::VideoAvc)
    }

    /// Video geometry of the stream, from its SPS.
    pub fn video_dimensions(&self, index: usize) -> Result<VideoDimensions, PlaybackError> {
        self.check_es_index(index)?;
        Ok(self.dimensions)
    }

    /// Picture field of view in degrees `(horizontal, vertical)`, 0 when
    /// the recording carries none.
    pub fn video_fov(&self, index: usize) -> Result<(f32, f32), PlaybackError> {
        self.check_es_index(index)?;
        Ok((self.hfov, self.vfov))
    }

    fn check_es_index(&self, index: usize) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        if index >= self.video_track_count {
            return Err(PlaybackError::InvalidArgument(format!(
                "stream index {index}"
            )));
        }
        Ok(())
    }

    /// Recording duration in microseconds.
    pub fn duration(&self) -> u64 {
        self.duration_us
    }

    /// dts of the most recently submitted sample (µs).
    pub fn current_time(&self) -> u64 {
        self.state.current_time
    }

    /// Session metadata store filled from the recording at open.
    pub fn peer_metadata(&self) -> Arc<PeerMetadata> {
        Arc::clone(&self.peer_meta)
    }

    // ── Decoder attachment ───────────────────────────────────────

    /// Attach the decoder; may be called exactly once per session.
    ///
    /// Negotiates the input bitstream format from the decoder's caps
    /// (byte-stream preferred) or fails with
    /// [`PlaybackError::UnsupportedBitstreamFormat`].
    pub fn set_decoder(&mut self, decoder: Box<dyn AvcDecoder>) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        if self.decoder.is_some() {
            return Err(PlaybackError::AlreadyConfigured);
        }
        let format = decoder
            .input_bitstream_format_caps()
            .preferred()
            .ok_or(PlaybackError::UnsupportedBitstreamFormat)?;
        debug!(?format, "decoder input format");
        self.bitstream_format = Some(format);
        self.decoder = Some(decoder);
        Ok(())
    }

    // ── Transport ────────────────────────────────────────────────

    /// Start playback at `speed`. `speed == 0` means pause; a negative
    /// speed plays backward across sync samples.
    pub fn play(&mut self, speed: f32) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        if speed == 0.0 {
            self.state.running = false;
            self.state.frame_by_frame = true;
        } else {
            self.state.running = true;
            self.state.frame_by_frame = false;
            self.state.pending_seek_to_prev_sample = false;
            self.state.speed = speed;
            self.timer.set(&*self.clock, 1);
        }
        debug!(speed, "play");
        Ok(())
    }

    /// Whether playback is paused (not running, or stepping frames).
    pub fn is_paused(&self) -> bool {
        if !self.configured {
            warn!("demuxer is not configured");
            return false;
        }
        !(self.state.running && !self.state.frame_by_frame)
    }

    /// Step back one frame.
    pub fn previous(&mut self) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        // Avoid seeking back again while a previous-frame seek is still
        // in progress.
        if !self.state.pending_seek_exact {
            self.state.pending_seek_to_prev_sample = true;
            self.state.pending_seek_exact = true;
            self.state.running = true;
            self.timer.set(&*self.clock, 1);
        }
        Ok(())
    }

    /// Step forward one frame (after `play(0)`), or nudge a stalled
    /// playback.
    pub fn next(&mut self) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        self.state.running = true;
        self.timer.set(&*self.clock, 1);
        Ok(())
    }

    /// Seek relative to the current position.
    pub fn seek(&mut self, delta_us: i64, exact: bool) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        let target = self
            .state
            .current_time
            .saturating_add_signed(delta_us)
            .min(self.duration_us);
        self.seek_to(target, exact)
    }

    /// Seek to an absolute position (clamped to the recording).
    pub fn seek_to(&mut self, ts_us: u64, exact: bool) -> Result<(), PlaybackError> {
        if !self.configured {
            return Err(PlaybackError::NotConfigured);
        }
        let target = ts_us.min(self.duration_us);
        self.state.pending_seek_ts = Some(target);
        self.state.pending_seek_exact = exact;
        self.state.pending_seek_to_prev_sample = false;
        self.state.running = true;
        self.timer.set(&*self.clock, 1);
        debug!(target_us = target, exact, "seek scheduled");
        Ok(())
    }

    // ── Loop driving ─────────────────────────────────────────────

    /// Run the timer tick if its deadline has passed. Returns whether a
    /// tick ran.
    pub fn advance(&mut self) -> bool {
        if self.timer.due(&*self.clock) {
            self.timer.clear();
            self.tick();
            true
        } else {
            false
        }
    }

    /// Time until the next tick is due, `None` when the timer is
    /// disarmed (playback stopped or stalled at end of stream).
    pub fn time_to_next_tick(&self) -> Option<Duration> {
        self.timer.remaining(&*self.clock)
    }

    /// Drive the engine until the timer disarms (pause, stop, or end of
    /// stream). Only meaningful with the real clock.
    pub fn run(&mut self) {
        while let Some(remaining) = self.time_to_next_tick() {
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
            self.advance();
        }
    }
}

impl Default for RecordDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecordDemuxer {
    fn drop(&mut self) {
        // The in-flight buffer (if any) returns to its pool here.
        self.state.current_buffer = None;
        self.timer.clear();
    }
}
