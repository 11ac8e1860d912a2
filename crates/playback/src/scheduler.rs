//! The timer tick: deliver one access unit to the decoder, then re-arm
//! the timer so the next one lands on time.
//!
//! A tick runs to completion and never blocks. Per-frame failures are
//! logged and converted into a short retry; playback is never aborted by
//! a transient error. If the tick leaves the timer disarmed, playback
//! has paused or reached the end of the track.

use tracing::{debug, trace, warn};

use rp_common::{AccessUnitInfo, FrameMetadata, Mp4Error, PlaybackError, PlayerResult};
use rp_h264::{nal, sei};
use rp_mp4::TrackSample;

use crate::buffer::QueueRejected;
use crate::record::{RecordDemuxer, PLAY_SPEED_MAX};

/// Re-arm delay after a transient failure (pool empty, read error).
const RETRY_DELAY_MS: u32 = 5;

enum TickOutcome {
    /// An access unit was processed (queued, or kept for the next tick).
    Frame { sample: TrackSample, silent: bool },
    /// No sample available: end of track.
    EndOfTrack,
    /// Transient failure; retry shortly without touching pacing state.
    Retry,
}

impl RecordDemuxer {
    /// One timer tick.
    pub(crate) fn tick(&mut self) {
        if self.decoder.is_none() || !self.state.running {
            self.state.last_frame_duration = 0;
            self.state.last_output_error = 0;
            return;
        }

        let mut now = self.clock.now_us();
        let outcome = self.deliver(&mut now);

        match outcome {
            TickOutcome::Retry => self.timer.set(&*self.clock, RETRY_DELAY_MS),
            TickOutcome::Frame { sample, silent } if self.state.running => {
                self.schedule_next(Some(&sample), silent, now);
            }
            TickOutcome::EndOfTrack if self.state.running => {
                self.schedule_next(None, false, now);
            }
            _ => {
                // frame stepping finished inside this tick
                self.state.last_frame_output_time = now;
                self.state.last_frame_duration = 0;
                self.state.last_output_error = 0;
            }
        }
    }

    /// Steps 2-11 of the tick: configure, acquire, seek, read, re-frame,
    /// annotate, submit.
    fn deliver(&mut self, now: &mut u64) -> TickOutcome {
        // Lazy decoder configuration on the first frame.
        if self.state.first_frame {
            match self.configure_decoder() {
                Ok(()) => self.state.first_frame = false,
                Err(e) => warn!(error = %e, "decoder configuration failed"),
            }
        }
        if self.decoder_source.is_none() {
            warn!("decoder is not configured");
            return TickOutcome::Retry;
        }

        // Buffer acquisition (non-blocking inside the tick).
        if self.state.current_buffer.is_none() {
            let Some(source) = self.decoder_source.as_ref() else {
                return TickOutcome::Retry;
            };
            match source.pool.acquire(false) {
                Ok(buf) => self.state.current_buffer = Some(buf),
                Err(PlaybackError::WouldBlock) => {
                    trace!("input pool exhausted");
                    return TickOutcome::Retry;
                }
                Err(e) => {
                    warn!(error = %e, "buffer acquisition failed");
                    return TickOutcome::Retry;
                }
            }
        }

        let Some(mp4) = self.mp4.as_mut() else {
            warn!("no recording attached");
            return TickOutcome::Retry;
        };

        // Pending seeks.
        if let Some(ts) = self.state.pending_seek_ts {
            match mp4.seek(ts, true) {
                Ok(()) => {
                    self.state.last_frame_duration = 0;
                    self.state.last_output_error = 0;
                }
                Err(e) => warn!(error = %e, target_us = ts, "seek failed"),
            }
        } else if self.state.pending_seek_to_prev_sample {
            match mp4.seek_to_prev_sample() {
                Ok(()) => {
                    self.state.last_frame_duration = 0;
                    self.state.last_output_error = 0;
                }
                Err(e) => warn!(error = %e, "seek to previous sample failed"),
            }
        }

        // Read the sample into the buffer.
        let Some(buffer) = self.state.current_buffer.as_mut() else {
            return TickOutcome::Retry;
        };
        let payload = match buffer.payload_mut() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "carry-over buffer is not writable");
                return TickOutcome::Retry;
            }
        };
        let sample = match mp4.next_sample(Some(payload), Some(&mut self.metadata_buf)) {
            Ok(s) => s,
            Err(Mp4Error::NoBuffer { size, capacity }) => {
                warn!(size, capacity, "sample exceeds buffer capacity, skipping");
                if let Err(e) = mp4.next_sample(None, None) {
                    warn!(error = %e, "sample skip failed");
                }
                return TickOutcome::Retry;
            }
            Err(Mp4Error::EndOfStream) => {
                debug!("end of track");
                return TickOutcome::EndOfTrack;
            }
            Err(e) => {
                warn!(error = %e, "sample read failed");
                return TickOutcome::Retry;
            }
        };
        if sample.size == 0 {
            return TickOutcome::EndOfTrack;
        }

        if let Err(e) = buffer.set_len(sample.size as usize) {
            warn!(error = %e, "buffer size update failed");
            return TickOutcome::Retry;
        }
        buffer.clear_userdata();

        // A sample is silent only while an exact seek is still priming
        // the decoder; the flag stays sticky until the first displayed
        // frame.
        let silent = sample.silent && self.state.pending_seek_exact;
        self.state.pending_seek_ts = None;
        self.state.pending_seek_to_prev_sample = false;
        self.state.pending_seek_exact = silent;

        // Re-frame the access unit for the decoder and locate its SEI.
        let Some(format) = self.bitstream_format else {
            return TickOutcome::Retry;
        };
        let sei_nalu = {
            let payload = match buffer.payload_mut() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "buffer not writable");
                    return TickOutcome::Retry;
                }
            };
            match nal::rewrite_access_unit(&mut payload[..sample.size as usize], format) {
                Ok(loc) => loc,
                Err(e) => {
                    warn!(error = %e, dts = sample.dts, "malformed access unit, dropped");
                    return TickOutcome::Retry;
                }
            }
        };

        // Copy application user data out of the SEI, skipping the
        // recorder's internal streaming-signalling messages.
        if let Some(loc) = sei_nalu {
            self.sei_scratch.clear();
            self.sei_scratch
                .extend_from_slice(&buffer.payload()[loc.offset..loc.offset + loc.len]);
            let parsed = sei::parse_user_data_sei(&self.sei_scratch, |ud| {
                if sei::is_streaming_signalling(&ud.uuid) {
                    return;
                }
                if ud.payload.is_empty() {
                    return;
                }
                if let Err(e) = buffer.set_userdata(ud.payload) {
                    warn!(error = %e, "user data copy failed");
                }
            });
            if let Err(e) = parsed {
                warn!(error = %e, dts = sample.dts, "SEI parsing failed");
            }
        }

        // Attach the access-unit descriptor.
        let metadata = FrameMetadata::decode(
            &self.metadata_buf[..sample.metadata_size as usize],
            self.metadata_mime.as_deref(),
        );
        *now = self.clock.now_us();
        buffer.set_au_info(AccessUnitInfo {
            is_complete: true,
            has_errors: false,
            is_ref: true,
            is_silent: silent,
            au_ntp_timestamp: sample.dts,
            au_ntp_timestamp_raw: sample.dts,
            au_ntp_timestamp_local: *now,
            demux_output_timestamp: *now,
            metadata,
        });
        self.state.current_time = sample.dts;

        // Submit. On refusal the buffer is carried over to the next tick.
        buffer.write_lock();
        if let Some(buf) = self.state.current_buffer.take() {
            let Some(source) = self.decoder_source.as_ref() else {
                self.state.current_buffer = Some(buf);
                return TickOutcome::Retry;
            };
            match source.queue.push(buf) {
                Ok(()) => {}
                Err(QueueRejected { mut buffer, reason }) => {
                    warn!(error = %reason, "queue refused buffer, keeping it");
                    buffer.unlock();
                    self.state.current_buffer = Some(buffer);
                }
            }
        }

        if self.state.frame_by_frame && !silent {
            self.state.running = false;
        }

        TickOutcome::Frame { sample, silent }
    }

    /// Fetch SPS/PPS, configure the attached decoder and grab its input
    /// source.
    fn configure_decoder(&mut self) -> PlayerResult<()> {
        let format = self
            .bitstream_format
            .ok_or(PlaybackError::UnsupportedBitstreamFormat)?;
        let mp4 = self.mp4.as_ref().ok_or(PlaybackError::NotConfigured)?;
        let (sps, pps) = mp4.avc_decoder_config()?;
        nal::write_prefixed_parameter_set(&mut self.sps_scratch, sps, format);
        nal::write_prefixed_parameter_set(&mut self.pps_scratch, pps, format);

        let decoder = self.decoder.as_mut().ok_or(PlaybackError::NotConfigured)?;
        decoder.configure(format, &self.sps_scratch, &self.pps_scratch)?;
        let source = decoder.input_source()?;
        self.decoder_source = Some(source);
        debug!("decoder configured");
        Ok(())
    }

    /// End-of-tick pacing: derive the next delivery instant from the
    /// sample spacing, the measured lateness, and the playback speed,
    /// then re-arm the timer.
    fn schedule_next(&mut self, sample: Option<&TrackSample>, silent: bool, now: u64) {
        let speed = self.state.speed;
        let sample_dts = sample.map(|s| s.dts).unwrap_or(0) as i64;
        let mut next_sample_dts = sample.map(|s| s.next_sample_dts).unwrap_or(0);

        // error > 0 means the previous frame went out late, < 0 early
        let error = if self.state.last_frame_output_time == 0
            || self.state.last_frame_duration == 0
            || speed == 0.0
            || speed >= PLAY_SPEED_MAX
            || silent
        {
            0
        } else {
            (now - self.state.last_frame_output_time) as i64 - self.state.last_frame_duration
                + self.state.last_output_error
        };

        if self.state.last_frame_output_time != 0 {
            let interval = (now - self.state.last_frame_output_time) as i64;
            self.state.avg_output_interval += (interval - self.state.avg_output_interval) >> 1;
        }

        let mut duration: i64;
        if speed >= PLAY_SPEED_MAX || next_sample_dts == 0 || silent {
            duration = 0;
        } else if speed < 0.0 {
            // Backward: step across sync samples, seeking as we go. If
            // the wait would be negative, fall back to earlier sync
            // samples until one leaves time to breathe.
            let prev_sync = sample.map(|s| s.prev_sync_sample_dts).unwrap_or(0);
            next_sample_dts = prev_sync;
            let mut pending_seek_ts = prev_sync;
            let mut next_sync_dts = prev_sync;
            duration = ((prev_sync as i64 - sample_dts) as f32 / speed) as i64;
            let mut new_duration = duration;
            while new_duration - error < 0 {
                match self
                    .mp4
                    .as_ref()
                    .and_then(|m| m.prev_sync_sample_before(next_sync_dts, true))
                {
                    Some(dts) if dts > 0 => {
                        pending_seek_ts = dts;
                        next_sync_dts = dts;
                        new_duration = ((dts as i64 - sample_dts) as f32 / speed) as i64;
                    }
                    _ => break,
                }
            }
            if pending_seek_ts > 0 {
                duration = new_duration;
                next_sample_dts = next_sync_dts;
                if let Some(mp4) = self.mp4.as_mut() {
                    if let Err(e) = mp4.seek(pending_seek_ts, true) {
                        warn!(error = %e, "backward seek failed");
                    }
                }
            }
        } else {
            // Forward: when late, consider skipping ahead to a sync
            // sample, but only if the landing is within twice the
            // average output interval (no wild jumps on a brief stall).
            let mut pending_seek_ts: u64 = 0;
            let mut next_sync_dts = next_sample_dts;
            duration = ((next_sample_dts as i64 - sample_dts) as f32 / speed) as i64;
            let mut new_duration = duration;
            while new_duration - error < 0 {
                match self
                    .mp4
                    .as_ref()
                    .and_then(|m| m.next_sync_sample_after(next_sync_dts, true))
                {
                    Some(dts) if dts > 0 => {
                        pending_seek_ts = dts;
                        next_sync_dts = dts;
                        new_duration = ((dts as i64 - sample_dts) as f32 / speed) as i64;
                    }
                    _ => break,
                }
            }
            if pending_seek_ts > 0 && new_duration - error < 2 * self.state.avg_output_interval {
                debug!(
                    "late on playback timings, seeking forward {:.2} ms",
                    (next_sync_dts as i64 - sample_dts) as f32 / 1000.0
                );
                duration = new_duration;
                next_sample_dts = next_sync_dts;
                if let Some(mp4) = self.mp4.as_mut() {
                    if let Err(e) = mp4.seek(pending_seek_ts, true) {
                        warn!(error = %e, "forward seek failed");
                    }
                }
            }
        }

        let mut wait_ms: u32 = 0;
        if next_sample_dts != 0 {
            let mut wait = duration - error;
            if wait < 0 {
                if duration > 0 {
                    debug!(
                        "late on playback timings ({:.1} ms, speed={:.2})",
                        -wait as f32 / 1000.0,
                        speed
                    );
                }
                wait = 0;
            }
            wait_ms = ((wait + 500) / 1000) as u32;
            if wait_ms == 0 {
                wait_ms = 1;
            }
        }

        self.state.last_frame_output_time = now;
        self.state.last_frame_duration = duration;
        self.state.last_output_error = error;

        if wait_ms > 0 {
            self.timer.set(&*self.clock, wait_ms);
        }
    }
}
