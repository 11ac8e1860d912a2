//! End-to-end playback scenarios driven by a deterministic clock and a
//! recording built in memory: forward pacing, seeks (exact and not),
//! pause and frame stepping, reverse playback, unpaced max speed, and
//! pool backpressure.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rp_common::{PlaybackError, PlayerError};
use rp_mp4::test_support::{RecordingBuilder, TEST_PPS, TEST_SPS};
use rp_playback::{
    AvcDecoder, BitstreamFormat, BitstreamFormatCaps, BufferPool, Clock, DecoderSource,
    FrameQueue, RecordDemuxer, PLAY_SPEED_MAX,
};

// ── test doubles ─────────────────────────────────────────────────────

struct FakeClock {
    now_us: AtomicU64,
}

impl FakeClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now_us: AtomicU64::new(1_000_000),
        })
    }

    fn advance(&self, by: Duration) {
        self.now_us
            .fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct ConfigureCall {
    format: BitstreamFormat,
    sps: Vec<u8>,
    pps: Vec<u8>,
}

struct FakeDecoder {
    caps: BitstreamFormatCaps,
    source: DecoderSource,
    configured: Arc<Mutex<Option<ConfigureCall>>>,
}

impl AvcDecoder for FakeDecoder {
    fn input_bitstream_format_caps(&self) -> BitstreamFormatCaps {
        self.caps
    }

    fn configure(
        &mut self,
        format: BitstreamFormat,
        sps: &[u8],
        pps: &[u8],
    ) -> Result<(), PlaybackError> {
        *self.configured.lock() = Some(ConfigureCall {
            format,
            sps: sps.to_vec(),
            pps: pps.to_vec(),
        });
        Ok(())
    }

    fn input_source(&mut self) -> Result<DecoderSource, PlaybackError> {
        Ok(self.source.clone())
    }
}

struct Harness {
    demuxer: RecordDemuxer,
    clock: Arc<FakeClock>,
    queue: FrameQueue,
    pool: BufferPool,
    configured: Arc<Mutex<Option<ConfigureCall>>>,
}

fn harness(builder: &RecordingBuilder, caps: BitstreamFormatCaps, buffers: usize) -> Harness {
    let clock = FakeClock::new();
    let mut demuxer = RecordDemuxer::with_clock(clock.clone());
    demuxer
        .open_source(Box::new(std::io::Cursor::new(builder.finish())))
        .unwrap();

    let pool = BufferPool::new(buffers, 4096);
    let queue = FrameQueue::new(&pool);
    let configured = Arc::new(Mutex::new(None));
    demuxer
        .set_decoder(Box::new(FakeDecoder {
            caps,
            source: DecoderSource {
                pool: pool.clone(),
                queue: queue.clone(),
            },
            configured: configured.clone(),
        }))
        .unwrap();

    Harness {
        demuxer,
        clock,
        queue,
        pool,
        configured,
    }
}

impl Harness {
    /// Advance the clock to the timer deadline and run the tick.
    /// Returns the delay the previous tick had armed.
    fn drive_tick(&mut self) -> Duration {
        let remaining = self
            .demuxer
            .time_to_next_tick()
            .expect("timer should be armed");
        self.clock.advance(remaining);
        assert!(self.demuxer.advance(), "tick should run at its deadline");
        remaining
    }

    /// Pop every queued access unit as `(dts, is_silent)`.
    fn drain(&self) -> Vec<(u64, bool)> {
        std::iter::from_fn(|| self.queue.try_pop())
            .map(|buf| {
                let info = buf.au_info().expect("queued buffer carries AU info");
                (info.au_ntp_timestamp, info.is_silent)
            })
            .collect()
    }
}

/// ~30 fps recording: dts 0, 33_333, 66_666, 100_000, ... all sync.
fn recording_30fps(frames: usize) -> RecordingBuilder {
    let mut builder = RecordingBuilder::new(1_000_000);
    for i in 0..frames {
        let delta = if i % 3 == 2 { 33_334 } else { 33_333 };
        builder.add_frame(delta, true, vec![0x41, i as u8]);
    }
    builder
}

/// 10 fps recording with a sync sample every `sync_every` frames.
fn recording_100ms(frames: usize, sync_every: usize) -> RecordingBuilder {
    let mut builder = RecordingBuilder::new(1_000_000);
    for i in 0..frames {
        builder.add_frame(100_000, i % sync_every == 0, vec![0x41, i as u8]);
    }
    builder
}

// ── forward pacing ───────────────────────────────────────────────────

#[test]
fn five_ticks_queue_five_frames_at_thirty_fps() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(1.0).unwrap();

    // the kick-off tick fires 1 ms after play()
    assert_eq!(h.demuxer.time_to_next_tick(), Some(Duration::from_millis(1)));

    h.drive_tick();
    for _ in 0..4 {
        let armed = h.drive_tick();
        let ms = armed.as_millis();
        assert!((32..=34).contains(&ms), "wait was {ms} ms");
    }

    let queued = h.drain();
    assert_eq!(
        queued,
        vec![
            (0, false),
            (33_333, false),
            (66_666, false),
            (100_000, false),
            (133_333, false),
        ]
    );

    // the decoder was configured exactly once, on the first tick
    let call = h.configured.lock().clone().unwrap();
    assert_eq!(call.format, BitstreamFormat::ByteStream);
}

#[test]
fn queued_frames_carry_descriptors_and_timestamps() {
    let mut h = harness(&recording_30fps(3), BitstreamFormatCaps::BYTE_STREAM, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    let buf = h.queue.try_pop().unwrap();
    let info = buf.au_info().unwrap();
    assert!(info.is_complete);
    assert!(info.is_ref);
    assert!(!info.has_errors);
    assert!(!info.is_silent);
    assert_eq!(info.au_ntp_timestamp, 0);
    assert_eq!(info.au_ntp_timestamp_raw, 0);
    assert_eq!(info.demux_output_timestamp, h.clock.now_us());
    assert_eq!(info.au_ntp_timestamp_local, info.demux_output_timestamp);
    assert!(!info.has_metadata());

    // byte-stream target: the length prefix became a start code
    assert_eq!(&buf.payload()[..4], &[0x00, 0x00, 0x00, 0x01]);
    assert_eq!(buf.payload()[4], 0x41);

    assert_eq!(h.demuxer.current_time(), 0);
}

#[test]
fn avcc_decoder_keeps_length_prefixes() {
    let mut h = harness(&recording_30fps(3), BitstreamFormatCaps::AVCC, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    let buf = h.queue.try_pop().unwrap();
    assert_eq!(&buf.payload()[..4], &[0x00, 0x00, 0x00, 0x02]);

    let call = h.configured.lock().clone().unwrap();
    assert_eq!(call.format, BitstreamFormat::Avcc);
    // AVCC configure buffers carry big-endian length prefixes
    assert_eq!(&call.sps[..4], &(TEST_SPS.len() as u32).to_be_bytes());
    assert_eq!(&call.sps[4..], &TEST_SPS);
    assert_eq!(&call.pps[4..], &TEST_PPS);
}

#[test]
fn byte_stream_configure_buffers_use_start_codes() {
    let mut h = harness(&recording_30fps(3), BitstreamFormatCaps::BOTH, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    // byte-stream is preferred when both are supported
    let call = h.configured.lock().clone().unwrap();
    assert_eq!(call.format, BitstreamFormat::ByteStream);
    assert_eq!(&call.sps[..4], &[0x00, 0x00, 0x00, 0x01]);
    assert_eq!(&call.sps[4..], &TEST_SPS);
}

// ── seeking ──────────────────────────────────────────────────────────

#[test]
fn plain_seek_resumes_from_sync_sample() {
    let mut h = harness(&recording_100ms(100, 10), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();
    h.drive_tick();

    h.demuxer.seek_to(5_050_000, false).unwrap();
    assert_eq!(h.demuxer.time_to_next_tick(), Some(Duration::from_millis(1)));
    h.drive_tick();

    let queued = h.drain();
    let last = queued.last().copied().unwrap();
    assert_eq!(last, (5_000_000, false)); // sync at or before the target
}

#[test]
fn exact_seek_primes_with_silent_frames() {
    let mut h = harness(&recording_100ms(100, 10), BitstreamFormatCaps::BYTE_STREAM, 16);
    h.demuxer.seek_to(5_250_000, true).unwrap();

    // silent priming runs at 1 ms per tick until the target is reached
    let mut submitted = Vec::new();
    for _ in 0..4 {
        h.drive_tick();
        submitted.extend(h.drain());
    }

    assert_eq!(
        submitted,
        vec![
            (5_000_000, true),
            (5_100_000, true),
            (5_200_000, true),
            (5_300_000, false),
        ]
    );
}

#[test]
fn relative_seek_clamps_to_track_bounds() {
    let mut h = harness(&recording_100ms(20, 5), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    h.demuxer.seek(i64::MIN / 2, false).unwrap();
    h.drive_tick();
    assert_eq!(h.drain().last().copied().unwrap().0, 0);

    h.demuxer.seek(i64::MAX / 2, false).unwrap();
    h.drive_tick();
    // clamped to duration: lands on the last sync sample
    assert_eq!(h.drain().last().copied().unwrap().0, 1_500_000);
}

// ── pause and frame stepping ─────────────────────────────────────────

#[test]
fn play_zero_pauses_and_stops_submissions() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();
    assert!(!h.demuxer.is_paused());

    h.demuxer.play(0.0).unwrap();
    assert!(h.demuxer.is_paused());

    // the already-armed timer fires once more but does nothing
    h.drive_tick();
    assert_eq!(h.demuxer.time_to_next_tick(), None);
    assert_eq!(h.drain().len(), 1);
}

#[test]
fn next_steps_exactly_one_frame_while_paused() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(0.0).unwrap();
    assert!(h.demuxer.is_paused());
    assert_eq!(h.demuxer.time_to_next_tick(), None);

    h.demuxer.next().unwrap();
    h.drive_tick();
    assert_eq!(h.drain(), vec![(0, false)]);
    // frame-by-frame mode: the tick cleared `running`, timer disarmed
    assert_eq!(h.demuxer.time_to_next_tick(), None);
    assert!(h.demuxer.is_paused());

    h.demuxer.next().unwrap();
    h.drive_tick();
    assert_eq!(h.drain(), vec![(33_333, false)]);
}

#[test]
fn previous_steps_back_one_frame() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(0.0).unwrap();
    for _ in 0..3 {
        h.demuxer.next().unwrap();
        h.drive_tick();
    }
    // frames 0, 33_333, 66_666 shown so far
    assert_eq!(h.drain().len(), 3);

    h.demuxer.previous().unwrap();
    h.drive_tick();

    let queued = h.drain();
    assert_eq!(queued.last().copied().unwrap(), (33_333, false));
    assert!(h.demuxer.is_paused());
    assert_eq!(h.demuxer.time_to_next_tick(), None);
}

// ── reverse playback ─────────────────────────────────────────────────

#[test]
fn negative_speed_walks_sync_samples_backward() {
    // one sync sample per second, 1 s apart
    let mut builder = RecordingBuilder::new(1_000_000);
    for i in 0..10u8 {
        builder.add_frame(1_000_000, true, vec![0x41, i]);
    }
    let mut h = harness(&builder, BitstreamFormatCaps::BYTE_STREAM, 16);

    h.demuxer.seek_to(5_000_000, false).unwrap();
    h.demuxer.play(-1.0).unwrap();

    let mut submitted = Vec::new();
    for _ in 0..5 {
        let armed = h.drive_tick();
        submitted.extend(h.drain());
        // 1 s between reverse steps once pacing settles
        if submitted.len() > 1 {
            assert!((950..=1050).contains(&armed.as_millis()), "{armed:?}");
        }
    }

    let dts: Vec<u64> = submitted.iter().map(|&(d, _)| d).collect();
    assert_eq!(dts, vec![5_000_000, 4_000_000, 3_000_000, 2_000_000, 1_000_000]);
}

// ── unpaced max speed ────────────────────────────────────────────────

#[test]
fn speed_max_runs_at_one_millisecond_per_tick() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 16);
    h.demuxer.play(PLAY_SPEED_MAX).unwrap();

    h.drive_tick();
    for _ in 0..4 {
        let armed = h.drive_tick();
        assert_eq!(armed, Duration::from_millis(1));
    }
    assert_eq!(h.drain().len(), 5);
}

// ── backpressure and stalls ──────────────────────────────────────────

#[test]
fn exhausted_pool_retries_without_dropping_frames() {
    let mut h = harness(&recording_30fps(10), BitstreamFormatCaps::BYTE_STREAM, 2);
    h.demuxer.play(PLAY_SPEED_MAX).unwrap();
    h.drive_tick();
    h.drive_tick();
    assert_eq!(h.pool.available(), 0);

    // pool empty: the tick re-arms at the 5 ms retry delay
    h.drive_tick();
    assert_eq!(h.demuxer.time_to_next_tick(), Some(Duration::from_millis(5)));

    // releasing one buffer lets the next tick proceed with the next frame
    drop(h.queue.try_pop());
    h.drive_tick();

    let queued = h.drain();
    assert_eq!(queued.first().copied().unwrap().0, 33_333);
    assert_eq!(queued.last().copied().unwrap().0, 66_666);
}

#[test]
fn end_of_track_disarms_the_timer() {
    let mut h = harness(&recording_30fps(2), BitstreamFormatCaps::BYTE_STREAM, 8);
    h.demuxer.play(PLAY_SPEED_MAX).unwrap();
    h.drive_tick();
    h.drive_tick();
    // the last frame has no successor: the timer stays disarmed
    assert_eq!(h.demuxer.time_to_next_tick(), None);

    // nudging past the end finds no sample and stalls in place
    h.demuxer.next().unwrap();
    h.drive_tick();
    assert_eq!(h.demuxer.time_to_next_tick(), None);
    assert_eq!(h.drain().len(), 2);
}

// ── SEI user data ────────────────────────────────────────────────────

fn user_data_sei(uuid: [u8; 16], body: &[u8]) -> Vec<u8> {
    let mut nal = vec![0x06, 0x05];
    nal.push((16 + body.len()) as u8);
    nal.extend_from_slice(&uuid);
    nal.extend_from_slice(body);
    nal.push(0x80);
    nal
}

#[test]
fn sei_user_data_lands_in_the_buffer_side_region() {
    let mut builder = RecordingBuilder::new(1_000_000);
    let sei = user_data_sei([0x11; 16], b"flight-notes");
    builder.add_frame_nals(33_333, true, &[&sei, &[0x65, 0x01, 0x02]]);

    let mut h = harness(&builder, BitstreamFormatCaps::BYTE_STREAM, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    let buf = h.queue.try_pop().unwrap();
    assert_eq!(buf.userdata(), b"flight-notes");
}

#[test]
fn streaming_signalling_sei_is_filtered_out() {
    let mut builder = RecordingBuilder::new(1_000_000);
    let sei = user_data_sei(rp_h264::sei::STREAMING_V1_UUID, b"internal");
    builder.add_frame_nals(33_333, true, &[&sei, &[0x65, 0x01, 0x02]]);

    let mut h = harness(&builder, BitstreamFormatCaps::BYTE_STREAM, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();

    let buf = h.queue.try_pop().unwrap();
    assert!(buf.userdata().is_empty());
}

// ── sidecar telemetry ────────────────────────────────────────────────

fn telemetry_record(battery: u8) -> Vec<u8> {
    let mut rec = vec![0u8; 40];
    rec[0..4].copy_from_slice(&0x5254_4D31u32.to_be_bytes());
    rec[14..18].copy_from_slice(&i32::MIN.to_be_bytes()); // no GPS fix
    rec[18..22].copy_from_slice(&i32::MIN.to_be_bytes());
    rec[27] = battery;
    rec[28] = 3; // flying
    rec
}

#[test]
fn frame_metadata_is_decoded_from_the_sidecar_track() {
    let mut builder = RecordingBuilder::new(1_000_000);
    builder.add_frame(33_333, true, vec![0x65, 0x01]);
    builder.add_frame(33_333, false, vec![0x41, 0x02]);
    builder.metadata_track(
        "application/x-rotorplay-telemetry",
        vec![telemetry_record(87), telemetry_record(86)],
    );

    let mut h = harness(&builder, BitstreamFormatCaps::BYTE_STREAM, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();
    h.drive_tick();

    let first = h.queue.try_pop().unwrap();
    let info = first.au_info().unwrap();
    assert!(info.has_metadata());
    let meta = info.metadata.as_ref().unwrap();
    assert_eq!(meta.battery_percentage, 87);
    assert!(meta.location.is_none());

    let second = h.queue.try_pop().unwrap();
    assert_eq!(
        second.au_info().unwrap().metadata.as_ref().unwrap().battery_percentage,
        86
    );
}

// ── open, introspection, guards ──────────────────────────────────────

#[test]
fn open_surfaces_dimensions_session_metadata_and_fov() {
    let mut builder = recording_30fps(3);
    builder.container_entry("com.rotorplay.friendly.name", "Anafi");
    builder.container_entry("com.rotorplay.model", "anafi");
    builder.container_entry("com.rotorplay.picture.fov", "84.0,53.0");

    let clock = FakeClock::new();
    let mut demuxer = RecordDemuxer::with_clock(clock);
    demuxer
        .open_source(Box::new(std::io::Cursor::new(builder.finish())))
        .unwrap();

    assert_eq!(demuxer.es_count(), 1);
    assert_eq!(
        demuxer.es_type(0).unwrap(),
        rp_common::ElementaryStreamType::VideoAvc
    );
    let dims = demuxer.video_dimensions(0).unwrap();
    assert_eq!((dims.width, dims.height), (1920, 1088));
    assert_eq!(demuxer.video_fov(0).unwrap(), (84.0, 53.0));
    assert!(matches!(
        demuxer.es_type(1),
        Err(PlaybackError::InvalidArgument(_))
    ));

    let peer = demuxer.peer_metadata();
    assert_eq!(peer.friendly_name(), "Anafi");
    assert_eq!(peer.model(), "anafi");
    assert!(peer.recording_duration() > 0);
}

#[test]
fn transport_requires_open() {
    let mut demuxer = RecordDemuxer::with_clock(FakeClock::new());
    assert!(matches!(
        demuxer.play(1.0),
        Err(PlaybackError::NotConfigured)
    ));
    assert!(matches!(
        demuxer.seek_to(0, false),
        Err(PlaybackError::NotConfigured)
    ));
    assert!(matches!(demuxer.next(), Err(PlaybackError::NotConfigured)));
    assert!(matches!(
        demuxer.previous(),
        Err(PlaybackError::NotConfigured)
    ));
    assert!(matches!(
        demuxer.close(),
        Err(PlayerError::Playback(PlaybackError::NotConfigured))
    ));
}

#[test]
fn open_twice_is_rejected() {
    let builder = recording_30fps(2);
    let mut demuxer = RecordDemuxer::with_clock(FakeClock::new());
    demuxer
        .open_source(Box::new(std::io::Cursor::new(builder.finish())))
        .unwrap();
    let again = demuxer.open_source(Box::new(std::io::Cursor::new(builder.finish())));
    assert!(matches!(
        again,
        Err(PlayerError::Playback(PlaybackError::AlreadyConfigured))
    ));
}

#[test]
fn decoder_can_only_be_attached_once() {
    let mut h = harness(&recording_30fps(2), BitstreamFormatCaps::BYTE_STREAM, 2);
    let pool = BufferPool::new(1, 64);
    let second = FakeDecoder {
        caps: BitstreamFormatCaps::BYTE_STREAM,
        source: DecoderSource {
            queue: FrameQueue::new(&pool),
            pool,
        },
        configured: Arc::new(Mutex::new(None)),
    };
    assert!(matches!(
        h.demuxer.set_decoder(Box::new(second)),
        Err(PlaybackError::AlreadyConfigured)
    ));
}

#[test]
fn decoder_without_formats_is_unsupported() {
    let builder = recording_30fps(2);
    let mut demuxer = RecordDemuxer::with_clock(FakeClock::new());
    demuxer
        .open_source(Box::new(std::io::Cursor::new(builder.finish())))
        .unwrap();

    let pool = BufferPool::new(1, 64);
    let decoder = FakeDecoder {
        caps: BitstreamFormatCaps::default(),
        source: DecoderSource {
            queue: FrameQueue::new(&pool),
            pool,
        },
        configured: Arc::new(Mutex::new(None)),
    };
    assert!(matches!(
        demuxer.set_decoder(Box::new(decoder)),
        Err(PlaybackError::UnsupportedBitstreamFormat)
    ));
}

#[test]
fn close_stops_the_timer() {
    let mut h = harness(&recording_30fps(5), BitstreamFormatCaps::BYTE_STREAM, 4);
    h.demuxer.play(1.0).unwrap();
    h.drive_tick();
    assert!(h.demuxer.time_to_next_tick().is_some());

    h.demuxer.close().unwrap();
    assert_eq!(h.demuxer.time_to_next_tick(), None);
    assert!(h.demuxer.is_paused());
}
