//! The demuxer-facing reader: opens a recording, indexes the first video
//! track (and its timed-metadata track, if any), and serves the playback
//! engine's iteration and seek primitives.

use rp_common::Mp4Error;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::boxes::{self, MovieBox};
use crate::sample::SampleTable;

/// Anything a recording can be read from.
pub trait MediaSource: Read + Seek + Send {}
impl<T: Read + Seek + Send> MediaSource for T {}

/// One access unit as returned by [`Mp4Reader::next_sample`].
///
/// Timestamps are microseconds. `next_sample_dts` and
/// `prev_sync_sample_dts` are `0` when there is no such sample; the first
/// sample of a track always has dts 0, so the sentinel is unambiguous.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrackSample {
    /// Decode timestamp of this sample.
    pub dts: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// Decode timestamp of the sample that follows in track order.
    pub next_sample_dts: u64,
    /// Decode timestamp of the nearest sync sample strictly before this one.
    pub prev_sync_sample_dts: u64,
    /// Pre-seek-target sample, present only to prime the decoder.
    pub silent: bool,
    /// Bytes written to the metadata buffer (0 if none).
    pub metadata_size: u32,
}

/// Reader over one recording: first video track plus optional sidecar
/// metadata track, with a single forward cursor.
pub struct Mp4Reader {
    src: Box<dyn MediaSource>,
    movie: MovieBox,
    video: SampleTable,
    meta: Option<SampleTable>,
    /// Index of the next video sample to deliver.
    cursor: usize,
    /// Index of the last delivered sample.
    last_delivered: Option<usize>,
    /// Samples with dts below this are flagged silent (seek priming).
    silent_until_us: Option<u64>,
}

impl Mp4Reader {
    /// Open a recording from a file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Mp4Error> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening recording");
        let file = File::open(path)?;
        Self::from_source(Box::new(BufReader::new(file)))
    }

    /// Open a recording from any readable, seekable source.
    pub fn from_source(mut src: Box<dyn MediaSource>) -> Result<Self, Mp4Error> {
        let movie = boxes::parse_movie(&mut src)?;

        let track = movie.videos.first().ok_or(Mp4Error::NoVideoTrack)?;
        let video = SampleTable::build(track.timescale, track.duration, &track.tables)?;

        let meta = match movie.metadata_tracks.first() {
            Some(m) => {
                debug!(track = m.id, mime = %m.mime, "timed-metadata track");
                Some(SampleTable::build(m.timescale, 0, &m.tables)?)
            }
            None => None,
        };

        info!(
            track = track.id,
            samples = video.len(),
            duration_us = movie.duration_us(),
            "video track indexed"
        );

        Ok(Mp4Reader {
            src,
            movie,
            video,
            meta,
            cursor: 0,
            last_delivered: None,
            silent_until_us: None,
        })
    }

    /// Total number of tracks the player recognises in this file.
    pub fn track_count(&self) -> usize {
        self.movie.videos.len() + self.movie.metadata_tracks.len()
    }

    /// Identifier of the consumed video track.
    pub fn video_track_id(&self) -> u32 {
        self.movie.videos[0].id
    }

    /// Movie duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        self.movie.duration_us()
    }

    /// Declared MIME type of the timed-metadata track.
    pub fn metadata_mime(&self) -> Option<&str> {
        self.movie
            .metadata_tracks
            .first()
            .map(|m| m.mime.as_str())
            .filter(|m| !m.is_empty())
    }

    /// Container-level key/value metadata entries.
    pub fn metadata_entries(&self) -> &[(String, String)] {
        &self.movie.entries
    }

    /// First SPS and PPS of the track's AVC decoder configuration.
    pub fn avc_decoder_config(&self) -> Result<(&[u8], &[u8]), Mp4Error> {
        let avcc = &self.movie.videos[0].avcc;
        let sps = avcc.sps.first().filter(|s| !s.is_empty());
        let pps = avcc.pps.first().filter(|p| !p.is_empty());
        match (sps, pps) {
            (Some(sps), Some(pps)) => Ok((sps.as_slice(), pps.as_slice())),
            _ => Err(Mp4Error::InvalidStructure {
                offset: 0,
                reason: "missing SPS or PPS in avcC".to_string(),
            }),
        }
    }

    /// Read the next video sample.
    ///
    /// With `out = Some(buf)`, the sample payload is copied into `buf`;
    /// a payload larger than `buf` fails with [`Mp4Error::NoBuffer`]
    /// without advancing the cursor. With `out = None` the cursor
    /// advances without copying (the skip variant). `meta_out` receives
    /// the sample-aligned metadata-track payload when both exist and fit.
    pub fn next_sample(
        &mut self,
        out: Option<&mut [u8]>,
        meta_out: Option<&mut [u8]>,
    ) -> Result<TrackSample, Mp4Error> {
        let index = self.cursor;
        let entry = *self.video.get(index).ok_or(Mp4Error::EndOfStream)?;

        if let Some(out) = out {
            let size = entry.size as usize;
            if size > out.len() {
                return Err(Mp4Error::NoBuffer {
                    size,
                    capacity: out.len(),
                });
            }
            self.src.seek(SeekFrom::Start(entry.offset))?;
            self.src.read_exact(&mut out[..size]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Mp4Error::TruncatedData {
                        expected: size,
                        got: 0,
                    }
                } else {
                    Mp4Error::Io(e)
                }
            })?;
        }

        let metadata_size = match meta_out {
            Some(meta_out) => self.read_metadata_sample(index, meta_out)?,
            None => 0,
        };

        let dts = self.video.dts_us(index);
        let next_sample_dts = if index + 1 < self.video.len() {
            self.video.dts_us(index + 1)
        } else {
            0
        };
        let prev_sync_sample_dts = self
            .video
            .sync_before_index(index)
            .map(|i| self.video.dts_us(i))
            .unwrap_or(0);

        let silent = match self.silent_until_us {
            Some(target) if dts < target => true,
            Some(_) => {
                self.silent_until_us = None;
                false
            }
            None => false,
        };

        self.last_delivered = Some(index);
        self.cursor = index + 1;

        Ok(TrackSample {
            dts,
            size: entry.size,
            next_sample_dts,
            prev_sync_sample_dts,
            silent,
            metadata_size,
        })
    }

    fn read_metadata_sample(&mut self, index: usize, meta_out: &mut [u8]) -> Result<u32, Mp4Error> {
        let entry = match self.meta.as_ref().and_then(|m| m.get(index)) {
            Some(e) => *e,
            None => return Ok(0),
        };
        let size = entry.size as usize;
        if size > meta_out.len() {
            warn!(
                sample = index,
                size,
                capacity = meta_out.len(),
                "metadata sample exceeds buffer, dropped"
            );
            return Ok(0);
        }
        self.src.seek(SeekFrom::Start(entry.offset))?;
        self.src.read_exact(&mut meta_out[..size])?;
        Ok(entry.size)
    }

    /// Position the cursor so the next delivered sample is at or before
    /// `ts_us`: the nearest sync sample when `sync`, the nearest sample
    /// otherwise. Samples before `ts_us` will be flagged silent.
    pub fn seek(&mut self, ts_us: u64, sync: bool) -> Result<(), Mp4Error> {
        if self.video.is_empty() {
            return Err(Mp4Error::EndOfStream);
        }
        let target = ts_us.min(self.duration_us());
        let index = if sync {
            self.video.sync_at_or_before_us(target)
        } else {
            self.video.sample_at_or_before_us(target)
        }
        .unwrap_or(0);

        debug!(target_us = target, index, sync, "seek");
        self.cursor = index;
        self.last_delivered = None;
        self.silent_until_us = Some(target);
        Ok(())
    }

    /// Step back one displayed frame: re-position on the sample before
    /// the last delivered one, priming from its preceding sync sample.
    pub fn seek_to_prev_sample(&mut self) -> Result<(), Mp4Error> {
        let last = self.last_delivered.ok_or(Mp4Error::EndOfStream)?;
        let target = last.saturating_sub(1);
        self.seek(self.video.dts_us(target), true)
    }

    /// Time of the first sync sample after `ts_us` (see
    /// [`SampleTable::next_sync_after_us`]).
    pub fn next_sync_sample_after(&self, ts_us: u64, strict: bool) -> Option<u64> {
        self.video.next_sync_after_us(ts_us, strict)
    }

    /// Time of the last sync sample before `ts_us`.
    pub fn prev_sync_sample_before(&self, ts_us: u64, strict: bool) -> Option<u64> {
        self.video.prev_sync_before_us(ts_us, strict)
    }
}
