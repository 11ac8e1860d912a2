//! In-memory recording builder for tests.
//!
//! Produces a minimal but structurally valid recording: `ftyp`, `mdat`,
//! then `moov` with one AVC video track, an optional timed-metadata
//! track, and optional `udta/meta/keys/ilst` container entries. Sample
//! payloads are stored AVCC-framed (4-byte big-endian length prefixes),
//! exactly as a recorder writes them.

/// Baseline-profile SPS for 1920x1088, no crop, no VUI.
pub const TEST_SPS: [u8; 9] = [0x67, 0x42, 0x00, 0x1E, 0xF4, 0x03, 0xC0, 0x11, 0x32];

/// Matching PPS.
pub const TEST_PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

struct Frame {
    delta: u32,
    sync: bool,
    /// AVCC-framed sample payload.
    data: Vec<u8>,
}

/// Builder for an in-memory test recording.
pub struct RecordingBuilder {
    timescale: u32,
    frames: Vec<Frame>,
    metadata: Option<(String, Vec<Vec<u8>>)>,
    entries: Vec<(String, String)>,
}

impl RecordingBuilder {
    pub fn new(timescale: u32) -> Self {
        Self {
            timescale,
            frames: Vec::new(),
            metadata: None,
            entries: Vec::new(),
        }
    }

    /// Append a frame holding a single NAL unit.
    pub fn add_frame(&mut self, delta: u32, sync: bool, nal: Vec<u8>) {
        self.add_frame_nals(delta, sync, &[&nal]);
    }

    /// Append a frame holding several NAL units (e.g. SEI + slice).
    pub fn add_frame_nals(&mut self, delta: u32, sync: bool, nals: &[&[u8]]) {
        let mut data = Vec::new();
        for nal in nals {
            data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            data.extend_from_slice(nal);
        }
        self.frames.push(Frame { delta, sync, data });
    }

    /// Attach a timed-metadata track whose samples align 1:1 with the
    /// video frames added so far.
    pub fn metadata_track(&mut self, mime: &str, samples: Vec<Vec<u8>>) {
        self.metadata = Some((mime.to_string(), samples));
    }

    /// Add one container-level key/value entry.
    pub fn container_entry(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// Serialize the recording.
    pub fn finish(&self) -> Vec<u8> {
        let ftyp = boxed(
            b"ftyp",
            [
                b"isom".to_vec(),
                0u32.to_be_bytes().to_vec(),
                b"isomavc1".to_vec(),
            ]
            .concat(),
        );

        // mdat: video samples then metadata samples
        let mut mdat_payload = Vec::new();
        let mut video_offsets = Vec::new();
        for frame in &self.frames {
            video_offsets.push(ftyp.len() as u64 + 8 + mdat_payload.len() as u64);
            mdat_payload.extend_from_slice(&frame.data);
        }
        let mut meta_offsets = Vec::new();
        if let Some((_, samples)) = &self.metadata {
            for sample in samples {
                meta_offsets.push(ftyp.len() as u64 + 8 + mdat_payload.len() as u64);
                mdat_payload.extend_from_slice(sample);
            }
        }
        let mdat = boxed(b"mdat", mdat_payload);

        let duration: u64 = self.frames.iter().map(|f| f.delta as u64).sum();

        let mut moov_payload = self.mvhd(duration);
        if !self.frames.is_empty() {
            moov_payload.extend(self.video_trak(duration, &video_offsets));
        }
        if let Some((mime, samples)) = &self.metadata {
            moov_payload.extend(self.metadata_trak(mime, samples, &meta_offsets));
        }
        if !self.entries.is_empty() {
            moov_payload.extend(self.udta());
        }
        let moov = boxed(b"moov", moov_payload);

        [ftyp, mdat, moov].concat()
    }

    fn mvhd(&self, duration: u64) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(&[0u8; 4]); // version + flags
        content.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        content.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        content.extend_from_slice(&self.timescale.to_be_bytes());
        content.extend_from_slice(&(duration as u32).to_be_bytes());
        content.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        content.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
        content.extend_from_slice(&[0u8; 10]); // reserved
        content.extend_from_slice(&identity_matrix());
        content.extend_from_slice(&[0u8; 24]); // pre_defined
        content.extend_from_slice(&3u32.to_be_bytes()); // next_track_ID
        boxed(b"mvhd", content)
    }

    fn video_trak(&self, duration: u64, offsets: &[u64]) -> Vec<u8> {
        let stbl = [
            self.video_stsd(),
            self.stts(self.frames.iter().map(|f| f.delta)),
            self.stss(),
            stsc_one_chunk(self.frames.len() as u32),
            stsz(self.frames.iter().map(|f| f.data.len() as u32)),
            stco(offsets.first().copied().unwrap_or(0)),
        ]
        .concat();
        trak(1, self.timescale, duration, *b"vide", stbl)
    }

    fn metadata_trak(&self, mime: &str, samples: &[Vec<u8>], offsets: &[u64]) -> Vec<u8> {
        // reuse the video frame spacing so samples stay index-aligned
        let deltas = self
            .frames
            .iter()
            .map(|f| f.delta)
            .chain(std::iter::repeat(1))
            .take(samples.len());
        let stbl = [
            mett_stsd(mime),
            self.stts(deltas),
            stsc_one_chunk(samples.len() as u32),
            stsz(samples.iter().map(|s| s.len() as u32)),
            stco(offsets.first().copied().unwrap_or(0)),
        ]
        .concat();
        trak(
            2,
            self.timescale,
            self.frames.iter().map(|f| f.delta as u64).sum(),
            *b"meta",
            stbl,
        )
    }

    fn video_stsd(&self) -> Vec<u8> {
        let mut avcc = vec![1u8, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
        avcc.extend_from_slice(&(TEST_SPS.len() as u16).to_be_bytes());
        avcc.extend_from_slice(&TEST_SPS);
        avcc.push(1);
        avcc.extend_from_slice(&(TEST_PPS.len() as u16).to_be_bytes());
        avcc.extend_from_slice(&TEST_PPS);

        let mut entry = Vec::new();
        entry.extend_from_slice(&[0u8; 6]); // reserved
        entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        entry.extend_from_slice(&[0u8; 16]); // pre_defined/reserved
        entry.extend_from_slice(&1920u16.to_be_bytes());
        entry.extend_from_slice(&1088u16.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horiz dpi
        entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vert dpi
        entry.extend_from_slice(&0u32.to_be_bytes()); // reserved
        entry.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        entry.extend_from_slice(&[0u8; 32]); // compressorname
        entry.extend_from_slice(&24u16.to_be_bytes()); // depth
        entry.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
        entry.extend(boxed(b"avcC", avcc));

        let mut content = vec![0u8; 4]; // version + flags
        content.extend_from_slice(&1u32.to_be_bytes()); // entry_count
        content.extend(boxed(b"avc1", entry));
        boxed(b"stsd", content)
    }

    fn stts(&self, deltas: impl Iterator<Item = u32>) -> Vec<u8> {
        let deltas: Vec<u32> = deltas.collect();
        let mut content = vec![0u8; 4];
        content.extend_from_slice(&(deltas.len() as u32).to_be_bytes());
        for delta in deltas {
            content.extend_from_slice(&1u32.to_be_bytes());
            content.extend_from_slice(&delta.to_be_bytes());
        }
        boxed(b"stts", content)
    }

    fn stss(&self) -> Vec<u8> {
        if self.frames.iter().all(|f| f.sync) {
            return Vec::new(); // no stss box: every sample is sync
        }
        let syncs: Vec<u32> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let mut content = vec![0u8; 4];
        content.extend_from_slice(&(syncs.len() as u32).to_be_bytes());
        for s in syncs {
            content.extend_from_slice(&s.to_be_bytes());
        }
        boxed(b"stss", content)
    }

    fn udta(&self) -> Vec<u8> {
        let mut keys_content = vec![0u8; 4];
        keys_content.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (key, _) in &self.entries {
            keys_content.extend_from_slice(&(key.len() as u32 + 8).to_be_bytes());
            keys_content.extend_from_slice(b"mdta");
            keys_content.extend_from_slice(key.as_bytes());
        }

        let mut ilst_content = Vec::new();
        for (index, (_, value)) in self.entries.iter().enumerate() {
            let mut data_content = Vec::new();
            data_content.extend_from_slice(&1u32.to_be_bytes()); // UTF-8
            data_content.extend_from_slice(&0u32.to_be_bytes()); // locale
            data_content.extend_from_slice(value.as_bytes());
            let data_box = boxed(b"data", data_content);

            let item_tag = (index as u32 + 1).to_be_bytes();
            ilst_content.extend(boxed(&item_tag, data_box));
        }

        let mut meta_content = vec![0u8; 4]; // full box version + flags
        meta_content.extend(handler_box(*b"mdir"));
        meta_content.extend(boxed(b"keys", keys_content));
        meta_content.extend(boxed(b"ilst", ilst_content));

        boxed(b"udta", boxed(b"meta", meta_content))
    }
}

// ─── box-writing helpers ────────────────────────────────────────────

fn boxed(tag: &[u8; 4], content: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 8);
    out.extend_from_slice(&(content.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(tag);
    out.extend(content);
    out
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn handler_box(handler: [u8; 4]) -> Vec<u8> {
    let mut content = vec![0u8; 4]; // version + flags
    content.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    content.extend_from_slice(&handler);
    content.extend_from_slice(&[0u8; 12]); // reserved
    content.push(0); // empty name
    boxed(b"hdlr", content)
}

fn trak(id: u32, timescale: u32, duration: u64, handler: [u8; 4], stbl: Vec<u8>) -> Vec<u8> {
    let mut tkhd = vec![0, 0, 0, 7]; // version 0, flags: enabled/in-movie/in-preview
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    tkhd.extend_from_slice(&id.to_be_bytes());
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // reserved
    tkhd.extend_from_slice(&(duration as u32).to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 16]); // reserved + layer + group + volume
    tkhd.extend_from_slice(&identity_matrix());
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // width
    tkhd.extend_from_slice(&0u32.to_be_bytes()); // height

    let mut mdhd = vec![0u8; 4];
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&timescale.to_be_bytes());
    mdhd.extend_from_slice(&(duration as u32).to_be_bytes());
    mdhd.extend_from_slice(&0x55C4u16.to_be_bytes()); // language "und"
    mdhd.extend_from_slice(&0u16.to_be_bytes()); // pre_defined

    let minf = boxed(b"minf", boxed(b"stbl", stbl));
    let mdia = boxed(
        b"mdia",
        [boxed(b"mdhd", mdhd), handler_box(handler), minf].concat(),
    );
    boxed(b"trak", [boxed(b"tkhd", tkhd), mdia].concat())
}

fn mett_stsd(mime: &str) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&[0u8; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    entry.push(0); // empty content_encoding
    entry.extend_from_slice(mime.as_bytes());
    entry.push(0);

    let mut content = vec![0u8; 4];
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend(boxed(b"mett", entry));
    boxed(b"stsd", content)
}

fn stsc_one_chunk(sample_count: u32) -> Vec<u8> {
    let mut content = vec![0u8; 4];
    content.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    content.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
    content.extend_from_slice(&sample_count.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
    boxed(b"stsc", content)
}

fn stsz(sizes: impl Iterator<Item = u32>) -> Vec<u8> {
    let sizes: Vec<u32> = sizes.collect();
    let mut content = vec![0u8; 4];
    content.extend_from_slice(&0u32.to_be_bytes()); // no uniform size
    content.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
    for size in sizes {
        content.extend_from_slice(&size.to_be_bytes());
    }
    boxed(b"stsz", content)
}

fn stco(first_chunk_offset: u64) -> Vec<u8> {
    let mut content = vec![0u8; 4];
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&(first_chunk_offset as u32).to_be_bytes());
    boxed(b"stco", content)
}
