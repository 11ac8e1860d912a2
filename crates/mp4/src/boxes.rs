//! ISO BMFF box (atom) parsing for AVC recordings.
//!
//! Walks ftyp/moov/trak/mdia/minf/stbl and the sample table boxes, plus
//! the QuickTime-style `udta/meta/keys/ilst` metadata triplet the recorder
//! writes its session entries into.
//!
//! Reference: ISO 14496-12 (ISO Base Media File Format) and ISO 14496-15
//! (AVC file format).

use byteorder::{BigEndian, ReadBytesExt};
use rp_common::Mp4Error;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, trace, warn};

// ─── FourCC constants ───────────────────────────────────────────────

/// Convert a 4-byte tag to its u32 FourCC code.
pub const fn fourcc(tag: [u8; 4]) -> u32 {
    u32::from_be_bytes(tag)
}

pub const FTYP: u32 = fourcc(*b"ftyp");
pub const MOOV: u32 = fourcc(*b"moov");
pub const MVHD: u32 = fourcc(*b"mvhd");
pub const TRAK: u32 = fourcc(*b"trak");
pub const TKHD: u32 = fourcc(*b"tkhd");
pub const MDIA: u32 = fourcc(*b"mdia");
pub const MDHD: u32 = fourcc(*b"mdhd");
pub const HDLR: u32 = fourcc(*b"hdlr");
pub const MINF: u32 = fourcc(*b"minf");
pub const STBL: u32 = fourcc(*b"stbl");
pub const STSD: u32 = fourcc(*b"stsd");
pub const STTS: u32 = fourcc(*b"stts");
pub const STSC: u32 = fourcc(*b"stsc");
pub const STSZ: u32 = fourcc(*b"stsz");
pub const STCO: u32 = fourcc(*b"stco");
pub const CO64: u32 = fourcc(*b"co64");
pub const STSS: u32 = fourcc(*b"stss");
pub const UDTA: u32 = fourcc(*b"udta");
pub const META: u32 = fourcc(*b"meta");
pub const KEYS: u32 = fourcc(*b"keys");
pub const ILST: u32 = fourcc(*b"ilst");
pub const DATA: u32 = fourcc(*b"data");
pub const MDTA: u32 = fourcc(*b"mdta");
pub const AVC1: u32 = fourcc(*b"avc1");
pub const AVC3: u32 = fourcc(*b"avc3");
pub const AVCC: u32 = fourcc(*b"avcC");
pub const METT: u32 = fourcc(*b"mett");
pub const HANDLER_VIDE: u32 = fourcc(*b"vide");
pub const HANDLER_META: u32 = fourcc(*b"meta");

/// Render a FourCC for diagnostics.
pub fn fourcc_str(cc: u32) -> String {
    cc.to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

// ─── Box header ─────────────────────────────────────────────────────

/// Header of one ISO BMFF box.
#[derive(Copy, Clone, Debug)]
pub struct BoxHeader {
    pub kind: u32,
    /// Total size including the header; 0 means "extends to EOF".
    pub size: u64,
    /// File offset of the box start.
    pub offset: u64,
    pub header_len: u8,
}

impl BoxHeader {
    /// Offset of the box payload.
    pub fn content_start(&self) -> u64 {
        self.offset + self.header_len as u64
    }

    /// Offset of the first byte past the box, unless it runs to EOF.
    pub fn end(&self) -> Option<u64> {
        (self.size != 0).then(|| self.offset + self.size)
    }
}

/// Read the next box header; `None` at EOF.
pub fn read_header<R: Read + Seek>(src: &mut R) -> Result<Option<BoxHeader>, Mp4Error> {
    let offset = src.stream_position()?;
    let short_size = match src.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let kind = src.read_u32::<BigEndian>()?;

    let (size, header_len) = match short_size {
        0 => (0, 8),
        1 => (src.read_u64::<BigEndian>()?, 16),
        n => (n as u64, 8),
    };
    if size != 0 && size < header_len as u64 {
        return Err(Mp4Error::InvalidStructure {
            offset,
            reason: format!("box '{}' smaller than its header", fourcc_str(kind)),
        });
    }

    trace!(
        kind = %fourcc_str(kind),
        offset,
        size,
        "box header"
    );
    Ok(Some(BoxHeader {
        kind,
        size,
        offset,
        header_len,
    }))
}

/// Seek past the current box.
pub fn skip_box<R: Read + Seek>(src: &mut R, header: &BoxHeader) -> Result<(), Mp4Error> {
    match header.end() {
        Some(end) => src.seek(SeekFrom::Start(end))?,
        None => src.seek(SeekFrom::End(0))?,
    };
    Ok(())
}

/// Read the 1-byte version + 3-byte flags of a full box.
fn read_full_box_version<R: Read>(src: &mut R) -> Result<u8, Mp4Error> {
    let version_flags = src.read_u32::<BigEndian>()?;
    Ok((version_flags >> 24) as u8)
}

// ─── Parsed structures ──────────────────────────────────────────────

/// AVC decoder configuration record (from the `avcC` box).
#[derive(Clone, Debug, Default)]
pub struct AvcConfiguration {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// Byte width of per-NAL length prefixes (4 for every known recording).
    pub nal_length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

/// One `stts` run: `count` samples spaced `delta` ticks apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SttsEntry {
    pub count: u32,
    pub delta: u32,
}

/// One `stsc` run mapping chunks to their sample count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Sample sizes: either one uniform size or a per-sample list.
#[derive(Clone, Debug, Default)]
pub struct SampleSizes {
    pub uniform: u32,
    pub sizes: Vec<u32>,
    pub count: u32,
}

impl SampleSizes {
    pub fn get(&self, index: usize) -> Option<u32> {
        if self.uniform != 0 {
            (index < self.count as usize).then_some(self.uniform)
        } else {
            self.sizes.get(index).copied()
        }
    }
}

/// Sample-table boxes shared by every track kind.
#[derive(Clone, Debug, Default)]
pub struct SampleTables {
    pub stts: Vec<SttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub stsz: SampleSizes,
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers; empty means every sample is sync.
    pub sync_samples: Vec<u32>,
}

/// A parsed AVC video track.
#[derive(Clone, Debug)]
pub struct VideoTrackBox {
    pub id: u32,
    pub timescale: u32,
    pub duration: u64,
    pub width: u32,
    pub height: u32,
    pub avcc: AvcConfiguration,
    pub tables: SampleTables,
}

/// A parsed timed-metadata track (`mett` sample entries).
#[derive(Clone, Debug)]
pub struct MetadataTrackBox {
    pub id: u32,
    pub timescale: u32,
    pub mime: String,
    pub tables: SampleTables,
}

/// Everything the player needs out of `moov`.
#[derive(Clone, Debug, Default)]
pub struct MovieBox {
    pub timescale: u32,
    pub duration: u64,
    pub videos: Vec<VideoTrackBox>,
    pub metadata_tracks: Vec<MetadataTrackBox>,
    /// Container-level key/value metadata entries, in file order.
    pub entries: Vec<(String, String)>,
}

impl MovieBox {
    /// Movie duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        (self.duration as u128 * 1_000_000 / self.timescale as u128) as u64
    }
}

// ─── Movie parsing ──────────────────────────────────────────────────

/// Scan the file's top-level boxes and parse `moov`.
pub fn parse_movie<R: Read + Seek>(src: &mut R) -> Result<MovieBox, Mp4Error> {
    src.seek(SeekFrom::Start(0))?;
    loop {
        let header = match read_header(src)? {
            Some(h) => h,
            None => {
                return Err(Mp4Error::InvalidStructure {
                    offset: 0,
                    reason: "no moov box in file".to_string(),
                })
            }
        };
        if header.kind == MOOV {
            return parse_moov(src, &header);
        }
        skip_box(src, &header)?;
    }
}

fn parse_moov<R: Read + Seek>(src: &mut R, moov: &BoxHeader) -> Result<MovieBox, Mp4Error> {
    let mut movie = MovieBox::default();
    let end = moov.end().ok_or(Mp4Error::InvalidStructure {
        offset: moov.offset,
        reason: "moov box without a size".to_string(),
    })?;

    while src.stream_position()? < end {
        let header = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        match header.kind {
            MVHD => {
                let version = read_full_box_version(src)?;
                if version == 1 {
                    src.read_u64::<BigEndian>()?; // creation_time
                    src.read_u64::<BigEndian>()?; // modification_time
                    movie.timescale = src.read_u32::<BigEndian>()?;
                    movie.duration = src.read_u64::<BigEndian>()?;
                } else {
                    src.read_u32::<BigEndian>()?;
                    src.read_u32::<BigEndian>()?;
                    movie.timescale = src.read_u32::<BigEndian>()?;
                    movie.duration = src.read_u32::<BigEndian>()? as u64;
                }
                skip_box(src, &header)?;
            }
            TRAK => parse_trak(src, &header, &mut movie)?,
            UDTA => parse_udta(src, &header, &mut movie.entries)?,
            _ => skip_box(src, &header)?,
        }
    }

    debug!(
        tracks = movie.videos.len() + movie.metadata_tracks.len(),
        duration_us = movie.duration_us(),
        entries = movie.entries.len(),
        "moov parsed"
    );
    Ok(movie)
}

/// Accumulates a track's boxes before classification by handler type.
#[derive(Default)]
struct TrackAccum {
    id: u32,
    timescale: u32,
    duration: u64,
    handler: u32,
    width: u32,
    height: u32,
    avcc: Option<AvcConfiguration>,
    mime: Option<String>,
    tables: SampleTables,
}

fn parse_trak<R: Read + Seek>(
    src: &mut R,
    trak: &BoxHeader,
    movie: &mut MovieBox,
) -> Result<(), Mp4Error> {
    let end = trak.end().ok_or(Mp4Error::InvalidStructure {
        offset: trak.offset,
        reason: "trak box without a size".to_string(),
    })?;

    let mut accum = TrackAccum::default();
    parse_trak_children(src, end, &mut accum)?;

    match accum.handler {
        HANDLER_VIDE if accum.avcc.is_some() => {
            movie.videos.push(VideoTrackBox {
                id: accum.id,
                timescale: accum.timescale,
                duration: accum.duration,
                width: accum.width,
                height: accum.height,
                avcc: accum.avcc.unwrap_or_default(),
                tables: accum.tables,
            });
        }
        HANDLER_VIDE => {
            warn!(track = accum.id, "video track without avcC, ignored");
        }
        HANDLER_META => {
            movie.metadata_tracks.push(MetadataTrackBox {
                id: accum.id,
                timescale: accum.timescale,
                mime: accum.mime.unwrap_or_default(),
                tables: accum.tables,
            });
        }
        other => {
            trace!(track = accum.id, handler = %fourcc_str(other), "track ignored");
        }
    }

    src.seek(SeekFrom::Start(end))?;
    Ok(())
}

fn parse_trak_children<R: Read + Seek>(
    src: &mut R,
    end: u64,
    accum: &mut TrackAccum,
) -> Result<(), Mp4Error> {
    while src.stream_position()? < end {
        let header = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        let child_end = header.end().unwrap_or(end);
        match header.kind {
            TKHD => {
                let version = read_full_box_version(src)?;
                if version == 1 {
                    src.seek(SeekFrom::Current(16))?; // creation + modification
                } else {
                    src.seek(SeekFrom::Current(8))?;
                }
                accum.id = src.read_u32::<BigEndian>()?;
                skip_box(src, &header)?;
            }
            MDHD => {
                let version = read_full_box_version(src)?;
                if version == 1 {
                    src.seek(SeekFrom::Current(16))?;
                    accum.timescale = src.read_u32::<BigEndian>()?;
                    accum.duration = src.read_u64::<BigEndian>()?;
                } else {
                    src.seek(SeekFrom::Current(8))?;
                    accum.timescale = src.read_u32::<BigEndian>()?;
                    accum.duration = src.read_u32::<BigEndian>()? as u64;
                }
                skip_box(src, &header)?;
            }
            HDLR => {
                read_full_box_version(src)?;
                src.read_u32::<BigEndian>()?; // pre_defined
                accum.handler = src.read_u32::<BigEndian>()?;
                skip_box(src, &header)?;
            }
            MDIA | MINF | STBL => {
                // containers: descend
                parse_trak_children(src, child_end, accum)?;
                src.seek(SeekFrom::Start(child_end))?;
            }
            STSD => {
                parse_stsd(src, &header, accum)?;
                skip_box(src, &header)?;
            }
            STTS => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                accum.tables.stts = (0..count)
                    .map(|_| {
                        Ok(SttsEntry {
                            count: src.read_u32::<BigEndian>()?,
                            delta: src.read_u32::<BigEndian>()?,
                        })
                    })
                    .collect::<Result<_, Mp4Error>>()?;
                skip_box(src, &header)?;
            }
            STSC => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                accum.tables.stsc = (0..count)
                    .map(|_| {
                        let first_chunk = src.read_u32::<BigEndian>()?;
                        let samples_per_chunk = src.read_u32::<BigEndian>()?;
                        src.read_u32::<BigEndian>()?; // sample_description_index
                        Ok(StscEntry {
                            first_chunk,
                            samples_per_chunk,
                        })
                    })
                    .collect::<Result<_, Mp4Error>>()?;
                skip_box(src, &header)?;
            }
            STSZ => {
                read_full_box_version(src)?;
                let uniform = src.read_u32::<BigEndian>()?;
                let count = src.read_u32::<BigEndian>()?;
                let sizes = if uniform == 0 {
                    (0..count)
                        .map(|_| Ok(src.read_u32::<BigEndian>()?))
                        .collect::<Result<_, Mp4Error>>()?
                } else {
                    Vec::new()
                };
                accum.tables.stsz = SampleSizes {
                    uniform,
                    sizes,
                    count,
                };
                skip_box(src, &header)?;
            }
            STCO => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                accum.tables.chunk_offsets = (0..count)
                    .map(|_| Ok(src.read_u32::<BigEndian>()? as u64))
                    .collect::<Result<_, Mp4Error>>()?;
                skip_box(src, &header)?;
            }
            CO64 => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                accum.tables.chunk_offsets = (0..count)
                    .map(|_| Ok(src.read_u64::<BigEndian>()?))
                    .collect::<Result<_, Mp4Error>>()?;
                skip_box(src, &header)?;
            }
            STSS => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                accum.tables.sync_samples = (0..count)
                    .map(|_| Ok(src.read_u32::<BigEndian>()?))
                    .collect::<Result<_, Mp4Error>>()?;
                skip_box(src, &header)?;
            }
            _ => skip_box(src, &header)?,
        }
    }
    Ok(())
}

// ─── Sample descriptions ────────────────────────────────────────────

fn parse_stsd<R: Read + Seek>(
    src: &mut R,
    _stsd: &BoxHeader,
    accum: &mut TrackAccum,
) -> Result<(), Mp4Error> {
    read_full_box_version(src)?;
    let entry_count = src.read_u32::<BigEndian>()?;

    for _ in 0..entry_count {
        let entry = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        let entry_end = entry.end().ok_or(Mp4Error::InvalidStructure {
            offset: entry.offset,
            reason: "sample entry without a size".to_string(),
        })?;

        match entry.kind {
            AVC1 | AVC3 => {
                // SampleEntry + VisualSampleEntry fixed fields
                src.seek(SeekFrom::Current(6 + 2))?; // reserved + data_reference_index
                src.seek(SeekFrom::Current(2 + 2 + 12))?; // pre_defined/reserved
                accum.width = src.read_u16::<BigEndian>()? as u32;
                accum.height = src.read_u16::<BigEndian>()? as u32;
                src.seek(SeekFrom::Current(4 + 4 + 4 + 2 + 32 + 2 + 2))?;

                // extension boxes up to the entry end
                while src.stream_position()? < entry_end {
                    let ext = match read_header(src)? {
                        Some(h) => h,
                        None => break,
                    };
                    if ext.kind == AVCC {
                        accum.avcc = Some(parse_avcc(src)?);
                    }
                    skip_box(src, &ext)?;
                }
            }
            METT => {
                src.seek(SeekFrom::Current(6 + 2))?;
                let remaining = entry_end - src.stream_position()?;
                let mut raw = vec![0u8; remaining as usize];
                src.read_exact(&mut raw)?;
                // content_encoding then mime_format, both null-terminated
                let mut strings = raw.split(|&b| b == 0);
                let _encoding = strings.next();
                accum.mime = strings
                    .next()
                    .map(|s| String::from_utf8_lossy(s).into_owned());
            }
            other => {
                trace!(entry = %fourcc_str(other), "sample entry ignored");
            }
        }
        src.seek(SeekFrom::Start(entry_end))?;
    }
    Ok(())
}

fn parse_avcc<R: Read + Seek>(src: &mut R) -> Result<AvcConfiguration, Mp4Error> {
    let offset = src.stream_position()?;
    let version = src.read_u8()?;
    if version != 1 {
        return Err(Mp4Error::InvalidStructure {
            offset,
            reason: format!("avcC configuration version {version}"),
        });
    }

    let mut config = AvcConfiguration {
        profile: src.read_u8()?,
        profile_compat: src.read_u8()?,
        level: src.read_u8()?,
        nal_length_size: (src.read_u8()? & 0x03) + 1,
        ..Default::default()
    };

    let sps_count = src.read_u8()? & 0x1F;
    for _ in 0..sps_count {
        let len = src.read_u16::<BigEndian>()? as usize;
        let mut nal = vec![0u8; len];
        src.read_exact(&mut nal)?;
        config.sps.push(nal);
    }
    let pps_count = src.read_u8()?;
    for _ in 0..pps_count {
        let len = src.read_u16::<BigEndian>()? as usize;
        let mut nal = vec![0u8; len];
        src.read_exact(&mut nal)?;
        config.pps.push(nal);
    }

    Ok(config)
}

// ─── udta metadata ──────────────────────────────────────────────────

/// Parse `udta/meta/{keys,ilst}` into key/value string entries.
fn parse_udta<R: Read + Seek>(
    src: &mut R,
    udta: &BoxHeader,
    entries: &mut Vec<(String, String)>,
) -> Result<(), Mp4Error> {
    let end = udta.end().unwrap_or(udta.offset);
    while src.stream_position()? < end {
        let header = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        if header.kind == META {
            read_full_box_version(src)?;
            parse_meta_children(src, header.end().unwrap_or(end), entries)?;
        }
        skip_box(src, &header)?;
    }
    src.seek(SeekFrom::Start(end))?;
    Ok(())
}

fn parse_meta_children<R: Read + Seek>(
    src: &mut R,
    end: u64,
    entries: &mut Vec<(String, String)>,
) -> Result<(), Mp4Error> {
    let mut keys: Vec<String> = Vec::new();
    let mut values: Vec<(u32, String)> = Vec::new();

    while src.stream_position()? < end {
        let header = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        match header.kind {
            KEYS => {
                read_full_box_version(src)?;
                let count = src.read_u32::<BigEndian>()?;
                for _ in 0..count {
                    let key_size = src.read_u32::<BigEndian>()? as usize;
                    let namespace = src.read_u32::<BigEndian>()?;
                    let mut key = vec![0u8; key_size.saturating_sub(8)];
                    src.read_exact(&mut key)?;
                    if namespace == MDTA {
                        keys.push(String::from_utf8_lossy(&key).into_owned());
                    } else {
                        keys.push(String::new());
                    }
                }
                skip_box(src, &header)?;
            }
            ILST => {
                parse_ilst(src, header.end().unwrap_or(end), &mut values)?;
                skip_box(src, &header)?;
            }
            _ => skip_box(src, &header)?,
        }
    }

    for (index, value) in values {
        match keys.get(index.wrapping_sub(1) as usize) {
            Some(key) if !key.is_empty() => entries.push((key.clone(), value)),
            _ => warn!(index, "ilst entry without a matching key"),
        }
    }
    Ok(())
}

fn parse_ilst<R: Read + Seek>(
    src: &mut R,
    end: u64,
    values: &mut Vec<(u32, String)>,
) -> Result<(), Mp4Error> {
    while src.stream_position()? < end {
        let item = match read_header(src)? {
            Some(h) => h,
            None => break,
        };
        // item kind is the 1-based index into the keys box
        let index = item.kind;
        let item_end = item.end().unwrap_or(end);
        while src.stream_position()? < item_end {
            let data = match read_header(src)? {
                Some(h) => h,
                None => break,
            };
            if data.kind == DATA {
                let type_indicator = src.read_u32::<BigEndian>()?;
                src.read_u32::<BigEndian>()?; // locale
                let len = data
                    .end()
                    .unwrap_or(item_end)
                    .saturating_sub(src.stream_position()?);
                let mut raw = vec![0u8; len as usize];
                src.read_exact(&mut raw)?;
                // type 1 = UTF-8 text; anything else is not a string entry
                if type_indicator == 1 {
                    values.push((index, String::from_utf8_lossy(&raw).into_owned()));
                }
            }
            skip_box(src, &data)?;
        }
        src.seek(SeekFrom::Start(item_end))?;
    }
    Ok(())
}
