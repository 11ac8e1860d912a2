//! Flat sample index built from the stts/stsc/stsz/stco/stss tables.
//!
//! All navigation the playback engine needs — next sample, sync sample at
//! or before a timestamp, sync-sample time queries for catch-up — runs on
//! this pre-computed table; the box tables are never consulted again
//! after open.

use rp_common::Mp4Error;
use tracing::debug;

use crate::boxes::{SampleTables, StscEntry};

/// One sample, pre-resolved to its file location and decode time.
#[derive(Copy, Clone, Debug)]
pub struct SampleEntry {
    /// Byte offset of the sample data in the file.
    pub offset: u64,
    /// Byte size of the sample data.
    pub size: u32,
    /// Decode timestamp in media timescale ticks.
    pub dts: u64,
    /// Whether this sample is independently decodable.
    pub is_sync: bool,
}

/// Pre-computed sample index for one track.
#[derive(Clone, Debug)]
pub struct SampleTable {
    samples: Vec<SampleEntry>,
    timescale: u32,
    duration_ticks: u64,
}

impl SampleTable {
    /// Build the flat index from a track's parsed sample tables.
    pub fn build(
        timescale: u32,
        duration_ticks: u64,
        tables: &SampleTables,
    ) -> Result<Self, Mp4Error> {
        let count = tables.stsz.count as usize;
        let mut samples = Vec::with_capacity(count);

        // dts accumulation from stts runs
        let mut dts_iter = DtsIter::new(&tables.stts);

        // chunk walk: offset of each sample from stsc runs + chunk offsets
        let mut sample_idx = 0usize;
        'chunks: for (chunk_idx, &chunk_offset) in tables.chunk_offsets.iter().enumerate() {
            let in_chunk = samples_per_chunk(&tables.stsc, chunk_idx as u32 + 1);
            let mut offset = chunk_offset;
            for _ in 0..in_chunk {
                if sample_idx >= count {
                    break 'chunks;
                }
                let size = tables.stsz.get(sample_idx).ok_or_else(|| {
                    Mp4Error::InvalidStructure {
                        offset: 0,
                        reason: format!(
                            "sample {sample_idx} not covered by stsz ({} entries)",
                            tables.stsz.count
                        ),
                    }
                })?;
                let is_sync = tables.sync_samples.is_empty()
                    || tables
                        .sync_samples
                        .binary_search(&(sample_idx as u32 + 1))
                        .is_ok();
                samples.push(SampleEntry {
                    offset,
                    size,
                    dts: dts_iter.next_dts(),
                    is_sync,
                });
                offset += size as u64;
                sample_idx += 1;
            }
        }

        if samples.len() != count {
            return Err(Mp4Error::InvalidStructure {
                offset: 0,
                reason: format!(
                    "stsc/stco cover {} samples, stsz declares {count}",
                    samples.len()
                ),
            });
        }

        debug!(
            samples = samples.len(),
            timescale, duration_ticks, "sample table built"
        );
        Ok(SampleTable {
            samples,
            timescale,
            duration_ticks,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SampleEntry> {
        self.samples.get(index)
    }

    /// Decode timestamp of a sample in microseconds.
    pub fn dts_us(&self, index: usize) -> u64 {
        self.samples
            .get(index)
            .map(|s| self.ticks_to_us(s.dts))
            .unwrap_or(0)
    }

    /// Track duration in microseconds.
    pub fn duration_us(&self) -> u64 {
        self.ticks_to_us(self.duration_ticks)
    }

    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        (ticks as u128 * 1_000_000 / self.timescale as u128) as u64
    }

    /// Index of the last sample with `dts <= ts_us`, or `None` if the
    /// first sample is already past `ts_us`.
    pub fn sample_at_or_before_us(&self, ts_us: u64) -> Option<usize> {
        let n = self
            .samples
            .partition_point(|s| self.ticks_to_us(s.dts) <= ts_us);
        n.checked_sub(1)
    }

    /// Index of the last *sync* sample with `dts <= ts_us`.
    pub fn sync_at_or_before_us(&self, ts_us: u64) -> Option<usize> {
        let start = self.sample_at_or_before_us(ts_us)?;
        (0..=start).rev().find(|&i| self.samples[i].is_sync)
    }

    /// Index of the nearest sync sample at or before `index` itself being
    /// excluded: the sync sample strictly before sample `index`.
    pub fn sync_before_index(&self, index: usize) -> Option<usize> {
        (0..index).rev().find(|&i| self.samples[i].is_sync)
    }

    /// Time of the first sync sample after `ts_us` (strictly after when
    /// `strict`, at-or-after otherwise), in microseconds.
    pub fn next_sync_after_us(&self, ts_us: u64, strict: bool) -> Option<u64> {
        self.samples
            .iter()
            .map(|s| (self.ticks_to_us(s.dts), s.is_sync))
            .find(|&(dts, is_sync)| is_sync && if strict { dts > ts_us } else { dts >= ts_us })
            .map(|(dts, _)| dts)
    }

    /// Time of the last sync sample before `ts_us` (strictly before when
    /// `strict`, at-or-before otherwise), in microseconds.
    pub fn prev_sync_before_us(&self, ts_us: u64, strict: bool) -> Option<u64> {
        self.samples
            .iter()
            .rev()
            .map(|s| (self.ticks_to_us(s.dts), s.is_sync))
            .find(|&(dts, is_sync)| is_sync && if strict { dts < ts_us } else { dts <= ts_us })
            .map(|(dts, _)| dts)
    }
}

/// Walks stts runs, yielding consecutive sample dts values.
struct DtsIter<'a> {
    runs: &'a [crate::boxes::SttsEntry],
    run: usize,
    left_in_run: u32,
    dts: u64,
}

impl<'a> DtsIter<'a> {
    fn new(runs: &'a [crate::boxes::SttsEntry]) -> Self {
        Self {
            runs,
            run: 0,
            left_in_run: runs.first().map(|r| r.count).unwrap_or(0),
            dts: 0,
        }
    }

    fn next_dts(&mut self) -> u64 {
        let current = self.dts;
        // advance past exhausted runs; reuse the last delta if stts ends
        while self.left_in_run == 0 && self.run + 1 < self.runs.len() {
            self.run += 1;
            self.left_in_run = self.runs[self.run].count;
        }
        let delta = self.runs.get(self.run).map(|r| r.delta).unwrap_or(0);
        self.left_in_run = self.left_in_run.saturating_sub(1);
        self.dts += delta as u64;
        current
    }
}

/// Samples in the given 1-based chunk, resolved from the stsc runs.
fn samples_per_chunk(stsc: &[StscEntry], chunk: u32) -> u32 {
    let mut per_chunk = 1;
    for entry in stsc {
        if entry.first_chunk <= chunk {
            per_chunk = entry.samples_per_chunk;
        } else {
            break;
        }
    }
    per_chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{SampleSizes, SttsEntry};

    fn tables(
        stts: Vec<SttsEntry>,
        stsc: Vec<StscEntry>,
        sizes: Vec<u32>,
        chunk_offsets: Vec<u64>,
        sync: Vec<u32>,
    ) -> SampleTables {
        let count = sizes.len() as u32;
        SampleTables {
            stts,
            stsc,
            stsz: SampleSizes {
                uniform: 0,
                sizes,
                count,
            },
            chunk_offsets,
            sync_samples: sync,
        }
    }

    /// 10 samples, 1 s apart at 90 kHz, one chunk, syncs at 1/4/7 (1-based).
    fn second_spaced_table() -> SampleTable {
        let t = tables(
            vec![SttsEntry {
                count: 10,
                delta: 90_000,
            }],
            vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 10,
            }],
            vec![100; 10],
            vec![0],
            vec![1, 4, 7],
        );
        SampleTable::build(90_000, 900_000, &t).unwrap()
    }

    #[test]
    fn offsets_and_dts_single_chunk() {
        let t = tables(
            vec![SttsEntry {
                count: 3,
                delta: 3_000,
            }],
            vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 3,
            }],
            vec![100, 200, 150],
            vec![1_000],
            vec![1],
        );
        let table = SampleTable::build(90_000, 9_000, &t).unwrap();

        assert_eq!(table.len(), 3);
        let s0 = table.get(0).unwrap();
        assert_eq!((s0.offset, s0.size, s0.dts), (1_000, 100, 0));
        assert!(s0.is_sync);
        let s1 = table.get(1).unwrap();
        assert_eq!((s1.offset, s1.size, s1.dts), (1_100, 200, 3_000));
        assert!(!s1.is_sync);
        let s2 = table.get(2).unwrap();
        assert_eq!((s2.offset, s2.size, s2.dts), (1_300, 150, 6_000));
    }

    #[test]
    fn offsets_across_chunks() {
        let t = tables(
            vec![SttsEntry {
                count: 3,
                delta: 512,
            }],
            vec![
                StscEntry {
                    first_chunk: 1,
                    samples_per_chunk: 2,
                },
                StscEntry {
                    first_chunk: 2,
                    samples_per_chunk: 1,
                },
            ],
            vec![100, 200, 300],
            vec![1_000, 5_000],
            vec![],
        );
        let table = SampleTable::build(48_000, 1_536, &t).unwrap();

        assert_eq!(table.get(0).unwrap().offset, 1_000);
        assert_eq!(table.get(1).unwrap().offset, 1_100);
        assert_eq!(table.get(2).unwrap().offset, 5_000);
        // empty stss => everything is sync
        assert!(table.get(2).unwrap().is_sync);
    }

    #[test]
    fn stts_shorter_than_samples_reuses_last_delta() {
        let t = tables(
            vec![SttsEntry {
                count: 2,
                delta: 1_000,
            }],
            vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 4,
            }],
            vec![10; 4],
            vec![0],
            vec![],
        );
        let table = SampleTable::build(1_000_000, 4_000, &t).unwrap();
        assert_eq!(table.get(3).unwrap().dts, 3_000);
    }

    #[test]
    fn mismatched_tables_rejected() {
        let t = tables(
            vec![SttsEntry {
                count: 3,
                delta: 100,
            }],
            vec![StscEntry {
                first_chunk: 1,
                samples_per_chunk: 2,
            }],
            vec![10, 10, 10],
            vec![0], // one chunk of 2 can't cover 3 samples
            vec![],
        );
        assert!(SampleTable::build(1_000, 300, &t).is_err());
    }

    #[test]
    fn microsecond_conversion() {
        let table = second_spaced_table();
        assert_eq!(table.dts_us(0), 0);
        assert_eq!(table.dts_us(3), 3_000_000);
        assert_eq!(table.duration_us(), 10_000_000);
    }

    #[test]
    fn sync_at_or_before() {
        let table = second_spaced_table();
        // syncs at 0 s, 3 s, 6 s
        assert_eq!(table.sync_at_or_before_us(0), Some(0));
        assert_eq!(table.sync_at_or_before_us(2_500_000), Some(0));
        assert_eq!(table.sync_at_or_before_us(5_000_000), Some(3));
        assert_eq!(table.sync_at_or_before_us(8_000_000), Some(6));
    }

    #[test]
    fn sync_before_index() {
        let table = second_spaced_table();
        assert_eq!(table.sync_before_index(0), None);
        assert_eq!(table.sync_before_index(3), Some(0));
        assert_eq!(table.sync_before_index(5), Some(3));
        assert_eq!(table.sync_before_index(9), Some(6));
    }

    #[test]
    fn sync_time_queries() {
        let table = second_spaced_table();

        assert_eq!(table.next_sync_after_us(0, true), Some(3_000_000));
        assert_eq!(table.next_sync_after_us(0, false), Some(0));
        assert_eq!(table.next_sync_after_us(6_000_000, true), None);

        assert_eq!(table.prev_sync_before_us(3_000_000, true), Some(0));
        assert_eq!(table.prev_sync_before_us(3_000_000, false), Some(3_000_000));
        assert_eq!(table.prev_sync_before_us(0, true), None);
    }

    #[test]
    fn empty_table() {
        let t = tables(vec![], vec![], vec![], vec![], vec![]);
        let table = SampleTable::build(90_000, 0, &t).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.sample_at_or_before_us(100), None);
        assert_eq!(table.sync_at_or_before_us(100), None);
    }
}
