//! `TimeSeriesPartition`: the shard-local container for one `PartKey`'s
//! chunks. Mutated only by the owning shard's ingest path; scans snapshot
//! the chunk list under a read lock so reads never block ingest for long.
use data_types::PartKey;

use crate::chunk::{Chunk, ChunkId, ChunkLimits};

/// A single ingested sample batch entry.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: usize,
    pub dropped_late: usize,
}

pub struct TimeSeriesPartition {
    part_key: PartKey,
    /// All chunks, ascending by time range; the last one is the write
    /// chunk unless it has just sealed and a new one hasn't been
    /// allocated yet (never observable outside `append_samples`).
    chunks: Vec<Chunk>,
    next_chunk_id: u64,
    limits: ChunkLimits,
    /// Wall-clock millis of the last accepted sample, used for LRU
    /// eviction ordering.
    last_ingest_time_ms: i64,
}

impl TimeSeriesPartition {
    pub fn new(part_key: PartKey, limits: ChunkLimits) -> Self {
        let id = ChunkId(0);
        Self {
            part_key,
            chunks: vec![Chunk::new(id)],
            next_chunk_id: 1,
            limits,
            last_ingest_time_ms: i64::MIN,
        }
    }

    pub fn part_key(&self) -> &PartKey {
        &self.part_key
    }

    pub fn last_ingest_time_ms(&self) -> i64 {
        self.last_ingest_time_ms
    }

    fn write_chunk_mut(&mut self) -> &mut Chunk {
        if self.chunks.last().map(|c| c.is_sealed()).unwrap_or(true) {
            let id = ChunkId(self.next_chunk_id);
            self.next_chunk_id += 1;
            self.chunks.push(Chunk::new(id));
        }
        self.chunks.last_mut().unwrap()
    }

    /// Append samples in timestamp order, sealing the write chunk and
    /// rolling a fresh one whenever its limits are hit. Samples whose
    /// timestamp does not strictly exceed the write chunk's current last
    /// timestamp are dropped (the root spec's late-arrival policy).
    pub fn ingest(&mut self, samples: &[Sample], now_ms: i64) -> IngestStats {
        let mut stats = IngestStats::default();
        for s in samples {
            let chunk = self.write_chunk_mut();
            if chunk.append(s.timestamp_ms, s.value) {
                stats.accepted += 1;
                self.last_ingest_time_ms = now_ms;
                if chunk.should_seal(&self.limits) {
                    chunk.seal();
                }
            } else {
                stats.dropped_late += 1;
            }
        }
        stats
    }

    /// Evict chunks entirely before `earliest_retained_ms`, per the
    /// retention invariant: chunks whose `lastTimestamp < e_T` are
    /// evictable and must not be returned by scans of ranges entirely
    /// before `e_T`.
    pub fn evict_expired_chunks(&mut self, earliest_retained_ms: i64) {
        self.chunks
            .retain(|c| c.last_timestamp().map(|t| t >= earliest_retained_ms).unwrap_or(true));
        if self.chunks.is_empty() {
            let id = ChunkId(self.next_chunk_id);
            self.next_chunk_id += 1;
            self.chunks.push(Chunk::new(id));
        }
    }

    /// `true` if any chunk's `[min, max]` range intersects `[start, end]`.
    pub fn could_satisfy_time_range(&self, start: i64, end: i64) -> bool {
        self.chunks.iter().any(|c| c.overlaps(start, end))
    }

    /// All samples across chunks whose range intersects `[start, end]`,
    /// filtered to exactly that range and in ascending timestamp order
    /// (chunk ranges are non-overlapping and ascending, so concatenation
    /// alone preserves order).
    pub fn scan(&self, start: i64, end: i64) -> Vec<(i64, f64)> {
        self.chunks
            .iter()
            .filter(|c| c.overlaps(start, end))
            .flat_map(|c| c.samples_in_range(start, end))
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk() -> PartKey {
        PartKey::new([("_metric_".to_string(), "foo".to_string())])
    }

    fn limits(max_chunk_size: usize) -> ChunkLimits {
        ChunkLimits {
            max_chunk_size,
            chunk_duration_ms: i64::MAX,
        }
    }

    #[test]
    fn ingest_seals_and_rolls_chunks() {
        let mut p = TimeSeriesPartition::new(pk(), limits(2));
        let samples: Vec<_> = (0..5)
            .map(|i| Sample {
                timestamp_ms: i * 10,
                value: i as f64,
            })
            .collect();
        let stats = p.ingest(&samples, 1_000);
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.dropped_late, 0);
        assert_eq!(p.chunk_count(), 3); // [0,10] sealed, [20,30] sealed, [40] open
    }

    #[test]
    fn late_arrivals_are_dropped() {
        let mut p = TimeSeriesPartition::new(pk(), limits(100));
        p.ingest(
            &[
                Sample { timestamp_ms: 100, value: 1.0 },
                Sample { timestamp_ms: 50, value: 2.0 },
                Sample { timestamp_ms: 150, value: 3.0 },
            ],
            1_000,
        );
        let stats = p.ingest(&[Sample { timestamp_ms: 90, value: 9.0 }], 1_001);
        assert_eq!(stats.dropped_late, 1);
        assert_eq!(p.scan(0, 200), vec![(100, 1.0), (150, 3.0)]);
    }

    #[test]
    fn evicts_chunks_before_retention_boundary() {
        let mut p = TimeSeriesPartition::new(pk(), limits(1));
        p.ingest(
            &[
                Sample { timestamp_ms: 0, value: 0.0 },
                Sample { timestamp_ms: 100, value: 1.0 },
                Sample { timestamp_ms: 200, value: 2.0 },
            ],
            1_000,
        );
        p.evict_expired_chunks(150);
        assert_eq!(p.scan(0, 300), vec![(200, 2.0)]);
    }

    #[test]
    fn scan_never_returns_samples_outside_range() {
        let mut p = TimeSeriesPartition::new(pk(), limits(2));
        p.ingest(
            &(0..10)
                .map(|i| Sample { timestamp_ms: i * 10, value: i as f64 })
                .collect::<Vec<_>>(),
            1_000,
        );
        let got = p.scan(25, 55);
        assert!(got.iter().all(|(t, _)| *t >= 25 && *t <= 55));
        assert_eq!(got, vec![(30, 3.0), (40, 4.0), (50, 5.0)]);
    }
}
