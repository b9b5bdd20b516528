//! A chunk is an append-only, sorted-by-timestamp run of samples for one
//! partition. Exactly one chunk per partition is the *write chunk*; the
//! rest are sealed and immutable (root spec's Data Model, `TimeSeriesPartition`).
use std::fmt;

/// Bounds a write chunk's lifetime: it seals when either bound is hit,
/// whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub max_chunk_size: usize,
    pub chunk_duration_ms: i64,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_chunk_size: 1_000,
            chunk_duration_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

/// One chunk's samples. Within a chunk, timestamps strictly increase (a
/// Data Model invariant); enforced by [`Chunk::append`] rejecting
/// non-increasing timestamps rather than silently reordering.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    samples: Vec<(i64, f64)>,
    sealed: bool,
}

impl Chunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            samples: Vec::new(),
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.samples.first().map(|(t, _)| *t)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.samples.last().map(|(t, _)| *t)
    }

    /// `true` if this chunk could hold any sample in `[start, end]`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        match (self.first_timestamp(), self.last_timestamp()) {
            (Some(first), Some(last)) => first <= end && last >= start,
            _ => false,
        }
    }

    /// Appends a sample. Returns `false` (and drops the sample) if
    /// `t` is not strictly greater than the current last timestamp — the
    /// late-arrival policy from the root spec's §4.1 `ingest`.
    pub fn append(&mut self, t: i64, v: f64) -> bool {
        if self.sealed {
            return false;
        }
        if let Some(last) = self.last_timestamp() {
            if t <= last {
                return false;
            }
        }
        self.samples.push((t, v));
        true
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Should this write chunk seal given `limits`?
    pub fn should_seal(&self, limits: &ChunkLimits) -> bool {
        if self.samples.len() >= limits.max_chunk_size {
            return true;
        }
        match (self.first_timestamp(), self.last_timestamp()) {
            (Some(first), Some(last)) => last - first >= limits.chunk_duration_ms,
            _ => false,
        }
    }

    /// Samples with `start <= t <= end`, in ascending order.
    pub fn samples_in_range(&self, start: i64, end: i64) -> impl Iterator<Item = (i64, f64)> + '_ {
        let lo = self.samples.partition_point(|(t, _)| *t < start);
        self.samples[lo..]
            .iter()
            .take_while(move |(t, _)| *t <= end)
            .copied()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk[{}]({} samples, sealed={})",
            self.id.0,
            self.len(),
            self.sealed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_increasing_timestamps() {
        let mut c = Chunk::new(ChunkId(0));
        assert!(c.append(10, 1.0));
        assert!(!c.append(10, 2.0));
        assert!(!c.append(5, 2.0));
        assert!(c.append(11, 2.0));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn seals_on_size_limit() {
        let limits = ChunkLimits {
            max_chunk_size: 2,
            chunk_duration_ms: i64::MAX,
        };
        let mut c = Chunk::new(ChunkId(0));
        c.append(0, 1.0);
        assert!(!c.should_seal(&limits));
        c.append(1, 1.0);
        assert!(c.should_seal(&limits));
    }

    #[test]
    fn seals_on_duration_limit() {
        let limits = ChunkLimits {
            max_chunk_size: usize::MAX,
            chunk_duration_ms: 100,
        };
        let mut c = Chunk::new(ChunkId(0));
        c.append(0, 1.0);
        c.append(50, 1.0);
        assert!(!c.should_seal(&limits));
        c.append(100, 1.0);
        assert!(c.should_seal(&limits));
    }

    #[test]
    fn samples_in_range_is_bounded() {
        let mut c = Chunk::new(ChunkId(0));
        for t in (0..100).step_by(10) {
            c.append(t, t as f64);
        }
        let got: Vec<_> = c.samples_in_range(20, 50).collect();
        assert_eq!(got, vec![(20, 20.0), (30, 30.0), (40, 40.0), (50, 50.0)]);
    }
}
