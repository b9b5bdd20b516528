use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Per-query planner parameters, carried from the wire request (§6) through
/// every planner layer.
#[derive(Debug, Clone)]
pub struct PlannerParams {
    /// Overrides the dataset's computed spread for this query only.
    pub spread_override: Option<u32>,
    pub query_timeout_millis: u64,
    /// Caps the number of samples a single leaf may materialize; breach
    /// surfaces as `QueryError::SampleLimitExceeded`.
    pub sample_limit: usize,
    /// Whether the multi-partition planner may fan out to remote
    /// partitions at all.
    pub process_multi_partition: bool,
    /// Downgrade `ShardNotAvailable` to a partial result instead of a hard
    /// `QueryError`.
    pub allow_partial_results: bool,
    /// Upper bound on shards a single query may touch before
    /// `QueryError::TooManyShardsQueried`.
    pub max_shards_queried: usize,
}

impl Default for PlannerParams {
    fn default() -> Self {
        Self {
            spread_override: None,
            query_timeout_millis: 30_000,
            sample_limit: 1_000_000,
            process_multi_partition: true,
            allow_partial_results: false,
            max_shards_queried: 64,
        }
    }
}

/// Immutable per-query configuration: the wire-level PromQL request plus
/// [`PlannerParams`]. Split from the mutable [`QueryStats`] accumulator the
/// way the root spec's design notes direct (§9: "Shared, mutable
/// `QueryContext`" is re-architected as immutable config + an explicit
/// atomic counter bundle).
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: String,
    pub start_secs: i64,
    pub step_secs: i64,
    pub end_secs: i64,
    pub planner_params: PlannerParams,
}

impl QueryContext {
    pub fn new(
        query_id: impl Into<String>,
        start_secs: i64,
        step_secs: i64,
        end_secs: i64,
        planner_params: PlannerParams,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            start_secs,
            step_secs,
            end_secs,
            planner_params,
        }
    }

    pub fn start_ms(&self) -> i64 {
        self.start_secs * 1000
    }

    pub fn end_ms(&self) -> i64 {
        self.end_secs * 1000
    }

    pub fn step_ms(&self) -> i64 {
        self.step_secs.max(1) * 1000
    }
}

/// Mutable query-execution statistics, accumulated concurrently across
/// leaves with plain atomics rather than a lock (the root spec's §9
/// guidance: "mutable `QueryStats` accumulator passed through by explicit
/// ownership").
#[derive(Debug, Default)]
pub struct QueryStats {
    samples_scanned: AtomicU64,
    chunks_scanned: AtomicU64,
    shards_queried: AtomicU64,
    partitions_scanned: AtomicU64,
    /// Set when planning skipped an unavailable shard under
    /// `PlannerParams::allow_partial_results`; the dispatcher reads this to
    /// mark the final `QueryResult` partial.
    shard_unavailable: AtomicBool,
}

impl QueryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_samples_scanned(&self, n: u64) {
        self.samples_scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_chunks_scanned(&self, n: u64) {
        self.chunks_scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_shards_queried(&self, n: u64) {
        self.shards_queried.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_partitions_scanned(&self, n: u64) {
        self.partitions_scanned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn samples_scanned(&self) -> u64 {
        self.samples_scanned.load(Ordering::Relaxed)
    }

    pub fn chunks_scanned(&self) -> u64 {
        self.chunks_scanned.load(Ordering::Relaxed)
    }

    pub fn shards_queried(&self) -> u64 {
        self.shards_queried.load(Ordering::Relaxed)
    }

    pub fn partitions_scanned(&self) -> u64 {
        self.partitions_scanned.load(Ordering::Relaxed)
    }

    pub fn mark_shard_unavailable(&self) {
        self.shard_unavailable.store(true, Ordering::Relaxed);
    }

    pub fn shard_unavailable(&self) -> bool {
        self.shard_unavailable.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let stats = QueryStats::new();
        stats.add_samples_scanned(10);
        stats.add_samples_scanned(5);
        assert_eq!(stats.samples_scanned(), 15);
    }

    #[test]
    fn context_converts_secs_to_ms() {
        let ctx = QueryContext::new("q1", 100, 10, 200, PlannerParams::default());
        assert_eq!(ctx.start_ms(), 100_000);
        assert_eq!(ctx.end_ms(), 200_000);
        assert_eq!(ctx.step_ms(), 10_000);
    }
}
