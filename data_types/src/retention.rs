use std::sync::Arc;

use observability_deps::tracing::debug;
use time_provider::TimeProviderRef;

/// Which retention class a single-cluster planner compiles against.
/// `RecordingRules` differs from `Raw` only in its retention knobs (own
/// retention, no downsampling) — see the routing rule in the
/// single-partition planner/selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    Raw,
    Downsample,
    RecordingRules,
}

/// `FixedMaxPartitionsEvictionPolicy(maxPartitions)`: when a shard's
/// partition count would exceed `max_partitions`, evict by LRU of last
/// ingest time until back under the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_partitions: usize,
}

impl EvictionPolicy {
    pub fn fixed_max_partitions(max_partitions: usize) -> Self {
        Self { max_partitions }
    }

    pub fn over_budget(&self, current_partitions: usize) -> bool {
        let over = current_partitions > self.max_partitions;
        if over {
            debug!(current_partitions, max = self.max_partitions, "partition count over eviction budget");
        }
        over
    }
}

/// Per-tier retention and chunking configuration.
#[derive(Clone)]
pub struct TierConfig {
    pub kind: TierKind,
    /// `max-chunk-size`: a write chunk seals after this many samples.
    pub max_chunk_size: usize,
    /// `chunk-duration`: a write chunk seals after spanning this long.
    pub chunk_duration_ms: i64,
    /// `shard-mem-size`: soft memory budget per shard, used by embedders
    /// to size `max_partitions`; the core only consumes the derived
    /// `eviction_policy`.
    pub shard_mem_size_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    /// Threshold above which the single-cluster planner inserts a
    /// two-level aggregation reduce (`reduceShardsPerNode`).
    pub reduce_shards_per_node: usize,
    /// Upper bound on subquery nesting depth (Open Question in the root
    /// spec; decided and made an explicit config value here).
    pub max_subquery_nesting_depth: usize,
    time_provider: TimeProviderRef,
    /// How long, measured back from "now", this tier still retains data.
    retention_duration_ms: i64,
}

impl std::fmt::Debug for TierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierConfig")
            .field("kind", &self.kind)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("chunk_duration_ms", &self.chunk_duration_ms)
            .field("shard_mem_size_bytes", &self.shard_mem_size_bytes)
            .field("eviction_policy", &self.eviction_policy)
            .field("reduce_shards_per_node", &self.reduce_shards_per_node)
            .field(
                "max_subquery_nesting_depth",
                &self.max_subquery_nesting_depth,
            )
            .field("retention_duration_ms", &self.retention_duration_ms)
            .finish()
    }
}

impl TierConfig {
    pub fn new(
        kind: TierKind,
        retention_duration_ms: i64,
        time_provider: TimeProviderRef,
    ) -> Self {
        Self {
            kind,
            max_chunk_size: 1_000_000,
            chunk_duration_ms: 24 * 60 * 60 * 1000,
            shard_mem_size_bytes: 1 << 30,
            eviction_policy: EvictionPolicy::fixed_max_partitions(1_000_000),
            reduce_shards_per_node: 4,
            max_subquery_nesting_depth: 5,
            time_provider,
            retention_duration_ms,
        }
    }

    /// `earliestRetainedTimestampFn()`: the earliest timestamp this tier
    /// still retains, evaluated against the current wall clock.
    pub fn earliest_retained_timestamp_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis() - self.retention_duration_ms
    }

    pub fn with_chunking(mut self, max_chunk_size: usize, chunk_duration_ms: i64) -> Self {
        self.max_chunk_size = max_chunk_size;
        self.chunk_duration_ms = chunk_duration_ms;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_reduce_shards_per_node(mut self, n: usize) -> Self {
        self.reduce_shards_per_node = n;
        self
    }
}

/// Shared handle to a [`TierConfig`], the form planners actually hold.
pub type TierConfigRef = Arc<TierConfig>;
