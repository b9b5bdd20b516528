//! Deterministic shard-key hashing and dynamic spread computation.
//!
//! `shardId = hash(shardKeyColumns) mod numShards`. "Spread" is
//! `log2(number of shards queried for a shard-key class)` and may change
//! over time (e.g. a dataset re-sharded from 2 to 4 shards); the
//! single-cluster planner asks a [`SpreadProvider`] for the spread in
//! effect at a given timestamp and splits the query range at any change
//! point it finds.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs, missing_debug_implementations, clippy::use_self)]

use std::hash::Hasher;

use data_types::ShardId;
use observability_deps::tracing::trace;
use siphasher::sip::SipHasher13;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("numShards must be a power of two greater than zero, got {num_shards}"))]
    NumShardsNotPowerOfTwo { num_shards: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Hashes ordered `(column, value)` shard-key pairs into a [`ShardId`] in
/// `[0, num_shards)`.
#[derive(Debug, Clone, Copy)]
pub struct ShardHasher {
    num_shards: u32,
}

impl ShardHasher {
    pub fn new(num_shards: u32) -> Result<Self> {
        if num_shards == 0 || !num_shards.is_power_of_two() {
            return NumShardsNotPowerOfTwoSnafu { num_shards }.fail();
        }
        Ok(Self { num_shards })
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Hash shard-key `(column, value)` pairs, in the dataset's configured
    /// `shard_key_columns` order, to a concrete [`ShardId`].
    pub fn shard_for<'a>(&self, shard_key: impl IntoIterator<Item = (&'a str, &'a str)>) -> ShardId {
        let mut hasher = SipHasher13::new();
        for (col, val) in shard_key {
            hasher.write(col.as_bytes());
            hasher.write_u8(0);
            hasher.write(val.as_bytes());
            hasher.write_u8(0);
        }
        let h = hasher.finish();
        let id = (h % self.num_shards as u64) as u32;
        trace!(shard_id = id, "hashed shard key");
        ShardId::new(id)
    }

    /// `spread = log2(shardsToQuery)`. `shards_to_query` must be a power
    /// of two dividing `num_shards`.
    pub fn spread_for_shard_count(shards_to_query: u32) -> u32 {
        32 - shards_to_query.leading_zeros() - 1
    }

    /// The concrete shard ids a query at `spread` touches for one shard-key
    /// class, given the class's base shard (spread 0 touches only
    /// `base_shard` itself; `spread = spread_for_shard_count(num_shards)`
    /// touches every shard).
    pub fn shards_at_spread(&self, base_shard: ShardId, spread: u32) -> Vec<ShardId> {
        let count = (1u32 << spread).clamp(1, self.num_shards);
        let group_start = (base_shard.get() / count) * count;
        (0..count).map(|i| ShardId::new(group_start + i)).collect()
    }
}

/// A single timestamp after which the spread for a shard-key class
/// changes, as produced by a [`SpreadProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadChange {
    pub effective_at_ms: i64,
    pub spread: u32,
}

/// `FunctionalSpreadProvider`: reports the spread in effect for a
/// shard-key class over time. The single-cluster planner uses this to
/// detect spread changes within `[startMs, endMs]` and split the query at
/// each change point.
pub trait SpreadProvider: std::fmt::Debug + Send + Sync {
    /// All spread changes whose `effective_at_ms` falls within
    /// `[start_ms, end_ms]`, ascending by time. An empty result means the
    /// spread was constant over the range.
    fn changes_in_range(&self, start_ms: i64, end_ms: i64) -> Vec<SpreadChange>;

    /// The spread in effect at `at_ms`.
    fn spread_at(&self, at_ms: i64) -> u32;
}

/// A [`SpreadProvider`] with a fixed spread for all time — the common
/// case where a dataset's shard count never changes.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpreadProvider {
    spread: u32,
}

impl ConstantSpreadProvider {
    pub fn new(spread: u32) -> Self {
        Self { spread }
    }
}

impl SpreadProvider for ConstantSpreadProvider {
    fn changes_in_range(&self, _start_ms: i64, _end_ms: i64) -> Vec<SpreadChange> {
        Vec::new()
    }

    fn spread_at(&self, _at_ms: i64) -> u32 {
        self.spread
    }
}

/// A [`SpreadProvider`] driven by an explicit, ascending schedule of
/// `(effective_at_ms, spread)` changes — used in tests and for datasets
/// that have been resharded a known number of times.
#[derive(Debug, Clone)]
pub struct ScheduledSpreadProvider {
    initial_spread: u32,
    schedule: Vec<SpreadChange>,
}

impl ScheduledSpreadProvider {
    pub fn new(initial_spread: u32, schedule: Vec<SpreadChange>) -> Self {
        debug_assert!(
            schedule.windows(2).all(|w| w[0].effective_at_ms < w[1].effective_at_ms),
            "spread schedule must be strictly ascending in time"
        );
        Self {
            initial_spread,
            schedule,
        }
    }
}

impl SpreadProvider for ScheduledSpreadProvider {
    fn changes_in_range(&self, start_ms: i64, end_ms: i64) -> Vec<SpreadChange> {
        self.schedule
            .iter()
            .filter(|c| c.effective_at_ms > start_ms && c.effective_at_ms <= end_ms)
            .copied()
            .collect()
    }

    fn spread_at(&self, at_ms: i64) -> u32 {
        self.schedule
            .iter()
            .rev()
            .find(|c| c.effective_at_ms <= at_ms)
            .map(|c| c.spread)
            .unwrap_or(self.initial_spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_order_independent_within_fixed_column_order() {
        let hasher = ShardHasher::new(8).unwrap();
        let a = hasher.shard_for([("_ws_", "demo"), ("_ns_", "app")]);
        let b = hasher.shard_for([("_ws_", "demo"), ("_ns_", "app")]);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_non_power_of_two_shard_counts() {
        assert!(matches!(
            ShardHasher::new(6),
            Err(Error::NumShardsNotPowerOfTwo { num_shards: 6 })
        ));
    }

    #[test]
    fn spread_for_shard_count_is_log2() {
        assert_eq!(ShardHasher::spread_for_shard_count(1), 0);
        assert_eq!(ShardHasher::spread_for_shard_count(2), 1);
        assert_eq!(ShardHasher::spread_for_shard_count(8), 3);
    }

    #[test]
    fn shards_at_spread_zero_is_single_shard_group() {
        let hasher = ShardHasher::new(8).unwrap();
        let shards = hasher.shards_at_spread(ShardId::new(5), 0);
        assert_eq!(shards.len(), 1);
    }

    #[test]
    fn shards_at_max_spread_is_all_shards() {
        let hasher = ShardHasher::new(8).unwrap();
        let shards = hasher.shards_at_spread(ShardId::new(5), 3);
        assert_eq!(shards.len(), 8);
    }

    #[test]
    fn scheduled_spread_reports_changes_within_window() {
        let provider = ScheduledSpreadProvider::new(
            1,
            vec![SpreadChange {
                effective_at_ms: 1_000,
                spread: 2,
            }],
        );
        assert_eq!(provider.spread_at(500), 1);
        assert_eq!(provider.spread_at(1_500), 2);
        assert_eq!(provider.changes_in_range(0, 2_000).len(), 1);
        assert_eq!(provider.changes_in_range(0, 500).len(), 0);
    }
}
