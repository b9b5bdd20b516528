//! `TimeSeriesMemStore`: the top-level, process-wide handle onto every
//! dataset's shards. One [`Shard`] per `(dataset, shard id)`, set up once
//! and then ingested into and scanned concurrently.
use std::sync::Arc;

use data_types::{ColumnFilter, EvictionPolicy, ShardId, TierConfigRef};
use hashbrown::HashMap;
use parking_lot::RwLock;
use schema::DatasetRef;
use snafu::Snafu;

use crate::chunk::ChunkLimits;
use crate::partition::{IngestStats, Sample};
use crate::shard::Shard;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("shard {shard} of dataset {dataset} is already set up"))]
    ShardAlreadySetup { dataset: String, shard: ShardId },
    #[snafu(display("shard {shard} of dataset {dataset} was never set up"))]
    ShardNotSetup { dataset: String, shard: ShardId },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ShardKey {
    dataset: DatasetKeyHandle,
    shard: ShardId,
}

/// `DatasetRef` wraps a `String`, which isn't `Copy`; interning it behind
/// an index keeps [`ShardKey`] cheap to hash and clone for every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DatasetKeyHandle(u32);

/// Shard-local chunked store for every dataset this process serves.
///
/// A `RwLock<Shard>` per key mirrors the read_buffer table's pattern: the
/// lock is only ever held long enough to mutate one shard's partitions or
/// to borrow it read-only for a scan, never across an actual I/O or
/// compute-heavy step.
pub struct TimeSeriesMemStore {
    datasets: RwLock<HashMap<DatasetRef, DatasetKeyHandle>>,
    shards: RwLock<HashMap<ShardKey, Arc<RwLock<Shard>>>>,
    next_dataset_handle: RwLock<u32>,
}

impl std::fmt::Debug for TimeSeriesMemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesMemStore")
            .field("datasets", &self.datasets.read().len())
            .field("shards", &self.shards.read().len())
            .finish()
    }
}

impl Default for TimeSeriesMemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesMemStore {
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
            next_dataset_handle: RwLock::new(0),
        }
    }

    fn handle_for(&self, dataset: &DatasetRef) -> DatasetKeyHandle {
        if let Some(handle) = self.datasets.read().get(dataset) {
            return *handle;
        }
        let mut datasets = self.datasets.write();
        if let Some(handle) = datasets.get(dataset) {
            return *handle;
        }
        let mut next = self.next_dataset_handle.write();
        let handle = DatasetKeyHandle(*next);
        *next += 1;
        datasets.insert(dataset.clone(), handle);
        handle
    }

    /// Idempotency guard: fails if this `(dataset, shard)` pair already has
    /// a shard allocated, matching the root spec's `setup` contract.
    pub fn setup(&self, dataset: &DatasetRef, shard_id: ShardId, tier: &TierConfigRef) -> Result<()> {
        let key = ShardKey {
            dataset: self.handle_for(dataset),
            shard: shard_id,
        };
        let mut shards = self.shards.write();
        if shards.contains_key(&key) {
            return ShardAlreadySetupSnafu {
                dataset: dataset.to_string(),
                shard: shard_id,
            }
            .fail();
        }
        let limits = ChunkLimits {
            max_chunk_size: tier.max_chunk_size,
            chunk_duration_ms: tier.chunk_duration_ms,
        };
        shards.insert(key, Arc::new(RwLock::new(Shard::new(limits, tier.eviction_policy))));
        Ok(())
    }

    fn shard_handle(&self, dataset: &DatasetRef, shard_id: ShardId) -> Result<Arc<RwLock<Shard>>> {
        let key = ShardKey {
            dataset: self.handle_for(dataset),
            shard: shard_id,
        };
        self.shards.read().get(&key).cloned().ok_or_else(|| {
            Error::ShardNotSetup {
                dataset: dataset.to_string(),
                shard: shard_id,
            }
        })
    }

    pub fn ingest(
        &self,
        dataset: &DatasetRef,
        shard_id: ShardId,
        part_key: data_types::PartKey,
        samples: &[Sample],
        now_ms: i64,
    ) -> Result<IngestStats> {
        let shard = self.shard_handle(dataset, shard_id)?;
        Ok(shard.write().ingest(part_key, samples, now_ms))
    }

    /// Drops chunks whose data has aged out of `tier`'s retention window.
    pub fn evict_expired(&self, dataset: &DatasetRef, shard_id: ShardId, tier: &TierConfigRef) -> Result<()> {
        let shard = self.shard_handle(dataset, shard_id)?;
        shard.write().evict_expired_chunks(tier.earliest_retained_timestamp_ms());
        Ok(())
    }

    pub fn scan(
        &self,
        dataset: &DatasetRef,
        shard_id: ShardId,
        filters: &[ColumnFilter],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(data_types::PartKey, Vec<(i64, f64)>)>> {
        let shard = self.shard_handle(dataset, shard_id)?;
        let guard = shard.read();
        Ok(guard
            .scan(filters, start_ms, end_ms)
            .into_iter()
            .map(|(k, rows)| (k.clone(), rows))
            .collect())
    }

    pub fn label_names(&self, dataset: &DatasetRef, shard_id: ShardId, filters: &[ColumnFilter]) -> Result<Vec<String>> {
        let shard = self.shard_handle(dataset, shard_id)?;
        Ok(shard.read().label_names(filters))
    }

    pub fn label_values(
        &self,
        dataset: &DatasetRef,
        shard_id: ShardId,
        filters: &[ColumnFilter],
        labels: &[String],
    ) -> Result<Vec<data_types::PartKey>> {
        let shard = self.shard_handle(dataset, shard_id)?;
        Ok(shard.read().label_values(filters, labels))
    }

    pub fn topk_cardinality(
        &self,
        dataset: &DatasetRef,
        shard_id: ShardId,
        shard_key_prefix: &[ColumnFilter],
        metric_column: &str,
        k: usize,
    ) -> Result<Vec<(String, usize)>> {
        let shard = self.shard_handle(dataset, shard_id)?;
        Ok(shard.read().topk_cardinality(shard_key_prefix, metric_column, k))
    }

    pub fn label_cardinality(
        &self,
        dataset: &DatasetRef,
        shard_id: ShardId,
        filters: &[ColumnFilter],
    ) -> Result<HashMap<String, usize>> {
        let shard = self.shard_handle(dataset, shard_id)?;
        Ok(shard.read().label_cardinality(filters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{PartKey, TierKind};
    use std::sync::Arc as StdArc;
    use time_provider::{MockProvider, Time};

    fn tier(max_partitions: usize) -> TierConfigRef {
        let clock = StdArc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        StdArc::new(
            data_types::TierConfig::new(TierKind::Raw, 3_600_000, clock)
                .with_eviction_policy(EvictionPolicy::fixed_max_partitions(max_partitions)),
        )
    }

    #[test]
    fn setup_is_idempotent_guarded() {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        let t = tier(10);
        store.setup(&dataset, ShardId::new(0), &t).unwrap();
        let err = store.setup(&dataset, ShardId::new(0), &t).unwrap_err();
        assert!(matches!(err, Error::ShardAlreadySetup { .. }));
    }

    #[test]
    fn ingest_and_scan_round_trip() {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        store.setup(&dataset, ShardId::new(0), &tier(10)).unwrap();

        let pk = PartKey::new([("_metric_".to_string(), "up".to_string())]);
        store
            .ingest(
                &dataset,
                ShardId::new(0),
                pk,
                &[Sample { timestamp_ms: 0, value: 1.0 }, Sample { timestamp_ms: 10, value: 1.0 }],
                100,
            )
            .unwrap();

        let rows = store
            .scan(&dataset, ShardId::new(0), &[ColumnFilter::equals("_metric_", "up")], 0, 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, vec![(0, 1.0), (10, 1.0)]);
    }

    #[test]
    fn operations_against_unsetup_shard_error() {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        let err = store.scan(&dataset, ShardId::new(0), &[], 0, 10).unwrap_err();
        assert!(matches!(err, Error::ShardNotSetup { .. }));
    }

    #[test]
    fn separate_datasets_do_not_share_shards() {
        let store = TimeSeriesMemStore::new();
        let a = DatasetRef::new("a");
        let b = DatasetRef::new("b");
        store.setup(&a, ShardId::new(0), &tier(10)).unwrap();
        store.setup(&b, ShardId::new(0), &tier(10)).unwrap();

        let pk = PartKey::new([("_metric_".to_string(), "up".to_string())]);
        store
            .ingest(&a, ShardId::new(0), pk, &[Sample { timestamp_ms: 0, value: 1.0 }], 0)
            .unwrap();

        assert!(store
            .scan(&b, ShardId::new(0), &[ColumnFilter::equals("_metric_", "up")], 0, 0)
            .unwrap()
            .is_empty());
    }
}
