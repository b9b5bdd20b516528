//! One shard's worth of partitions plus their shared inverted index.
//! Owned exclusively by its single ingest task; scans borrow immutably.
use data_types::{ColumnFilter, EvictionPolicy, PartKey};
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};

use crate::chunk::ChunkLimits;
use crate::index::InvertedIndex;
use crate::partition::{IngestStats, Sample, TimeSeriesPartition};

/// A slot id local to one shard, assigned on first ingest for its
/// `PartKey` and reused (after eviction) for a later, unrelated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(pub u32);

pub struct Shard {
    by_key: HashMap<PartKey, PartitionId>,
    slots: Vec<Option<TimeSeriesPartition>>,
    free_ids: Vec<u32>,
    index: InvertedIndex,
    limits: ChunkLimits,
    eviction_policy: EvictionPolicy,
}

impl Shard {
    pub fn new(limits: ChunkLimits, eviction_policy: EvictionPolicy) -> Self {
        Self {
            by_key: HashMap::new(),
            slots: Vec::new(),
            free_ids: Vec::new(),
            index: InvertedIndex::new(),
            limits,
            eviction_policy,
        }
    }

    fn partition_count(&self) -> usize {
        self.by_key.len()
    }

    fn alloc_slot(&mut self, part_key: PartKey) -> PartitionId {
        let partition = TimeSeriesPartition::new(part_key.clone(), self.limits);
        let id = if let Some(id) = self.free_ids.pop() {
            self.slots[id as usize] = Some(partition);
            PartitionId(id)
        } else {
            self.slots.push(Some(partition));
            PartitionId((self.slots.len() - 1) as u32)
        };
        self.index.add(id.0, &part_key);
        self.by_key.insert(part_key, id);
        id
    }

    /// Evicts the least-recently-ingested partition, per
    /// `FixedMaxPartitionsEvictionPolicy`.
    fn evict_one(&mut self) {
        let lru = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i as u32, p.last_ingest_time_ms())))
            .min_by_key(|(_, t)| *t);
        let Some((id, _)) = lru else { return };
        if let Some(partition) = self.slots[id as usize].take() {
            debug!(partition_id = id, "evicting partition by LRU");
            self.index.remove(id, partition.part_key());
            self.by_key.remove(partition.part_key());
            self.free_ids.push(id);
        }
    }

    /// Appends `samples` to the partition for `part_key`, creating it on
    /// first ingest and evicting the LRU partition first if the shard is
    /// at capacity.
    pub fn ingest(&mut self, part_key: PartKey, samples: &[Sample], now_ms: i64) -> IngestStats {
        let id = match self.by_key.get(&part_key) {
            Some(id) => *id,
            None => {
                while self.eviction_policy.over_budget(self.partition_count() + 1) {
                    self.evict_one();
                }
                self.alloc_slot(part_key)
            }
        };
        self.slots[id.0 as usize].as_mut().unwrap().ingest(samples, now_ms)
    }

    /// Drops chunks entirely before `earliest_retained_ms` across every
    /// partition in this shard.
    pub fn evict_expired_chunks(&mut self, earliest_retained_ms: i64) {
        for partition in self.slots.iter_mut().flatten() {
            partition.evict_expired_chunks(earliest_retained_ms);
        }
    }

    /// Partitions whose `PartKey` matches `filters` and whose chunk range
    /// intersects `[start, end]`.
    pub fn scan(&self, filters: &[ColumnFilter], start: i64, end: i64) -> Vec<(&PartKey, Vec<(i64, f64)>)> {
        let candidates = self.index.matching(filters);
        let mut out = Vec::new();
        for id in candidates.iter() {
            let Some(Some(partition)) = self.slots.get(id as usize) else {
                warn!(partition_id = id, "posting referenced a missing partition slot");
                continue;
            };
            if partition.could_satisfy_time_range(start, end) {
                let rows = partition.scan(start, end);
                if !rows.is_empty() {
                    out.push((partition.part_key(), rows));
                }
            }
        }
        out
    }

    pub fn label_names(&self, filters: &[ColumnFilter]) -> Vec<String> {
        let candidates = self.index.matching(filters);
        let mut names: Vec<String> = self
            .index
            .label_names()
            .filter(|name| {
                candidates.iter().any(|id| {
                    self.slots
                        .get(id as usize)
                        .and_then(|s| s.as_ref())
                        .map(|p| p.part_key().get(name).is_some())
                        .unwrap_or(false)
                })
            })
            .map(|s| s.to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// One row per distinct combination `labels` takes on among partitions
    /// matching `filters`; a row carries only the requested labels that are
    /// actually present on that partition's key, omitted labels are simply
    /// absent from the row rather than padded with an empty value.
    pub fn label_values(&self, filters: &[ColumnFilter], labels: &[String]) -> Vec<PartKey> {
        let candidates = self.index.matching(filters);
        let mut rows: Vec<PartKey> = candidates
            .iter()
            .filter_map(|id| self.slots.get(id as usize).and_then(|s| s.as_ref()))
            .map(|p| PartKey::new(labels.iter().filter_map(|label| p.part_key().get(label).map(|v| (label.clone(), v.to_string())))))
            .filter(|row| row.iter().next().is_some())
            .collect();
        rows.sort();
        rows.dedup();
        rows
    }

    /// Top `k` metric names by series count under partitions matching
    /// `shard_key_prefix`.
    pub fn topk_cardinality(&self, shard_key_prefix: &[ColumnFilter], metric_column: &str, k: usize) -> Vec<(String, usize)> {
        let candidates = self.index.matching(shard_key_prefix);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in candidates.iter() {
            if let Some(Some(p)) = self.slots.get(id as usize) {
                if let Some(metric) = p.part_key().metric(metric_column) {
                    *counts.entry(metric.to_string()).or_insert(0) += 1;
                }
            }
        }
        let mut ordered: Vec<_> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ordered.truncate(k);
        ordered
    }

    pub fn label_cardinality(&self, filters: &[ColumnFilter]) -> HashMap<String, usize> {
        let candidates = self.index.matching(filters);
        self.index
            .label_names()
            .map(|name| {
                let count = candidates
                    .iter()
                    .filter_map(|id| self.slots.get(id as usize).and_then(|s| s.as_ref()))
                    .filter_map(|p| p.part_key().get(name))
                    .collect::<std::collections::HashSet<_>>()
                    .len();
                (name.to_string(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(pairs: &[(&str, &str)]) -> PartKey {
        PartKey::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    fn sample(t: i64, v: f64) -> Sample {
        Sample {
            timestamp_ms: t,
            value: v,
        }
    }

    #[test]
    fn ingest_creates_partition_and_is_scannable() {
        let mut shard = Shard::new(ChunkLimits::default(), EvictionPolicy::fixed_max_partitions(10));
        shard.ingest(pk(&[("job", "a")]), &[sample(0, 1.0), sample(10, 2.0)], 1_000);
        let results = shard.scan(&[ColumnFilter::equals("job", "a")], 0, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, vec![(0, 1.0), (10, 2.0)]);
    }

    #[test]
    fn evicts_lru_when_over_budget() {
        let mut shard = Shard::new(ChunkLimits::default(), EvictionPolicy::fixed_max_partitions(1));
        shard.ingest(pk(&[("job", "a")]), &[sample(0, 1.0)], 100);
        shard.ingest(pk(&[("job", "b")]), &[sample(0, 1.0)], 200);

        assert!(shard.scan(&[ColumnFilter::equals("job", "a")], 0, 0).is_empty());
        assert_eq!(shard.scan(&[ColumnFilter::equals("job", "b")], 0, 0).len(), 1);
    }

    #[test]
    fn topk_cardinality_orders_descending() {
        let mut shard = Shard::new(ChunkLimits::default(), EvictionPolicy::fixed_max_partitions(100));
        for i in 0..3 {
            shard.ingest(pk(&[("_metric_", "foo"), ("instance", &i.to_string())]), &[sample(0, 1.0)], 0);
        }
        shard.ingest(pk(&[("_metric_", "bar")]), &[sample(0, 1.0)], 0);

        let top = shard.topk_cardinality(&[], "_metric_", 1);
        assert_eq!(top, vec![("foo".to_string(), 3)]);
    }

    #[test]
    fn label_values_returns_a_multi_column_row_per_matching_partition() {
        let mut shard = Shard::new(ChunkLimits::default(), EvictionPolicy::fixed_max_partitions(100));
        shard.ingest(
            pk(&[("_metric_", "http_req_total"), ("job", "myCoolService"), ("unicode_tag", "uni\u{3c0}tag")]),
            &[sample(0, 1.0)],
            0,
        );
        shard.ingest(pk(&[("_metric_", "http_req_total"), ("job", "other")]), &[sample(0, 1.0)], 0);

        let filters = [ColumnFilter::equals("_metric_", "http_req_total"), ColumnFilter::equals("job", "myCoolService")];
        let labels = ["job".to_string(), "unicode_tag".to_string()];
        let rows = shard.label_values(&filters, &labels);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("job"), Some("myCoolService"));
        assert_eq!(rows[0].get("unicode_tag"), Some("uni\u{3c0}tag"));
    }
}
