//! The recursive `ExecPlan` evaluator: walks the tree, resolving leaves
//! against the chunk store or a remote partition and folding non-leaf nodes
//! through the `transform` module.
use chunk_store::TimeSeriesMemStore;
use data_types::{PartKey, RangeVectorKey};
use futures::future::BoxFuture;
use hashbrown::HashMap;
use remote_client::RemoteClient;

use crate::error::{QueryError, Result};
use crate::plan::{ExecPlan, LeafOp, Transform};
use crate::range_vector::RangeVector;
use crate::session::QuerySession;
use crate::transform;

/// A plan node's result shape. Only [`ExecResult::RangeVectors`] can feed a
/// `Transform`/`BinaryJoin`/`SetOperator`/`Stitch`; the metadata shapes only
/// ever concatenate or reduce with their own kind.
#[derive(Debug)]
pub enum ExecResult {
    RangeVectors(Vec<RangeVector>),
    Labels(Vec<String>),
    /// One multi-column row per distinct combination the requested label
    /// set takes on (§6's `labelValues`) — unlike `Labels`, a row can carry
    /// more than one label's value at once.
    LabelValues(Vec<PartKey>),
    PartKeys(Vec<PartKey>),
    Cardinality(Vec<(String, usize)>),
    LabelCardinality(HashMap<String, usize>),
}

impl ExecResult {
    pub(crate) fn into_range_vectors(self) -> Result<Vec<RangeVector>> {
        match self {
            Self::RangeVectors(rvs) => Ok(rvs),
            other => Err(QueryError::Internal {
                message: format!("expected range vectors, got {}", other.kind()),
            }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::RangeVectors(_) => "range_vectors",
            Self::Labels(_) => "labels",
            Self::LabelValues(_) => "label_values",
            Self::PartKeys(_) => "part_keys",
            Self::Cardinality(_) => "cardinality",
            Self::LabelCardinality(_) => "label_cardinality",
        }
    }
}

fn key_from_part_key(pk: &PartKey) -> RangeVectorKey {
    RangeVectorKey::new(pk.iter().map(|(k, v)| (k.to_string(), v.to_string())))
}

/// Evaluate `plan` against `store`, dispatching `Remote` leaves through
/// `remote`. Boxed recursion: `async fn`s cannot call themselves directly.
pub fn execute<'a>(
    plan: &'a ExecPlan,
    store: &'a TimeSeriesMemStore,
    remote: &'a RemoteClient,
    session: &'a QuerySession,
) -> BoxFuture<'a, Result<ExecResult>> {
    Box::pin(async move {
        match plan {
            ExecPlan::Leaf(leaf) => execute_leaf(leaf, store, session),
            ExecPlan::Transform { input, transform } => {
                let rvs = execute(input, store, remote, session).await?.into_range_vectors()?;
                Ok(ExecResult::RangeVectors(apply_transform(rvs, transform, session)?))
            }
            ExecPlan::BinaryJoin { left, right, op, matching } => {
                let left = execute(left, store, remote, session).await?.into_range_vectors()?;
                let right = execute(right, store, remote, session).await?.into_range_vectors()?;
                Ok(ExecResult::RangeVectors(transform::binary_join(left, right, *op, matching)))
            }
            ExecPlan::SetOperator { left, right, op } => {
                let left = execute(left, store, remote, session).await?.into_range_vectors()?;
                let right = execute(right, store, remote, session).await?.into_range_vectors()?;
                Ok(ExecResult::RangeVectors(transform::set_operator(left, right, *op)))
            }
            ExecPlan::Concat { children } => {
                let mut results = Vec::with_capacity(children.len());
                for child in children {
                    results.push(execute(child, store, remote, session).await?);
                }
                concat_results(results)
            }
            ExecPlan::ReduceAggregate { children, op, param } => {
                let mut rvs = Vec::new();
                for child in children {
                    rvs.extend(execute(child, store, remote, session).await?.into_range_vectors()?);
                }
                Ok(ExecResult::RangeVectors(transform::reduce_same_key(rvs, *op, *param)))
            }
            ExecPlan::Stitch { children } => {
                let mut streams = Vec::with_capacity(children.len());
                for child in children {
                    streams.push(execute(child, store, remote, session).await?.into_range_vectors()?);
                }
                Ok(ExecResult::RangeVectors(transform::stitch(streams)))
            }
            ExecPlan::Remote(remote_exec) => Ok(ExecResult::RangeVectors(remote_exec.execute(remote).await?)),
        }
    })
}

fn execute_leaf(leaf: &LeafOp, store: &TimeSeriesMemStore, session: &QuerySession) -> Result<ExecResult> {
    let dataset = &session.dataset;
    match leaf {
        LeafOp::MultiSchemaPartitions {
            shard,
            chunk_method,
            filters,
            ..
        } => {
            let rows = store.scan(dataset, *shard, filters, chunk_method.start_ms, chunk_method.end_ms)?;
            let sample_count: usize = rows.iter().map(|(_, r)| r.len()).sum();
            if sample_count > session.sample_limit() {
                return Err(QueryError::SampleLimitExceeded { limit: session.sample_limit() });
            }
            session.stats.add_samples_scanned(sample_count as u64);
            session.stats.add_partitions_scanned(rows.len() as u64);
            session.stats.add_shards_queried(1);
            Ok(ExecResult::RangeVectors(
                rows.into_iter()
                    .map(|(pk, samples)| RangeVector::from_rows(key_from_part_key(&pk), samples))
                    .collect(),
            ))
        }
        LeafOp::LabelValues { shard, filters, labels, .. } => Ok(ExecResult::LabelValues(store.label_values(dataset, *shard, filters, labels)?)),
        LeafOp::LabelNames { shard, filters, .. } => Ok(ExecResult::Labels(store.label_names(dataset, *shard, filters)?)),
        LeafOp::PartKeys { shard, filters, chunk_method, .. } => {
            let rows = store.scan(dataset, *shard, filters, chunk_method.start_ms, chunk_method.end_ms)?;
            Ok(ExecResult::PartKeys(rows.into_iter().map(|(pk, _)| pk).collect()))
        }
        LeafOp::LabelCardinality { shard, filters, .. } => Ok(ExecResult::LabelCardinality(store.label_cardinality(dataset, *shard, filters)?)),
        LeafOp::TopkCardinality {
            shard,
            shard_key_prefix,
            metric_column,
            k,
            ..
        } => Ok(ExecResult::Cardinality(store.topk_cardinality(dataset, *shard, shard_key_prefix, metric_column, *k)?)),
        LeafOp::EmptyResult => Ok(ExecResult::RangeVectors(Vec::new())),
    }
}

fn apply_transform(rvs: Vec<RangeVector>, t: &Transform, session: &QuerySession) -> Result<Vec<RangeVector>> {
    Ok(match t {
        Transform::PeriodicSamples {
            start_ms,
            end_ms,
            step_ms,
            window_ms,
            function,
            offset_ms,
            param,
            stale_lookback_ms,
        } => rvs
            .into_iter()
            .map(|rv| {
                let key = rv.key.clone();
                let rows = transform::periodic_samples(
                    &rv.collect_rows(),
                    *start_ms,
                    *end_ms,
                    *step_ms,
                    *window_ms,
                    *function,
                    *offset_ms,
                    *param,
                    *stale_lookback_ms,
                );
                RangeVector::from_rows(key, rows)
            })
            .collect(),
        Transform::InstantFunction { function, param } => rvs
            .into_iter()
            .map(|rv| {
                let key = rv.key.clone();
                let rows = transform::instant_function(&rv.collect_rows(), *function, *param);
                RangeVector::from_rows(key, rows)
            })
            .collect(),
        Transform::AggregateMapReduce { op, param, by, without } => transform::aggregate(rvs, *op, *param, by, without),
        Transform::HistogramFunction { function, param, max, le_label } => {
            transform::histogram_function(rvs, *function, *param, *max, le_label)
        }
        Transform::ScalarArithmetic { op, scalar, scalar_on_left } => rvs
            .into_iter()
            .map(|rv| {
                let key = rv.key.clone();
                let rows = transform::scalar_arithmetic(&rv.collect_rows(), *op, *scalar, *scalar_on_left);
                RangeVector::from_rows(key, rows)
            })
            .collect(),
        Transform::AbsentFunction { labels } => {
            let ctx = &session.query_context;
            let grid: Vec<i64> = data_types::OutputRange::new(ctx.start_ms(), ctx.end_ms(), ctx.step_ms())
                .iter()
                .collect();
            transform::absent_function(&rvs, labels.clone(), &grid).into_iter().collect()
        }
    })
}

fn concat_results(results: Vec<ExecResult>) -> Result<ExecResult> {
    let Some(first) = results.first() else {
        return Ok(ExecResult::RangeVectors(Vec::new()));
    };
    match first {
        ExecResult::RangeVectors(_) => {
            let mut out = Vec::new();
            for r in results {
                out.extend(r.into_range_vectors()?);
            }
            Ok(ExecResult::RangeVectors(out))
        }
        ExecResult::Labels(_) => {
            let mut out = Vec::new();
            for r in results {
                match r {
                    ExecResult::Labels(v) => out.extend(v),
                    other => return mismatched(&other),
                }
            }
            out.sort();
            out.dedup();
            Ok(ExecResult::Labels(out))
        }
        ExecResult::LabelValues(_) => {
            let mut out = Vec::new();
            for r in results {
                match r {
                    ExecResult::LabelValues(v) => out.extend(v),
                    other => return mismatched(&other),
                }
            }
            out.sort();
            out.dedup();
            Ok(ExecResult::LabelValues(out))
        }
        ExecResult::PartKeys(_) => {
            let mut out = Vec::new();
            for r in results {
                match r {
                    ExecResult::PartKeys(v) => out.extend(v),
                    other => return mismatched(&other),
                }
            }
            out.sort();
            out.dedup();
            Ok(ExecResult::PartKeys(out))
        }
        ExecResult::Cardinality(_) => {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for r in results {
                match r {
                    ExecResult::Cardinality(v) => {
                        for (name, c) in v {
                            *counts.entry(name).or_insert(0) += c;
                        }
                    }
                    other => return mismatched(&other),
                }
            }
            let mut ordered: Vec<_> = counts.into_iter().collect();
            ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            Ok(ExecResult::Cardinality(ordered))
        }
        ExecResult::LabelCardinality(_) => {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for r in results {
                match r {
                    ExecResult::LabelCardinality(v) => {
                        for (name, c) in v {
                            *counts.entry(name).or_insert(0) += c;
                        }
                    }
                    other => return mismatched(&other),
                }
            }
            Ok(ExecResult::LabelCardinality(counts))
        }
    }
}

fn mismatched(r: &ExecResult) -> Result<ExecResult> {
    Err(QueryError::SchemaConflict {
        left: "concat children".to_string(),
        right: r.kind().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{ColumnFilter, EvictionPolicy, PlannerParams, QueryContext, ShardId, TierConfig, TierKind};
    use query_functions::AggregateOp;
    use schema::DatasetRef;
    use std::sync::Arc;
    use time_provider::{MockProvider, Time};

    fn session() -> QuerySession {
        let ctx = QueryContext::new("q1", 0, 10, 20, PlannerParams::default());
        QuerySession::new(DatasetRef::new("prometheus"), ctx)
    }

    fn store_with_one_series() -> TimeSeriesMemStore {
        let store = TimeSeriesMemStore::new();
        let dataset = DatasetRef::new("prometheus");
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tier = Arc::new(TierConfig::new(TierKind::Raw, 3_600_000, clock).with_eviction_policy(EvictionPolicy::fixed_max_partitions(10)));
        store.setup(&dataset, ShardId::new(0), &tier).unwrap();
        store
            .ingest(
                &dataset,
                ShardId::new(0),
                data_types::PartKey::new([("_metric_".to_string(), "up".to_string())]),
                &[
                    chunk_store::Sample { timestamp_ms: 0, value: 1.0 },
                    chunk_store::Sample { timestamp_ms: 10_000, value: 2.0 },
                    chunk_store::Sample { timestamp_ms: 20_000, value: 3.0 },
                ],
                100,
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn leaf_scan_then_reduce_same_key() {
        let store = store_with_one_series();
        let remote = RemoteClient::new();
        let session = session();

        let leaf = ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
            dataset: DatasetRef::new("prometheus"),
            shard: ShardId::new(0),
            chunk_method: crate::plan::ChunkMethod { start_ms: 0, end_ms: 20_000 },
            filters: vec![ColumnFilter::equals("_metric_", "up")],
        });
        let plan = ExecPlan::ReduceAggregate {
            children: vec![leaf.clone(), leaf],
            op: AggregateOp::Sum,
            param: None,
        };

        let result = execute(&plan, &store, &remote, &session).await.unwrap();
        let rvs = result.into_range_vectors().unwrap();
        assert_eq!(rvs.len(), 1);
        assert_eq!(rvs.into_iter().next().unwrap().collect_rows(), vec![(0, 2.0), (10_000, 4.0), (20_000, 6.0)]);
        assert_eq!(session.stats.samples_scanned(), 6);
    }

    #[tokio::test]
    async fn transform_chain_applies_periodic_samples_then_instant_function() {
        let store = store_with_one_series();
        let remote = RemoteClient::new();
        let session = session();

        let leaf = ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
            dataset: DatasetRef::new("prometheus"),
            shard: ShardId::new(0),
            chunk_method: crate::plan::ChunkMethod { start_ms: 0, end_ms: 20_000 },
            filters: vec![ColumnFilter::equals("_metric_", "up")],
        });
        let plan = leaf
            .transform(Transform::PeriodicSamples {
                start_ms: 0,
                end_ms: 20_000,
                step_ms: 10_000,
                window_ms: None,
                function: None,
                offset_ms: 0,
                param: None,
                stale_lookback_ms: 5 * 60 * 1000,
            })
            .transform(Transform::InstantFunction {
                function: query_functions::InstantFunction::Abs,
                param: None,
            });

        let result = execute(&plan, &store, &remote, &session).await.unwrap();
        let rows = result.into_range_vectors().unwrap().into_iter().next().unwrap().collect_rows();
        assert_eq!(rows, vec![(0, 1.0), (10_000, 2.0), (20_000, 3.0)]);
    }

    #[tokio::test]
    async fn sample_limit_is_enforced() {
        let store = store_with_one_series();
        let remote = RemoteClient::new();
        let mut ctx = QueryContext::new("q1", 0, 10, 20, PlannerParams::default());
        ctx.planner_params.sample_limit = 1;
        let session = QuerySession::new(DatasetRef::new("prometheus"), ctx);

        let leaf = ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
            dataset: DatasetRef::new("prometheus"),
            shard: ShardId::new(0),
            chunk_method: crate::plan::ChunkMethod { start_ms: 0, end_ms: 20_000 },
            filters: vec![ColumnFilter::equals("_metric_", "up")],
        });

        let err = execute(&leaf, &store, &remote, &session).await.unwrap_err();
        assert!(matches!(err, QueryError::SampleLimitExceeded { .. }));
    }
}
