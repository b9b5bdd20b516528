//! `MultiPartitionPlanner`: fans a query out across local and remote
//! partitions via a [`PartitionLocationProvider`], injecting
//! `PromQlRemoteExec` leaves for the fragments owned elsewhere.
use std::sync::Arc;

use data_types::{QueryContext, QueryStats};
use exec::remote::PromQlRemoteExec;
use exec::{ExecPlan, LeafOp};
use observability_deps::tracing::debug;
use promql::{AggregateOp, LogicalPlan, VectorSelector};

use crate::{convert_aggregate_op, Planner};

/// One partition's ownership window, as returned by a
/// [`PartitionLocationProvider`] lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionAssignment {
    pub name: String,
    pub endpoint_url: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl PartitionAssignment {
    pub fn new(name: impl Into<String>, endpoint_url: impl Into<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            start_ms,
            end_ms,
        }
    }
}

/// `getPartitions`/`getAuthorizedPartitions`: resolves a query's routing
/// key and time range to the concrete partitions that own it. One
/// partition is always `local_partition_name()`; `MultiPartitionPlanner`
/// delegates that one to its inner planner and emits a remote leaf for
/// every other.
pub trait PartitionLocationProvider: std::fmt::Debug + Send + Sync {
    fn get_partitions(&self, routing_key: &[(String, String)], start_ms: i64, end_ms: i64) -> Vec<PartitionAssignment>;

    fn get_authorized_partitions(&self, start_ms: i64, end_ms: i64) -> Vec<PartitionAssignment>;

    /// The name `get_partitions`/`get_authorized_partitions` uses for the
    /// partition this process itself serves.
    fn local_partition_name(&self) -> &str;
}

#[derive(Debug)]
pub struct MultiPartitionPlanner {
    /// Plans the fragment owned by `local_partition_name()`.
    local: Arc<dyn Planner>,
    locations: Arc<dyn PartitionLocationProvider>,
    /// Shard-key-shaped columns a routing key is built from, e.g. `_ws_`/`_ns_`.
    routing_key_columns: Vec<String>,
    query_timeout_ms: u64,
}

impl MultiPartitionPlanner {
    pub fn new(local: Arc<dyn Planner>, locations: Arc<dyn PartitionLocationProvider>, routing_key_columns: Vec<String>) -> Self {
        Self {
            local,
            locations,
            routing_key_columns,
            query_timeout_ms: 30_000,
        }
    }

    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    /// Extracts `(column, value)` pairs for `routing_key_columns` from
    /// every selector reachable in `logical`. A column with conflicting
    /// values across selectors, or missing from one entirely, is dropped —
    /// an incomplete routing key simply means every authorized partition
    /// gets consulted, which is always correct, just less targeted.
    fn routing_key(&self, logical: &LogicalPlan) -> Vec<(String, String)> {
        let mut selectors = Vec::new();
        collect_selectors(logical, &mut selectors);

        self.routing_key_columns
            .iter()
            .filter_map(|col| {
                let mut value: Option<&str> = None;
                for vs in &selectors {
                    let found = vs.matchers.iter().find(|m| &m.label == col && m.op == promql::MatchOp::Eq).map(|m| m.value.as_str());
                    match (value, found) {
                        (None, Some(v)) => value = Some(v),
                        (Some(existing), Some(v)) if existing != v => return None,
                        _ => {}
                    }
                }
                value.map(|v| (col.clone(), v.to_string()))
            })
            .collect()
    }

    fn partitions_for(&self, logical: &LogicalPlan, start_ms: i64, end_ms: i64) -> Vec<PartitionAssignment> {
        let key = self.routing_key(logical);
        if key.len() == self.routing_key_columns.len() {
            self.locations.get_partitions(&key, start_ms, end_ms)
        } else {
            debug!(columns = ?self.routing_key_columns, "multi-partition: incomplete routing key, querying every authorized partition");
            self.locations.get_authorized_partitions(start_ms, end_ms)
        }
    }

    fn remote_leaf(&self, partition: &PartitionAssignment, logical: &LogicalPlan, ctx: &QueryContext) -> ExecPlan {
        ExecPlan::Remote(PromQlRemoteExec {
            endpoint: partition.endpoint_url.clone(),
            query: logical.to_string(),
            start_ms: ctx.start_ms().max(partition.start_ms),
            end_ms: ctx.end_ms().min(partition.end_ms),
            step_ms: ctx.step_ms(),
            timeout_ms: self.query_timeout_ms,
            url_params: Vec::new(),
        })
    }
}

impl Planner for MultiPartitionPlanner {
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<ExecPlan> {
        let partitions = self.partitions_for(logical, ctx.start_ms(), ctx.end_ms());
        let local_name = self.locations.local_partition_name();

        if partitions.iter().all(|p| p.name == local_name) {
            return self.local.plan(logical, ctx, stats);
        }
        if partitions.iter().all(|p| p.name != local_name) && partitions.len() == 1 {
            return Ok(self.remote_leaf(&partitions[0], logical, ctx));
        }

        // A genuine split across partitions. Associative aggregates with no
        // per-partition-crossing grouping push straight down: each partition
        // computes the same aggregate independently and a top-level reduce
        // unites the partials. Anything else just needs every partition's
        // full result concatenated together.
        if let LogicalPlan::Aggregate { op, param, grouping, .. } = logical {
            if op.is_directly_associative() {
                let children: exec::Result<Vec<ExecPlan>> = partitions
                    .iter()
                    .map(|p| {
                        if p.name == local_name {
                            self.local.plan(logical, ctx, stats)
                        } else {
                            Ok(self.remote_leaf(p, logical, ctx))
                        }
                    })
                    .collect();
                let param = param.as_ref().and_then(|p| as_number(p));
                let _ = grouping;
                return Ok(ExecPlan::ReduceAggregate {
                    children: children?,
                    op: convert_aggregate_op(*op),
                    param,
                });
            }
        }

        let children: exec::Result<Vec<ExecPlan>> = partitions
            .iter()
            .map(|p| {
                if p.name == local_name {
                    self.local.plan(logical, ctx, stats)
                } else {
                    Ok(self.remote_leaf(p, logical, ctx))
                }
            })
            .collect();
        Ok(ExecPlan::Concat { children: children? })
    }
}

fn collect_selectors<'a>(logical: &'a LogicalPlan, out: &mut Vec<&'a VectorSelector>) {
    match logical {
        LogicalPlan::VectorSelector(vs) => out.push(vs),
        LogicalPlan::RangeSelector { selector, .. } => out.push(selector),
        LogicalPlan::Subquery { expr, .. } | LogicalPlan::Unary { expr, .. } => collect_selectors(expr, out),
        LogicalPlan::Call { args, .. } => args.iter().for_each(|a| collect_selectors(a, out)),
        LogicalPlan::Aggregate { expr, param, .. } => {
            collect_selectors(expr, out);
            if let Some(p) = param {
                collect_selectors(p, out);
            }
        }
        LogicalPlan::Binary { lhs, rhs, .. } => {
            collect_selectors(lhs, out);
            collect_selectors(rhs, out);
        }
        LogicalPlan::NumberLiteral(_) | LogicalPlan::StringLiteral(_) => {}
    }
}

fn as_number(expr: &LogicalPlan) -> Option<f64> {
    match expr {
        LogicalPlan::NumberLiteral(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{PlannerParams, QueryStats, ShardId};
    use exec::ChunkMethod;
    use parking_lot::Mutex;
    use schema::DatasetRef;

    #[derive(Debug)]
    struct LocalStub;

    impl Planner for LocalStub {
        fn plan(&self, _logical: &LogicalPlan, ctx: &QueryContext, _stats: &QueryStats) -> exec::Result<ExecPlan> {
            Ok(ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
                dataset: DatasetRef::new("local"),
                shard: ShardId::new(0),
                chunk_method: ChunkMethod { start_ms: ctx.start_ms(), end_ms: ctx.end_ms() },
                filters: Vec::new(),
            }))
        }
    }

    #[derive(Debug)]
    struct FakeLocations {
        partitions: Mutex<Vec<PartitionAssignment>>,
    }

    impl PartitionLocationProvider for FakeLocations {
        fn get_partitions(&self, _routing_key: &[(String, String)], _start_ms: i64, _end_ms: i64) -> Vec<PartitionAssignment> {
            self.partitions.lock().clone()
        }

        fn get_authorized_partitions(&self, _start_ms: i64, _end_ms: i64) -> Vec<PartitionAssignment> {
            self.partitions.lock().clone()
        }

        fn local_partition_name(&self) -> &str {
            "local"
        }
    }

    fn ctx() -> QueryContext {
        QueryContext::new("q1", 0, 10, 20, PlannerParams::default())
    }

    fn selector_with_ns(ns: &str) -> LogicalPlan {
        LogicalPlan::VectorSelector(VectorSelector {
            metric: Some("up".to_string()),
            matchers: vec![promql::LabelMatcher {
                label: "_ns_".to_string(),
                op: promql::MatchOp::Eq,
                value: ns.to_string(),
            }],
            offset_ms: None,
        })
    }

    #[test]
    fn all_local_delegates_without_remote_leaves() {
        let locations = Arc::new(FakeLocations {
            partitions: Mutex::new(vec![PartitionAssignment::new("local", "http://local", 0, 20_000)]),
        });
        let p = MultiPartitionPlanner::new(Arc::new(LocalStub), locations, vec!["_ns_".to_string()]);
        let plan = p.plan(&selector_with_ns("demo"), &ctx(), &QueryStats::new()).unwrap();
        assert!(matches!(plan, ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { .. })));
    }

    #[test]
    fn single_remote_partition_emits_a_remote_leaf() {
        let locations = Arc::new(FakeLocations {
            partitions: Mutex::new(vec![PartitionAssignment::new("remote-1", "http://remote-1", 0, 20_000)]),
        });
        let p = MultiPartitionPlanner::new(Arc::new(LocalStub), locations, vec!["_ns_".to_string()]);
        let plan = p.plan(&selector_with_ns("demo"), &ctx(), &QueryStats::new()).unwrap();
        let ExecPlan::Remote(remote) = plan else {
            panic!("expected a remote leaf, got {plan:?}");
        };
        assert_eq!(remote.endpoint, "http://remote-1");
        assert!(remote.query.contains("up"));
    }

    #[test]
    fn associative_aggregate_split_across_partitions_becomes_a_reduce() {
        let locations = Arc::new(FakeLocations {
            partitions: Mutex::new(vec![
                PartitionAssignment::new("local", "http://local", 0, 20_000),
                PartitionAssignment::new("remote-1", "http://remote-1", 0, 20_000),
            ]),
        });
        let p = MultiPartitionPlanner::new(Arc::new(LocalStub), locations, vec![]);
        let logical = LogicalPlan::Aggregate {
            op: AggregateOp::Sum,
            expr: Box::new(selector_with_ns("demo")),
            param: None,
            grouping: promql::Grouping::default(),
        };
        let plan = p.plan(&logical, &ctx(), &QueryStats::new()).unwrap();
        let ExecPlan::ReduceAggregate { children, op, .. } = plan else {
            panic!("expected a reduce-aggregate, got {plan:?}");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(op, query_functions::AggregateOp::Sum);
    }

    #[test]
    fn non_associative_split_concatenates_every_partition() {
        let locations = Arc::new(FakeLocations {
            partitions: Mutex::new(vec![
                PartitionAssignment::new("local", "http://local", 0, 20_000),
                PartitionAssignment::new("remote-1", "http://remote-1", 0, 20_000),
            ]),
        });
        let p = MultiPartitionPlanner::new(Arc::new(LocalStub), locations, vec![]);
        let plan = p.plan(&selector_with_ns("demo"), &ctx(), &QueryStats::new()).unwrap();
        let ExecPlan::Concat { children } = plan else {
            panic!("expected a concat, got {plan:?}");
        };
        assert_eq!(children.len(), 2);
    }
}
