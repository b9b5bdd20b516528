//! `ShardKeyRegexPlanner`: expands a regex shard-key filter into a union of
//! concrete shard-key tuples, plans one subplan per tuple, and lifts an
//! associative aggregate above the union when the outer operator allows it.
use std::sync::Arc;

use data_types::{ColumnFilter, FilterOp, QueryContext, QueryStats};
use exec::ExecPlan;
use hashbrown::HashMap;
use promql::{LabelMatcher, LogicalPlan, MatchOp, VectorSelector};
use regex::Regex;

use crate::{convert_aggregate_op, Planner};

/// `shardKeyMatcherFn(filters) -> [[filter]]`: expands shard-key filters
/// (assumed already narrowed to shard-key columns) into a union of
/// equality-only tuples. An empty result means no concrete shard key
/// matches — the caller should plan an empty result rather than fan out.
pub trait ShardKeyMatcher: std::fmt::Debug + Send + Sync {
    fn expand(&self, filters: &[ColumnFilter]) -> Vec<Vec<ColumnFilter>>;
}

/// A [`ShardKeyMatcher`] backed by a fixed, in-memory universe of known
/// values per shard-key column — the common case for a bounded set of
/// tenants/namespaces that changes rarely enough to hold in memory.
#[derive(Debug, Default)]
pub struct StaticShardKeyMatcher {
    known_values: HashMap<String, Vec<String>>,
}

impl StaticShardKeyMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_values(mut self, column: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        self.known_values.insert(column.into(), values.into_iter().collect());
        self
    }
}

impl ShardKeyMatcher for StaticShardKeyMatcher {
    fn expand(&self, filters: &[ColumnFilter]) -> Vec<Vec<ColumnFilter>> {
        let mut tuples: Vec<Vec<ColumnFilter>> = vec![Vec::new()];
        for f in filters {
            let candidates: Vec<ColumnFilter> = match f.op {
                FilterOp::Equals | FilterOp::NotEquals => vec![f.clone()],
                FilterOp::Regex | FilterOp::NotRegex => {
                    let Ok(re) = Regex::new(&format!("^(?:{})$", f.value)) else {
                        return Vec::new();
                    };
                    let negate = f.op == FilterOp::NotRegex;
                    self.known_values
                        .get(&f.column)
                        .into_iter()
                        .flatten()
                        .filter(|v| re.is_match(v) != negate)
                        .map(|v| ColumnFilter::equals(f.column.clone(), v.clone()))
                        .collect()
                }
            };
            if candidates.is_empty() {
                return Vec::new();
            }
            tuples = tuples
                .into_iter()
                .flat_map(|prefix| {
                    candidates.iter().map(move |c| {
                        let mut next = prefix.clone();
                        next.push(c.clone());
                        next
                    })
                })
                .collect();
        }
        tuples
    }
}

#[derive(Debug)]
pub struct ShardKeyRegexPlanner {
    inner: Arc<dyn Planner>,
    matcher: Arc<dyn ShardKeyMatcher>,
    shard_key_columns: Vec<String>,
}

impl ShardKeyRegexPlanner {
    pub fn new(inner: Arc<dyn Planner>, matcher: Arc<dyn ShardKeyMatcher>, shard_key_columns: Vec<String>) -> Self {
        Self {
            inner,
            matcher,
            shard_key_columns,
        }
    }
}

impl Planner for ShardKeyRegexPlanner {
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<ExecPlan> {
        let Some(selector) = first_selector(logical) else {
            return self.inner.plan(logical, ctx, stats);
        };

        let shard_key_filters: Vec<ColumnFilter> = selector
            .matchers
            .iter()
            .map(ColumnFilter::from)
            .filter(|f| self.shard_key_columns.contains(&f.column))
            .collect();

        if !shard_key_filters.iter().any(|f| matches!(f.op, FilterOp::Regex | FilterOp::NotRegex)) {
            return self.inner.plan(logical, ctx, stats);
        }

        let tuples = self.matcher.expand(&shard_key_filters);
        if tuples.is_empty() {
            return Ok(ExecPlan::Leaf(exec::LeafOp::EmptyResult));
        }

        let children: exec::Result<Vec<ExecPlan>> = tuples.iter().map(|tuple| self.inner.plan(&rewrite(logical, tuple), ctx, stats)).collect();
        let children = children?;

        if let LogicalPlan::Aggregate { op, param, .. } = logical {
            if op.is_directly_associative() {
                return Ok(ExecPlan::ReduceAggregate {
                    children,
                    op: convert_aggregate_op(*op),
                    param: param.as_deref().and_then(as_number),
                });
            }
        }

        Ok(match children.len() {
            1 => children.into_iter().next().unwrap(),
            _ => ExecPlan::Concat { children },
        })
    }
}

fn first_selector(logical: &LogicalPlan) -> Option<&VectorSelector> {
    match logical {
        LogicalPlan::VectorSelector(vs) => Some(vs),
        LogicalPlan::RangeSelector { selector, .. } => Some(selector),
        LogicalPlan::Subquery { expr, .. } | LogicalPlan::Unary { expr, .. } => first_selector(expr),
        LogicalPlan::Call { args, .. } => args.iter().find_map(first_selector),
        LogicalPlan::Aggregate { expr, .. } => first_selector(expr),
        LogicalPlan::Binary { lhs, rhs, .. } => first_selector(lhs).or_else(|| first_selector(rhs)),
        LogicalPlan::NumberLiteral(_) | LogicalPlan::StringLiteral(_) => None,
    }
}

fn as_number(expr: &LogicalPlan) -> Option<f64> {
    match expr {
        LogicalPlan::NumberLiteral(n) => Some(*n),
        _ => None,
    }
}

/// Rewrites every selector reachable in `logical`, replacing any matcher on
/// a `tuple` column with `tuple`'s concrete equality and leaving every
/// other matcher untouched.
fn rewrite(logical: &LogicalPlan, tuple: &[ColumnFilter]) -> LogicalPlan {
    match logical {
        LogicalPlan::VectorSelector(vs) => LogicalPlan::VectorSelector(rewrite_selector(vs, tuple)),
        LogicalPlan::RangeSelector { selector, range_ms } => LogicalPlan::RangeSelector {
            selector: rewrite_selector(selector, tuple),
            range_ms: *range_ms,
        },
        LogicalPlan::Subquery { expr, range_ms, step_ms, offset_ms } => LogicalPlan::Subquery {
            expr: Box::new(rewrite(expr, tuple)),
            range_ms: *range_ms,
            step_ms: *step_ms,
            offset_ms: *offset_ms,
        },
        LogicalPlan::Call { func, args } => LogicalPlan::Call {
            func: func.clone(),
            args: args.iter().map(|a| rewrite(a, tuple)).collect(),
        },
        LogicalPlan::Aggregate { op, expr, param, grouping } => LogicalPlan::Aggregate {
            op: *op,
            expr: Box::new(rewrite(expr, tuple)),
            param: param.as_ref().map(|p| Box::new(rewrite(p, tuple))),
            grouping: grouping.clone(),
        },
        LogicalPlan::Binary { op, lhs, rhs, matching } => LogicalPlan::Binary {
            op: *op,
            lhs: Box::new(rewrite(lhs, tuple)),
            rhs: Box::new(rewrite(rhs, tuple)),
            matching: matching.clone(),
        },
        LogicalPlan::Unary { negative, expr } => LogicalPlan::Unary {
            negative: *negative,
            expr: Box::new(rewrite(expr, tuple)),
        },
        LogicalPlan::NumberLiteral(n) => LogicalPlan::NumberLiteral(*n),
        LogicalPlan::StringLiteral(s) => LogicalPlan::StringLiteral(s.clone()),
    }
}

fn rewrite_selector(vs: &VectorSelector, tuple: &[ColumnFilter]) -> VectorSelector {
    let mut matchers: Vec<LabelMatcher> = vs.matchers.iter().filter(|m| !tuple.iter().any(|f| f.column == m.label)).cloned().collect();
    for f in tuple {
        matchers.push(LabelMatcher {
            label: f.column.clone(),
            op: MatchOp::Eq,
            value: f.value.clone(),
        });
    }
    VectorSelector {
        metric: vs.metric.clone(),
        matchers,
        offset_ms: vs.offset_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{PlannerParams, QueryStats, ShardId};
    use exec::ChunkMethod;
    use schema::DatasetRef;

    #[derive(Debug)]
    struct RecordingInner;

    impl Planner for RecordingInner {
        fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, _stats: &QueryStats) -> exec::Result<ExecPlan> {
            Ok(ExecPlan::Leaf(exec::LeafOp::MultiSchemaPartitions {
                dataset: DatasetRef::new(logical.to_string()),
                shard: ShardId::new(0),
                chunk_method: ChunkMethod { start_ms: ctx.start_ms(), end_ms: ctx.end_ms() },
                filters: Vec::new(),
            }))
        }
    }

    fn planner() -> ShardKeyRegexPlanner {
        let matcher = Arc::new(StaticShardKeyMatcher::new().with_known_values("_ns_", ["ns1".to_string(), "ns2".to_string(), "other".to_string()]));
        ShardKeyRegexPlanner::new(Arc::new(RecordingInner), matcher, vec!["_ws_".to_string(), "_ns_".to_string()])
    }

    fn ctx() -> QueryContext {
        QueryContext::new("q1", 0, 10, 20, PlannerParams::default())
    }

    fn selector_with_ns_regex(pattern: &str) -> LogicalPlan {
        LogicalPlan::VectorSelector(VectorSelector {
            metric: Some("up".to_string()),
            matchers: vec![LabelMatcher {
                label: "_ns_".to_string(),
                op: MatchOp::Re,
                value: pattern.to_string(),
            }],
            offset_ms: None,
        })
    }

    fn query_strings(plan: &ExecPlan) -> Vec<String> {
        match plan {
            ExecPlan::Leaf(exec::LeafOp::MultiSchemaPartitions { dataset, .. }) => vec![dataset.dataset.clone()],
            ExecPlan::Concat { children } | ExecPlan::ReduceAggregate { children, .. } => children.iter().flat_map(query_strings).collect(),
            other => panic!("unexpected plan shape {other:?}"),
        }
    }

    #[test]
    fn no_shard_key_regex_delegates_unchanged() {
        let p = planner();
        let logical = LogicalPlan::VectorSelector(VectorSelector {
            metric: Some("up".to_string()),
            matchers: vec![LabelMatcher { label: "_ns_".to_string(), op: MatchOp::Eq, value: "ns1".to_string() }],
            offset_ms: None,
        });
        let plan = p.plan(&logical, &ctx(), &QueryStats::new()).unwrap();
        assert_eq!(query_strings(&plan), vec!["up{_ns_=\"ns1\"}".to_string()]);
    }

    #[test]
    fn regex_expands_into_a_concat_of_concrete_tuples() {
        let p = planner();
        let plan = p.plan(&selector_with_ns_regex("ns.*"), &ctx(), &QueryStats::new()).unwrap();
        let mut got = query_strings(&plan);
        got.sort();
        assert_eq!(got, vec!["up{_ns_=\"ns1\"}".to_string(), "up{_ns_=\"ns2\"}".to_string()]);
    }

    #[test]
    fn aggregate_above_regex_expansion_pushes_down_and_reduces() {
        let p = planner();
        let logical = LogicalPlan::Aggregate {
            op: promql::AggregateOp::Sum,
            expr: Box::new(selector_with_ns_regex("ns.*")),
            param: None,
            grouping: promql::Grouping::default(),
        };
        let plan = p.plan(&logical, &ctx(), &QueryStats::new()).unwrap();
        let ExecPlan::ReduceAggregate { children, op, .. } = &plan else {
            panic!("expected a reduce-aggregate, got {plan:?}");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(*op, query_functions::AggregateOp::Sum);
    }

    #[test]
    fn no_matching_known_value_yields_empty_result() {
        let p = planner();
        let plan = p.plan(&selector_with_ns_regex("zzz.*"), &ctx(), &QueryStats::new()).unwrap();
        assert!(matches!(plan, ExecPlan::Leaf(exec::LeafOp::EmptyResult)));
    }
}
