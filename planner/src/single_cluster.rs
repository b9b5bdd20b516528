//! `SingleClusterPlanner`: compiles a `LogicalPlan` against one dataset's
//! shards within a single tier (raw, downsample, or recording-rules — the
//! three differ only in their `TierConfig`, per the decision recorded in
//! `DESIGN.md`). Owns retention clipping, shard selection and
//! spread-change splitting, metric-column label rewriting, histogram
//! bucket-family functions, and the aggregation-parallelism two-level
//! reduce.
use std::sync::Arc;

use data_types::{ColumnFilter, OutputRange, QueryContext, QueryStats, ShardId, TierConfigRef};
use exec::{ArithmeticOp, ChunkMethod, ExecPlan, HistogramFn, JoinMatching, LeafOp, SetOp, Transform};
use observability_deps::tracing::debug;
use promql::{AggregateOp as PromAggregateOp, BinaryOp, GroupMod, LogicalPlan, VectorSelector};
use query_functions::{InstantFunction, RangeFunction};
use schema::{Dataset, PROM_NAME_LABEL};
use sharder::{ShardHasher, SpreadProvider};
use snafu::Snafu;

use crate::shard_mapper::ShardMapper;
use crate::{convert_aggregate_op, Planner};

/// No per-tier field carries this (it is a query-evaluation constant, not
/// a retention knob): how far back a gapless instant lookup is still
/// willing to reach for the most recent sample. Matches the default used
/// throughout the `exec` crate's own tests.
const DEFAULT_STALE_LOOKBACK_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unknown function {name}"))]
    UnknownFunction { name: String },

    #[snafu(display("{func} expects a range selector or subquery argument"))]
    ExpectsRangeArgument { func: String },

    #[snafu(display("{func} is not supported against this store"))]
    UnsupportedFunction { func: String },

    #[snafu(display("scalar-only query results are not supported"))]
    ScalarOnlyResult,

    #[snafu(display("shard {shard} is not available"))]
    ShardNotAvailable { shard: ShardId },

    #[snafu(display("query would touch {requested} shards, more than the {limit} configured bound"))]
    TooManyShardsQueried { requested: usize, limit: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for exec::QueryError {
    fn from(e: Error) -> Self {
        match e {
            Error::ShardNotAvailable { shard } => exec::QueryError::ShardNotAvailable { shard },
            Error::TooManyShardsQueried { requested, limit } => exec::QueryError::TooManyShardsQueried { requested, limit },
            other => exec::QueryError::BadQuery { message: other.to_string() },
        }
    }
}

/// `Count`'s partial is itself a sum of per-shard counts; `sum`/`min`/`max`
/// fold with the same op at both levels. `avg`/`stddev`/`topk`/etc. are not
/// `is_directly_associative()` and never reach this function.
fn top_level_op(op: query_functions::AggregateOp) -> query_functions::AggregateOp {
    use query_functions::AggregateOp as Q;
    match op {
        Q::Count => Q::Sum,
        other => other,
    }
}

#[derive(Debug)]
pub struct SingleClusterPlanner {
    dataset: Arc<Dataset>,
    tier: TierConfigRef,
    shard_hasher: ShardHasher,
    shard_mapper: Arc<dyn ShardMapper>,
    spread_provider: Arc<dyn SpreadProvider>,
}

impl SingleClusterPlanner {
    pub fn new(
        dataset: Arc<Dataset>,
        tier: TierConfigRef,
        shard_hasher: ShardHasher,
        shard_mapper: Arc<dyn ShardMapper>,
        spread_provider: Arc<dyn SpreadProvider>,
    ) -> Self {
        Self {
            dataset,
            tier,
            shard_hasher,
            shard_mapper,
            spread_provider,
        }
    }

    fn metric_column(&self) -> &str {
        if self.dataset.needs_metric_column_rewrite() {
            self.dataset.options.metric_column.as_str()
        } else {
            PROM_NAME_LABEL
        }
    }

    /// §4.3's label rewrite: a positional metric name is filtered under
    /// the dataset's configured metric column directly; an explicit
    /// `__name__=...` matcher is rewritten the same way so the two spellings
    /// of "select this metric" always resolve to one filter column.
    fn selector_filters(&self, vs: &VectorSelector) -> Vec<ColumnFilter> {
        let metric_column = self.metric_column();
        vs.filters(metric_column)
            .into_iter()
            .map(|f| f.renamed(PROM_NAME_LABEL, metric_column))
            .collect()
    }

    /// §4.3's histogram bucket rewrite: `{_metric_="X_bucket", le="v"}`
    /// becomes `{_metric_="X"}`, `le` dropped from push-down, plus
    /// `Some(v)` so the caller chains `HistogramFn::Bucket` onto the
    /// resulting scan. Fires only when the metric filter's value actually
    /// ends in `_bucket` and an exact `le` filter parses as a float;
    /// anything else passes `filters` through unchanged.
    fn rewrite_histogram_bucket(&self, filters: Vec<ColumnFilter>) -> (Vec<ColumnFilter>, Option<f64>) {
        let metric_column = self.metric_column();
        let Some(base_metric) = filters
            .iter()
            .find(|f| f.column == metric_column && f.is_exact_equality())
            .and_then(|f| f.value.strip_suffix("_bucket"))
            .map(str::to_string)
        else {
            return (filters, None);
        };
        let Some(le) = filters
            .iter()
            .find(|f| f.column == "le" && f.is_exact_equality())
            .and_then(|f| f.value.parse::<f64>().ok())
        else {
            return (filters, None);
        };

        let rewritten = filters
            .into_iter()
            .filter(|f| f.column != "le")
            .map(|f| if f.column == metric_column { ColumnFilter::equals(metric_column, base_metric.clone()) } else { f })
            .collect();
        (rewritten, Some(le))
    }

    /// Chains `HistogramFn::Bucket` onto every leaf in `leaves` when the
    /// preceding `rewrite_histogram_bucket` call fired; a no-op otherwise.
    fn with_histogram_bucket(leaves: Vec<ExecPlan>, le: Option<f64>) -> Vec<ExecPlan> {
        let Some(le) = le else {
            return leaves;
        };
        leaves
            .into_iter()
            .map(|p| {
                p.transform(Transform::HistogramFunction {
                    function: HistogramFn::Bucket,
                    param: le,
                    max: None,
                    le_label: "le".to_string(),
                })
            })
            .collect()
    }

    /// `Some(pairs)` only when every shard-key column is pinned by an
    /// exact-equality filter; `None` means the query can't be routed to a
    /// single shard-key class and must fan out across every shard.
    fn shard_key_pairs<'a>(&self, filters: &'a [ColumnFilter]) -> Option<Vec<(&'a str, &'a str)>> {
        self.dataset
            .options
            .shard_key_columns
            .iter()
            .map(|col| {
                filters
                    .iter()
                    .find(|f| &f.column == col && f.is_exact_equality())
                    .map(|f| (f.column.as_str(), f.value.as_str()))
            })
            .collect()
    }

    /// §4.3's retention clipping: `effectiveStart = max(requestedStart,
    /// earliestRetained + step + window + offset + staleDataLookback)`.
    /// Returns `None` when the clipped range is empty (entirely retired).
    fn clip_to_retention(&self, start_ms: i64, end_ms: i64, step_ms: i64, window_ms: i64, offset_ms: i64) -> Option<(i64, i64)> {
        let earliest = self.tier.earliest_retained_timestamp_ms();
        let effective_start = start_ms.max(earliest + step_ms + window_ms + offset_ms + DEFAULT_STALE_LOOKBACK_MS);
        if effective_start > end_ms {
            debug!(effective_start, end_ms, "query range entirely outside retention");
            None
        } else {
            Some((effective_start, end_ms))
        }
    }

    /// Splits `[start_ms, end_ms]` at every spread-change point the
    /// `SpreadProvider` reports, resolving each segment's concrete shard
    /// set. A shard key that can't be pinned to one class fans out to
    /// every shard at that segment's full spread instead.
    fn shard_segments(&self, filters: &[ColumnFilter], start_ms: i64, end_ms: i64) -> Vec<(i64, i64, Vec<ShardId>)> {
        if end_ms < start_ms {
            return Vec::new();
        }
        let pairs = self.shard_key_pairs(filters);
        let base_shard = pairs.as_ref().map(|p| self.shard_hasher.shard_for(p.iter().copied())).unwrap_or_else(|| ShardId::new(0));
        let full_fanout = pairs.is_none();

        let mut bounds = vec![start_ms];
        let mut changes = self.spread_provider.changes_in_range(start_ms, end_ms);
        changes.sort_by_key(|c| c.effective_at_ms);
        bounds.extend(changes.iter().map(|c| c.effective_at_ms));
        bounds.push(end_ms.saturating_add(1));

        let mut segments = Vec::with_capacity(bounds.len().saturating_sub(1));
        for w in bounds.windows(2) {
            let seg_start = w[0];
            let seg_end = (w[1] - 1).min(end_ms);
            if seg_end < seg_start {
                continue;
            }
            let spread = if full_fanout {
                ShardHasher::spread_for_shard_count(self.shard_hasher.num_shards())
            } else {
                self.spread_provider.spread_at(seg_start)
            };
            let shards = self.shard_hasher.shards_at_spread(base_shard, spread);
            segments.push((seg_start, seg_end, shards));
        }
        segments
    }

    /// Per-(time segment, shard) leaf scans for `filters` over
    /// `[start_ms, end_ms]`. Bails with `TooManyShardsQueried` before
    /// planning a single leaf if the resolved shard count exceeds
    /// `ctx.planner_params.max_shards_queried`; an unavailable shard (per
    /// the `ShardMapper`) is either skipped with `stats` marked partial
    /// (`allow_partial_results`) or turned into a hard `ShardNotAvailable`.
    /// Each surviving leaf is independently foldable — the basis both for a
    /// plain `Concat` and for the aggregation-parallelism two-level reduce.
    fn leaf_scans(&self, filters: &[ColumnFilter], start_ms: i64, end_ms: i64, ctx: &QueryContext, stats: &QueryStats) -> Result<Vec<ExecPlan>> {
        let segments = self.shard_segments(filters, start_ms, end_ms);
        let requested: usize = segments.iter().map(|(_, _, shards)| shards.len()).sum();
        let limit = ctx.planner_params.max_shards_queried;
        if requested > limit {
            return Err(Error::TooManyShardsQueried { requested, limit });
        }

        let mut leaves = Vec::new();
        for (seg_start, seg_end, shards) in segments {
            for shard in shards {
                if self.shard_mapper.status(shard).is_unavailable() {
                    debug!(%shard, "skipping unavailable shard");
                    stats.mark_shard_unavailable();
                    if !ctx.planner_params.allow_partial_results {
                        return Err(Error::ShardNotAvailable { shard });
                    }
                    continue;
                }
                leaves.push(ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
                    dataset: self.dataset.reference.clone(),
                    shard,
                    chunk_method: ChunkMethod { start_ms: seg_start, end_ms: seg_end },
                    filters: filters.to_vec(),
                }));
            }
        }
        Ok(leaves)
    }

    /// Wraps `leaf_scans` in `Transform::PeriodicSamples` resampling onto
    /// the output grid `[grid.start_ms, grid.end_ms]`, applying `function`
    /// over `window_ms` if given.
    #[allow(clippy::too_many_arguments)]
    fn periodic_leaf_scans(
        &self,
        filters: &[ColumnFilter],
        grid: OutputRange,
        window_ms: Option<i64>,
        function: Option<RangeFunction>,
        offset_ms: i64,
        param: Option<f64>,
        ctx: &QueryContext,
        stats: &QueryStats,
    ) -> Result<Vec<ExecPlan>> {
        let scan_start = grid.start_ms - offset_ms - window_ms.unwrap_or(0) - DEFAULT_STALE_LOOKBACK_MS;
        let scan_end = grid.end_ms - offset_ms;
        Ok(self
            .leaf_scans(filters, scan_start, scan_end, ctx, stats)?
            .into_iter()
            .map(|leaf| {
                leaf.transform(Transform::PeriodicSamples {
                    start_ms: grid.start_ms,
                    end_ms: grid.end_ms,
                    step_ms: grid.step_ms,
                    window_ms,
                    function,
                    offset_ms,
                    param,
                    stale_lookback_ms: DEFAULT_STALE_LOOKBACK_MS,
                })
            })
            .collect())
    }

    fn output_grid(&self, ctx: &QueryContext) -> OutputRange {
        OutputRange::new(ctx.start_ms(), ctx.end_ms(), ctx.step_ms())
    }

    /// Attempts to decompose `logical` into one `ExecPlan` per shard,
    /// sharing no cross-shard state before an aggregate would fold them.
    /// `Some` only for the shapes that are genuinely independent per
    /// shard: selectors, per-row instant functions, range functions over a
    /// selector, and unary/scalar arithmetic over any of those. Binary
    /// vector-vector joins and nested aggregates fall back to `None` —
    /// `compile` still produces a correct plan for them, just without the
    /// two-level reduce optimization.
    fn try_leafwise(&self, logical: &LogicalPlan, ctx: &QueryContext, grid: OutputRange, stats: &QueryStats) -> Result<Option<Vec<ExecPlan>>> {
        Ok(match logical {
            LogicalPlan::VectorSelector(vs) => {
                let (filters, le) = self.rewrite_histogram_bucket(self.selector_filters(vs));
                let offset_ms = vs.offset_ms.unwrap_or(0);
                Some(Self::with_histogram_bucket(self.periodic_leaf_scans(&filters, grid, None, None, offset_ms, None, ctx, stats)?, le))
            }
            LogicalPlan::RangeSelector { selector, range_ms } => {
                let (filters, le) = self.rewrite_histogram_bucket(self.selector_filters(selector));
                let offset_ms = selector.offset_ms.unwrap_or(0);
                Some(Self::with_histogram_bucket(
                    self.periodic_leaf_scans(&filters, grid, Some(*range_ms), None, offset_ms, None, ctx, stats)?,
                    le,
                ))
            }
            LogicalPlan::Call { func, args } => self.try_leafwise_call(func, args, ctx, grid, stats)?,
            LogicalPlan::Unary { negative, expr } => {
                let Some(inner) = self.try_leafwise(expr, ctx, grid, stats)? else {
                    return Ok(None);
                };
                if !*negative {
                    Some(inner)
                } else {
                    Some(
                        inner
                            .into_iter()
                            .map(|p| {
                                p.transform(Transform::ScalarArithmetic {
                                    op: ArithmeticOp::Sub,
                                    scalar: 0.0,
                                    scalar_on_left: true,
                                })
                            })
                            .collect(),
                    )
                }
            }
            LogicalPlan::Binary { op, lhs, rhs, .. } if !op.is_set_operator() => {
                match (as_scalar(lhs), as_scalar(rhs)) {
                    (None, Some(scalar)) => {
                        let Some(inner) = self.try_leafwise(lhs, ctx, grid, stats)? else {
                            return Ok(None);
                        };
                        Some(scalar_map(inner, arithmetic_op(*op), scalar, false))
                    }
                    (Some(scalar), None) => {
                        let Some(inner) = self.try_leafwise(rhs, ctx, grid, stats)? else {
                            return Ok(None);
                        };
                        Some(scalar_map(inner, arithmetic_op(*op), scalar, true))
                    }
                    _ => None,
                }
            }
            _ => None,
        })
    }

    fn try_leafwise_call(&self, func: &str, args: &[LogicalPlan], ctx: &QueryContext, grid: OutputRange, stats: &QueryStats) -> Result<Option<Vec<ExecPlan>>> {
        if let Some(rf) = RangeFunction::from_name(func) {
            let Some((selector, range_ms, offset_ms)) = range_argument(args) else {
                return Ok(None);
            };
            let (filters, le) = self.rewrite_histogram_bucket(self.selector_filters(selector));
            let param = range_param(rf, args);
            return Ok(Some(Self::with_histogram_bucket(
                self.periodic_leaf_scans(&filters, grid, Some(range_ms), Some(rf), offset_ms, param, ctx, stats)?,
                le,
            )));
        }
        if let Some(instant_fn) = InstantFunction::from_name(func) {
            let Some(inner_expr) = args.first() else {
                return Ok(None);
            };
            let Some(inner) = self.try_leafwise(inner_expr, ctx, grid, stats)? else {
                return Ok(None);
            };
            let param = instant_fn.takes_param().then(|| scalar_literal(args.get(1)));
            return Ok(Some(
                inner
                    .into_iter()
                    .map(|p| p.transform(Transform::InstantFunction { function: instant_fn, param: param.flatten() }))
                    .collect(),
            ));
        }
        Ok(None)
    }

    /// Builds the full `ExecPlan` for `logical`, output on `ctx`'s grid.
    fn compile_at_grid(&self, logical: &LogicalPlan, ctx: &QueryContext, grid: OutputRange, stats: &QueryStats) -> Result<ExecPlan> {
        if let Some(leaves) = self.try_leafwise(logical, ctx, grid, stats)? {
            return Ok(concat_or_empty(leaves));
        }

        match logical {
            LogicalPlan::Aggregate { op, expr, param, grouping } => self.compile_aggregate(*op, expr, param.as_deref(), grouping, ctx, grid, stats),
            LogicalPlan::Binary { op, lhs, rhs, matching } => self.compile_binary(*op, lhs, rhs, matching, ctx, grid, stats),
            LogicalPlan::Subquery { expr, range_ms, step_ms, offset_ms } => {
                let inner_grid = subquery_grid(grid, *range_ms, step_ms.unwrap_or(grid.step_ms), offset_ms.unwrap_or(0));
                self.compile_at_grid(expr, ctx, inner_grid, stats)
            }
            LogicalPlan::NumberLiteral(_) | LogicalPlan::StringLiteral(_) => Err(Error::ScalarOnlyResult),
            // VectorSelector/RangeSelector/Call/Unary/scalar-Binary are all
            // handled by `try_leafwise` above; reaching here means a
            // leafwise attempt returned `None` for a shape it doesn't
            // special-case (e.g. an unknown function name).
            LogicalPlan::Call { func, .. } => Err(Error::UnknownFunction { name: func.clone() }),
            _ => Err(Error::UnsupportedFunction { func: format!("{logical}") }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_aggregate(
        &self,
        op: PromAggregateOp,
        expr: &LogicalPlan,
        param: Option<&LogicalPlan>,
        grouping: &promql::Grouping,
        ctx: &QueryContext,
        grid: OutputRange,
        stats: &QueryStats,
    ) -> Result<ExecPlan> {
        let q_op = convert_aggregate_op(op);
        let q_param = param.and_then(as_scalar);
        let (by, without) = match grouping.modifier {
            Some(GroupMod::By) => (grouping.labels.clone(), Vec::new()),
            Some(GroupMod::Without) => (Vec::new(), grouping.labels.clone()),
            None => (Vec::new(), Vec::new()),
        };

        if let Some(leaves) = self.try_leafwise(expr, ctx, grid, stats)? {
            if q_op.is_directly_associative() && leaves.len() > self.tier.reduce_shards_per_node {
                let children: Vec<ExecPlan> = leaves
                    .into_iter()
                    .map(|p| {
                        p.transform(Transform::AggregateMapReduce {
                            op: q_op,
                            param: q_param,
                            by: by.clone(),
                            without: without.clone(),
                        })
                    })
                    .collect();
                return Ok(ExecPlan::ReduceAggregate {
                    children,
                    op: top_level_op(q_op),
                    param: q_param,
                });
            }
            return Ok(concat_or_empty(leaves).transform(Transform::AggregateMapReduce { op: q_op, param: q_param, by, without }));
        }

        let inner = self.compile_at_grid(expr, ctx, grid, stats)?;
        Ok(inner.transform(Transform::AggregateMapReduce { op: q_op, param: q_param, by, without }))
    }

    fn compile_binary(
        &self,
        op: BinaryOp,
        lhs: &LogicalPlan,
        rhs: &LogicalPlan,
        matching: &promql::VectorMatching,
        ctx: &QueryContext,
        grid: OutputRange,
        stats: &QueryStats,
    ) -> Result<ExecPlan> {
        let left = self.compile_at_grid(lhs, ctx, grid, stats)?;
        let right = self.compile_at_grid(rhs, ctx, grid, stats)?;
        if op.is_set_operator() {
            return Ok(ExecPlan::SetOperator { left: Box::new(left), right: Box::new(right), op: set_op(op) });
        }
        let join_matching = JoinMatching {
            on: if matching.on { matching.labels.clone() } else { Vec::new() },
            ignoring: if matching.on { Vec::new() } else { matching.labels.clone() },
            include: matching.include.clone(),
            cardinality: matching.cardinality.map(vector_cardinality),
        };
        Ok(ExecPlan::BinaryJoin {
            left: Box::new(left),
            right: Box::new(right),
            op: arithmetic_op(op),
            matching: join_matching,
        })
    }
}

impl Planner for SingleClusterPlanner {
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<ExecPlan> {
        let grid = self.output_grid(ctx);
        let (clipped_start, clipped_end) = match self.clip_to_retention(grid.start_ms, grid.end_ms, grid.step_ms, 0, 0) {
            Some(bounds) => bounds,
            None => return Ok(ExecPlan::Leaf(LeafOp::EmptyResult)),
        };
        let clipped_grid = OutputRange::new(clipped_start, clipped_end, grid.step_ms);
        self.compile_at_grid(logical, ctx, clipped_grid, stats).map_err(Into::into)
    }
}

/// Metadata endpoints (label names/values, series, cardinality) don't
/// compile a `LogicalPlan` at all — they fan the same `filters` out across
/// the shards that could hold matching series and concat the per-shard
/// answers, skipping the aggregation/grid machinery entirely.
impl SingleClusterPlanner {
    fn metadata_leaves(
        &self,
        filters: &[ColumnFilter],
        start_ms: i64,
        end_ms: i64,
        mut leaf: impl FnMut(ShardId) -> LeafOp,
    ) -> Vec<ExecPlan> {
        let mut leaves = Vec::new();
        for (_, _, shards) in self.shard_segments(filters, start_ms, end_ms) {
            for shard in shards {
                if self.shard_mapper.status(shard).is_unavailable() {
                    debug!(%shard, "skipping unavailable shard");
                    continue;
                }
                leaves.push(ExecPlan::Leaf(leaf(shard)));
            }
        }
        leaves
    }

    /// `LabelValuesDistConcatExec`-equivalent: one multi-column row per
    /// distinct combination `labels` takes on among series matching
    /// `filters` within `[start_ms, end_ms]`.
    pub fn plan_label_values(&self, filters: &[ColumnFilter], labels: &[String], start_ms: i64, end_ms: i64) -> ExecPlan {
        let dataset = self.dataset.reference.clone();
        let leaves = self.metadata_leaves(filters, start_ms, end_ms, |shard| LeafOp::LabelValues {
            dataset: dataset.clone(),
            shard,
            filters: filters.to_vec(),
            labels: labels.to_vec(),
        });
        concat_or_empty(leaves)
    }

    /// The distinct label names present among series matching `filters`.
    pub fn plan_label_names(&self, filters: &[ColumnFilter], start_ms: i64, end_ms: i64) -> ExecPlan {
        let dataset = self.dataset.reference.clone();
        let leaves = self.metadata_leaves(filters, start_ms, end_ms, |shard| LeafOp::LabelNames {
            dataset: dataset.clone(),
            shard,
            filters: filters.to_vec(),
        });
        concat_or_empty(leaves)
    }

    /// The distinct partition keys (series) matching `filters`, with their
    /// active chunk's time bounds narrowed to `[start_ms, end_ms]`.
    pub fn plan_part_keys(&self, filters: &[ColumnFilter], start_ms: i64, end_ms: i64) -> ExecPlan {
        let dataset = self.dataset.reference.clone();
        let mut leaves = Vec::new();
        for (seg_start, seg_end, shards) in self.shard_segments(filters, start_ms, end_ms) {
            for shard in shards {
                if self.shard_mapper.status(shard).is_unavailable() {
                    continue;
                }
                leaves.push(ExecPlan::Leaf(LeafOp::PartKeys {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.to_vec(),
                    chunk_method: ChunkMethod { start_ms: seg_start, end_ms: seg_end },
                }));
            }
        }
        concat_or_empty(leaves)
    }

    /// Series cardinality among series matching `filters`.
    pub fn plan_label_cardinality(&self, filters: &[ColumnFilter], start_ms: i64, end_ms: i64) -> ExecPlan {
        let dataset = self.dataset.reference.clone();
        let leaves = self.metadata_leaves(filters, start_ms, end_ms, |shard| LeafOp::LabelCardinality {
            dataset: dataset.clone(),
            shard,
            filters: filters.to_vec(),
        });
        concat_or_empty(leaves)
    }

    /// Top-`k` cardinality by `metric_column` under `shard_key_prefix`, as
    /// of `as_of_ms`. Not time-ranged: cardinality is read off the current
    /// shard index state rather than any particular chunk.
    pub fn plan_topk_cardinality(&self, shard_key_prefix: &[ColumnFilter], metric_column: &str, k: usize, as_of_ms: i64) -> ExecPlan {
        let pairs = self.shard_key_pairs(shard_key_prefix);
        let base_shard = pairs.as_ref().map(|p| self.shard_hasher.shard_for(p.iter().copied())).unwrap_or_else(|| ShardId::new(0));
        let spread = if pairs.is_none() {
            ShardHasher::spread_for_shard_count(self.shard_hasher.num_shards())
        } else {
            self.spread_provider.spread_at(as_of_ms)
        };
        let dataset = self.dataset.reference.clone();
        let leaves: Vec<ExecPlan> = self
            .shard_hasher
            .shards_at_spread(base_shard, spread)
            .into_iter()
            .filter(|shard| !self.shard_mapper.status(*shard).is_unavailable())
            .map(|shard| {
                ExecPlan::Leaf(LeafOp::TopkCardinality {
                    dataset: dataset.clone(),
                    shard,
                    shard_key_prefix: shard_key_prefix.to_vec(),
                    metric_column: metric_column.to_string(),
                    k,
                })
            })
            .collect();
        concat_or_empty(leaves)
    }
}

fn concat_or_empty(mut leaves: Vec<ExecPlan>) -> ExecPlan {
    if leaves.len() == 1 {
        leaves.pop().unwrap()
    } else {
        ExecPlan::Concat { children: leaves }
    }
}

fn as_scalar(expr: &LogicalPlan) -> Option<f64> {
    match expr {
        LogicalPlan::NumberLiteral(n) => Some(*n),
        LogicalPlan::Unary { negative, expr } => as_scalar(expr).map(|v| if *negative { -v } else { v }),
        _ => None,
    }
}

fn scalar_literal(expr: Option<&LogicalPlan>) -> Option<f64> {
    expr.and_then(as_scalar)
}

fn scalar_map(plans: Vec<ExecPlan>, op: ArithmeticOp, scalar: f64, scalar_on_left: bool) -> Vec<ExecPlan> {
    plans.into_iter().map(|p| p.transform(Transform::ScalarArithmetic { op, scalar, scalar_on_left })).collect()
}

fn arithmetic_op(op: BinaryOp) -> ArithmeticOp {
    match op {
        BinaryOp::Add => ArithmeticOp::Add,
        BinaryOp::Sub => ArithmeticOp::Sub,
        BinaryOp::Mul => ArithmeticOp::Mul,
        BinaryOp::Div => ArithmeticOp::Div,
        BinaryOp::Mod => ArithmeticOp::Mod,
        BinaryOp::Pow => ArithmeticOp::Pow,
        BinaryOp::Eq => ArithmeticOp::Eq,
        BinaryOp::Ne => ArithmeticOp::Ne,
        BinaryOp::Gt => ArithmeticOp::Gt,
        BinaryOp::Lt => ArithmeticOp::Lt,
        BinaryOp::Ge => ArithmeticOp::Ge,
        BinaryOp::Le => ArithmeticOp::Le,
        BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => unreachable!("set operators handled separately"),
    }
}

fn set_op(op: BinaryOp) -> SetOp {
    match op {
        BinaryOp::And => SetOp::And,
        BinaryOp::Or => SetOp::Or,
        BinaryOp::Unless => SetOp::Unless,
        _ => unreachable!("non-set operator routed to compile_binary's set-op branch"),
    }
}

fn vector_cardinality(c: promql::VectorCardinality) -> exec::VectorCardinality {
    match c {
        promql::VectorCardinality::OneToOne => exec::VectorCardinality::OneToOne,
        promql::VectorCardinality::ManyToOne => exec::VectorCardinality::ManyToOne,
        promql::VectorCardinality::OneToMany => exec::VectorCardinality::OneToMany,
        promql::VectorCardinality::ManyToMany => exec::VectorCardinality::ManyToMany,
    }
}

/// Extracts `(selector, range_ms, offset_ms)` from a range function's sole
/// vector-shaped argument, whether written as `x[5m]` or `x[5m] offset 1h`.
fn range_argument(args: &[LogicalPlan]) -> Option<(&VectorSelector, i64, i64)> {
    match args.first()? {
        LogicalPlan::RangeSelector { selector, range_ms } => Some((selector, *range_ms, selector.offset_ms.unwrap_or(0))),
        _ => None,
    }
}

/// `quantile_over_time(q, x[5m])`/`predict_linear(x[5m], t)`/
/// `holt_winters(x[5m], sf, tf)`: the scalar params sit among `args[1..]`.
fn range_param(rf: RangeFunction, args: &[LogicalPlan]) -> Option<f64> {
    if !rf.takes_param() {
        return None;
    }
    args.get(1).and_then(as_scalar)
}

/// §4.3's subquery grid alignment: `firstGrid = ceil((qStart-W)/S)*S`,
/// `lastGrid = floor(qEnd/S)*S`, evaluated against the outer grid's own
/// bounds (`qStart`/`qEnd`) rather than the whole query's original bounds,
/// so nested subqueries align independently at each level.
fn subquery_grid(outer: OutputRange, range_ms: i64, step_ms: i64, offset_ms: i64) -> OutputRange {
    let step_ms = step_ms.max(1);
    let q_start = outer.start_ms - offset_ms;
    let q_end = outer.end_ms - offset_ms;
    let first_grid = div_ceil(q_start - range_ms, step_ms) * step_ms;
    let last_grid = q_end.div_euclid(step_ms) * step_ms;
    OutputRange::new(first_grid, last_grid, step_ms)
}

fn div_ceil(a: i64, b: i64) -> i64 {
    let d = a.div_euclid(b);
    if a.rem_euclid(b) == 0 {
        d
    } else {
        d + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{EvictionPolicy, PlannerParams, QueryStats, TierConfig, TierKind};
    use schema::{ColumnType, DataSchema, DatasetOptions, DatasetRef};
    use time_provider::{MockProvider, Time};

    fn planner(num_shards: u32) -> SingleClusterPlanner {
        let dataset = Arc::new(Dataset::new(
            DatasetRef::new("prometheus"),
            ["_ws_".to_string(), "_ns_".to_string(), "_metric_".to_string()],
            vec![DataSchema::single_value("promCounter", ColumnType::Counter)],
            DatasetOptions::default(),
        ));
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(10_000_000_000)));
        let tier = Arc::new(TierConfig::new(TierKind::Raw, 30 * 24 * 60 * 60 * 1000, clock).with_eviction_policy(EvictionPolicy::fixed_max_partitions(1_000)));
        let hasher = ShardHasher::new(num_shards).unwrap();
        let mapper = Arc::new(crate::shard_mapper::StaticShardMapper::all_active(num_shards));
        let spread = Arc::new(sharder::ConstantSpreadProvider::new(ShardHasher::spread_for_shard_count(num_shards)));
        SingleClusterPlanner::new(dataset, tier, hasher, mapper, spread)
    }

    fn ctx(start_secs: i64, step_secs: i64, end_secs: i64) -> QueryContext {
        QueryContext::new("q1", start_secs, step_secs, end_secs, PlannerParams::default())
    }

    fn selector(metric: &str) -> LogicalPlan {
        LogicalPlan::VectorSelector(VectorSelector {
            metric: Some(metric.to_string()),
            matchers: vec![],
            offset_ms: None,
        })
    }

    #[test]
    fn bare_selector_compiles_to_a_single_leaf_scan() {
        let p = planner(1);
        let c = ctx(9_999_990, 10, 10_000_000);
        let plan = p.plan(&selector("up"), &c, &QueryStats::new()).unwrap();
        match plan {
            ExecPlan::Transform { input, .. } => assert!(matches!(*input, ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { .. }))),
            other => panic!("expected a transform over a leaf scan, got {other:?}"),
        }
    }

    #[test]
    fn histogram_bucket_rewrite_drops_le_and_renames_metric() {
        let p = planner(1);
        let c = ctx(9_999_990, 10, 10_000_000);
        let logical = LogicalPlan::Call {
            func: "rate".to_string(),
            args: vec![LogicalPlan::RangeSelector {
                selector: VectorSelector {
                    metric: Some("my_hist_bucket".to_string()),
                    matchers: vec![promql::LabelMatcher {
                        label: "le".to_string(),
                        op: promql::MatchOp::Eq,
                        value: "0.5".to_string(),
                    }],
                    offset_ms: None,
                },
                range_ms: 600_000,
            }],
        };

        let plan = p.plan(&logical, &c, &QueryStats::new()).unwrap();
        let ExecPlan::Transform { input, transform } = plan else {
            panic!("expected a histogram-bucket transform on top, got {plan:?}");
        };
        match transform {
            Transform::HistogramFunction { function, param, le_label, .. } => {
                assert!(matches!(function, HistogramFn::Bucket));
                assert_eq!(param, 0.5);
                assert_eq!(le_label, "le");
            }
            other => panic!("expected HistogramFunction, got {other:?}"),
        }

        let ExecPlan::Transform { input, transform } = *input else {
            panic!("expected the rate's PeriodicSamples transform beneath, got {input:?}");
        };
        assert!(matches!(transform, Transform::PeriodicSamples { function: Some(_), .. }));

        let ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { filters, .. }) = *input else {
            panic!("expected a leaf scan beneath the rate transform");
        };
        assert!(filters.iter().any(|f| f.column == "_metric_" && f.value == "my_hist"));
        assert!(!filters.iter().any(|f| f.column == "le"));
    }

    #[test]
    fn incomplete_shard_key_fans_out_to_every_shard() {
        let p = planner(4);
        let c = ctx(9_999_990, 10, 10_000_000);
        let logical = LogicalPlan::VectorSelector(VectorSelector {
            metric: None,
            matchers: vec![promql::LabelMatcher {
                label: "job".to_string(),
                op: promql::MatchOp::Eq,
                value: "x".to_string(),
            }],
            offset_ms: None,
        });
        let plan = p.plan(&logical, &c, &QueryStats::new()).unwrap();
        let ExecPlan::Concat { children } = plan else {
            panic!("expected a fan-out concat, got {plan:?}");
        };
        assert_eq!(children.len(), 4);
    }

    #[test]
    fn query_entirely_before_retention_returns_empty() {
        let p = planner(1);
        let c = ctx(0, 10, 20);
        let plan = p.plan(&selector("up"), &c, &QueryStats::new()).unwrap();
        assert!(matches!(plan, ExecPlan::Leaf(LeafOp::EmptyResult)));
    }

    #[test]
    fn label_values_fans_out_across_shards() {
        let p = planner(4);
        let plan = p.plan_label_values(&[], &["job".to_string()], 0, 100);
        let ExecPlan::Concat { children } = plan else {
            panic!("expected a fan-out concat, got {plan:?}");
        };
        assert_eq!(children.len(), 4);
        assert!(matches!(children[0], ExecPlan::Leaf(LeafOp::LabelValues { .. })));
    }

    #[test]
    fn part_keys_single_shard_returns_bare_leaf() {
        let p = planner(1);
        let filters = vec![ColumnFilter::equals("job", "x")];
        let plan = p.plan_part_keys(&filters, 0, 100);
        assert!(matches!(plan, ExecPlan::Leaf(LeafOp::PartKeys { .. })));
    }

    #[test]
    fn topk_cardinality_pinned_prefix_targets_one_shard() {
        let p = planner(8);
        let prefix = vec![ColumnFilter::equals("_ws_", "demo")];
        let plan = p.plan_topk_cardinality(&prefix, "_metric_", 10, 5_000);
        assert!(matches!(plan, ExecPlan::Leaf(LeafOp::TopkCardinality { k: 10, .. })));
    }

    #[test]
    fn sum_over_many_shards_uses_two_level_reduce() {
        let tier_cfg = Arc::new(
            TierConfig::new(TierKind::Raw, 30 * 24 * 60 * 60 * 1000, Arc::new(MockProvider::new(Time::from_timestamp_millis(10_000_000_000))))
                .with_reduce_shards_per_node(1),
        );
        let dataset = Arc::new(Dataset::new(
            DatasetRef::new("prometheus"),
            ["_ws_".to_string(), "_ns_".to_string(), "_metric_".to_string()],
            vec![DataSchema::single_value("promCounter", ColumnType::Counter)],
            DatasetOptions::default(),
        ));
        let hasher = ShardHasher::new(4).unwrap();
        let mapper = Arc::new(crate::shard_mapper::StaticShardMapper::all_active(4));
        let spread = Arc::new(sharder::ConstantSpreadProvider::new(2));
        let p = SingleClusterPlanner::new(dataset, tier_cfg, hasher, mapper, spread);

        let c = ctx(9_999_990, 10, 10_000_000);
        let logical = LogicalPlan::Aggregate {
            op: PromAggregateOp::Sum,
            expr: Box::new(LogicalPlan::VectorSelector(VectorSelector {
                metric: None,
                matchers: vec![
                    promql::LabelMatcher { label: "_ws_".to_string(), op: promql::MatchOp::Eq, value: "w".to_string() },
                    promql::LabelMatcher { label: "_ns_".to_string(), op: promql::MatchOp::Eq, value: "n".to_string() },
                    promql::LabelMatcher { label: "_metric_".to_string(), op: promql::MatchOp::Eq, value: "up".to_string() },
                ],
                offset_ms: None,
            })),
            param: None,
            grouping: promql::Grouping::default(),
        };
        let plan = p.plan(&logical, &c, &QueryStats::new()).unwrap();
        let ExecPlan::ReduceAggregate { children, op, .. } = plan else {
            panic!("expected a two-level reduce, got {plan:?}");
        };
        assert_eq!(op, query_functions::AggregateOp::Sum);
        assert_eq!(children.len(), 4);
    }

    #[test]
    fn too_many_shards_queried_is_rejected_before_planning_any_leaf() {
        let p = planner(4);
        let params = PlannerParams { max_shards_queried: 2, ..Default::default() };
        let c = QueryContext::new("q1", 9_999_990, 10, 10_000_000, params);
        let err = p.plan(&selector("up"), &c, &QueryStats::new()).unwrap_err();
        assert!(matches!(err, exec::QueryError::TooManyShardsQueried { requested: 4, limit: 2 }));
    }

    fn planner_with_unavailable_shard_zero() -> SingleClusterPlanner {
        let dataset = Arc::new(Dataset::new(
            DatasetRef::new("prometheus"),
            ["_ws_".to_string(), "_ns_".to_string(), "_metric_".to_string()],
            vec![DataSchema::single_value("promCounter", ColumnType::Counter)],
            DatasetOptions::default(),
        ));
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(10_000_000_000)));
        let tier = Arc::new(TierConfig::new(TierKind::Raw, 30 * 24 * 60 * 60 * 1000, clock).with_eviction_policy(EvictionPolicy::fixed_max_partitions(1_000)));
        let hasher = ShardHasher::new(1).unwrap();
        let mapper = Arc::new(crate::shard_mapper::StaticShardMapper::all_active(1));
        mapper.set_status(ShardId::new(0), data_types::ShardStatus::Recovery);
        let spread = Arc::new(sharder::ConstantSpreadProvider::new(ShardHasher::spread_for_shard_count(1)));
        SingleClusterPlanner::new(dataset, tier, hasher, mapper, spread)
    }

    #[test]
    fn unavailable_shard_is_a_hard_error_when_partial_results_are_disallowed() {
        let p = planner_with_unavailable_shard_zero();
        let c = ctx(9_999_990, 10, 10_000_000);
        let stats = QueryStats::new();
        let err = p.plan(&selector("up"), &c, &stats).unwrap_err();
        assert!(matches!(err, exec::QueryError::ShardNotAvailable { shard } if shard == ShardId::new(0)));
    }

    #[test]
    fn unavailable_shard_is_skipped_and_marks_stats_when_partial_results_are_allowed() {
        let p = planner_with_unavailable_shard_zero();
        let params = PlannerParams { allow_partial_results: true, ..Default::default() };
        let c = QueryContext::new("q1", 9_999_990, 10, 10_000_000, params);
        let stats = QueryStats::new();
        let plan = p.plan(&selector("up"), &c, &stats).unwrap();
        assert!(matches!(plan, ExecPlan::Leaf(LeafOp::EmptyResult) | ExecPlan::Concat { .. } | ExecPlan::Transform { .. }));
        assert!(stats.shard_unavailable());
    }

    #[test]
    fn subquery_grid_aligns_to_step() {
        let outer = OutputRange::new(1_007, 2_013, 100);
        let grid = subquery_grid(outer, 500, 100, 0);
        assert_eq!(grid.start_ms % 100, 0);
        assert_eq!(grid.end_ms % 100, 0);
        assert!(grid.start_ms <= 1_007 - 500 + 100);
        assert!(grid.end_ms <= 2_013);
    }
}
