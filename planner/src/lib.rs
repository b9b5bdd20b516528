//! Compiles a parsed PromQL [`promql::LogicalPlan`] into an [`exec::ExecPlan`].
//!
//! Five planner types, one per §4.3–§4.7: [`single_cluster::SingleClusterPlanner`]
//! (retention clipping, shard selection, label rewriting, aggregation
//! parallelism, subquery/offset semantics), [`long_time_range::LongTimeRangePlanner`]
//! (raw/downsample tier split), [`multi_partition::MultiPartitionPlanner`]
//! (cross-partition fan-out), [`shard_key_regex::ShardKeyRegexPlanner`]
//! (regex shard-key expansion), and [`single_partition::PlannerSelector`]
//! (routes a metric name to the planner that owns it). Cycles between them
//! (multi-partition → single-partition → long-range → single-cluster) are
//! resolved by constructor injection rather than a shared registry, per §9:
//! each planner holds its collaborators as `Arc<dyn Planner>` and the call
//! graph is a DAG fixed at construction time.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

pub mod long_time_range;
pub mod multi_partition;
pub mod shard_key_regex;
pub mod shard_mapper;
pub mod single_cluster;
pub mod single_partition;

use data_types::{QueryContext, QueryStats};
use promql::LogicalPlan;

pub use long_time_range::LongTimeRangePlanner;
pub use multi_partition::{MultiPartitionPlanner, PartitionAssignment, PartitionLocationProvider};
pub use shard_key_regex::{ShardKeyMatcher, ShardKeyRegexPlanner};
pub use shard_mapper::{ShardMapper, StaticShardMapper};
pub use single_cluster::SingleClusterPlanner;
pub use single_partition::PlannerSelector;

/// Every planner in this crate compiles the same `LogicalPlan` into the same
/// `ExecPlan` shape, so callers (and other planners composing one as a
/// collaborator) can hold any of them behind `Arc<dyn Planner>`.
pub trait Planner: std::fmt::Debug + Send + Sync {
    /// `stats` accumulates plan-time facts (currently just an unavailable
    /// shard skipped under `allow_partial_results`) the same way it
    /// accumulates execution-time counters, so the dispatcher can read one
    /// bundle to decide whether the final result is partial.
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<exec::ExecPlan>;
}

/// Converts the parser's `AggregateOp` into `query_functions`'s identical
/// enum. The two are defined separately because `promql` does not depend on
/// `query_functions`; this is the one seam where a planner has to bridge
/// them.
pub(crate) fn convert_aggregate_op(op: promql::AggregateOp) -> query_functions::AggregateOp {
    use promql::AggregateOp as P;
    use query_functions::AggregateOp as Q;
    match op {
        P::Sum => Q::Sum,
        P::Avg => Q::Avg,
        P::Count => Q::Count,
        P::Group => Q::Group,
        P::Min => Q::Min,
        P::Max => Q::Max,
        P::Stddev => Q::Stddev,
        P::Stdvar => Q::Stdvar,
        P::Topk => Q::Topk,
        P::Bottomk => Q::Bottomk,
        P::CountValues => Q::CountValues,
        P::Quantile => Q::Quantile,
    }
}
