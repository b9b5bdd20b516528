//! `ExecPlan`: a tagged variant tree over operator kinds (§9's
//! re-architecture of a deep `ExecPlan` class hierarchy into an enum whose
//! variants carry their own params, so plan rewriting is a tree-walk over
//! immutable data).
use data_types::ColumnFilter;
use data_types::ShardId;
use query_functions::{AggregateOp, InstantFunction, RangeFunction};
use schema::DatasetRef;

use crate::remote::PromQlRemoteExec;

/// A single shard-local scan's time bound, separate from the query's output
/// grid (a `PeriodicSamplesMapper` may need a wider scan window for its
/// range function).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMethod {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Leaf operators: §4.2's scan and metadata leaves.
#[derive(Debug, Clone)]
pub enum LeafOp {
    MultiSchemaPartitions {
        dataset: DatasetRef,
        shard: ShardId,
        chunk_method: ChunkMethod,
        filters: Vec<ColumnFilter>,
    },
    LabelValues {
        dataset: DatasetRef,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
        labels: Vec<String>,
    },
    LabelNames {
        dataset: DatasetRef,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
    },
    PartKeys {
        dataset: DatasetRef,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
        chunk_method: ChunkMethod,
    },
    LabelCardinality {
        dataset: DatasetRef,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
    },
    TopkCardinality {
        dataset: DatasetRef,
        shard: ShardId,
        shard_key_prefix: Vec<ColumnFilter>,
        metric_column: String,
        k: usize,
    },
    EmptyResult,
}

/// Join cardinality, per §4.2's `BinaryJoinExec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    And,
    Or,
    Unless,
}

/// Join-label matching (`on`/`ignoring`), plus `group_left`/`group_right`'s
/// carried-through labels from the many side.
#[derive(Debug, Clone, Default)]
pub struct JoinMatching {
    pub on: Vec<String>,
    pub ignoring: Vec<String>,
    pub include: Vec<String>,
    pub cardinality: Option<VectorCardinality>,
}

/// A single non-leaf transform applied to an upstream stream; chained as a
/// `Vec<Transform>` on a `Transform` plan node the way the root spec
/// attaches "a separate variant list" of transformers to every node.
#[derive(Debug, Clone)]
pub enum Transform {
    PeriodicSamples {
        start_ms: i64,
        end_ms: i64,
        step_ms: i64,
        window_ms: Option<i64>,
        function: Option<RangeFunction>,
        offset_ms: i64,
        param: Option<f64>,
        stale_lookback_ms: i64,
    },
    InstantFunction {
        function: InstantFunction,
        param: Option<f64>,
    },
    AggregateMapReduce {
        op: AggregateOp,
        param: Option<f64>,
        by: Vec<String>,
        without: Vec<String>,
    },
    AbsentFunction {
        labels: Vec<(String, String)>,
    },
    /// `histogram_quantile`/`histogram_max_quantile`/`histogram_bucket`: a
    /// many-to-one transform over a bucket family (series sharing every
    /// label except `le_label`), not a per-row map like the other instant
    /// functions, so it gets its own variant rather than folding into
    /// `InstantFunction`.
    HistogramFunction {
        function: HistogramFn,
        param: f64,
        max: Option<f64>,
        le_label: String,
    },
    /// Vector-scalar arithmetic/comparison (`x * 2`, `2 - x`, unary `-x` as
    /// `Sub` with `scalar: 0.0, scalar_on_left: true`). `BinaryJoin` only
    /// combines two vectors, so a literal operand is folded in here
    /// instead of being planned as its own leaf.
    ScalarArithmetic {
        op: ArithmeticOp,
        scalar: f64,
        scalar_on_left: bool,
    },
}

/// Which bucket-family function `Transform::HistogramFunction` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramFn {
    Quantile,
    MaxQuantile,
    Bucket,
}

/// The plan tree. Leaves carry `LeafOp`; everything else is a node
/// combining one or more child plans.
#[derive(Debug, Clone)]
pub enum ExecPlan {
    Leaf(LeafOp),
    Transform {
        input: Box<ExecPlan>,
        transform: Transform,
    },
    BinaryJoin {
        left: Box<ExecPlan>,
        right: Box<ExecPlan>,
        op: ArithmeticOp,
        matching: JoinMatching,
    },
    SetOperator {
        left: Box<ExecPlan>,
        right: Box<ExecPlan>,
        op: SetOp,
    },
    /// `LocalPartitionDistConcatExec` / `LabelValuesDistConcatExec` / etc:
    /// interleaves each child's rows without combining them.
    Concat {
        children: Vec<ExecPlan>,
    },
    /// `LocalPartitionReduceAggregateExec` / `MultiPartitionReduceAggregateExec`:
    /// folds each child's partial accumulators for `op`.
    ReduceAggregate {
        children: Vec<ExecPlan>,
        op: AggregateOp,
        param: Option<f64>,
    },
    /// `StitchRvsExec`: n-way timestamp merge of same-keyed streams from
    /// different tiers/shards/spread segments.
    Stitch {
        children: Vec<ExecPlan>,
    },
    Remote(PromQlRemoteExec),
}

impl ExecPlan {
    pub fn transform(self, transform: Transform) -> Self {
        Self::Transform {
            input: Box::new(self),
            transform,
        }
    }
}
