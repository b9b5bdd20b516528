//! Dataset and data-schema definitions.
//!
//! A [`Dataset`] is a named schema (partition-key columns, data columns,
//! options). One logical dataset can coexist with several [`DataSchema`]s
//! (e.g. `promCounter`, `gauge`, `promHistogram`) which fix the row layout
//! of samples within a series.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs, missing_debug_implementations, clippy::use_self)]

use hashbrown::HashMap;
use indexmap::IndexSet;
use snafu::Snafu;
use std::sync::Arc;

/// Column name the engine uses internally for the metric/measurement name,
/// regardless of what `options.metric_column` calls it at the dataset
/// boundary.
pub const INTERNAL_METRIC_COLUMN: &str = "_metric_";

/// The label name PromQL selectors use for the metric name.
pub const PROM_NAME_LABEL: &str = "__name__";

/// Default shard-key columns: workspace, namespace, metric.
pub const DEFAULT_SHARD_KEY_COLUMNS: &[&str] = &["_ws_", "_ns_", INTERNAL_METRIC_COLUMN];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("data schema \"{name}\" is not known to dataset \"{dataset}\""))]
    UnknownDataSchema { dataset: String, name: String },

    #[snafu(display("data schema \"{name}\" must have at least one value column"))]
    NoValueColumns { name: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A reference to a [`Dataset`], cheap to pass around and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetRef {
    pub dataset: String,
}

impl DatasetRef {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dataset)
    }
}

/// Value column types a [`DataSchema`] row may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// A single IEEE-754 double (counter, gauge).
    Double,
    /// A pre-bucketed histogram (sequence of `(bucket_bound, count)` pairs).
    Histogram,
    /// A monotonic counter-like double that the engine treats specially
    /// for `rate`/`increase` reset detection.
    Counter,
}

/// One column in a [`DataSchema`]: name plus type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Fixes the row layout of samples for one kind of series: a timestamp
/// column plus one or more value columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSchema {
    pub name: String,
    pub timestamp_column: String,
    pub value_columns: Vec<SchemaColumn>,
}

impl DataSchema {
    pub fn new(
        name: impl Into<String>,
        timestamp_column: impl Into<String>,
        value_columns: Vec<SchemaColumn>,
    ) -> Result<Self> {
        let name = name.into();
        if value_columns.is_empty() {
            return NoValueColumnsSnafu { name }.fail();
        }
        Ok(Self {
            name,
            timestamp_column: timestamp_column.into(),
            value_columns,
        })
    }

    /// The single-value-column convenience schema used by most Prometheus
    /// metric types (`promCounter`, `gauge`).
    pub fn single_value(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            timestamp_column: "timestamp".to_string(),
            value_columns: vec![SchemaColumn {
                name: "value".to_string(),
                column_type,
            }],
        }
    }

    /// `promHistogram`: one bucketed-histogram value column.
    pub fn prom_histogram(name: impl Into<String>) -> Self {
        Self::single_value(name, ColumnType::Histogram)
    }

    pub fn is_histogram(&self) -> bool {
        self.value_columns
            .iter()
            .any(|c| c.column_type == ColumnType::Histogram)
    }
}

/// Options controlling how a [`Dataset`]'s series are keyed and sharded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOptions {
    /// The partition-key column treated as the metric name. Defaults to
    /// [`INTERNAL_METRIC_COLUMN`]; may be overridden (e.g. `"kpi"`), in
    /// which case `__name__` in incoming filters is rewritten to this
    /// column by the planner.
    pub metric_column: String,
    /// Columns participating in shard-key hashing, in order.
    pub shard_key_columns: Vec<String>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            metric_column: INTERNAL_METRIC_COLUMN.to_string(),
            shard_key_columns: DEFAULT_SHARD_KEY_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// A named schema: partition-key columns, one or more [`DataSchema`]s, and
/// [`DatasetOptions`].
#[derive(Debug, Clone)]
pub struct Dataset {
    pub reference: DatasetRef,
    pub partition_key_columns: IndexSet<String>,
    data_schemas: HashMap<String, Arc<DataSchema>>,
    pub options: DatasetOptions,
}

impl Dataset {
    pub fn new(
        reference: DatasetRef,
        partition_key_columns: impl IntoIterator<Item = String>,
        data_schemas: Vec<DataSchema>,
        options: DatasetOptions,
    ) -> Self {
        Self {
            reference,
            partition_key_columns: partition_key_columns.into_iter().collect(),
            data_schemas: data_schemas
                .into_iter()
                .map(|s| (s.name.clone(), Arc::new(s)))
                .collect(),
            options,
        }
    }

    pub fn data_schema(&self, name: &str) -> Result<Arc<DataSchema>> {
        self.data_schemas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDataSchema {
                dataset: self.reference.to_string(),
                name: name.to_string(),
            })
    }

    pub fn data_schemas(&self) -> impl Iterator<Item = &Arc<DataSchema>> {
        self.data_schemas.values()
    }

    /// `true` if this dataset's metric column differs from the PromQL
    /// `__name__` label, i.e. label rewriting is required at plan time.
    pub fn needs_metric_column_rewrite(&self) -> bool {
        self.options.metric_column != PROM_NAME_LABEL
    }
}
