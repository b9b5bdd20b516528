//! `QueryResult`/`QueryResponse`: what `QuerySession::execute` ultimately
//! produces (§4.2, §6).
use std::sync::Arc;

use data_types::QueryStats;
use schema::SchemaColumn;

use crate::error::QueryError;
use crate::range_vector::RangeVector;

pub struct QueryResult {
    pub id: String,
    pub schema: Vec<SchemaColumn>,
    pub range_vectors: Vec<RangeVector>,
    pub stats: Arc<QueryStats>,
    pub partial: bool,
    pub message: Option<String>,
}

impl QueryResult {
    pub fn new(id: impl Into<String>, schema: Vec<SchemaColumn>, range_vectors: Vec<RangeVector>, stats: Arc<QueryStats>) -> Self {
        Self {
            id: id.into(),
            schema,
            range_vectors,
            stats,
            partial: false,
            message: None,
        }
    }

    pub fn partial(mut self, message: impl Into<String>) -> Self {
        self.partial = true;
        self.message = Some(message.into());
        self
    }
}

/// Either branch of §4.2's `execute(store, session) → QueryResponse`.
pub enum QueryResponse {
    Result(QueryResult),
    Error {
        id: String,
        stats: Arc<QueryStats>,
        cause: QueryError,
    },
}

impl QueryResponse {
    pub fn error(id: impl Into<String>, stats: Arc<QueryStats>, cause: QueryError) -> Self {
        Self::Error {
            id: id.into(),
            stats,
            cause,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// §6's metadata endpoints (label-values, label-names, series, label- and
/// top-k cardinality) don't share `QueryResult`'s range-vector shape, so
/// dispatching one yields this instead.
#[derive(Debug)]
pub enum MetadataResponse {
    Labels(Vec<String>),
    LabelValues(Vec<data_types::PartKey>),
    PartKeys(Vec<data_types::PartKey>),
    LabelCardinality(std::collections::HashMap<String, usize>),
    Cardinality(Vec<(String, usize)>),
    Error { cause: QueryError },
}

impl MetadataResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
