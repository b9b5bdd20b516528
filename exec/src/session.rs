//! `QuerySession`: the per-query bundle of immutable config and mutable
//! stats threaded through every operator (§9's re-architecture of a shared,
//! mutable `QueryContext`).
use std::sync::Arc;

use data_types::{QueryContext, QueryStats};
use schema::DatasetRef;

#[derive(Debug, Clone)]
pub struct QuerySession {
    pub dataset: DatasetRef,
    pub query_context: Arc<QueryContext>,
    pub stats: Arc<QueryStats>,
}

impl QuerySession {
    pub fn new(dataset: DatasetRef, query_context: QueryContext) -> Self {
        Self::with_stats(dataset, query_context, Arc::new(QueryStats::new()))
    }

    /// Reuses a `QueryStats` already populated during planning (e.g. an
    /// unavailable shard skipped under `allow_partial_results`) instead of
    /// starting the execution-time counters from a fresh instance.
    pub fn with_stats(dataset: DatasetRef, query_context: QueryContext, stats: Arc<QueryStats>) -> Self {
        Self {
            dataset,
            query_context: Arc::new(query_context),
            stats,
        }
    }

    pub fn sample_limit(&self) -> usize {
        self.query_context.planner_params.sample_limit
    }
}
