//! `Dispatcher`: where a planner hands a compiled [`ExecPlan`] off for
//! execution, replacing an actor-addressed dispatch with an explicit async
//! call (§9's re-architecture of "implicit actor dispatch" into a plain
//! trait object a planner can hold and call directly).
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chunk_store::TimeSeriesMemStore;
use observability_deps::tracing::warn;
use remote_client::RemoteClient;
use schema::SchemaColumn;

use crate::engine::{self, ExecResult};
use crate::error::QueryError;
use crate::plan::ExecPlan;
use crate::response::{MetadataResponse, QueryResponse, QueryResult};
use crate::session::QuerySession;

#[async_trait]
pub trait Dispatcher: std::fmt::Debug + Send + Sync {
    async fn dispatch(&self, plan: ExecPlan, session: QuerySession) -> QueryResponse;

    /// Dispatches a plan rooted at one of the metadata `LeafOp`s
    /// (label-values, label-names, series, cardinality); §6's metadata
    /// endpoints go through this instead of `dispatch` since their result
    /// isn't range-vector shaped.
    async fn dispatch_metadata(&self, plan: ExecPlan, session: QuerySession) -> MetadataResponse;

    /// Name of the cluster this dispatcher ultimately executes against;
    /// surfaced in logs and in a partial result's diagnostic message.
    fn cluster_name(&self) -> &str;

    /// `true` if `dispatch` never crosses a process boundary. A planner
    /// uses this to decide whether it's safe to skip serializing a plan
    /// fragment to PromQL text and instead execute it in-process.
    fn is_local_call(&self) -> bool {
        true
    }
}

/// Executes a plan against a local [`TimeSeriesMemStore`], following
/// [`ExecPlan::Remote`] leaves out over HTTP via a shared [`RemoteClient`].
#[derive(Debug)]
pub struct InProcessPlanDispatcher {
    store: Arc<TimeSeriesMemStore>,
    remote: RemoteClient,
    cluster_name: String,
}

impl InProcessPlanDispatcher {
    pub fn new(store: Arc<TimeSeriesMemStore>, cluster_name: impl Into<String>) -> Self {
        Self {
            store,
            remote: RemoteClient::new(),
            cluster_name: cluster_name.into(),
        }
    }
}

#[async_trait]
impl Dispatcher for InProcessPlanDispatcher {
    async fn dispatch(&self, plan: ExecPlan, session: QuerySession) -> QueryResponse {
        let query_id = session.query_context.query_id.clone();
        let stats = session.stats.clone();
        let timeout_millis = session.query_context.planner_params.query_timeout_millis;

        let result = match tokio::time::timeout(Duration::from_millis(timeout_millis), engine::execute(&plan, &self.store, &self.remote, &session)).await {
            Ok(result) => result,
            Err(_) => return QueryResponse::error(query_id, stats, QueryError::QueryTimeout { timeout_millis }),
        };

        match result {
            Ok(ExecResult::RangeVectors(rvs)) => {
                let mut result = QueryResult::new(query_id, Vec::<SchemaColumn>::new(), rvs, stats.clone());
                if stats.shard_unavailable() {
                    result = result.partial(format!("one or more shards were unavailable on cluster {}", self.cluster_name));
                }
                QueryResponse::Result(result)
            }
            Ok(other) => {
                warn!(kind = ?other, "top-level dispatch of a metadata-shaped plan is not representable as a QueryResult");
                QueryResponse::error(
                    query_id,
                    stats,
                    QueryError::Internal {
                        message: "top-level plan must resolve to range vectors".to_string(),
                    },
                )
            }
            Err(cause) => QueryResponse::error(query_id, stats, cause),
        }
    }

    async fn dispatch_metadata(&self, plan: ExecPlan, session: QuerySession) -> MetadataResponse {
        match engine::execute(&plan, &self.store, &self.remote, &session).await {
            Ok(ExecResult::RangeVectors(_)) => MetadataResponse::Error {
                cause: QueryError::Internal {
                    message: "metadata dispatch of a range-vector-shaped plan is not representable".to_string(),
                },
            },
            Ok(ExecResult::Labels(labels)) => MetadataResponse::Labels(labels),
            Ok(ExecResult::LabelValues(rows)) => MetadataResponse::LabelValues(rows),
            Ok(ExecResult::PartKeys(keys)) => MetadataResponse::PartKeys(keys),
            Ok(ExecResult::Cardinality(counts)) => MetadataResponse::Cardinality(counts),
            Ok(ExecResult::LabelCardinality(counts)) => MetadataResponse::LabelCardinality(counts.into_iter().collect()),
            Err(cause) => MetadataResponse::Error { cause },
        }
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}
