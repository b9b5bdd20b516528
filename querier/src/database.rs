//! `QuerierDatabase`: the single entry point a wire-level front end calls
//! into — PromQL text and metadata requests in, a `QueryResponse`/
//! `MetadataResponse` out. Wires the five planner types behind one
//! `Arc<dyn Planner>` call graph and an `InProcessPlanDispatcher`, per §9's
//! "cycles between planners resolved by constructor injection" guidance.
use std::sync::Arc;

use chunk_store::TimeSeriesMemStore;
use data_types::{ColumnFilter, PlannerParams, QueryContext, QueryStats, TierConfigRef};
use exec::{Dispatcher, InProcessPlanDispatcher, MetadataResponse, QueryError, QueryResponse, QuerySession};
use observability_deps::tracing::debug;
use planner::long_time_range::DownsampleHorizon;
use planner::multi_partition::{MultiPartitionPlanner, PartitionLocationProvider};
use planner::shard_key_regex::ShardKeyMatcher;
use planner::single_partition::RecordingRuleSuffixRouter;
use planner::{LongTimeRangePlanner, Planner, PlannerSelector, ShardKeyRegexPlanner, ShardMapper, SingleClusterPlanner};
use promql::LabelMatcher;
use schema::{Dataset, DatasetRef};
use sharder::{ShardHasher, SpreadProvider};
use snafu::{ResultExt, Snafu};
use time_provider::TimeProviderRef;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build shard hasher: {source}"))]
    InvalidShardCount { source: sharder::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shard-key columns a regex matcher can expand; `None` leaves regex
/// shard-key filters to the ordinary full-fanout path in
/// [`SingleClusterPlanner`].
pub struct ShardKeyExpansion {
    pub matcher: Arc<dyn ShardKeyMatcher>,
    pub shard_key_columns: Vec<String>,
}

impl std::fmt::Debug for ShardKeyExpansion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardKeyExpansion").field("shard_key_columns", &self.shard_key_columns).finish()
    }
}

/// Cross-partition routing; `None` means this database only ever serves its
/// own local partition and `MultiPartitionPlanner` is skipped entirely.
pub struct MultiPartitionRouting {
    pub locations: Arc<dyn PartitionLocationProvider>,
    pub routing_key_columns: Vec<String>,
}

impl std::fmt::Debug for MultiPartitionRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPartitionRouting").field("routing_key_columns", &self.routing_key_columns).finish()
    }
}

/// Everything [`QuerierDatabase::new`] needs to wire its planner DAG:
/// one dataset shared by three cluster roles (raw, downsample,
/// recording-rules — §4.3's note that the three differ only in
/// `TierConfig`), the shard topology they're all sharded the same way
/// over, and the two optional cross-cutting planners (§4.5, §4.6).
#[derive(Debug)]
pub struct QuerierDatabaseConfig {
    pub dataset: Arc<Dataset>,
    pub raw_tier: TierConfigRef,
    pub downsample_tier: TierConfigRef,
    pub recording_rules_tier: TierConfigRef,
    pub num_shards: u32,
    pub shard_mapper: Arc<dyn ShardMapper>,
    pub spread_provider: Arc<dyn SpreadProvider>,
    pub time_provider: TimeProviderRef,
    /// How far downsampling lags raw ingest; see [`DownsampleHorizon`].
    pub downsample_lag_ms: i64,
    pub shard_key_expansion: Option<ShardKeyExpansion>,
    pub multi_partition: Option<MultiPartitionRouting>,
    pub cluster_name: String,
}

/// The top-level query database: a composed `Planner` DAG plus the
/// dispatcher and store it runs against. Construction is the only place
/// that sees the whole planner wiring; every other part of this crate's
/// API just calls through `self.planner`/`self.dispatcher`.
#[derive(Debug)]
pub struct QuerierDatabase {
    dataset: DatasetRef,
    planner: Arc<dyn Planner>,
    raw_planner: Arc<SingleClusterPlanner>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl QuerierDatabase {
    pub fn new(store: Arc<TimeSeriesMemStore>, config: QuerierDatabaseConfig) -> Result<Self> {
        let hasher = ShardHasher::new(config.num_shards).context(InvalidShardCountSnafu)?;

        let raw_planner = Arc::new(SingleClusterPlanner::new(
            config.dataset.clone(),
            config.raw_tier,
            hasher.clone(),
            config.shard_mapper.clone(),
            config.spread_provider.clone(),
        ));
        let downsample_planner = Arc::new(SingleClusterPlanner::new(
            config.dataset.clone(),
            config.downsample_tier,
            hasher.clone(),
            config.shard_mapper.clone(),
            config.spread_provider.clone(),
        ));
        let recording_rules_planner = Arc::new(SingleClusterPlanner::new(
            config.dataset.clone(),
            config.recording_rules_tier,
            hasher,
            config.shard_mapper,
            config.spread_provider,
        ));

        let horizon = DownsampleHorizon::new(config.time_provider, config.downsample_lag_ms);
        let long_term: Arc<dyn Planner> = Arc::new(LongTimeRangePlanner::new(raw_planner.clone(), downsample_planner, horizon));
        let recording_rules: Arc<dyn Planner> = recording_rules_planner;

        let mut long_term = long_term;
        let mut recording_rules = recording_rules;
        if let Some(expansion) = config.shard_key_expansion {
            long_term = Arc::new(ShardKeyRegexPlanner::new(long_term, expansion.matcher.clone(), expansion.shard_key_columns.clone()));
            recording_rules = Arc::new(ShardKeyRegexPlanner::new(recording_rules, expansion.matcher, expansion.shard_key_columns));
        }

        let router = Arc::new(RecordingRuleSuffixRouter::new("long-term", "recording-rules"));
        let selector: Arc<dyn Planner> = Arc::new(PlannerSelector::new(router).register("long-term", long_term).register("recording-rules", recording_rules));

        let top: Arc<dyn Planner> = match config.multi_partition {
            Some(routing) => Arc::new(MultiPartitionPlanner::new(selector, routing.locations, routing.routing_key_columns)),
            None => selector,
        };

        Ok(Self {
            dataset: config.dataset.reference.clone(),
            planner: top,
            raw_planner,
            dispatcher: Arc::new(InProcessPlanDispatcher::new(store, config.cluster_name)),
        })
    }

    /// Evaluates `query` over `[start_secs, end_secs]` stepped by
    /// `step_secs`; `query_id` is the caller's request id (request-id
    /// generation is a gateway concern, out of this crate's scope).
    pub async fn query_range(&self, query_id: impl Into<String>, query: &str, start_secs: i64, step_secs: i64, end_secs: i64, planner_params: PlannerParams) -> QueryResponse {
        let query_id = query_id.into();
        let logical = match promql::parse(query) {
            Ok(logical) => logical,
            Err(source) => return QueryResponse::error(query_id, Arc::new(QueryStats::new()), QueryError::BadQuery { message: source.to_string() }),
        };
        let ctx = QueryContext::new(query_id, start_secs, step_secs, end_secs, planner_params);
        let stats = Arc::new(QueryStats::new());
        let plan = match self.planner.plan(&logical, &ctx, &stats) {
            Ok(plan) => plan,
            Err(cause) => return QueryResponse::error(ctx.query_id, stats, cause),
        };
        debug!(query_id = %ctx.query_id, "dispatching compiled plan");
        let session = QuerySession::with_stats(self.dataset.clone(), ctx, stats);
        self.dispatcher.dispatch(plan, session).await
    }

    /// Instant-query convenience: a single sample at `time_secs`.
    pub async fn query_instant(&self, query_id: impl Into<String>, query: &str, time_secs: i64, planner_params: PlannerParams) -> QueryResponse {
        self.query_range(query_id, query, time_secs, 0, time_secs, planner_params).await
    }

    /// §6's label-values endpoint, scoped by `matchers` and
    /// `[start_ms, end_ms]`; one row per distinct combination `labels`
    /// takes on. Metadata endpoints read off the raw tier's index only,
    /// the freshest and most complete of the three roles.
    pub async fn label_values(
        &self,
        query_id: impl Into<String>,
        matchers: &[LabelMatcher],
        labels: &[String],
        start_ms: i64,
        end_ms: i64,
        planner_params: PlannerParams,
    ) -> MetadataResponse {
        let filters = filters_from_matchers(matchers);
        let plan = self.raw_planner.plan_label_values(&filters, labels, start_ms, end_ms);
        self.dispatch_metadata(query_id, plan, planner_params).await
    }

    /// §6's label-names endpoint.
    pub async fn label_names(&self, query_id: impl Into<String>, matchers: &[LabelMatcher], start_ms: i64, end_ms: i64, planner_params: PlannerParams) -> MetadataResponse {
        let filters = filters_from_matchers(matchers);
        let plan = self.raw_planner.plan_label_names(&filters, start_ms, end_ms);
        self.dispatch_metadata(query_id, plan, planner_params).await
    }

    /// §6's series endpoint (returns matching `PartKey`s).
    pub async fn series(&self, query_id: impl Into<String>, matchers: &[LabelMatcher], start_ms: i64, end_ms: i64, planner_params: PlannerParams) -> MetadataResponse {
        let filters = filters_from_matchers(matchers);
        let plan = self.raw_planner.plan_part_keys(&filters, start_ms, end_ms);
        self.dispatch_metadata(query_id, plan, planner_params).await
    }

    /// §6's label-cardinality endpoint.
    pub async fn label_cardinality(&self, query_id: impl Into<String>, matchers: &[LabelMatcher], start_ms: i64, end_ms: i64, planner_params: PlannerParams) -> MetadataResponse {
        let filters = filters_from_matchers(matchers);
        let plan = self.raw_planner.plan_label_cardinality(&filters, start_ms, end_ms);
        self.dispatch_metadata(query_id, plan, planner_params).await
    }

    /// §6's top-k cardinality endpoint, as of `as_of_ms` (not time-ranged).
    pub async fn topk_cardinality(
        &self,
        query_id: impl Into<String>,
        shard_key_prefix: &[LabelMatcher],
        metric_column: &str,
        k: usize,
        as_of_ms: i64,
        planner_params: PlannerParams,
    ) -> MetadataResponse {
        let filters = filters_from_matchers(shard_key_prefix);
        let plan = self.raw_planner.plan_topk_cardinality(&filters, metric_column, k, as_of_ms);
        self.dispatch_metadata(query_id, plan, planner_params).await
    }

    async fn dispatch_metadata(&self, query_id: impl Into<String>, plan: exec::ExecPlan, planner_params: PlannerParams) -> MetadataResponse {
        let ctx = QueryContext::new(query_id, 0, 1, 0, planner_params);
        let session = QuerySession::new(self.dataset.clone(), ctx);
        self.dispatcher.dispatch_metadata(plan, session).await
    }
}

fn filters_from_matchers(matchers: &[LabelMatcher]) -> Vec<ColumnFilter> {
    matchers.iter().map(ColumnFilter::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_store::Sample;
    use data_types::{EvictionPolicy, PartKey, ShardId, TierConfig, TierKind};
    use schema::{ColumnType, DataSchema, DatasetOptions};
    use sharder::ConstantSpreadProvider;
    use time_provider::{MockProvider, Time};

    fn test_database(now_ms: i64) -> (QuerierDatabase, Arc<TimeSeriesMemStore>) {
        let dataset = Arc::new(Dataset::new(
            DatasetRef::new("prometheus"),
            ["_ws_".to_string(), "_ns_".to_string(), "_metric_".to_string()],
            vec![DataSchema::single_value("promCounter", ColumnType::Counter)],
            DatasetOptions::default(),
        ));
        let clock: TimeProviderRef = Arc::new(MockProvider::new(Time::from_timestamp_millis(now_ms)));
        let raw_tier = Arc::new(TierConfig::new(TierKind::Raw, 7 * 24 * 60 * 60 * 1000, clock.clone()).with_eviction_policy(EvictionPolicy::fixed_max_partitions(1_000)));
        let downsample_tier = Arc::new(TierConfig::new(TierKind::Downsample, 30 * 24 * 60 * 60 * 1000, clock.clone()).with_eviction_policy(EvictionPolicy::fixed_max_partitions(1_000)));
        let recording_rules_tier = Arc::new(TierConfig::new(TierKind::RecordingRules, 90 * 24 * 60 * 60 * 1000, clock.clone()).with_eviction_policy(EvictionPolicy::fixed_max_partitions(1_000)));

        let config = QuerierDatabaseConfig {
            dataset,
            raw_tier,
            downsample_tier,
            recording_rules_tier,
            num_shards: 1,
            shard_mapper: Arc::new(planner::StaticShardMapper::all_active(1)),
            spread_provider: Arc::new(ConstantSpreadProvider::new(0)),
            time_provider: clock,
            downsample_lag_ms: 0,
            shard_key_expansion: None,
            multi_partition: None,
            cluster_name: "test-cluster".to_string(),
        };

        let store = Arc::new(TimeSeriesMemStore::new());
        store.setup(&DatasetRef::new("prometheus"), ShardId::new(0), &config.raw_tier).unwrap();
        let db = QuerierDatabase::new(store.clone(), config).unwrap();
        (db, store)
    }

    #[tokio::test]
    async fn query_range_scans_ingested_samples() {
        let (db, store) = test_database(1_000_000);
        store
            .ingest(
                &DatasetRef::new("prometheus"),
                ShardId::new(0),
                PartKey::new([("_metric_".to_string(), "up".to_string())]),
                &[Sample { timestamp_ms: 0, value: 1.0 }],
                1_000_000,
            )
            .unwrap();

        let response = db.query_range("q1", "up", 0, 10, 0, PlannerParams::default()).await;
        match response {
            QueryResponse::Result(result) => assert_eq!(result.range_vectors.len(), 1),
            QueryResponse::Error { cause, .. } => panic!("unexpected error: {cause:?}"),
        }
    }

    #[tokio::test]
    async fn query_range_rejects_unparseable_query() {
        let (db, _store) = test_database(1_000_000);
        let response = db.query_range("q1", "up{", 0, 10, 0, PlannerParams::default()).await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn label_names_reports_ingested_series_labels() {
        let (db, store) = test_database(1_000_000);
        store
            .ingest(
                &DatasetRef::new("prometheus"),
                ShardId::new(0),
                PartKey::new([("_metric_".to_string(), "up".to_string()), ("job".to_string(), "x".to_string())]),
                &[Sample { timestamp_ms: 0, value: 1.0 }],
                1_000_000,
            )
            .unwrap();

        match db.label_names("q1", &[], 0, 1_000_000, PlannerParams::default()).await {
            MetadataResponse::Labels(mut labels) => {
                labels.sort();
                assert_eq!(labels, vec!["_metric_".to_string(), "job".to_string()]);
            }
            other => panic!("expected labels, got a different metadata shape: {other:?}"),
        }
    }
}
