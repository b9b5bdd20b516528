//! `PlannerSelector`: holds a `plannerName -> Planner` map and routes each
//! query to one of them by the metric it selects, per the default
//! recording-rules naming convention (`foo:1m`, `foo:5m`, ...).
use std::sync::Arc;

use data_types::{QueryContext, QueryStats};
use exec::{ExecPlan, QueryError};
use hashbrown::HashMap;
use promql::{LogicalPlan, VectorSelector};
use schema::PROM_NAME_LABEL;

use crate::Planner;

/// Maps a query's primary metric name to the `plannerName` that should
/// serve it.
pub trait MetricNameRouter: std::fmt::Debug + Send + Sync {
    fn route(&self, metric_name: Option<&str>) -> String;
}

/// The default rule: a metric name ending in a colon followed by a
/// downsampling-interval-shaped suffix (`:1m`, `:5m30s`, ...) is a
/// recording rule's own output and is routed to its planner, which has its
/// own retention and is never itself downsampled; everything else goes to
/// the long-term planner.
#[derive(Debug, Clone)]
pub struct RecordingRuleSuffixRouter {
    pub long_term_planner: String,
    pub recording_rules_planner: String,
}

impl RecordingRuleSuffixRouter {
    pub fn new(long_term_planner: impl Into<String>, recording_rules_planner: impl Into<String>) -> Self {
        Self {
            long_term_planner: long_term_planner.into(),
            recording_rules_planner: recording_rules_planner.into(),
        }
    }
}

impl MetricNameRouter for RecordingRuleSuffixRouter {
    fn route(&self, metric_name: Option<&str>) -> String {
        match metric_name {
            Some(name) if is_recording_rule_name(name) => self.recording_rules_planner.clone(),
            _ => self.long_term_planner.clone(),
        }
    }
}

fn is_recording_rule_name(name: &str) -> bool {
    name.rsplit_once(':').is_some_and(|(_, suffix)| suffix.starts_with(|c: char| c.is_ascii_digit()))
}

#[derive(Debug)]
pub struct PlannerSelector {
    planners: HashMap<String, Arc<dyn Planner>>,
    router: Arc<dyn MetricNameRouter>,
}

impl PlannerSelector {
    pub fn new(router: Arc<dyn MetricNameRouter>) -> Self {
        Self {
            planners: HashMap::new(),
            router,
        }
    }

    pub fn register(mut self, planner_name: impl Into<String>, planner: Arc<dyn Planner>) -> Self {
        self.planners.insert(planner_name.into(), planner);
        self
    }
}

impl Planner for PlannerSelector {
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<ExecPlan> {
        let metric_name = primary_metric_name(logical);
        let planner_name = self.router.route(metric_name.as_deref());
        let planner = self.planners.get(&planner_name).ok_or_else(|| QueryError::BadQuery {
            message: format!("no planner registered under {planner_name:?}"),
        })?;
        planner.plan(logical, ctx, stats)
    }
}

fn primary_metric_name(logical: &LogicalPlan) -> Option<String> {
    let vs = first_selector(logical)?;
    vs.metric.clone().or_else(|| vs.matchers.iter().find(|m| m.label == PROM_NAME_LABEL && m.op == promql::MatchOp::Eq).map(|m| m.value.clone()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{PlannerParams, QueryStats, ShardId};
    use exec::ChunkMethod;
    use schema::DatasetRef;

    #[derive(Debug)]
    struct NamedStub(&'static str);

    impl Planner for NamedStub {
        fn plan(&self, _logical: &LogicalPlan, ctx: &QueryContext, _stats: &QueryStats) -> exec::Result<ExecPlan> {
            Ok(ExecPlan::Leaf(exec::LeafOp::MultiSchemaPartitions {
                dataset: DatasetRef::new(self.0),
                shard: ShardId::new(0),
                chunk_method: ChunkMethod { start_ms: ctx.start_ms(), end_ms: ctx.end_ms() },
                filters: Vec::new(),
            }))
        }
    }

    fn selector(name: &str) -> LogicalPlan {
        LogicalPlan::VectorSelector(VectorSelector {
            metric: Some(name.to_string()),
            matchers: vec![],
            offset_ms: None,
        })
    }

    fn ctx() -> QueryContext {
        QueryContext::new("q1", 0, 10, 20, PlannerParams::default())
    }

    fn dataset_name(plan: &ExecPlan) -> &str {
        match plan {
            ExecPlan::Leaf(exec::LeafOp::MultiSchemaPartitions { dataset, .. }) => dataset.dataset.as_str(),
            other => panic!("expected a leaf, got {other:?}"),
        }
    }

    fn selector_planner() -> PlannerSelector {
        let router = Arc::new(RecordingRuleSuffixRouter::new("long-term", "recording-rules"));
        PlannerSelector::new(router)
            .register("long-term", Arc::new(NamedStub("long-term")))
            .register("recording-rules", Arc::new(NamedStub("recording-rules")))
    }

    #[test]
    fn plain_metric_routes_to_long_term() {
        let p = selector_planner();
        let plan = p.plan(&selector("http_requests_total"), &ctx(), &QueryStats::new()).unwrap();
        assert_eq!(dataset_name(&plan), "long-term");
    }

    #[test]
    fn recording_rule_suffix_routes_to_recording_rules() {
        let p = selector_planner();
        let plan = p.plan(&selector("instance:requests:rate1m:5m"), &ctx(), &QueryStats::new()).unwrap();
        assert_eq!(dataset_name(&plan), "recording-rules");
    }

    #[test]
    fn unregistered_planner_name_is_an_error() {
        let router = Arc::new(RecordingRuleSuffixRouter::new("long-term", "recording-rules"));
        let p = PlannerSelector::new(router).register("long-term", Arc::new(NamedStub("long-term")));
        let err = p.plan(&selector("foo:1m"), &ctx(), &QueryStats::new()).unwrap_err();
        assert!(matches!(err, QueryError::BadQuery { .. }));
    }
}
