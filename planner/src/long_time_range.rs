//! `LongTimeRangePlanner`: splits a query's time range across the raw and
//! downsample single-cluster planners at the downsample horizon, stitching
//! the two result streams back together when a query spans both tiers.
use std::sync::Arc;

use data_types::{QueryContext, QueryStats};
use exec::{ExecPlan, LeafOp};
use observability_deps::tracing::debug;
use promql::LogicalPlan;
use time_provider::TimeProviderRef;

use crate::Planner;

/// How far downsampling lags raw ingest: data older than
/// `now - lag_ms` is available from the downsample tier, data newer than
/// that has not been downsampled yet and must come from the raw tier.
#[derive(Clone)]
pub struct DownsampleHorizon {
    time_provider: TimeProviderRef,
    lag_ms: i64,
}

impl std::fmt::Debug for DownsampleHorizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownsampleHorizon").field("lag_ms", &self.lag_ms).finish()
    }
}

impl DownsampleHorizon {
    pub fn new(time_provider: TimeProviderRef, lag_ms: i64) -> Self {
        Self { time_provider, lag_ms }
    }

    /// `latestDownsampleTimestampFn()`.
    pub fn latest_downsample_timestamp_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis() - self.lag_ms
    }
}

/// Splits `[start, end]` into at most two intervals at the downsample
/// horizon: `[start, latestDownsample]` to the downsample planner,
/// `[latestDownsample, end]` to the raw planner. Delegates directly to
/// whichever single planner covers the whole range; wraps both in a
/// `Stitch` when the range straddles the boundary.
#[derive(Debug)]
pub struct LongTimeRangePlanner {
    raw: Arc<dyn Planner>,
    downsample: Arc<dyn Planner>,
    horizon: DownsampleHorizon,
}

impl LongTimeRangePlanner {
    pub fn new(raw: Arc<dyn Planner>, downsample: Arc<dyn Planner>, horizon: DownsampleHorizon) -> Self {
        Self { raw, downsample, horizon }
    }
}

impl Planner for LongTimeRangePlanner {
    fn plan(&self, logical: &LogicalPlan, ctx: &QueryContext, stats: &QueryStats) -> exec::Result<ExecPlan> {
        let latest_downsample = self.horizon.latest_downsample_timestamp_ms();
        let start_ms = ctx.start_ms();
        let end_ms = ctx.end_ms();
        let step_ms = ctx.step_ms();

        if latest_downsample < start_ms {
            debug!(start_ms, latest_downsample, "long-time-range: entirely raw");
            return self.raw.plan(logical, ctx, stats);
        }
        if latest_downsample >= end_ms {
            debug!(end_ms, latest_downsample, "long-time-range: entirely downsample");
            return self.downsample.plan(logical, ctx, stats);
        }

        // Downsample grid ends at the last step <= the horizon; raw grid
        // starts at the first step >= the horizon, so the two never
        // double-count a sample at the boundary itself.
        let downsample_end = align_down(latest_downsample, step_ms, start_ms);
        let raw_start = align_up(latest_downsample, step_ms, start_ms);

        let mut children = Vec::with_capacity(2);
        if downsample_end >= start_ms {
            children.push(self.downsample.plan(logical, &rebounded(ctx, start_ms, downsample_end), stats)?);
        }
        if raw_start <= end_ms {
            children.push(self.raw.plan(logical, &rebounded(ctx, raw_start, end_ms), stats)?);
        }

        Ok(match children.len() {
            0 => ExecPlan::Leaf(LeafOp::EmptyResult),
            1 => children.pop().unwrap(),
            _ => ExecPlan::Stitch { children },
        })
    }
}

fn align_down(ts_ms: i64, step_ms: i64, grid_origin_ms: i64) -> i64 {
    let step_ms = step_ms.max(1);
    grid_origin_ms + (ts_ms - grid_origin_ms).div_euclid(step_ms) * step_ms
}

fn align_up(ts_ms: i64, step_ms: i64, grid_origin_ms: i64) -> i64 {
    let down = align_down(ts_ms, step_ms, grid_origin_ms);
    if down == ts_ms {
        down
    } else {
        down + step_ms.max(1)
    }
}

fn rebounded(ctx: &QueryContext, start_ms: i64, end_ms: i64) -> QueryContext {
    let mut c = ctx.clone();
    c.start_secs = start_ms.div_euclid(1000);
    c.end_secs = end_ms.div_euclid(1000);
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{PlannerParams, QueryStats, ShardId};
    use exec::ChunkMethod;
    use schema::DatasetRef;
    use time_provider::{MockProvider, Time};

    #[derive(Debug)]
    struct TierStub {
        name: &'static str,
    }

    impl Planner for TierStub {
        fn plan(&self, _logical: &LogicalPlan, ctx: &QueryContext, _stats: &QueryStats) -> exec::Result<ExecPlan> {
            Ok(ExecPlan::Leaf(LeafOp::MultiSchemaPartitions {
                dataset: DatasetRef::new(self.name),
                shard: ShardId::new(0),
                chunk_method: ChunkMethod { start_ms: ctx.start_ms(), end_ms: ctx.end_ms() },
                filters: Vec::new(),
            }))
        }
    }

    fn selector() -> LogicalPlan {
        LogicalPlan::VectorSelector(promql::VectorSelector {
            metric: Some("up".to_string()),
            matchers: vec![],
            offset_ms: None,
        })
    }

    fn ctx(start_secs: i64, step_secs: i64, end_secs: i64) -> QueryContext {
        QueryContext::new("q1", start_secs, step_secs, end_secs, PlannerParams::default())
    }

    fn planner(now_ms: i64, lag_ms: i64) -> LongTimeRangePlanner {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(now_ms)));
        let horizon = DownsampleHorizon::new(clock, lag_ms);
        LongTimeRangePlanner::new(Arc::new(TierStub { name: "raw" }), Arc::new(TierStub { name: "downsample" }), horizon)
    }

    fn dataset_name(plan: &ExecPlan) -> &str {
        match plan {
            ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { dataset, .. }) => dataset.dataset.as_str(),
            other => panic!("expected a leaf scan, got {other:?}"),
        }
    }

    #[test]
    fn entirely_before_horizon_delegates_to_raw_only() {
        // now=2_000, lag=0 => horizon=2_000, well past the query's end.
        let p = planner(2_000, 0);
        let plan = p.plan(&selector(), &ctx(0, 1, 1), &QueryStats::new()).unwrap();
        assert_eq!(dataset_name(&plan), "raw");
    }

    #[test]
    fn entirely_after_horizon_delegates_to_downsample_only() {
        // now=0, lag=0 => horizon=0, before the query's start.
        let p = planner(0, 0);
        let plan = p.plan(&selector(), &ctx(10, 1, 20), &QueryStats::new()).unwrap();
        assert_eq!(dataset_name(&plan), "downsample");
    }

    #[test]
    fn straddling_range_stitches_both_tiers_aligned_to_step() {
        // now=550, lag=0 => horizon=550, strictly inside [0, 1000] (step
        // clamps to 1000ms via `QueryContext::step_ms`'s `.max(1)`).
        let p = planner(550, 0);
        let plan = p.plan(&selector(), &ctx(0, 0, 1), &QueryStats::new()).unwrap();
        let ExecPlan::Stitch { children } = plan else {
            panic!("expected a stitch of both tiers");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(dataset_name(&children[0]), "downsample");
        assert_eq!(dataset_name(&children[1]), "raw");
        let ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { chunk_method: ds_bounds, .. }) = &children[0] else {
            unreachable!()
        };
        let ExecPlan::Leaf(LeafOp::MultiSchemaPartitions { chunk_method: raw_bounds, .. }) = &children[1] else {
            unreachable!()
        };
        assert!(ds_bounds.end_ms <= 550);
        assert!(raw_bounds.start_ms >= 550);
        assert!(raw_bounds.start_ms > ds_bounds.end_ms);
    }
}
