//! The non-leaf `RangeVectorTransformer`s from §4.2, applied over
//! already-scanned `(timestampMs, value)` rows. Each function takes and
//! returns plain data rather than a cursor: the lazy-pull contract lives at
//! the `RangeVectorCursor` boundary (`range_vector.rs`); once a leaf's rows
//! are in hand, transforming them is ordinary synchronous computation.
use hashbrown::HashMap;

use data_types::RangeVectorKey;
use query_functions::{
    histogram_bucket, histogram_max_quantile, histogram_quantile, AggregateOp, Accumulator, Bucket, InstantFunction, RangeFunction,
};

use crate::plan::{ArithmeticOp, HistogramFn, JoinMatching, SetOp, VectorCardinality};
use crate::range_vector::RangeVector;

/// `PeriodicSamplesMapper`: resample `rows` (already gated to the scan
/// window) onto the grid `{start_ms, start_ms+step_ms, ..., end_ms}`.
#[allow(clippy::too_many_arguments)]
pub fn periodic_samples(
    rows: &[(i64, f64)],
    start_ms: i64,
    end_ms: i64,
    step_ms: i64,
    window_ms: Option<i64>,
    function: Option<RangeFunction>,
    offset_ms: i64,
    param: Option<f64>,
    stale_lookback_ms: i64,
) -> Vec<(i64, f64)> {
    let step_ms = step_ms.max(1);
    let params: Vec<f64> = param.into_iter().collect();
    let mut out = Vec::new();
    let mut t = start_ms;
    while t <= end_ms {
        let effective_t = t + offset_ms;
        match window_ms {
            Some(window) => {
                let lo = effective_t - window;
                let window_rows: Vec<(i64, f64)> = rows
                    .iter()
                    .copied()
                    .filter(|(ts, _)| *ts > lo && *ts <= effective_t)
                    .collect();
                if let Some(f) = function {
                    if let Ok(Some(v)) = f.eval(&window_rows, lo, effective_t, &params) {
                        out.push((t, v));
                    }
                }
            }
            None => {
                // No window: most recent sample within staleDataLookback.
                let lo = effective_t - stale_lookback_ms;
                if let Some((_, v)) = rows.iter().rev().find(|(ts, _)| *ts > lo && *ts <= effective_t) {
                    out.push((t, *v));
                }
            }
        }
        t += step_ms;
    }
    out
}

/// `InstantVectorFunctionMapper`: pointwise.
pub fn instant_function(rows: &[(i64, f64)], function: InstantFunction, param: Option<f64>) -> Vec<(i64, f64)> {
    let params: Vec<f64> = param.into_iter().collect();
    rows.iter().map(|(t, v)| (*t, function.apply(*t, *v, &params))).collect()
}

/// Vector-scalar arithmetic: `lhs op rhs` where one side is a compile-time
/// constant, applied pointwise.
pub fn scalar_arithmetic(rows: &[(i64, f64)], op: ArithmeticOp, scalar: f64, scalar_on_left: bool) -> Vec<(i64, f64)> {
    rows.iter()
        .map(|(t, v)| {
            let value = if scalar_on_left {
                apply_arithmetic(op, scalar, *v)
            } else {
                apply_arithmetic(op, *v, scalar)
            };
            (*t, value)
        })
        .collect()
}

/// `histogram_quantile`/`histogram_max_quantile`/`histogram_bucket`: group
/// `rvs` into bucket families (every label but `le_label` shared), then at
/// each timestamp read off every family member's value as one `le` bucket
/// and apply `function`.
pub fn histogram_function(rvs: Vec<RangeVector>, function: HistogramFn, param: f64, max: Option<f64>, le_label: &str) -> Vec<RangeVector> {
    let mut families: HashMap<RangeVectorKey, Vec<(f64, Vec<(i64, f64)>)>> = HashMap::new();
    for rv in rvs {
        let Some(le) = rv.key.get(le_label).and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        let family_key = without_label(&rv.key, le_label);
        families.entry(family_key).or_default().push((le, rv.collect_rows()));
    }

    let mut out = Vec::new();
    for (family_key, members) in families {
        let mut timestamps: Vec<i64> = members.iter().flat_map(|(_, rows)| rows.iter().map(|(t, _)| *t)).collect();
        timestamps.sort_unstable();
        timestamps.dedup();

        let mut rows = Vec::with_capacity(timestamps.len());
        for t in timestamps {
            let buckets: Vec<Bucket> = members
                .iter()
                .filter_map(|(le, series)| series.iter().find(|(ts, _)| *ts == t).map(|(_, v)| Bucket { le: *le, value: *v }))
                .collect();
            let value = match function {
                HistogramFn::Quantile => histogram_quantile(&buckets, param),
                HistogramFn::MaxQuantile => histogram_max_quantile(&buckets, param, max.unwrap_or(f64::INFINITY)),
                HistogramFn::Bucket => histogram_bucket(&buckets, param),
            };
            rows.push((t, value));
        }
        out.push(RangeVector::from_rows(family_key, rows));
    }
    out
}

fn without_label(key: &RangeVectorKey, label: &str) -> RangeVectorKey {
    let kept: Vec<String> = key.iter().map(|(k, _)| k.to_string()).filter(|k| k != label).collect();
    key.project(&kept)
}

/// `AbsentFunctionMapper`: emits a single synthetic series with value 1 at
/// every input timestamp if, and only if, the upstream is empty.
pub fn absent_function(rvs: &[RangeVector], labels: Vec<(String, String)>, grid: &[i64]) -> Option<RangeVector> {
    if !rvs.is_empty() {
        return None;
    }
    Some(RangeVector::from_rows(
        RangeVectorKey::new(labels),
        grid.iter().map(|t| (*t, 1.0)).collect(),
    ))
}

/// `AggregateMapReduce` + `AggregatePresenter`: group by the surviving
/// labels (`by`/`without`), fold each group's samples *per grid point* into
/// an associative [`Accumulator`], then finalize.
pub fn aggregate(rvs: Vec<RangeVector>, op: AggregateOp, param: Option<f64>, by: &[String], without: &[String]) -> Vec<RangeVector> {
    group_and_fold(rvs, op, param, |key| group_key_for(key, by, without))
}

/// `LocalPartitionReduceAggregateExec`/`MultiPartitionReduceAggregateExec`:
/// folds same-keyed partial accumulators arriving from different
/// shards/partitions, with no further relabeling (the grouping key is each
/// series' own key, unlike [`aggregate`]'s `by`/`without` projection).
pub fn reduce_same_key(rvs: Vec<RangeVector>, op: AggregateOp, param: Option<f64>) -> Vec<RangeVector> {
    group_and_fold(rvs, op, param, |key| key.clone())
}

fn group_and_fold(rvs: Vec<RangeVector>, op: AggregateOp, param: Option<f64>, key_fn: impl Fn(&RangeVectorKey) -> RangeVectorKey) -> Vec<RangeVector> {
    // grouping_key -> grid_timestamp -> accumulator
    let mut groups: HashMap<RangeVectorKey, HashMap<i64, Accumulator>> = HashMap::new();

    for rv in rvs {
        let group_key = key_fn(&rv.key);
        let series_key = rv.key.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
        let by_time = groups.entry(group_key).or_default();
        for (t, v) in rv.collect_rows() {
            let acc = Accumulator::new(op, v, series_key.as_bytes(), param);
            match by_time.remove(&t) {
                Some(existing) => by_time.insert(t, existing.merge(acc)),
                None => by_time.insert(t, acc),
            };
        }
    }

    let mut out = Vec::new();
    for (group_key, by_time) in groups {
        let mut times: Vec<_> = by_time.into_iter().collect();
        times.sort_by_key(|(t, _)| *t);
        if matches!(op, AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::CountValues) {
            // Fan out to one series per discriminator, one row per grid point.
            let mut per_discriminator: HashMap<String, Vec<(i64, f64)>> = HashMap::new();
            for (t, acc) in times {
                for (discriminator, v) in acc.finalize(param) {
                    per_discriminator
                        .entry(discriminator.unwrap_or_default())
                        .or_default()
                        .push((t, v));
                }
            }
            for (discriminator, rows) in per_discriminator {
                let mut key = group_key.clone();
                if !discriminator.is_empty() {
                    key.insert("__discriminator__", discriminator);
                }
                out.push(RangeVector::from_rows(key, rows));
            }
        } else {
            let rows = times
                .into_iter()
                .map(|(t, acc)| (t, acc.finalize(param).into_iter().next().map(|(_, v)| v).unwrap_or(f64::NAN)))
                .collect();
            out.push(RangeVector::from_rows(group_key, rows));
        }
    }
    out
}

fn group_key_for(key: &RangeVectorKey, by: &[String], without: &[String]) -> RangeVectorKey {
    if !by.is_empty() {
        key.project(by)
    } else if !without.is_empty() {
        let kept: Vec<String> = key.iter().map(|(k, _)| k.to_string()).filter(|k| !without.contains(k)).collect();
        key.project(&kept)
    } else {
        RangeVectorKey::default()
    }
}

fn apply_arithmetic(op: ArithmeticOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        ArithmeticOp::Add => lhs + rhs,
        ArithmeticOp::Sub => lhs - rhs,
        ArithmeticOp::Mul => lhs * rhs,
        ArithmeticOp::Div => lhs / rhs,
        ArithmeticOp::Mod => lhs % rhs,
        ArithmeticOp::Pow => lhs.powf(rhs),
        ArithmeticOp::Eq => bool_to_f64(lhs == rhs),
        ArithmeticOp::Ne => bool_to_f64(lhs != rhs),
        ArithmeticOp::Gt => bool_to_f64(lhs > rhs),
        ArithmeticOp::Lt => bool_to_f64(lhs < rhs),
        ArithmeticOp::Ge => bool_to_f64(lhs >= rhs),
        ArithmeticOp::Le => bool_to_f64(lhs <= rhs),
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// `BinaryJoinExec`: pair left/right series by their `on`/`ignoring` join
/// labels and apply `op` elementwise at matching timestamps. `many_to_one`/
/// `one_to_many` carry the `include` labels from the single side onto every
/// matched output series.
pub fn binary_join(left: Vec<RangeVector>, right: Vec<RangeVector>, op: ArithmeticOp, matching: &JoinMatching) -> Vec<RangeVector> {
    let right_by_join_key: HashMap<RangeVectorKey, (RangeVectorKey, HashMap<i64, f64>)> = right
        .into_iter()
        .map(|rv| {
            let jk = join_key(&rv.key, matching);
            let full_key = rv.key.clone();
            let rows: HashMap<i64, f64> = rv.collect_rows().into_iter().collect();
            (jk, (full_key, rows))
        })
        .collect();

    let mut out = Vec::new();
    for left_rv in left {
        let jk = join_key(&left_rv.key, matching);
        let Some((right_key, right_rows)) = right_by_join_key.get(&jk) else {
            continue;
        };

        let mut out_key = left_rv.key.clone();
        for label in &matching.include {
            if let Some(v) = right_key.get(label) {
                out_key.insert(label.clone(), v.to_string());
            }
        }

        let rows: Vec<(i64, f64)> = left_rv
            .collect_rows()
            .into_iter()
            .filter_map(|(t, lv)| right_rows.get(&t).map(|rv| (t, apply_arithmetic(op, lv, *rv))))
            .collect();
        out.push(RangeVector::from_rows(out_key, rows));
    }
    out
}

fn join_key(key: &RangeVectorKey, matching: &JoinMatching) -> RangeVectorKey {
    if !matching.on.is_empty() {
        key.project(&matching.on)
    } else if !matching.ignoring.is_empty() {
        let kept: Vec<String> = key.iter().map(|(k, _)| k.to_string()).filter(|k| !matching.ignoring.contains(k)).collect();
        key.project(&kept)
    } else {
        key.clone()
    }
}

/// `SetOperatorExec`: `and`/`or`/`unless` over matching series, by join key
/// equality (no value arithmetic).
pub fn set_operator(left: Vec<RangeVector>, right: Vec<RangeVector>, op: SetOp) -> Vec<RangeVector> {
    let matching = JoinMatching::default();
    let right_keys: std::collections::HashSet<RangeVectorKey> = right.iter().map(|rv| join_key(&rv.key, &matching)).collect();

    match op {
        SetOp::And => left.into_iter().filter(|rv| right_keys.contains(&join_key(&rv.key, &matching))).collect(),
        SetOp::Unless => left.into_iter().filter(|rv| !right_keys.contains(&join_key(&rv.key, &matching))).collect(),
        SetOp::Or => {
            let mut seen: std::collections::HashSet<RangeVectorKey> = std::collections::HashSet::new();
            let mut out = Vec::new();
            for rv in left {
                seen.insert(join_key(&rv.key, &matching));
                out.push(rv);
            }
            for rv in right {
                if seen.insert(join_key(&rv.key, &matching)) {
                    out.push(rv);
                }
            }
            out
        }
    }
}

/// `VectorCardinality` is presently informational only (validated by the
/// planner, not enforced numerically here); kept as a marker so callers can
/// assert the planner chose the expected shape.
pub fn describe_cardinality(c: VectorCardinality) -> &'static str {
    match c {
        VectorCardinality::OneToOne => "one-to-one",
        VectorCardinality::ManyToOne => "many-to-one",
        VectorCardinality::OneToMany => "one-to-many",
        VectorCardinality::ManyToMany => "many-to-many",
    }
}

/// `StitchRvsMapper`/`StitchRvsExec`: n-way timestamp merge of streams
/// sharing a series key, across tiers/shards/spread segments. Small `n`, so
/// a linear scan beats a heap (§4.2). On two non-NaN sources at the same
/// timestamp, emits NaN (unable-to-calculate sentinel per §4.2/§9).
pub fn stitch(children: Vec<Vec<RangeVector>>) -> Vec<RangeVector> {
    let mut by_key: HashMap<RangeVectorKey, Vec<Vec<(i64, f64)>>> = HashMap::new();
    for child in children {
        for rv in child {
            by_key.entry(rv.key.clone()).or_default().push(rv.collect_rows());
        }
    }

    by_key
        .into_iter()
        .map(|(key, sources)| {
            let merged = merge_by_timestamp(sources);
            RangeVector::from_rows(key, merged)
        })
        .collect()
}

fn merge_by_timestamp(sources: Vec<Vec<(i64, f64)>>) -> Vec<(i64, f64)> {
    let mut cursors: Vec<std::vec::IntoIter<(i64, f64)>> = sources.into_iter().map(|v| v.into_iter()).collect();
    let mut heads: Vec<Option<(i64, f64)>> = cursors.iter_mut().map(|c| c.next()).collect();
    let mut out = Vec::new();

    loop {
        let min_t = heads.iter().filter_map(|h| h.map(|(t, _)| t)).min();
        let Some(min_t) = min_t else { break };

        let mut values_at_min = Vec::new();
        for (i, head) in heads.iter_mut().enumerate() {
            if let Some((t, v)) = *head {
                if t == min_t {
                    values_at_min.push(v);
                    *head = cursors[i].next();
                }
            }
        }

        let non_nan: Vec<f64> = values_at_min.iter().copied().filter(|v| !v.is_nan()).collect();
        let value = match non_nan.len() {
            0 => f64::NAN,
            1 => non_nan[0],
            _ => f64::NAN, // two non-NaN sources collide: unable-to-calculate sentinel.
        };
        out.push((min_t, value));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_samples_without_window_takes_last_value_within_lookback() {
        let rows = vec![(0, 1.0), (5_000, 2.0)];
        let out = periodic_samples(&rows, 0, 20_000, 10_000, None, None, 0, None, 5 * 60 * 1000);
        assert_eq!(out, vec![(0, 1.0), (10_000, 2.0), (20_000, 2.0)]);
    }

    #[test]
    fn periodic_samples_with_window_applies_range_function() {
        // Window is `(t - window, t]`, so the sample exactly at the lower
        // bound (ts=0) falls outside a 10s window ending at t=10_000.
        let rows = vec![(0, 1.0), (5_000, 2.0), (10_000, 3.0)];
        let out = periodic_samples(&rows, 10_000, 10_000, 10_000, Some(10_000), Some(RangeFunction::SumOverTime), 0, None, 0);
        assert_eq!(out, vec![(10_000, 5.0)]);
    }

    #[test]
    fn stitch_emits_nan_on_colliding_non_nan_sources() {
        let a = RangeVector::from_rows(RangeVectorKey::default(), vec![(0, 1.0)]);
        let b = RangeVector::from_rows(RangeVectorKey::default(), vec![(0, 2.0)]);
        let merged = stitch(vec![vec![a], vec![b]]);
        assert_eq!(merged.len(), 1);
        let rows = merged.into_iter().next().unwrap().collect_rows();
        assert!(rows[0].1.is_nan());
    }

    #[test]
    fn stitch_prefers_the_unique_non_nan_source() {
        let a = RangeVector::from_rows(RangeVectorKey::default(), vec![(0, f64::NAN)]);
        let b = RangeVector::from_rows(RangeVectorKey::default(), vec![(0, 5.0)]);
        let merged = stitch(vec![vec![a], vec![b]]);
        let rows = merged.into_iter().next().unwrap().collect_rows();
        assert_eq!(rows[0].1, 5.0);
    }

    #[test]
    fn aggregate_sum_groups_by_by_clause() {
        let a = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 1.0)]);
        let b = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 2.0)]);
        let result = aggregate(vec![a, b], AggregateOp::Sum, None, &["job".to_string()], &[]);
        assert_eq!(result.len(), 1);
        assert_eq!(result.into_iter().next().unwrap().collect_rows(), vec![(0, 3.0)]);
    }

    #[test]
    fn reduce_same_key_merges_partials_from_different_shards() {
        let a = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 1.0)]);
        let b = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 2.0)]);
        let result = reduce_same_key(vec![a, b], AggregateOp::Sum, None);
        assert_eq!(result.len(), 1);
        assert_eq!(result.into_iter().next().unwrap().collect_rows(), vec![(0, 3.0)]);
    }

    #[test]
    fn histogram_bucket_reads_off_one_bucket_per_timestamp() {
        let low = RangeVector::from_rows(
            RangeVectorKey::new([("_metric_".to_string(), "my_hist".to_string()), ("le".to_string(), "0.1".to_string())]),
            vec![(0, 2.0)],
        );
        let high = RangeVector::from_rows(
            RangeVectorKey::new([("_metric_".to_string(), "my_hist".to_string()), ("le".to_string(), "0.5".to_string())]),
            vec![(0, 5.0)],
        );
        let result = histogram_function(vec![low, high], HistogramFn::Bucket, 0.5, None, "le");
        assert_eq!(result.len(), 1);
        let rv = result.into_iter().next().unwrap();
        assert_eq!(rv.key.get("le"), None);
        assert_eq!(rv.collect_rows(), vec![(0, 5.0)]);
    }

    #[test]
    fn set_operator_and_keeps_only_matching_keys() {
        let a = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 1.0)]);
        let b = RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "b".to_string())]), vec![(0, 1.0)]);
        let right = vec![RangeVector::from_rows(RangeVectorKey::new([("job".to_string(), "a".to_string())]), vec![(0, 9.0)])];
        let result = set_operator(vec![a, b], right, SetOp::And);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key.get("job"), Some("a"));
    }
}
