//! Aggregate map-reduce math: mapper accumulators combine associatively
//! across shards/nodes (`AggregateMapReduce`); the presenter finalizes
//! (`AggregatePresenter`), e.g. `avg = sum/count`, `topk` ordering.
use std::collections::HashMap;

use ordered_float::OrderedFloat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Group,
    Min,
    Max,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    CountValues,
    Quantile,
}

impl AggregateOp {
    pub fn is_directly_associative(&self) -> bool {
        matches!(self, Self::Sum | Self::Count | Self::Min | Self::Max)
    }
}

/// A partial accumulator for one grouping key at one grid point. Mappers
/// emit these; the reducer folds them with [`Accumulator::merge`]; the
/// presenter calls [`Accumulator::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(f64),
    /// `(sum, count)` so `avg` stays associative across a two-level
    /// reduce: partials carry both, and only the presenter divides.
    SumCount(f64, f64),
    Count(f64),
    Min(f64),
    Max(f64),
    /// Welford's online algorithm state: `(count, mean, m2)`.
    Variance(f64, f64, f64),
    Group,
    /// Bounded to `k` entries; merging re-sorts and truncates.
    Topk(usize, Vec<(Vec<u8>, f64)>),
    Bottomk(usize, Vec<(Vec<u8>, f64)>),
    CountValues(HashMap<OrderedFloat<f64>, u64>),
    /// All observed values, presented as a quantile at finalize time.
    /// Bounded accuracy is out of scope; correctness over a full data set
    /// is what the root spec's testable properties require.
    Quantile(Vec<f64>),
}

/// `NaN` sorts below every real value for `topk`'s descending order.
fn topk_rank(v: f64) -> f64 {
    if v.is_nan() {
        f64::NEG_INFINITY
    } else {
        v
    }
}

/// `NaN` sorts above every real value for `bottomk`'s ascending order.
fn bottomk_rank(v: f64) -> f64 {
    if v.is_nan() {
        f64::INFINITY
    } else {
        v
    }
}

impl Accumulator {
    pub fn new(op: AggregateOp, value: f64, key: &[u8], param: Option<f64>) -> Self {
        match op {
            AggregateOp::Sum => Self::Sum(value),
            AggregateOp::Avg => Self::SumCount(value, 1.0),
            AggregateOp::Count => Self::Count(1.0),
            AggregateOp::Min => Self::Min(value),
            AggregateOp::Max => Self::Max(value),
            AggregateOp::Stddev | AggregateOp::Stdvar => Self::Variance(1.0, value, 0.0),
            AggregateOp::Group => Self::Group,
            AggregateOp::Topk => {
                Self::Topk(param.unwrap_or(1.0).max(1.0) as usize, vec![(key.to_vec(), value)])
            }
            AggregateOp::Bottomk => Self::Bottomk(
                param.unwrap_or(1.0).max(1.0) as usize,
                vec![(key.to_vec(), value)],
            ),
            AggregateOp::CountValues => {
                let mut m = HashMap::new();
                m.insert(OrderedFloat(value), 1);
                Self::CountValues(m)
            }
            AggregateOp::Quantile => Self::Quantile(vec![value]),
        }
    }

    /// Associatively combine two partials for the same grouping key. The
    /// order of `self`/`other` must not matter for `sum`/`count`/`min`/
    /// `max`/`avg`, which is exactly the property §8 requires.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Sum(a), Self::Sum(b)) => Self::Sum(a + b),
            (Self::SumCount(sa, ca), Self::SumCount(sb, cb)) => Self::SumCount(sa + sb, ca + cb),
            (Self::Count(a), Self::Count(b)) => Self::Count(a + b),
            (Self::Min(a), Self::Min(b)) => Self::Min(a.min(b)),
            (Self::Max(a), Self::Max(b)) => Self::Max(a.max(b)),
            (Self::Group, Self::Group) => Self::Group,
            (Self::Variance(ca, ma, m2a), Self::Variance(cb, mb, m2b)) => {
                let count = ca + cb;
                let delta = mb - ma;
                let mean = ma + delta * cb / count;
                let m2 = m2a + m2b + delta * delta * ca * cb / count;
                Self::Variance(count, mean, m2)
            }
            (Self::Topk(k, mut a), Self::Topk(_, b)) => {
                a.extend(b);
                // NaN never outranks a real value, on either shard, so a
                // merge's result doesn't depend on which side saw the NaN
                // sample first.
                a.sort_by(|x, y| topk_rank(y.1).total_cmp(&topk_rank(x.1)));
                a.truncate(k);
                Self::Topk(k, a)
            }
            (Self::Bottomk(k, mut a), Self::Bottomk(_, b)) => {
                a.extend(b);
                a.sort_by(|x, y| bottomk_rank(x.1).total_cmp(&bottomk_rank(y.1)));
                a.truncate(k);
                Self::Bottomk(k, a)
            }
            (Self::CountValues(mut a), Self::CountValues(b)) => {
                for (k, v) in b {
                    *a.entry(k).or_insert(0) += v;
                }
                Self::CountValues(a)
            }
            (Self::Quantile(mut a), Self::Quantile(b)) => {
                a.extend(b);
                Self::Quantile(a)
            }
            (a, _) => a, // mismatched variants should not occur; keep the left side.
        }
    }

    /// Finalize into the presented value(s). `topk`/`bottomk`/
    /// `count_values` fan out to multiple output series, so they return a
    /// vector of `(discriminator, value)`; everything else returns one
    /// value under an empty discriminator.
    pub fn finalize(self, quantile_q: Option<f64>) -> Vec<(Option<String>, f64)> {
        match self {
            Self::Sum(v) => vec![(None, v)],
            Self::SumCount(s, c) => vec![(None, if c > 0.0 { s / c } else { f64::NAN })],
            Self::Count(v) => vec![(None, v)],
            Self::Min(v) => vec![(None, v)],
            Self::Max(v) => vec![(None, v)],
            Self::Group => vec![(None, 1.0)],
            Self::Variance(count, _, m2) => {
                let var = if count > 0.0 { m2 / count } else { f64::NAN };
                vec![(None, var)]
            }
            Self::Topk(_, entries) | Self::Bottomk(_, entries) => entries
                .into_iter()
                .map(|(key, v)| (Some(String::from_utf8_lossy(&key).to_string()), v))
                .collect(),
            Self::CountValues(map) => map
                .into_iter()
                .map(|(v, count)| (Some(v.0.to_string()), count as f64))
                .collect(),
            Self::Quantile(values) => {
                let q = quantile_q.unwrap_or(0.5);
                vec![(None, crate::range::quantile_pub(values.into_iter(), q))]
            }
        }
    }
}

/// `stddev` is the square root of `stdvar`'s finalized variance.
pub fn finalize_stddev(acc: Accumulator) -> f64 {
    let var = acc.finalize(None)[0].1;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_two_level_reduce_matches_one_level() {
        let parts: Vec<f64> = vec![1.0, 2.0, 3.0, 4.0];
        let one_level = parts
            .iter()
            .fold(Accumulator::Sum(0.0), |acc, v| acc.merge(Accumulator::Sum(*v)));

        let left = parts[..2]
            .iter()
            .fold(Accumulator::Sum(0.0), |acc, v| acc.merge(Accumulator::Sum(*v)));
        let right = parts[2..]
            .iter()
            .fold(Accumulator::Sum(0.0), |acc, v| acc.merge(Accumulator::Sum(*v)));
        let two_level = left.merge(right);

        assert_eq!(one_level.finalize(None), two_level.finalize(None));
    }

    #[test]
    fn avg_two_level_reduce_matches_one_level_via_sum_count() {
        let values = [1.0, 2.0, 3.0, 7.0];
        let partials: Vec<_> = values
            .iter()
            .map(|v| Accumulator::SumCount(*v, 1.0))
            .collect();

        let one_level = partials
            .iter()
            .cloned()
            .reduce(|a, b| a.merge(b))
            .unwrap();
        let left = partials[0].clone().merge(partials[1].clone());
        let right = partials[2].clone().merge(partials[3].clone());
        let two_level = left.merge(right);

        assert_eq!(one_level.finalize(None), two_level.finalize(None));
    }

    #[test]
    fn min_max_associative() {
        let a = Accumulator::Min(5.0).merge(Accumulator::Min(2.0));
        assert_eq!(a.finalize(None), vec![(None, 2.0)]);
        let b = Accumulator::Max(5.0).merge(Accumulator::Max(2.0));
        assert_eq!(b.finalize(None), vec![(None, 5.0)]);
    }

    #[test]
    fn topk_merges_and_truncates() {
        let a = Accumulator::Topk(2, vec![(b"a".to_vec(), 10.0), (b"b".to_vec(), 5.0)]);
        let b = Accumulator::Topk(2, vec![(b"c".to_vec(), 20.0)]);
        let merged = a.merge(b);
        let result = merged.finalize(None);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].1, 20.0);
    }

    #[test]
    fn topk_merge_ignores_nan_regardless_of_side() {
        let a = Accumulator::Topk(1, vec![(b"nan".to_vec(), f64::NAN)]);
        let b = Accumulator::Topk(1, vec![(b"real".to_vec(), 1.0)]);
        let merged_ab = a.clone().merge(b.clone());
        let merged_ba = b.merge(a);
        assert_eq!(merged_ab.finalize(None)[0].1, 1.0);
        assert_eq!(merged_ba.finalize(None)[0].1, 1.0);
    }

    #[test]
    fn variance_matches_naive_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let acc = values
            .iter()
            .map(|v| Accumulator::Variance(1.0, *v, 0.0))
            .reduce(|a, b| a.merge(b))
            .unwrap();
        let var = acc.finalize(None)[0].1;
        // Known population variance for this classic example is 4.0.
        assert!((var - 4.0).abs() < 1e-9);
    }
}
