//! Range functions: reduce a window of `(timestamp, value)` samples to a
//! single value at a grid point. Applied by `PeriodicSamplesMapper` in the
//! `exec` crate for each point of the output time grid.
use observability_deps::tracing::trace;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{function} requires a parameter"))]
    MissingParam { function: &'static str },

    #[snafu(display("quantile parameter must be in [0,1], got {q}"))]
    InvalidQuantile { q: f64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The range functions enumerated in the root spec's §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFunction {
    Rate,
    Increase,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
    CountOverTime,
    StddevOverTime,
    LastOverTime,
    QuantileOverTime,
    HoltWinters,
    PredictLinear,
    Deriv,
    Changes,
    Resets,
    AbsentOverTime,
}

impl RangeFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rate" => Self::Rate,
            "increase" => Self::Increase,
            "avg_over_time" => Self::AvgOverTime,
            "min_over_time" => Self::MinOverTime,
            "max_over_time" => Self::MaxOverTime,
            "sum_over_time" => Self::SumOverTime,
            "count_over_time" => Self::CountOverTime,
            "stddev_over_time" => Self::StddevOverTime,
            "last_over_time" => Self::LastOverTime,
            "quantile_over_time" => Self::QuantileOverTime,
            "holt_winters" => Self::HoltWinters,
            "predict_linear" => Self::PredictLinear,
            "deriv" => Self::Deriv,
            "changes" => Self::Changes,
            "resets" => Self::Resets,
            "absent_over_time" => Self::AbsentOverTime,
            _ => return None,
        })
    }

    /// Does this function need a scalar parameter (`quantile_over_time`,
    /// `holt_winters`, `predict_linear`)?
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            Self::QuantileOverTime | Self::HoltWinters | Self::PredictLinear
        )
    }

    /// Evaluate over `samples` (ascending timestamp, all within the
    /// window), at grid point `t_ms`, with the window spanning
    /// `(window_start_ms, t_ms]`. `params` holds the function's scalar
    /// arguments in source order (e.g. `[sf, tf]` for `holt_winters`,
    /// `[duration]` for `predict_linear`, `[q]` for `quantile_over_time`).
    pub fn eval(
        &self,
        samples: &[(i64, f64)],
        window_start_ms: i64,
        t_ms: i64,
        params: &[f64],
    ) -> Result<Option<f64>> {
        if samples.is_empty() {
            return Ok(match self {
                Self::AbsentOverTime => Some(1.0),
                Self::Changes | Self::Resets | Self::CountOverTime => Some(0.0),
                _ => None,
            });
        }
        Ok(match self {
            Self::AbsentOverTime => None,
            Self::SumOverTime => Some(samples.iter().map(|(_, v)| v).sum()),
            Self::CountOverTime => Some(samples.len() as f64),
            Self::AvgOverTime => {
                let sum: f64 = samples.iter().map(|(_, v)| v).sum();
                Some(sum / samples.len() as f64)
            }
            Self::MinOverTime => samples.iter().map(|(_, v)| *v).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.min(v)))
            }),
            Self::MaxOverTime => samples.iter().map(|(_, v)| *v).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.max(v)))
            }),
            Self::StddevOverTime => Some(stddev(samples)),
            Self::LastOverTime => samples.last().map(|(_, v)| *v),
            Self::QuantileOverTime => {
                let q = *params.first().ok_or(Error::MissingParam {
                    function: "quantile_over_time",
                })?;
                Some(quantile(samples.iter().map(|(_, v)| *v), q)?)
            }
            Self::Deriv => Some(linear_regression(samples).1),
            Self::PredictLinear => {
                let dur = *params.first().ok_or(Error::MissingParam {
                    function: "predict_linear",
                })?;
                let (intercept_at_t, slope) = linear_regression(samples);
                Some(intercept_at_t + slope * dur)
            }
            Self::HoltWinters => {
                if params.len() < 2 {
                    return Err(Error::MissingParam {
                        function: "holt_winters",
                    });
                }
                Some(holt_winters(samples, params[0], params[1]))
            }
            Self::Changes => Some(count_changes(samples) as f64),
            Self::Resets => Some(count_resets(samples) as f64),
            Self::Rate | Self::Increase => {
                let raw = extrapolated_rate(samples, window_start_ms, t_ms, true);
                Some(if matches!(self, Self::Rate) {
                    let window_secs = (t_ms - window_start_ms) as f64 / 1000.0;
                    if window_secs > 0.0 {
                        raw / window_secs
                    } else {
                        0.0
                    }
                } else {
                    raw
                })
            }
        })
    }
}

fn stddev(samples: &[(i64, f64)]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|(_, v)| (v - mean).powi(2))
        .sum::<f64>()
        / n;
    var.sqrt()
}

/// Linear-interpolated quantile over unsorted values, PromQL-style
/// (nearest-rank with interpolation between order statistics).
fn quantile(values: impl Iterator<Item = f64>, q: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&q) {
        return Err(Error::InvalidQuantile { q });
    }
    let mut v: Vec<f64> = values.collect();
    v.sort_by(|a, b| a.total_cmp(b));
    if v.is_empty() {
        return Ok(f64::NAN);
    }
    if v.len() == 1 {
        return Ok(v[0]);
    }
    let rank = q * (v.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        Ok(v[lower])
    } else {
        let frac = rank - lower as f64;
        Ok(v[lower] + (v[upper] - v[lower]) * frac)
    }
}

/// `quantile`, infallible and clamping `q` to `[0,1]`, for callers (like
/// the aggregate `quantile` operator) that already validated `q` upstream
/// and just want a value back.
pub fn quantile_pub(values: impl Iterator<Item = f64>, q: f64) -> f64 {
    quantile(values, q.clamp(0.0, 1.0)).unwrap_or(f64::NAN)
}

/// Ordinary least squares over `(timestamp_ms, value)`, returning
/// `(intercept_at_last_sample, slope_per_second)` matching Prometheus's
/// `deriv`/`predict_linear` convention of anchoring the intercept at the
/// last sample's time.
fn linear_regression(samples: &[(i64, f64)]) -> (f64, f64) {
    if samples.len() < 2 {
        return (samples.first().map(|(_, v)| *v).unwrap_or(0.0), 0.0);
    }
    let anchor = samples.last().unwrap().0 as f64;
    let n = samples.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (ts, v) in samples {
        let x = (*ts as f64 - anchor) / 1000.0;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_x2 += x * x;
    }
    let denom = n * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return (sum_y / n, 0.0);
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    (intercept, slope)
}

fn holt_winters(samples: &[(i64, f64)], sf: f64, tf: f64) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    let mut s = samples[0].1;
    let mut b = if samples.len() > 1 {
        samples[1].1 - samples[0].1
    } else {
        0.0
    };
    for (_, v) in samples.iter().skip(1) {
        let prev_s = s;
        s = sf * v + (1.0 - sf) * (s + b);
        b = tf * (s - prev_s) + (1.0 - tf) * b;
    }
    s
}

fn count_changes(samples: &[(i64, f64)]) -> usize {
    samples
        .windows(2)
        .filter(|w| w[0].1 != w[1].1 && !(w[0].1.is_nan() && w[1].1.is_nan()))
        .count()
}

fn count_resets(samples: &[(i64, f64)]) -> usize {
    samples.windows(2).filter(|w| w[1].1 < w[0].1).count()
}

/// `rate`/`increase` with Prometheus-style extrapolation: the observed
/// delta (corrected for counter resets) is scaled up to account for the
/// fraction of the window before the first and after the last sample.
fn extrapolated_rate(
    samples: &[(i64, f64)],
    window_start_ms: i64,
    window_end_ms: i64,
    counter_reset_aware: bool,
) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mut delta = 0.0;
    let mut prev = samples[0].1;
    for (_, v) in samples.iter().skip(1) {
        if counter_reset_aware && *v < prev {
            delta += v;
        } else {
            delta += v - prev;
        }
        prev = *v;
    }

    let sample_span_ms = (samples.last().unwrap().0 - samples[0].0).max(1) as f64;
    let avg_interval_ms = sample_span_ms / (samples.len() - 1) as f64;

    let duration_to_start = (samples[0].0 - window_start_ms) as f64;
    let duration_to_end = (window_end_ms - samples.last().unwrap().0) as f64;

    let extrapolation_threshold = avg_interval_ms * 1.1;
    let extrapolate_to_interval = |gap: f64| {
        if gap > extrapolation_threshold {
            avg_interval_ms / 2.0
        } else {
            gap
        }
    };

    let extrapolated_start = extrapolate_to_interval(duration_to_start.max(0.0));
    let extrapolated_end = extrapolate_to_interval(duration_to_end.max(0.0));
    let window_ms = sample_span_ms + extrapolated_start + extrapolated_end;

    trace!(sample_span_ms, window_ms, delta, "extrapolated rate window");
    delta * (window_ms / sample_span_ms)
}
