//! Pointwise instant-vector functions and histogram bucket math, applied
//! per-sample by `InstantVectorFunctionMapper` in the `exec` crate.
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Pointwise transforms from the root spec's §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantFunction {
    Abs,
    Ceil,
    Floor,
    Exp,
    Ln,
    Log2,
    Log10,
    Sqrt,
    Round,
    Sgn,
    ClampMin,
    ClampMax,
    Hour,
    Minute,
    DayOfMonth,
    DayOfWeek,
    DayOfYear,
    Month,
    Year,
    DaysInMonth,
}

impl InstantFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Self::Abs,
            "ceil" => Self::Ceil,
            "floor" => Self::Floor,
            "exp" => Self::Exp,
            "ln" => Self::Ln,
            "log2" => Self::Log2,
            "log10" => Self::Log10,
            "sqrt" => Self::Sqrt,
            "round" => Self::Round,
            "sgn" => Self::Sgn,
            "clamp_min" => Self::ClampMin,
            "clamp_max" => Self::ClampMax,
            "hour" => Self::Hour,
            "minute" => Self::Minute,
            "day_of_month" => Self::DayOfMonth,
            "day_of_week" => Self::DayOfWeek,
            "day_of_year" => Self::DayOfYear,
            "month" => Self::Month,
            "year" => Self::Year,
            "days_in_month" => Self::DaysInMonth,
            _ => None?,
        })
    }

    pub fn is_time_function(&self) -> bool {
        matches!(
            self,
            Self::Hour
                | Self::Minute
                | Self::DayOfMonth
                | Self::DayOfWeek
                | Self::DayOfYear
                | Self::Month
                | Self::Year
                | Self::DaysInMonth
        )
    }

    pub fn takes_param(&self) -> bool {
        matches!(self, Self::ClampMin | Self::ClampMax)
    }

    /// Apply at sample `(t_ms, value)`. Time functions ignore `value` and
    /// `params`; the rest ignore `t_ms`.
    pub fn apply(&self, t_ms: i64, value: f64, params: &[f64]) -> f64 {
        if self.is_time_function() {
            return self.apply_time(t_ms);
        }
        match self {
            Self::Abs => value.abs(),
            Self::Ceil => value.ceil(),
            Self::Floor => value.floor(),
            Self::Exp => value.exp(),
            Self::Ln => value.ln(),
            Self::Log2 => value.log2(),
            Self::Log10 => value.log10(),
            Self::Sqrt => value.sqrt(),
            Self::Round => {
                let to_nearest = params.first().copied().unwrap_or(1.0);
                if to_nearest == 0.0 {
                    value
                } else {
                    (value / to_nearest).round() * to_nearest
                }
            }
            Self::Sgn => {
                if value > 0.0 {
                    1.0
                } else if value < 0.0 {
                    -1.0
                } else {
                    value
                }
            }
            Self::ClampMin => value.max(params.first().copied().unwrap_or(f64::NEG_INFINITY)),
            Self::ClampMax => value.min(params.first().copied().unwrap_or(f64::INFINITY)),
            _ => unreachable!("time functions handled above"),
        }
    }

    fn apply_time(&self, t_ms: i64) -> f64 {
        let dt: DateTime<Utc> = DateTime::from_timestamp_millis(t_ms).unwrap_or_default();
        match self {
            Self::Hour => dt.hour() as f64,
            Self::Minute => dt.minute() as f64,
            Self::DayOfMonth => dt.day() as f64,
            Self::DayOfWeek => dt.weekday().num_days_from_sunday() as f64,
            Self::DayOfYear => dt.ordinal() as f64,
            Self::Month => dt.month() as f64,
            Self::Year => dt.year() as f64,
            Self::DaysInMonth => days_in_month(dt.year(), dt.month()) as f64,
            _ => unreachable!(),
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let this_start = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let next_start = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap();
    (next_start - this_start).num_days() as u32
}

/// One `(le, value)` pair read off a `_bucket` series family for
/// `histogram_quantile`/`histogram_max_quantile`/`histogram_bucket`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub le: f64,
    pub value: f64,
}

/// Linear-interpolated quantile over cumulative histogram buckets,
/// Prometheus `histogram_quantile` semantics: buckets sorted ascending by
/// `le`, values are cumulative counts.
pub fn histogram_quantile(buckets: &[Bucket], q: f64) -> f64 {
    if buckets.is_empty() {
        return f64::NAN;
    }
    let mut sorted = buckets.to_vec();
    sorted.sort_by(|a, b| a.le.total_cmp(&b.le));
    let total = sorted.last().unwrap().value;
    if total <= 0.0 {
        return f64::NAN;
    }
    let rank = q * total;
    let mut lower_bound = f64::NEG_INFINITY;
    let mut lower_count = 0.0;
    for b in &sorted {
        if b.value >= rank {
            if !b.le.is_finite() {
                return lower_bound.max(0.0);
            }
            if b.value == lower_count {
                continue;
            }
            let frac = (rank - lower_count) / (b.value - lower_count);
            return lower_bound + (b.le - lower_bound) * frac.clamp(0.0, 1.0);
        }
        lower_bound = b.le;
        lower_count = b.value;
    }
    sorted.last().unwrap().le
}

/// `histogram_max_quantile`: like `histogram_quantile` but clamped to the
/// bucket-family's declared maximum so extrapolation past the highest
/// finite bucket never exceeds it.
pub fn histogram_max_quantile(buckets: &[Bucket], q: f64, max: f64) -> f64 {
    histogram_quantile(buckets, q).min(max)
}

/// `histogram_bucket(le, vector)`: pick out the cumulative count for a
/// single bucket boundary from a bucket family, or `NaN` if `le` isn't
/// present.
pub fn histogram_bucket(buckets: &[Bucket], le: f64) -> f64 {
    buckets
        .iter()
        .find(|b| (b.le - le).abs() < f64::EPSILON)
        .map(|b| b.value)
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_and_ceil() {
        assert_eq!(InstantFunction::Abs.apply(0, -4.0, &[]), 4.0);
        assert_eq!(InstantFunction::Ceil.apply(0, 1.2, &[]), 2.0);
    }

    #[test]
    fn clamp_min_max() {
        assert_eq!(InstantFunction::ClampMin.apply(0, 1.0, &[5.0]), 5.0);
        assert_eq!(InstantFunction::ClampMax.apply(0, 10.0, &[5.0]), 5.0);
    }

    #[test]
    fn hour_of_epoch() {
        // 1970-01-01T01:00:00Z
        assert_eq!(InstantFunction::Hour.apply(3_600_000, 0.0, &[]), 1.0);
    }

    #[test]
    fn histogram_quantile_interpolates_between_buckets() {
        let buckets = vec![
            Bucket { le: 0.1, value: 0.0 },
            Bucket { le: 0.5, value: 5.0 },
            Bucket {
                le: f64::INFINITY,
                value: 10.0,
            },
        ];
        let q = histogram_quantile(&buckets, 0.5);
        assert!(q > 0.1 && q <= 0.5);
    }

    #[test]
    fn histogram_bucket_looks_up_exact_le() {
        let buckets = vec![Bucket { le: 0.5, value: 5.0 }, Bucket { le: 1.0, value: 8.0 }];
        assert_eq!(histogram_bucket(&buckets, 0.5), 5.0);
        assert!(histogram_bucket(&buckets, 2.0).is_nan());
    }

    #[test]
    fn histogram_quantile_does_not_panic_on_nan_bucket_boundary() {
        let buckets = vec![
            Bucket { le: 0.5, value: 5.0 },
            Bucket { le: f64::NAN, value: 7.0 },
            Bucket { le: f64::INFINITY, value: 10.0 },
        ];
        // must not panic sorting a `le` family that carries a NaN sentinel
        let _ = histogram_quantile(&buckets, 0.5);
    }

    #[test]
    fn days_in_month_handles_leap_year() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
    }
}
