use std::collections::BTreeMap;

/// The grouping key of a [`crate::PartKey`]-derived result: the label
/// values that survive `by`/`without`/join grouping. Plain data — the
/// lazy row cursor itself lives in the `exec` crate, which depends on
/// `data_types` rather than the other way around.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RangeVectorKey {
    labels: BTreeMap<String, String>,
}

impl RangeVectorKey {
    pub fn new(labels: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            labels: labels.into_iter().collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn insert(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(label.into(), value.into());
    }

    /// Restrict to just `labels`, in `by`-clause order (`without` callers
    /// pass the complement).
    pub fn project(&self, labels: &[String]) -> Self {
        Self::new(
            labels
                .iter()
                .filter_map(|l| self.get(l).map(|v| (l.clone(), v.to_string()))),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// The nominal time grid a [`crate::PlannerParams`]-driven query evaluates
/// on: `(startMs, endMs, stepMs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputRange {
    pub start_ms: i64,
    pub end_ms: i64,
    pub step_ms: i64,
}

impl OutputRange {
    pub fn new(start_ms: i64, end_ms: i64, step_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            step_ms,
        }
    }

    /// Number of grid points from `start_ms` to `end_ms` inclusive.
    pub fn len(&self) -> usize {
        if self.step_ms <= 0 || self.end_ms < self.start_ms {
            0
        } else {
            ((self.end_ms - self.start_ms) / self.step_ms) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the grid points `start_ms, start_ms+step_ms, ..., <= end_ms`.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let n = self.len();
        (0..n).map(move |i| self.start_ms + (i as i64) * self.step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_range_iterates_grid() {
        let r = OutputRange::new(0, 20, 10);
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![0, 10, 20]);
    }

    #[test]
    fn output_range_empty_when_end_before_start() {
        let r = OutputRange::new(10, 0, 5);
        assert!(r.is_empty());
        assert_eq!(r.iter().collect::<Vec<_>>(), Vec::<i64>::new());
    }

    #[test]
    fn key_project_keeps_only_requested_labels() {
        let mut k = RangeVectorKey::default();
        k.insert("job", "a");
        k.insert("instance", "b");
        let projected = k.project(&["job".to_string()]);
        assert_eq!(projected.get("job"), Some("a"));
        assert_eq!(projected.get("instance"), None);
    }
}
