use schema::DataSchema;
use std::{collections::BTreeMap, sync::Arc};

/// The canonicalized, byte-encoded tuple of partition-key column values for
/// one series, unique within a `(dataset, shard)`.
///
/// Stored as label-sorted `(column, value)` pairs rather than a raw byte
/// buffer: the core never needs to decode an opaque wire encoding (that is
/// the on-disk column store's concern, out of scope per the root spec), but
/// it does need cheap equality, hashing, and label lookups for filter
/// matching and label-value/label-name metadata queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartKey {
    // BTreeMap keeps column order canonical so two PartKeys built from the
    // same label set in different insertion order compare equal.
    columns: BTreeMap<String, String>,
}

impl PartKey {
    pub fn new(columns: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The metric name under `column`, if present.
    pub fn metric(&self, metric_column: &str) -> Option<&str> {
        self.get(metric_column)
    }

    /// Approximate heap size in bytes, used by eviction accounting.
    pub fn heap_size(&self) -> usize {
        self.columns
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + std::mem::size_of::<Self>()
    }
}

/// A [`PartKey`] together with the [`DataSchema`] that describes how its
/// samples are laid out, as carried by scan results.
#[derive(Debug, Clone)]
pub struct PartKeyWithSchema {
    pub part_key: PartKey,
    pub data_schema: Arc<DataSchema>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_regardless_of_insertion_order() {
        let a = PartKey::new([
            ("_ws_".to_string(), "demo".to_string()),
            ("_metric_".to_string(), "foo".to_string()),
        ]);
        let b = PartKey::new([
            ("_metric_".to_string(), "foo".to_string()),
            ("_ws_".to_string(), "demo".to_string()),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn metric_lookup() {
        let pk = PartKey::new([("_metric_".to_string(), "http_req_total".to_string())]);
        assert_eq!(pk.metric("_metric_"), Some("http_req_total"));
        assert_eq!(pk.metric("missing"), None);
    }
}
