//! Per-shard inverted label index: `labelName -> labelValue -> set of
//! partition ids`. Supports conjunctive equality and regex filters,
//! reduced to the smallest posting-list intersection first (root spec's
//! §4.1 "Index lookup" algorithm).
use croaring::Bitmap;
use data_types::{ColumnFilter, FilterOp, PartKey};
use hashbrown::HashMap;
use regex::Regex;

pub struct InvertedIndex {
    postings: HashMap<String, HashMap<String, Bitmap>>,
    all_ids: Bitmap,
}

impl std::fmt::Debug for InvertedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvertedIndex")
            .field("label_names", &self.postings.len())
            .field("partitions", &self.all_ids.cardinality())
            .finish()
    }
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self {
            postings: HashMap::new(),
            all_ids: Bitmap::create(),
        }
    }

    /// Index updates become visible no later than the next scan: this is
    /// synchronous, called under the shard's write path before the ingest
    /// call returns.
    pub fn add(&mut self, partition_id: u32, part_key: &PartKey) {
        for (label, value) in part_key.iter() {
            self.postings
                .entry(label.to_string())
                .or_default()
                .entry(value.to_string())
                .or_insert_with(Bitmap::create)
                .add(partition_id);
        }
        self.all_ids.add(partition_id);
    }

    pub fn remove(&mut self, partition_id: u32, part_key: &PartKey) {
        for (label, value) in part_key.iter() {
            if let Some(values) = self.postings.get_mut(label) {
                if let Some(bm) = values.get_mut(value) {
                    bm.remove(partition_id);
                }
            }
        }
        self.all_ids.remove(partition_id);
    }

    fn equals_postings(&self, column: &str, value: &str) -> Bitmap {
        self.postings
            .get(column)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_else(Bitmap::create)
    }

    fn regex_postings(&self, column: &str, pattern: &str) -> Bitmap {
        let mut out = Bitmap::create();
        let Ok(re) = Regex::new(&format!("^(?:{pattern})$")) else {
            return out;
        };
        if let Some(values) = self.postings.get(column) {
            for (value, bm) in values {
                if re.is_match(value) {
                    out.or_inplace(bm);
                }
            }
        }
        out
    }

    fn filter_postings(&self, filter: &ColumnFilter) -> Bitmap {
        match filter.op {
            FilterOp::Equals => self.equals_postings(&filter.column, &filter.value),
            FilterOp::NotEquals => {
                let mut complement = self.all_ids.clone();
                complement.andnot_inplace(&self.equals_postings(&filter.column, &filter.value));
                complement
            }
            FilterOp::Regex => self.regex_postings(&filter.column, &filter.value),
            FilterOp::NotRegex => {
                let mut complement = self.all_ids.clone();
                complement.andnot_inplace(&self.regex_postings(&filter.column, &filter.value));
                complement
            }
        }
    }

    /// Conjunctive intersection of all filters' candidate sets, smallest
    /// set first so later intersections touch as few ids as possible.
    pub fn matching(&self, filters: &[ColumnFilter]) -> Bitmap {
        if filters.is_empty() {
            return self.all_ids.clone();
        }
        let mut candidates: Vec<Bitmap> = filters.iter().map(|f| self.filter_postings(f)).collect();
        candidates.sort_by_key(|b| b.cardinality());

        let mut result = candidates[0].clone();
        for bm in &candidates[1..] {
            if result.is_empty() {
                break;
            }
            result.and_inplace(bm);
        }
        result
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.postings.keys().map(|s| s.as_str())
    }

    pub fn label_values(&self, label: &str) -> impl Iterator<Item = &str> {
        self.postings
            .get(label)
            .into_iter()
            .flat_map(|values| values.keys().map(|s| s.as_str()))
    }

    pub fn distinct_value_count(&self, label: &str) -> usize {
        self.postings.get(label).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(pairs: &[(&str, &str)]) -> PartKey {
        PartKey::new(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn equality_conjunction_intersects() {
        let mut idx = InvertedIndex::new();
        idx.add(0, &pk(&[("job", "a"), ("env", "prod")]));
        idx.add(1, &pk(&[("job", "a"), ("env", "dev")]));
        idx.add(2, &pk(&[("job", "b"), ("env", "prod")]));

        let matches = idx.matching(&[
            ColumnFilter::equals("job", "a"),
            ColumnFilter::equals("env", "prod"),
        ]);
        assert_eq!(matches.to_vec(), vec![0]);
    }

    #[test]
    fn regex_unions_matching_values() {
        let mut idx = InvertedIndex::new();
        idx.add(0, &pk(&[("region", "us-east")]));
        idx.add(1, &pk(&[("region", "us-west")]));
        idx.add(2, &pk(&[("region", "eu-west")]));

        let matches = idx.matching(&[ColumnFilter::regex("region", "us-.*")]);
        let mut v = matches.to_vec();
        v.sort();
        assert_eq!(v, vec![0, 1]);
    }

    #[test]
    fn not_equals_is_complement_within_all_ids() {
        let mut idx = InvertedIndex::new();
        idx.add(0, &pk(&[("job", "a")]));
        idx.add(1, &pk(&[("job", "b")]));

        let matches = idx.matching(&[ColumnFilter::not_equals("job", "a")]);
        assert_eq!(matches.to_vec(), vec![1]);
    }

    #[test]
    fn remove_drops_from_postings_and_universe() {
        let mut idx = InvertedIndex::new();
        let key = pk(&[("job", "a")]);
        idx.add(0, &key);
        idx.remove(0, &key);
        assert!(idx.matching(&[ColumnFilter::equals("job", "a")]).is_empty());
        assert!(idx.matching(&[]).is_empty());
    }

    #[test]
    fn empty_filter_set_matches_universe() {
        let mut idx = InvertedIndex::new();
        idx.add(0, &pk(&[("job", "a")]));
        idx.add(1, &pk(&[("job", "b")]));
        let mut v = idx.matching(&[]).to_vec();
        v.sort();
        assert_eq!(v, vec![0, 1]);
    }
}
