/// The comparison a [`ColumnFilter`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    NotEquals,
    /// `=~`
    Regex,
    /// `!~`
    NotRegex,
}

/// A single column (label) filter, as extracted from PromQL selector
/// matchers. Shard-key columns among a query's filters (`_ws_`, `_ns_`,
/// `_metric_` by default) drive shard selection; the rest are pushed down
/// to the chunk store's inverted index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl ColumnFilter {
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Equals,
            value: value.into(),
        }
    }

    pub fn not_equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::NotEquals,
            value: value.into(),
        }
    }

    pub fn regex(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Regex,
            value: value.into(),
        }
    }

    pub fn not_regex(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::NotRegex,
            value: value.into(),
        }
    }

    /// `true` for filters whose candidate set can be computed without
    /// scanning postings (a plain equality).
    pub fn is_exact_equality(&self) -> bool {
        self.op == FilterOp::Equals
    }

    /// Rename this filter's column, e.g. during `__name__` -> configured
    /// metric-column rewriting.
    pub fn renamed(&self, from: &str, to: &str) -> Self {
        if self.column == from {
            Self {
                column: to.to_string(),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}
