//! The streaming result type every operator produces and consumes: a keyed,
//! lazy, forward-only cursor of `(timestampMs, value)` rows.
use data_types::{OutputRange, RangeVectorKey};

/// A lazy, pull-based row cursor. `close` releases any upstream resource
/// (a remote HTTP body, a scan snapshot) and must be idempotent.
pub trait RangeVectorCursor: Send {
    fn next_row(&mut self) -> Option<(i64, f64)>;

    fn close(&mut self) {}
}

/// A cursor over an already-materialized, ascending-by-timestamp row list —
/// what a chunk-store scan or a finished aggregate presents upstream.
pub struct VecCursor {
    rows: std::vec::IntoIter<(i64, f64)>,
}

impl VecCursor {
    pub fn new(rows: Vec<(i64, f64)>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RangeVectorCursor for VecCursor {
    fn next_row(&mut self) -> Option<(i64, f64)> {
        self.rows.next()
    }
}

/// `(key, rows, outputRange?)`.
pub struct RangeVector {
    pub key: RangeVectorKey,
    pub rows: Box<dyn RangeVectorCursor>,
    pub output_range: Option<OutputRange>,
}

impl RangeVector {
    pub fn new(key: RangeVectorKey, rows: Box<dyn RangeVectorCursor>, output_range: Option<OutputRange>) -> Self {
        Self {
            key,
            rows,
            output_range,
        }
    }

    pub fn from_rows(key: RangeVectorKey, rows: Vec<(i64, f64)>) -> Self {
        Self::new(key, Box::new(VecCursor::new(rows)), None)
    }

    /// Drains the cursor into a plain vector, then closes it. Test- and
    /// reducer-facing convenience; the planner/executor proper never needs
    /// to fully materialize a `RangeVector` before the final presentation.
    pub fn collect_rows(mut self) -> Vec<(i64, f64)> {
        let mut out = Vec::new();
        while let Some(row) = self.rows.next_row() {
            out.push(row);
        }
        self.rows.close();
        out
    }
}

impl std::fmt::Debug for RangeVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeVector")
            .field("key", &self.key)
            .field("output_range", &self.output_range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_cursor_yields_rows_in_order() {
        let mut cursor = VecCursor::new(vec![(0, 1.0), (10, 2.0)]);
        assert_eq!(cursor.next_row(), Some((0, 1.0)));
        assert_eq!(cursor.next_row(), Some((10, 2.0)));
        assert_eq!(cursor.next_row(), None);
    }

    #[test]
    fn collect_rows_drains_and_closes() {
        let rv = RangeVector::from_rows(RangeVectorKey::default(), vec![(0, 1.0), (5, 2.0)]);
        assert_eq!(rv.collect_rows(), vec![(0, 1.0), (5, 2.0)]);
    }
}
