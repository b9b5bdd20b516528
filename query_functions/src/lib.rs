//! Range, instant and aggregate function math shared by the planner and
//! executor. Kept free of any streaming/`RangeVector` types so it can be
//! unit tested directly against plain sample slices.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

pub mod aggregate;
pub mod instant;
pub mod range;

pub use aggregate::{AggregateOp, Accumulator};
pub use instant::{histogram_bucket, histogram_max_quantile, histogram_quantile, Bucket, InstantFunction};
pub use range::RangeFunction;
