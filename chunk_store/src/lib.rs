//! Shard-local, in-memory time-series storage: chunked per-partition
//! samples plus an inverted label index, wrapped by a dataset/shard keyed
//! top-level store.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

pub mod chunk;
pub mod index;
pub mod partition;
pub mod shard;
pub mod store;

pub use chunk::{Chunk, ChunkId, ChunkLimits};
pub use index::InvertedIndex;
pub use partition::{IngestStats, Sample, TimeSeriesPartition};
pub use shard::{PartitionId, Shard};
pub use store::{Error, Result, TimeSeriesMemStore};
