//! Query database: the crate that composes the planner DAG, the in-process
//! dispatcher and the chunk store into one PromQL-in/response-out handle.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

mod database;

pub use database::{Error, MultiPartitionRouting, QuerierDatabase, QuerierDatabaseConfig, Result, ShardKeyExpansion};
