//! Thin re-export of the `tracing` crate so every crate in the workspace
//! logs through one pinned version. Import `observability_deps::tracing`
//! rather than depending on `tracing` directly.

pub use tracing;
