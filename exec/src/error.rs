//! §7's error kinds, as the enum every operator's `Result` ultimately folds
//! into. Lower-level crates keep their own narrower `Error` enums and are
//! converted at the boundary.
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    #[snafu(display("query timed out after {timeout_millis}ms"))]
    QueryTimeout { timeout_millis: u64 },

    #[snafu(display("leaf would emit more than the {limit} sample limit"))]
    SampleLimitExceeded { limit: usize },

    #[snafu(display("query would touch {requested} shards, more than the {limit} configured bound"))]
    TooManyShardsQueried { requested: usize, limit: usize },

    #[snafu(display("stitched streams disagree on column types: {left} vs {right}"))]
    SchemaConflict { left: String, right: String },

    #[snafu(display("bad query: {message}"))]
    BadQuery { message: String },

    #[snafu(display("shard {shard} is not available"))]
    ShardNotAvailable { shard: data_types::ShardId },

    #[snafu(display("remote partition returned an error: {message}"))]
    RemoteError { message: String },

    #[snafu(display("internal invariant violation: {message}"))]
    Internal { message: String },
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;

impl From<chunk_store::Error> for QueryError {
    fn from(e: chunk_store::Error) -> Self {
        QueryError::Internal {
            message: e.to_string(),
        }
    }
}
