//! `ShardMapper`: shard liveness lookup, external to and opaque for the
//! rest of this crate (per the root spec's framing of shard-to-node
//! assignment as somebody else's problem). The planner only needs to ask
//! "is this shard servable right now" when deciding whether to route a
//! leaf at all or fall back to `LeafOp::EmptyResult`/a partial result.

use data_types::{ShardId, ShardStatus};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Looked up once per leaf during planning; implementations are expected
/// to be cheap, in-memory reads (the actual liveness tracking — watching a
/// cluster membership service, etc — lives outside this crate).
pub trait ShardMapper: std::fmt::Debug + Send + Sync {
    fn status(&self, shard: ShardId) -> ShardStatus;
}

/// A fixed or test-driven `ShardMapper` backed by an in-memory map.
/// Shards absent from the map report [`ShardStatus::Unassigned`].
#[derive(Debug)]
pub struct StaticShardMapper {
    statuses: RwLock<HashMap<ShardId, ShardStatus>>,
}

impl StaticShardMapper {
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// All shards `Active`, the common case for a fully up cluster.
    pub fn all_active(num_shards: u32) -> Self {
        let mapper = Self::new();
        for id in 0..num_shards {
            mapper.set_status(ShardId::new(id), ShardStatus::Active);
        }
        mapper
    }

    pub fn set_status(&self, shard: ShardId, status: ShardStatus) {
        self.statuses.write().insert(shard, status);
    }
}

impl Default for StaticShardMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardMapper for StaticShardMapper {
    fn status(&self, shard: ShardId) -> ShardStatus {
        self.statuses
            .read()
            .get(&shard)
            .copied()
            .unwrap_or(ShardStatus::Unassigned)
    }
}
