//! The local log stores of one node, one per shard

use crate::store::{FailingLogStore, LocalLogStore, MemoryLogStore};
use epochlog_common::{Counter, Error, NodeIndex, Result, ShardId, Stats};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

/// Per-node set of local log stores
pub struct ShardedLogStore {
    node: NodeIndex,
    shards: Vec<RwLock<Arc<dyn LocalLogStore>>>,
    stats: Arc<Stats>,
}

impl ShardedLogStore {
    pub fn new(node: NodeIndex, stores: Vec<Arc<dyn LocalLogStore>>, stats: Arc<Stats>) -> Self {
        Self {
            node,
            shards: stores.into_iter().map(RwLock::new).collect(),
            stats,
        }
    }

    /// `num_shards` empty in-memory stores
    #[must_use]
    pub fn in_memory(node: NodeIndex, num_shards: u16, stats: Arc<Stats>) -> Self {
        let stores = (0..num_shards)
            .map(|_| Arc::new(MemoryLogStore::new()) as Arc<dyn LocalLogStore>)
            .collect();
        Self::new(node, stores, stats)
    }

    #[must_use]
    pub const fn node(&self) -> NodeIndex {
        self.node
    }

    #[must_use]
    pub fn num_shards(&self) -> u16 {
        u16::try_from(self.shards.len()).unwrap_or(u16::MAX)
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.num_shards()).map(|s| ShardId::new(self.node, s))
    }

    /// Store of shard `shard`
    pub fn get(&self, shard: u16) -> Result<Arc<dyn LocalLogStore>> {
        self.shards
            .get(usize::from(shard))
            .map(|s| Arc::clone(&s.read()))
            .ok_or_else(|| Error::invalid_param(format!("{} has no shard {shard}", self.node)))
    }

    /// Replace shard `shard` with a [`FailingLogStore`]
    pub fn switch_to_failing(&self, shard: u16) -> Result<()> {
        let slot = self.shards.get(usize::from(shard)).ok_or_else(|| {
            Error::internal(format!("cannot switch missing shard {shard} of {}", self.node))
        })?;
        let id = ShardId::new(self.node, shard);
        let mut store = slot.write();
        if store.is_failing() {
            return Ok(());
        }
        warn!("Switching {} to failing log store", id);
        *store = Arc::new(FailingLogStore::new(id));
        self.stats.bump(Counter::FailingShards);
        Ok(())
    }

    #[must_use]
    pub fn is_failing(&self, shard: u16) -> bool {
        self.shards
            .get(usize::from(shard))
            .is_some_and(|s| s.read().is_failing())
    }

    /// Shards currently backed by a failing store
    #[must_use]
    pub fn failing_shards(&self) -> Vec<ShardId> {
        self.shard_ids()
            .filter(|id| self.is_failing(id.shard))
            .collect()
    }
}
