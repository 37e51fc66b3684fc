//! Control-plane state sequencers act on
//!
//! Filled from the maintenance and event logs by whoever follows them.
//! Activation refuses to start sequencers on a node a maintenance has
//! taken out of sequencing, and recovery does not count answers from
//! shards that are still being rebuilt toward its f-majority.

use epochlog_common::ShardId;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct ClusterControl {
    sequencing_disabled: AtomicBool,
    rebuilding: RwLock<HashSet<ShardId>>,
}

impl ClusterControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this node may not start new sequencers
    #[must_use]
    pub fn sequencing_disabled(&self) -> bool {
        self.sequencing_disabled.load(Ordering::Acquire)
    }

    pub fn set_sequencing_disabled(&self, disabled: bool) {
        self.sequencing_disabled.store(disabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_rebuilding(&self, shard: ShardId) -> bool {
        self.rebuilding.read().contains(&shard)
    }

    /// Replace the set of shards being rebuilt
    pub fn set_rebuilding(&self, shards: impl IntoIterator<Item = ShardId>) {
        *self.rebuilding.write() = shards.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochlog_common::NodeIndex;

    #[test]
    fn test_rebuilding_set_is_replaced() {
        let control = ClusterControl::new();
        let a = ShardId::new(NodeIndex::new(0), 0);
        let b = ShardId::new(NodeIndex::new(1), 0);
        control.set_rebuilding([a]);
        assert!(control.is_rebuilding(a));
        control.set_rebuilding([b]);
        assert!(!control.is_rebuilding(a));
        assert!(control.is_rebuilding(b));

        assert!(!control.sequencing_disabled());
        control.set_sequencing_disabled(true);
        assert!(control.sequencing_disabled());
    }
}
