//! Failure-domain quorum checks
//!
//! Two questions recovery and the write path ask about a set of shards:
//! can these shards hold a fully replicated copy, and is a set of responses
//! an f-majority (the shards that did not answer could not, on their own,
//! hold a fully replicated copy).

use crate::nodes::NodesConfiguration;
use crate::replication::{LocationScope, ReplicationProperty};
use crate::types::ShardId;
use std::collections::HashSet;

/// Quorum checker for one replica set under one replication property
#[derive(Clone, Debug)]
pub struct FailureDomainChecker<'a> {
    nodes: &'a NodesConfiguration,
    replication: &'a ReplicationProperty,
}

impl<'a> FailureDomainChecker<'a> {
    #[must_use]
    pub const fn new(nodes: &'a NodesConfiguration, replication: &'a ReplicationProperty) -> Self {
        Self { nodes, replication }
    }

    /// Whether copies on `shards` satisfy the replication property
    pub fn can_replicate<'s>(&self, shards: impl IntoIterator<Item = &'s ShardId>) -> bool {
        let shards: HashSet<ShardId> = shards.into_iter().copied().collect();
        if shards.len() < usize::from(self.replication.replication_factor()) {
            return false;
        }
        LocationScope::ALL.iter().all(|scope| {
            let required = usize::from(self.replication.effective(*scope));
            let domains: HashSet<String> = shards
                .iter()
                .filter_map(|s| self.nodes.domain_of(*s, *scope))
                .collect();
            domains.len() >= required
        })
    }

    /// Whether `responded` is an f-majority of `replica_set`
    pub fn is_f_majority(&self, replica_set: &[ShardId], responded: &HashSet<ShardId>) -> bool {
        let missing: Vec<&ShardId> = replica_set
            .iter()
            .filter(|s| !responded.contains(s))
            .collect();
        !self.can_replicate(missing)
    }
}
