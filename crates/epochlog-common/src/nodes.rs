//! Cluster nodes configuration
//!
//! The membership view used to pick replica sets and to evaluate
//! failure-domain coverage. Changes to membership are out of scope; the
//! configuration is versioned so replica sets can record which view they
//! were chosen from.

use crate::replication::{LocationScope, NodeLocation};
use crate::types::{NodeIndex, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single node of the cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub index: NodeIndex,
    pub name: String,
    #[serde(default)]
    pub location: NodeLocation,
    /// Number of local log stores (shards)
    #[serde(default = "default_num_shards")]
    pub num_shards: u16,
    /// Relative weight for running sequencers; 0 disables the role
    #[serde(default = "default_weight")]
    pub sequencer_weight: f64,
    /// Whether the storage role accepts new copies
    #[serde(default = "default_writable")]
    pub storage_writable: bool,
}

const fn default_num_shards() -> u16 {
    1
}

const fn default_weight() -> f64 {
    1.0
}

const fn default_writable() -> bool {
    true
}

impl NodeInfo {
    #[must_use]
    pub fn new(index: u16, location: NodeLocation) -> Self {
        Self {
            index: NodeIndex::new(index),
            name: format!("node-{index}"),
            location,
            num_shards: 1,
            sequencer_weight: 1.0,
            storage_writable: true,
        }
    }

    #[must_use]
    pub fn with_shards(mut self, num_shards: u16) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.num_shards).map(|s| ShardId::new(self.index, s))
    }
}

/// Versioned set of cluster nodes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesConfiguration {
    pub version: u64,
    pub nodes: BTreeMap<NodeIndex, NodeInfo>,
}

impl NodesConfiguration {
    #[must_use]
    pub fn new(version: u64, nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        Self {
            version,
            nodes: nodes.into_iter().map(|n| (n.index, n)).collect(),
        }
    }

    /// `count` single-shard nodes, each in its own rack
    #[must_use]
    pub fn flat(count: u16) -> Self {
        Self::new(
            1,
            (0..count).map(|i| NodeInfo::new(i, NodeLocation::new("r", "dc", format!("rack{i}")))),
        )
    }

    #[must_use]
    pub fn get(&self, node: NodeIndex) -> Option<&NodeInfo> {
        self.nodes.get(&node)
    }

    #[must_use]
    pub fn contains_shard(&self, shard: ShardId) -> bool {
        self.nodes
            .get(&shard.node)
            .is_some_and(|n| shard.shard < n.num_shards)
    }

    /// All shards of storage-writable nodes
    pub fn writable_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.nodes
            .values()
            .filter(|n| n.storage_writable)
            .flat_map(NodeInfo::shards)
    }

    /// Failure domain of a shard at `scope`. Node scope maps to the node
    /// index so every node is its own domain.
    #[must_use]
    pub fn domain_of(&self, shard: ShardId, scope: LocationScope) -> Option<String> {
        let node = self.nodes.get(&shard.node)?;
        match scope {
            LocationScope::Node => Some(node.index.to_string()),
            _ => node.location.domain(scope),
        }
    }

    /// Nodes eligible to run sequencers
    pub fn sequencer_nodes(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.nodes.values().filter(|n| n.sequencer_weight > 0.0)
    }
}
