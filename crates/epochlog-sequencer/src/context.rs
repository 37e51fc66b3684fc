//! Everything a sequencer needs from the rest of the node

use crate::control::ClusterControl;
use epochlog_common::config::{LogsConfig, RecoveryConfig, SequencerConfig};
use epochlog_common::{NodeIndex, NodesConfiguration, Stats};
use epochlog_epoch_store::EpochStore;
use epochlog_storage::ShardDirectory;
use std::sync::Arc;

/// Shared, read-only dependencies of every sequencer on a node
#[derive(Clone)]
pub struct SequencerContext {
    pub node: NodeIndex,
    pub epoch_store: EpochStore,
    pub shards: Arc<ShardDirectory>,
    pub nodes: Arc<NodesConfiguration>,
    pub logs: Arc<LogsConfig>,
    pub sequencer: SequencerConfig,
    pub recovery: RecoveryConfig,
    pub stats: Arc<Stats>,
    pub control: Arc<ClusterControl>,
}
