//! Metadata updaters
//!
//! An updater is a pure function from the current record (if any) to the
//! epoch metadata that should replace it. The store runs it inside its
//! read-modify-write loop, possibly more than once.

use crate::metadata::{EpochMetaData, LogMetaData};
use crate::nodeset::select_replica_set;
use epochlog_common::{
    Epoch, Error, LogId, NodeIndex, NodesConfiguration, ReplicationProperty, Result,
};
use std::sync::Arc;

/// What an updater decided
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Replace the current epoch metadata
    Write(EpochMetaData),
    /// Nothing to change
    UpToDate,
}

/// Computes the next epoch metadata of a log
pub trait MetaDataUpdater: Send + Sync {
    fn update(&self, log: LogId, current: Option<&LogMetaData>) -> Result<UpdateOutcome>;
}

/// Inputs for placing a new epoch
#[derive(Clone, Debug)]
struct Placement {
    nodes: Arc<NodesConfiguration>,
    replication: ReplicationProperty,
    nodeset_size: usize,
    written_by: NodeIndex,
}

impl Placement {
    fn place(&self, log: LogId, epoch: Epoch) -> Result<EpochMetaData> {
        Ok(EpochMetaData {
            epoch,
            replica_set: select_replica_set(log, &self.nodes, &self.replication, self.nodeset_size)?,
            replication: self.replication.clone(),
            nodes_config_version: self.nodes.version,
            written_by: Some(self.written_by),
            disabled: false,
        })
    }
}

/// Creates epoch 1 for a log that has no metadata yet
#[derive(Clone, Debug)]
pub struct ProvisionUpdater {
    placement: Placement,
}

impl ProvisionUpdater {
    #[must_use]
    pub const fn new(
        nodes: Arc<NodesConfiguration>,
        replication: ReplicationProperty,
        nodeset_size: usize,
        written_by: NodeIndex,
    ) -> Self {
        Self {
            placement: Placement {
                nodes,
                replication,
                nodeset_size,
                written_by,
            },
        }
    }
}

impl MetaDataUpdater for ProvisionUpdater {
    fn update(&self, log: LogId, current: Option<&LogMetaData>) -> Result<UpdateOutcome> {
        if current.is_some() {
            return Ok(UpdateOutcome::UpToDate);
        }
        self.placement.place(log, Epoch::MIN).map(UpdateOutcome::Write)
    }
}

/// Claims the next epoch with a freshly selected replica set
#[derive(Clone, Debug)]
pub struct BumpEpochUpdater {
    placement: Placement,
}

impl BumpEpochUpdater {
    #[must_use]
    pub const fn new(
        nodes: Arc<NodesConfiguration>,
        replication: ReplicationProperty,
        nodeset_size: usize,
        written_by: NodeIndex,
    ) -> Self {
        Self {
            placement: Placement {
                nodes,
                replication,
                nodeset_size,
                written_by,
            },
        }
    }
}

impl MetaDataUpdater for BumpEpochUpdater {
    fn update(&self, log: LogId, current: Option<&LogMetaData>) -> Result<UpdateOutcome> {
        let current = current.ok_or(Error::NotFound(log))?;
        if current.current.disabled {
            return Err(Error::Disabled(log));
        }
        let next = current.current.epoch.next().ok_or(Error::TooManyEpochs(log))?;
        self.placement.place(log, next).map(UpdateOutcome::Write)
    }
}
