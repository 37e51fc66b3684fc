//! Admin operations
//!
//! Node status, snapshots of the internal state machines, the cluster's
//! replication summary, and per-log sequencer control. [`crate::http`]
//! exposes these over HTTP.

use epochlog_common::{
    Config, Error, LocationScope, LogId, Lsn, NodeIndex, ReplicationProperty, Result, ShardId,
    Stats,
};
use epochlog_rsm::{
    EventLog, MaintenanceDefinition, MaintenanceLog, RsmHandle, ShardRebuild, SnapshotStatus,
    StateMachine,
};
use epochlog_sequencer::{AllSequencers, SequencerState};
use epochlog_storage::ShardedLogStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a snapshot request, one variant per reported status
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotOutcome {
    Ok {
        version: Lsn,
    },
    #[serde(rename = "UPTODATE")]
    UpToDate {
        version: Lsn,
    },
    NodeNotReady,
    StaleVersion {
        server_version: u64,
        requested: u64,
    },
    OperationError {
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// The event or maintenance log has not been loaded yet
    Starting,
    Alive,
    /// Serving, but some local shard is failing
    Warning,
}

impl NodeStatus {
    #[must_use]
    pub fn decide(rsms_loaded: bool, failing_shards: &[ShardId]) -> Self {
        if !failing_shards.is_empty() {
            Self::Warning
        } else if rsms_loaded {
            Self::Alive
        } else {
            Self::Starting
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: NodeStatus,
    pub node: NodeIndex,
    pub cluster: String,
    pub event_log_loaded: bool,
    pub maintenance_log_loaded: bool,
    pub failing_shards: Vec<ShardId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogTreeInfo {
    pub version: u64,
    pub num_logs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TolerableFailureDomain {
    pub domain: LocationScope,
    pub count: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicationInfo {
    /// Version of the logs configuration
    pub version: u64,
    pub narrowest_replication: ReplicationProperty,
    pub smallest_replication_factor: u8,
    pub tolerable_failure_domains: TolerableFailureDomain,
    pub nodes_config_version: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RebuildEntry {
    pub shard: ShardId,
    pub state: ShardRebuild,
}

/// A state machine's contents as reported to admin callers
#[derive(Clone, Debug, Serialize)]
pub struct StateReport<T> {
    pub version: Lsn,
    pub snapshot_version: Option<Lsn>,
    pub loaded: bool,
    pub entries: Vec<T>,
}

#[derive(Clone)]
pub struct AdminApi {
    config: Arc<Config>,
    sequencers: Arc<AllSequencers>,
    local_store: Arc<ShardedLogStore>,
    event_log: RsmHandle<EventLog>,
    maintenance_log: RsmHandle<MaintenanceLog>,
    stats: Arc<Stats>,
}

impl AdminApi {
    #[must_use]
    pub const fn new(
        config: Arc<Config>,
        sequencers: Arc<AllSequencers>,
        local_store: Arc<ShardedLogStore>,
        event_log: RsmHandle<EventLog>,
        maintenance_log: RsmHandle<MaintenanceLog>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            sequencers,
            local_store,
            event_log,
            maintenance_log,
            stats,
        }
    }

    /// Liveness of this node as seen by operators
    pub async fn status(&self) -> StatusReport {
        let event_log_loaded = self.event_log.view().await.is_ok_and(|v| v.loaded);
        let maintenance_log_loaded = self.maintenance_log.view().await.is_ok_and(|v| v.loaded);
        let failing_shards = self.local_store.failing_shards();
        StatusReport {
            status: NodeStatus::decide(event_log_loaded && maintenance_log_loaded, &failing_shards),
            node: self.config.node.node_index(),
            cluster: self.config.nodes.name.clone(),
            event_log_loaded,
            maintenance_log_loaded,
            failing_shards,
        }
    }

    #[must_use]
    pub fn log_tree_info(&self) -> LogTreeInfo {
        let logs = &self.sequencers.context().logs;
        LogTreeInfo {
            version: logs.version,
            num_logs: logs.ranges.iter().map(|r| r.last - r.first + 1).sum(),
        }
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.config.nodes.name
    }

    /// The configuration this node runs with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn take_snapshot<M: StateMachine>(
        handle: &RsmHandle<M>,
        min_version: u64,
    ) -> SnapshotOutcome {
        let outcome = match handle.take_snapshot(min_version).await {
            Ok(SnapshotStatus::Ok { version }) => SnapshotOutcome::Ok { version },
            Ok(SnapshotStatus::UpToDate { version }) => SnapshotOutcome::UpToDate { version },
            Err(Error::NodeNotReady) => SnapshotOutcome::NodeNotReady,
            Err(Error::StaleVersion {
                server_version,
                requested,
            }) => SnapshotOutcome::StaleVersion {
                server_version,
                requested,
            },
            Err(e) => {
                warn!("{} snapshot failed: {}", M::NAME, e);
                SnapshotOutcome::OperationError {
                    message: e.to_string(),
                }
            }
        };
        info!("{} snapshot requested (min version {}): {:?}", M::NAME, min_version, outcome);
        outcome
    }

    pub async fn take_event_log_snapshot(&self, min_version: u64) -> SnapshotOutcome {
        Self::take_snapshot(&self.event_log, min_version).await
    }

    pub async fn take_maintenance_log_snapshot(&self, min_version: u64) -> SnapshotOutcome {
        Self::take_snapshot(&self.maintenance_log, min_version).await
    }

    /// Weakest replication across all configured logs
    #[must_use]
    pub fn replication_info(&self) -> ReplicationInfo {
        let ctx = self.sequencers.context();
        let mut replications = ctx.logs.all_replications();
        let first = replications.next().cloned().unwrap_or_default();
        let (narrowest, smallest) = replications.fold(
            (first.clone(), first.replication_factor()),
            |(narrowest, smallest), r| {
                (narrowest.narrowest(r), smallest.min(r.replication_factor()))
            },
        );
        let domain = narrowest.biggest_scope();
        let count = narrowest.effective(domain).saturating_sub(1);
        ReplicationInfo {
            version: ctx.logs.version,
            smallest_replication_factor: smallest,
            tolerable_failure_domains: TolerableFailureDomain { domain, count },
            narrowest_replication: narrowest,
            nodes_config_version: ctx.nodes.version,
        }
    }

    pub async fn sequencer_state(&self, log: LogId) -> Result<SequencerState> {
        self.sequencers
            .state(log)
            .await?
            .ok_or(Error::NoSequencer(log))
    }

    pub async fn activate_sequencer(&self, log: LogId) -> Result<SequencerState> {
        info!("Admin request to activate sequencer for log {}", log);
        self.sequencers.activate(log).await
    }

    pub async fn event_log_state(&self) -> Result<StateReport<RebuildEntry>> {
        let view = self.event_log.view().await?;
        Ok(StateReport {
            version: view.version,
            snapshot_version: view.snapshot_version,
            loaded: view.loaded,
            entries: view
                .state
                .iter()
                .map(|(shard, rebuild)| RebuildEntry {
                    shard: *shard,
                    state: rebuild.clone(),
                })
                .collect(),
        })
    }

    pub async fn maintenance_log_state(&self) -> Result<StateReport<MaintenanceDefinition>> {
        let view = self.maintenance_log.view().await?;
        Ok(StateReport {
            version: view.version,
            snapshot_version: view.snapshot_version,
            loaded: view.loaded,
            entries: view.state.iter().cloned().collect(),
        })
    }

    #[must_use]
    pub fn metrics(&self) -> String {
        self.stats.export_prometheus("epochlog")
    }
}
