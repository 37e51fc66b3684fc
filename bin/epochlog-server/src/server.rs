//! Server bootstrap
//!
//! Opens the epoch store, brings up the shards of every configured node in
//! process, starts the sequencer workers and the two internal state
//! machines. An epoch store that cannot be opened stops startup. Once the
//! state machines run, their maintenances and rebuilds are fed to the
//! sequencers' [`ClusterControl`].

use crate::admin::AdminApi;
use crate::loopback::LoopbackLogClient;
use epochlog_common::config::EpochStoreKind;
use epochlog_common::{Config, Error, LogId, NodeIndex, Result, Stats};
use epochlog_epoch_store::{
    EpochStore, EpochStoreBackend, FileEpochStoreBackend, MemoryEpochStoreBackend,
};
use epochlog_rsm::{EventLog, LogClient, MaintenanceLog, ReplicatedStateMachine, RsmHandle};
use epochlog_sequencer::{AllSequencers, ClusterControl, SequencerContext};
use epochlog_storage::{
    LocalShard, LogStorageStateMap, ShardDirectory, ShardedLogStore, populate_state_map,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RSM_QUEUE_SIZE: usize = 256;

const INTERNAL_LOGS: [LogId; 4] = [
    LogId::EVENT_LOG_DELTAS,
    LogId::EVENT_LOG_SNAPSHOTS,
    LogId::MAINTENANCE_LOG_DELTAS,
    LogId::MAINTENANCE_LOG_SNAPSHOTS,
];

fn open_epoch_store(config: &Config) -> Result<Arc<dyn EpochStoreBackend>> {
    match config.epoch_store.backend {
        EpochStoreKind::Memory => Ok(Arc::new(MemoryEpochStoreBackend::new())),
        EpochStoreKind::File => {
            let path = config
                .epoch_store
                .path
                .clone()
                .unwrap_or_else(|| config.node.data_dir.join("epochs.redb"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(FileEpochStoreBackend::open(&path)?))
        }
    }
}

/// Shards of every node, served in this process, and the store of this
/// node's own shards
async fn start_shards(
    config: &Config,
    stats: &Arc<Stats>,
) -> Result<(Arc<ShardDirectory>, Arc<ShardedLogStore>)> {
    let directory = Arc::new(ShardDirectory::new());
    let nodes = config.nodes.nodes_configuration();
    let mut local = None;
    for node in nodes.nodes.values() {
        let store = Arc::new(ShardedLogStore::in_memory(
            node.index,
            node.num_shards,
            Arc::clone(stats),
        ));
        if node.index == config.node.node_index() {
            for shard in &config.storage.failing_shards {
                store.switch_to_failing(*shard)?;
            }
            local = Some(Arc::clone(&store));
        }
        let states = Arc::new(LogStorageStateMap::new(Arc::clone(stats)));
        populate_state_map(Arc::clone(&store), Arc::clone(&states)).await?;
        for id in node.shards() {
            directory.insert(Arc::new(LocalShard::new(
                id,
                Arc::clone(&store),
                Arc::clone(&states),
            )));
        }
    }
    info!("Serving {} shards on {} nodes", directory.len(), nodes.nodes.len());
    let local = local.ok_or_else(|| {
        Error::Configuration(format!("node {} has no shards", config.node.node_index()))
    })?;
    Ok((directory, local))
}

/// Mirror the maintenance and event logs into `control`
async fn refresh_control(
    node: NodeIndex,
    control: &ClusterControl,
    event_log: &RsmHandle<EventLog>,
    maintenance_log: &RsmHandle<MaintenanceLog>,
) {
    match maintenance_log.view().await {
        Ok(view) => {
            let disabled = view.state.sequencer_disabled(node);
            if disabled != control.sequencing_disabled() {
                info!("Sequencing on {} is now {}", node, if disabled { "disabled" } else { "enabled" });
            }
            control.set_sequencing_disabled(disabled);
        }
        Err(e) => debug!("Maintenance log not readable: {}", e),
    }
    match event_log.view().await {
        Ok(view) => control.set_rebuilding(view.state.rebuilding()),
        Err(e) => debug!("Event log not readable: {}", e),
    }
}

async fn follow_control(
    node: NodeIndex,
    control: Arc<ClusterControl>,
    event_log: RsmHandle<EventLog>,
    maintenance_log: RsmHandle<MaintenanceLog>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                refresh_control(node, &control, &event_log, &maintenance_log).await;
            }
        }
    }
}

pub struct Server {
    config: Arc<Config>,
    stats: Arc<Stats>,
    sequencers: Arc<AllSequencers>,
    local_store: Arc<ShardedLogStore>,
    event_log: RsmHandle<EventLog>,
    maintenance_log: RsmHandle<MaintenanceLog>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(Stats::new());

        let backend = open_epoch_store(&config).inspect_err(|e| {
            error!("Cannot open epoch store: {}", e);
        })?;
        let epoch_store = EpochStore::new(backend, &config.epoch_store, Arc::clone(&stats));
        let (shards, local_store) = start_shards(&config, &stats).await?;
        let control = Arc::new(ClusterControl::new());

        let ctx = Arc::new(SequencerContext {
            node: config.node.node_index(),
            epoch_store,
            shards,
            nodes: Arc::new(config.nodes.nodes_configuration()),
            logs: Arc::new(config.logs.clone()),
            sequencer: config.sequencer.clone(),
            recovery: config.recovery.clone(),
            stats: Arc::clone(&stats),
            control: Arc::clone(&control),
        });
        let sequencers = Arc::new(AllSequencers::start(ctx));
        if !config.sequencer.lazy_activation {
            for log in INTERNAL_LOGS {
                if let Err(e) = sequencers.activate(log).await {
                    warn!("Could not activate internal log {}: {}", log, e);
                }
            }
        }

        let client: Arc<dyn LogClient> = Arc::new(LoopbackLogClient::new(Arc::clone(&sequencers)));
        let shutdown = CancellationToken::new();
        let (event_log, event_task) = ReplicatedStateMachine::<EventLog>::new(
            Arc::clone(&client),
            config.rsm.event_log_snapshotting,
            Arc::clone(&stats),
        )
        .spawn(config.rsm.sync_interval(), RSM_QUEUE_SIZE, shutdown.child_token());
        let (maintenance_log, maintenance_task) = ReplicatedStateMachine::<MaintenanceLog>::new(
            client,
            config.rsm.maintenance_log_snapshotting,
            Arc::clone(&stats),
        )
        .spawn(config.rsm.sync_interval(), RSM_QUEUE_SIZE, shutdown.child_token());

        if let Err(e) = event_log.sync().await {
            warn!("Event log not loaded yet: {}", e);
        }
        if let Err(e) = maintenance_log.sync().await {
            warn!("Maintenance log not loaded yet: {}", e);
        }

        let node = config.node.node_index();
        refresh_control(node, &control, &event_log, &maintenance_log).await;
        let control_task = tokio::spawn(follow_control(
            node,
            control,
            event_log.clone(),
            maintenance_log.clone(),
            config.rsm.sync_interval(),
            shutdown.child_token(),
        ));

        info!("epochlog server started on {}", node);
        Ok(Self {
            config: Arc::new(config),
            stats,
            sequencers,
            local_store,
            event_log,
            maintenance_log,
            shutdown,
            tasks: vec![event_task, maintenance_task, control_task],
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn sequencers(&self) -> &Arc<AllSequencers> {
        &self.sequencers
    }

    #[must_use]
    pub const fn event_log(&self) -> &RsmHandle<EventLog> {
        &self.event_log
    }

    #[must_use]
    pub const fn maintenance_log(&self) -> &RsmHandle<MaintenanceLog> {
        &self.maintenance_log
    }

    #[must_use]
    pub fn admin(&self) -> Arc<AdminApi> {
        Arc::new(AdminApi::new(
            Arc::clone(&self.config),
            Arc::clone(&self.sequencers),
            Arc::clone(&self.local_store),
            self.event_log.clone(),
            self.maintenance_log.clone(),
            Arc::clone(&self.stats),
        ))
    }

    /// Token cancelled when the server shuts down
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(self) {
        info!("Shutting down epochlog server");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.sequencers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::SnapshotOutcome;
    use bytes::Bytes;
    use epochlog_common::{Epoch, Error, NodeIndex, ShardId};
    use epochlog_rsm::{EventLogDelta, MaintenanceDefinition, MaintenanceDelta, MaintenanceTarget, ShardRebuild};
    use epochlog_sequencer::SequencerStatus;

    fn file_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.epoch_store.backend = EpochStoreKind::File;
        config.epoch_store.path = Some(dir.path().join("epochs.redb"));
        config.sequencer.workers = 2;
        config.rsm.sync_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_appends_get_increasing_lsns() {
        let server = Server::start(Config::default()).await.unwrap();
        let log = LogId::new(3);
        let mut last = None;
        for i in 0..20u32 {
            let lsn = server
                .sequencers()
                .append(log, Bytes::from(i.to_le_bytes().to_vec()))
                .await
                .unwrap();
            assert_eq!(lsn.epoch, Epoch::MIN);
            if let Some(prev) = last {
                assert!(lsn > prev);
            }
            last = Some(lsn);
        }
        let state = server.sequencers().state(log).await.unwrap().unwrap();
        assert_eq!(state.status, SequencerStatus::Active);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_epoch_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogId::new(9);

        let server = Server::start(file_config(&dir)).await.unwrap();
        let first = server.sequencers().activate(log).await.unwrap();
        assert_eq!(first.epoch, Epoch::MIN);
        server.shutdown().await;

        let server = Server::start(file_config(&dir)).await.unwrap();
        let second = server.sequencers().activate(log).await.unwrap();
        assert_eq!(second.epoch, Epoch::new(2));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unopenable_epoch_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let mut config = Config::default();
        config.epoch_store.backend = EpochStoreKind::File;
        config.epoch_store.path = Some(blocker.join("epochs.redb"));
        assert!(Server::start(config).await.is_err());
    }

    #[tokio::test]
    async fn test_event_log_through_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::start(file_config(&dir)).await.unwrap();
        let shard = ShardId::new(NodeIndex::new(1), 0);

        server
            .event_log()
            .write_delta(EventLogDelta::ShardNeedsRebuild {
                shard,
                reason: "disk replaced".into(),
            })
            .await
            .unwrap();
        let rejected = server
            .event_log()
            .write_delta(EventLogDelta::ShardAckRebuilt { shard })
            .await;
        assert!(matches!(rejected, Err(Error::InvalidParam(_))));

        let view = server.event_log().view().await.unwrap();
        assert!(matches!(view.state.get(shard), Some(ShardRebuild::Rebuilding { .. })));

        let admin = server.admin();
        let taken = admin.take_event_log_snapshot(0).await;
        assert!(matches!(taken, SnapshotOutcome::Ok { version } if version == view.version));
        let again = admin.take_event_log_snapshot(0).await;
        assert!(matches!(again, SnapshotOutcome::UpToDate { version } if version == view.version));

        let report = admin.event_log_state().await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.snapshot_version, Some(view.version));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_disabled() {
        let mut config = Config::default();
        config.rsm.maintenance_log_snapshotting = false;
        let server = Server::start(config).await.unwrap();
        let outcome = server.admin().take_maintenance_log_snapshot(0).await;
        assert!(matches!(outcome, SnapshotOutcome::OperationError { .. }));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_maintenance_disables_sequencing() {
        let mut config = Config::default();
        config.rsm.sync_interval_ms = 20;
        let server = Server::start(config).await.unwrap();
        let node = NodeIndex::new(0);
        let shard = ShardId::new(NodeIndex::new(2), 0);
        let control = &server.sequencers().context().control;

        server
            .maintenance_log()
            .write_delta(MaintenanceDelta::ApplyMaintenance(MaintenanceDefinition {
                id: "upgrade-n0".into(),
                user: "ops".into(),
                shards: Vec::new(),
                target: MaintenanceTarget::MayBeUnavailable,
                sequencer_nodes: vec![node],
                reason: "kernel upgrade".into(),
                created_at_ms: 0,
            }))
            .await
            .unwrap();
        server
            .event_log()
            .write_delta(EventLogDelta::ShardNeedsRebuild {
                shard,
                reason: "disk replaced".into(),
            })
            .await
            .unwrap();

        let mut refused = None;
        for i in 0..100 {
            match server.sequencers().activate(LogId::new(100 + i)).await {
                Err(Error::SequencingDisabled(by)) => {
                    refused = Some(by);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert_eq!(refused, Some(node));
        assert!(control.sequencing_disabled());
        assert!(control.is_rebuilding(shard));
        server.shutdown().await;
    }
}
