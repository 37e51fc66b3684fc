//! Maintenance log: operator requests to take shards or sequencers out of
//! service

use crate::machine::StateMachine;
use epochlog_common::{Error, LogId, NodeIndex, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a maintenance needs from the affected shards
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceTarget {
    /// Shards may go down as long as no data becomes unavailable
    MayBeUnavailable,
    /// Shards must be emptied before the maintenance starts
    Drained,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceDefinition {
    pub id: String,
    pub user: String,
    pub shards: Vec<ShardId>,
    pub target: MaintenanceTarget,
    pub sequencer_nodes: Vec<NodeIndex>,
    pub reason: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceDelta {
    ApplyMaintenance(MaintenanceDefinition),
    RemoveMaintenances { ids: Vec<String> },
}

/// Active maintenances by id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMaintenanceState {
    maintenances: BTreeMap<String, MaintenanceDefinition>,
}

impl ClusterMaintenanceState {
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&MaintenanceDefinition> {
        self.maintenances.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaintenanceDefinition> {
        self.maintenances.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maintenances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maintenances.is_empty()
    }

    /// Whether a maintenance asks `node` to stop running sequencers
    #[must_use]
    pub fn sequencer_disabled(&self, node: NodeIndex) -> bool {
        self.iter().any(|m| m.sequencer_nodes.contains(&node))
    }
}

pub struct MaintenanceLog;

impl StateMachine for MaintenanceLog {
    type Delta = MaintenanceDelta;
    type State = ClusterMaintenanceState;

    const NAME: &'static str = "maintenance log";

    fn delta_log() -> LogId {
        LogId::MAINTENANCE_LOG_DELTAS
    }

    fn snapshot_log() -> LogId {
        LogId::MAINTENANCE_LOG_SNAPSHOTS
    }

    fn apply(state: &mut ClusterMaintenanceState, delta: &MaintenanceDelta) -> Result<()> {
        match delta {
            MaintenanceDelta::ApplyMaintenance(definition) => {
                if definition.id.is_empty() {
                    return Err(Error::invalid_param("maintenance id must not be empty"));
                }
                if state.maintenances.contains_key(&definition.id) {
                    return Err(Error::invalid_param(format!(
                        "maintenance {} already exists",
                        definition.id
                    )));
                }
                state
                    .maintenances
                    .insert(definition.id.clone(), definition.clone());
            }
            MaintenanceDelta::RemoveMaintenances { ids } => {
                if let Some(unknown) = ids.iter().find(|id| !state.maintenances.contains_key(*id)) {
                    return Err(Error::invalid_param(format!("unknown maintenance {unknown}")));
                }
                for id in ids {
                    state.maintenances.remove(id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LogClient, MemoryLogClient};
    use crate::machine::{ReplicatedStateMachine, SnapshotStatus};
    use epochlog_common::Stats;
    use std::sync::Arc;

    fn definition(id: &str, node: u16) -> MaintenanceDefinition {
        MaintenanceDefinition {
            id: id.into(),
            user: "ops".into(),
            shards: vec![ShardId::new(NodeIndex::new(node), 0)],
            target: MaintenanceTarget::Drained,
            sequencer_nodes: vec![NodeIndex::new(node)],
            reason: "kernel upgrade".into(),
            created_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut state = ClusterMaintenanceState::default();
        let apply = MaintenanceDelta::ApplyMaintenance(definition("m1", 1));
        MaintenanceLog::apply(&mut state, &apply).unwrap();
        let duplicate = MaintenanceDelta::ApplyMaintenance(definition("m1", 2));
        assert!(matches!(
            MaintenanceLog::apply(&mut state, &duplicate),
            Err(Error::InvalidParam(_))
        ));
        assert_eq!(state.get("m1"), Some(&definition("m1", 1)));
    }

    #[test]
    fn test_remove_is_all_or_nothing() {
        let mut state = ClusterMaintenanceState::default();
        for (id, node) in [("m1", 1), ("m2", 2)] {
            MaintenanceLog::apply(&mut state, &MaintenanceDelta::ApplyMaintenance(definition(id, node)))
                .unwrap();
        }
        assert!(state.sequencer_disabled(NodeIndex::new(2)));

        let bad = MaintenanceDelta::RemoveMaintenances {
            ids: vec!["m1".into(), "nope".into()],
        };
        assert!(MaintenanceLog::apply(&mut state, &bad).is_err());
        assert_eq!(state.len(), 2);

        let good = MaintenanceDelta::RemoveMaintenances {
            ids: vec!["m2".into()],
        };
        MaintenanceLog::apply(&mut state, &good).unwrap();
        assert!(!state.sequencer_disabled(NodeIndex::new(2)));
        assert!(state.sequencer_disabled(NodeIndex::new(1)));
        assert_eq!(state.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_replicas_converge_through_snapshot() {
        let client = Arc::new(MemoryLogClient::new());
        let stats = Arc::new(Stats::new());
        let mut writer: ReplicatedStateMachine<MaintenanceLog> =
            ReplicatedStateMachine::new(Arc::clone(&client) as Arc<dyn LogClient>, true, Arc::clone(&stats));
        writer.load().await.unwrap();

        let first = writer
            .write_delta(&MaintenanceDelta::ApplyMaintenance(definition("m1", 1)))
            .await
            .unwrap();
        assert!(
            writer
                .write_delta(&MaintenanceDelta::ApplyMaintenance(definition("m1", 1)))
                .await
                .is_err()
        );
        // The rejected duplicate still moved the version past `first`.
        let status = writer.take_snapshot(0).await.unwrap();
        assert!(matches!(status, SnapshotStatus::Ok { version } if version > first));
        writer
            .write_delta(&MaintenanceDelta::ApplyMaintenance(definition("m2", 2)))
            .await
            .unwrap();

        let mut reader: ReplicatedStateMachine<MaintenanceLog> =
            ReplicatedStateMachine::new(Arc::clone(&client) as Arc<dyn LogClient>, true, stats);
        reader.load().await.unwrap();
        assert_eq!(reader.state(), writer.state());
        assert_eq!(reader.version(), writer.version());
        assert_eq!(reader.state().len(), 2);
    }
}
