//! Event log: cluster-wide rebuilding status of shards

use crate::machine::StateMachine;
use epochlog_common::{Error, LogId, NodeIndex, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLogDelta {
    /// The shard lost data and must be rebuilt from its peers
    ShardNeedsRebuild { shard: ShardId, reason: String },
    ShardAbortRebuild { shard: ShardId },
    /// Rebuilding finished; the shard must still acknowledge it
    ShardIsRebuilt { shard: ShardId, donor: NodeIndex },
    ShardAckRebuilt { shard: ShardId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRebuild {
    Rebuilding { reason: String },
    Rebuilt { donor: NodeIndex },
}

/// Shards that are rebuilding or waiting to acknowledge a rebuild
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildingSet {
    shards: BTreeMap<ShardId, ShardRebuild>,
}

impl RebuildingSet {
    #[must_use]
    pub fn get(&self, shard: ShardId) -> Option<&ShardRebuild> {
        self.shards.get(&shard)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShardId, &ShardRebuild)> {
        self.shards.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Shards that cannot serve reads yet
    pub fn rebuilding(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.iter().filter_map(|(shard, rebuild)| {
            matches!(rebuild, ShardRebuild::Rebuilding { .. }).then_some(*shard)
        })
    }
}

pub struct EventLog;

impl StateMachine for EventLog {
    type Delta = EventLogDelta;
    type State = RebuildingSet;

    const NAME: &'static str = "event log";

    fn delta_log() -> LogId {
        LogId::EVENT_LOG_DELTAS
    }

    fn snapshot_log() -> LogId {
        LogId::EVENT_LOG_SNAPSHOTS
    }

    fn apply(state: &mut RebuildingSet, delta: &EventLogDelta) -> Result<()> {
        match delta {
            EventLogDelta::ShardNeedsRebuild { shard, reason } => {
                if let Some(ShardRebuild::Rebuilding { .. }) = state.shards.get(shard) {
                    return Err(Error::invalid_param(format!("{shard} is already rebuilding")));
                }
                state.shards.insert(
                    *shard,
                    ShardRebuild::Rebuilding {
                        reason: reason.clone(),
                    },
                );
            }
            EventLogDelta::ShardAbortRebuild { shard } => match state.shards.get(shard) {
                Some(ShardRebuild::Rebuilding { .. }) => {
                    state.shards.remove(shard);
                }
                _ => return Err(Error::invalid_param(format!("{shard} is not rebuilding"))),
            },
            EventLogDelta::ShardIsRebuilt { shard, donor } => match state.shards.get_mut(shard) {
                Some(rebuild @ ShardRebuild::Rebuilding { .. }) => {
                    *rebuild = ShardRebuild::Rebuilt { donor: *donor };
                }
                _ => return Err(Error::invalid_param(format!("{shard} is not rebuilding"))),
            },
            EventLogDelta::ShardAckRebuilt { shard } => match state.shards.get(shard) {
                Some(ShardRebuild::Rebuilt { .. }) => {
                    state.shards.remove(shard);
                }
                _ => {
                    return Err(Error::invalid_param(format!(
                        "{shard} has no rebuild to acknowledge"
                    )));
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(node: u16) -> ShardId {
        ShardId::new(NodeIndex::new(node), 0)
    }

    fn needs_rebuild(node: u16) -> EventLogDelta {
        EventLogDelta::ShardNeedsRebuild {
            shard: shard(node),
            reason: "disk replaced".into(),
        }
    }

    #[test]
    fn test_rebuild_lifecycle() {
        let mut set = RebuildingSet::default();
        EventLog::apply(&mut set, &needs_rebuild(1)).unwrap();
        EventLog::apply(&mut set, &needs_rebuild(2)).unwrap();
        assert_eq!(set.rebuilding().collect::<Vec<_>>(), vec![shard(1), shard(2)]);

        EventLog::apply(
            &mut set,
            &EventLogDelta::ShardIsRebuilt {
                shard: shard(1),
                donor: NodeIndex::new(0),
            },
        )
        .unwrap();
        assert_eq!(
            set.get(shard(1)),
            Some(&ShardRebuild::Rebuilt {
                donor: NodeIndex::new(0)
            })
        );
        assert_eq!(set.rebuilding().collect::<Vec<_>>(), vec![shard(2)]);

        EventLog::apply(&mut set, &EventLogDelta::ShardAckRebuilt { shard: shard(1) }).unwrap();
        EventLog::apply(&mut set, &EventLogDelta::ShardAbortRebuild { shard: shard(2) }).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_invalid_transitions_leave_state_unchanged() {
        let mut set = RebuildingSet::default();
        EventLog::apply(&mut set, &needs_rebuild(1)).unwrap();
        let before = set.clone();

        assert!(EventLog::apply(&mut set, &needs_rebuild(1)).is_err());
        assert!(EventLog::apply(&mut set, &EventLogDelta::ShardAckRebuilt { shard: shard(1) }).is_err());
        assert!(EventLog::apply(&mut set, &EventLogDelta::ShardAbortRebuild { shard: shard(3) }).is_err());
        assert!(
            EventLog::apply(
                &mut set,
                &EventLogDelta::ShardIsRebuilt {
                    shard: shard(3),
                    donor: NodeIndex::new(0),
                },
            )
            .is_err()
        );
        assert_eq!(set, before);
    }

    #[test]
    fn test_rebuilt_shard_can_need_rebuild_again() {
        let mut set = RebuildingSet::default();
        EventLog::apply(&mut set, &needs_rebuild(1)).unwrap();
        EventLog::apply(
            &mut set,
            &EventLogDelta::ShardIsRebuilt {
                shard: shard(1),
                donor: NodeIndex::new(2),
            },
        )
        .unwrap();
        EventLog::apply(&mut set, &needs_rebuild(1)).unwrap();
        assert_eq!(set.len(), 1);
        assert!(matches!(set.get(shard(1)), Some(ShardRebuild::Rebuilding { .. })));
    }
}
