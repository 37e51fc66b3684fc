//! Shard service: what sequencers and recovery ask of a storage shard
//!
//! [`ShardClient`] is the storage-node surface (seal, digest, store,
//! release). [`LocalShard`] serves it from the node's own log store and
//! state map with no transport in between; [`ShardDirectory`] resolves a
//! [`ShardId`] to its client.

use crate::metadata::{LogMetadata, Seal};
use crate::sharded::ShardedLogStore;
use crate::state::{LogStorageState, LogStorageStateMap};
use crate::store::RecordKind;
use async_trait::async_trait;
use dashmap::DashMap;
use epochlog_common::{Epoch, Error, LogId, Lsn, Result, ShardId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Who is writing a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOrigin {
    /// The sequencer that owns the record's epoch
    Sequencer,
    /// Recovery run by the sequencer of `sequencer_epoch`
    Recovery { sequencer_epoch: Epoch },
}

/// A shard's view of one epoch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestReply {
    pub shard: ShardId,
    /// Records at or below this LSN are trimmed and left out of `records`
    pub trim_point: Lsn,
    pub records: BTreeMap<u32, RecordKind>,
}

impl DigestReply {
    /// Highest offset this shard holds anything for
    #[must_use]
    pub fn max_offset(&self) -> u32 {
        self.records.keys().next_back().copied().unwrap_or(0)
    }
}

/// Snapshot of a shard's watermarks for one log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardLogState {
    pub trim_point: Lsn,
    pub last_clean_epoch: Epoch,
    pub last_released: Lsn,
    pub seal: Option<Seal>,
}

/// Storage-node operations on one shard
#[async_trait]
pub trait ShardClient: Send + Sync {
    fn shard_id(&self) -> ShardId;

    /// Refuse further sequencer writes for epochs `<= seal.epoch`. Returns
    /// the seal in force; a higher existing seal is `Error::Sealed`.
    async fn seal(&self, log: LogId, seal: Seal) -> Result<Seal>;

    /// Everything the shard holds for `epoch` above its trim point
    async fn digest(&self, log: LogId, epoch: Epoch) -> Result<DigestReply>;

    async fn store(&self, log: LogId, lsn: Lsn, kind: RecordKind, origin: StoreOrigin)
    -> Result<()>;

    /// Advance the last released LSN
    async fn release(&self, log: LogId, lsn: Lsn) -> Result<()>;

    async fn set_last_clean_epoch(&self, log: LogId, epoch: Epoch) -> Result<()>;

    async fn trim(&self, log: LogId, lsn: Lsn) -> Result<()>;

    /// Released records in `[from, to]` above the trim point
    async fn read(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, RecordKind)>>;

    async fn log_state(&self, log: LogId) -> Result<ShardLogState>;
}

/// Shard served in-process from the node's stores
pub struct LocalShard {
    id: ShardId,
    store: Arc<ShardedLogStore>,
    states: Arc<LogStorageStateMap>,
    available: AtomicBool,
}

impl LocalShard {
    #[must_use]
    pub const fn new(id: ShardId, store: Arc<ShardedLogStore>, states: Arc<LogStorageStateMap>) -> Self {
        Self {
            id,
            store,
            states,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the node going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self, log: LogId) -> Result<Arc<LogStorageState>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable(format!("{} is unreachable", self.id)));
        }
        self.states.check(log, self.id)
    }

    fn persist(&self, log: LogId, value: &LogMetadata) -> Result<()> {
        self.store.get(self.id.shard)?.write_log_metadata(log, value)
    }
}

#[async_trait]
impl ShardClient for LocalShard {
    fn shard_id(&self) -> ShardId {
        self.id
    }

    async fn seal(&self, log: LogId, seal: Seal) -> Result<Seal> {
        let state = self.state(log)?;
        if let Some(existing) = state.seal()
            && existing.epoch > seal.epoch
        {
            return Err(Error::Sealed {
                epoch: existing.epoch,
                by: existing.sealed_by,
            });
        }
        let (in_force, changed) = state.update_seal(seal);
        if changed {
            self.persist(log, &LogMetadata::Seal(in_force))?;
            debug!("log {} sealed up to {} on {} by {}", log, in_force.epoch, self.id, in_force.sealed_by);
        }
        Ok(in_force)
    }

    async fn digest(&self, log: LogId, epoch: Epoch) -> Result<DigestReply> {
        let trim_point = self.state(log)?.trim_point();
        let mut records = self.store.get(self.id.shard)?.read_epoch(log, epoch)?;
        records.retain(|offset, _| Lsn::new(epoch, *offset) > trim_point);
        Ok(DigestReply {
            shard: self.id,
            trim_point,
            records,
        })
    }

    async fn store(
        &self,
        log: LogId,
        lsn: Lsn,
        kind: RecordKind,
        origin: StoreOrigin,
    ) -> Result<()> {
        let state = self.state(log)?;
        if let Some(seal) = state.seal() {
            let rejected = match origin {
                StoreOrigin::Sequencer => seal.epoch >= lsn.epoch,
                StoreOrigin::Recovery { sequencer_epoch } => seal.epoch >= sequencer_epoch,
            };
            if rejected {
                return Err(Error::Sealed {
                    epoch: seal.epoch,
                    by: seal.sealed_by,
                });
            }
        }
        trace!("log {} store {} on {} ({:?})", log, lsn, self.id, origin);
        self.store.get(self.id.shard)?.put_record(log, lsn, kind)
    }

    async fn release(&self, log: LogId, lsn: Lsn) -> Result<()> {
        let state = self.state(log)?;
        if state.update_last_released_lsn(lsn) {
            self.persist(log, &LogMetadata::LastReleased(state.last_released()))?;
        }
        Ok(())
    }

    async fn set_last_clean_epoch(&self, log: LogId, epoch: Epoch) -> Result<()> {
        let state = self.state(log)?;
        if state.update_last_clean_epoch(epoch) {
            self.persist(log, &LogMetadata::LastClean(state.last_clean_epoch()))?;
        }
        Ok(())
    }

    async fn trim(&self, log: LogId, lsn: Lsn) -> Result<()> {
        let state = self.state(log)?;
        if state.update_trim_point(lsn) {
            self.persist(log, &LogMetadata::TrimPoint(state.trim_point()))?;
        }
        Ok(())
    }

    async fn read(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, RecordKind)>> {
        let state = self.state(log)?;
        let trim = state.trim_point();
        let from = if from <= trim {
            Lsn::from_u64(trim.as_u64().saturating_add(1))
        } else {
            from
        };
        let to = to.min(state.last_released());
        self.store.get(self.id.shard)?.read_range(log, from, to)
    }

    async fn log_state(&self, log: LogId) -> Result<ShardLogState> {
        let state = self.state(log)?;
        Ok(ShardLogState {
            trim_point: state.trim_point(),
            last_clean_epoch: state.last_clean_epoch(),
            last_released: state.last_released(),
            seal: state.seal(),
        })
    }
}

/// Resolves shard ids to their clients
#[derive(Default)]
pub struct ShardDirectory {
    shards: DashMap<ShardId, Arc<dyn ShardClient>>,
}

impl ShardDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Arc<dyn ShardClient>) {
        self.shards.insert(client.shard_id(), client);
    }

    /// Client of `shard`; unknown shards are unreachable
    pub fn get(&self, shard: ShardId) -> Result<Arc<dyn ShardClient>> {
        self.shards
            .get(&shard)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::ServiceUnavailable(format!("no route to {shard}")))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use epochlog_common::{NodeIndex, Stats};

    fn shard() -> LocalShard {
        let stats = Arc::new(Stats::new());
        let node = NodeIndex::new(0);
        LocalShard::new(
            ShardId::new(node, 0),
            Arc::new(ShardedLogStore::in_memory(node, 1, Arc::clone(&stats))),
            Arc::new(LogStorageStateMap::new(stats)),
        )
    }

    fn lsn(e: u32, o: u32) -> Lsn {
        Lsn::new(Epoch::new(e), o)
    }

    fn data(s: &'static str) -> RecordKind {
        RecordKind::Data(Bytes::from_static(s.as_bytes()))
    }

    #[tokio::test]
    async fn test_seal_blocks_old_sequencer() {
        let shard = shard();
        let log = LogId::new(1);
        shard.store(log, lsn(3, 1), data("a"), StoreOrigin::Sequencer).await.unwrap();

        let seal = Seal {
            epoch: Epoch::new(3),
            sealed_by: NodeIndex::new(2),
        };
        shard.seal(log, seal).await.unwrap();
        assert!(matches!(
            shard.store(log, lsn(3, 2), data("b"), StoreOrigin::Sequencer).await,
            Err(Error::Sealed { epoch, by }) if epoch == Epoch::new(3) && by == NodeIndex::new(2)
        ));
        // The sealing sequencer may still plug holes and write its own epoch.
        shard
            .store(
                log,
                lsn(3, 2),
                RecordKind::Gap,
                StoreOrigin::Recovery {
                    sequencer_epoch: Epoch::new(4),
                },
            )
            .await
            .unwrap();
        shard.store(log, lsn(4, 1), data("c"), StoreOrigin::Sequencer).await.unwrap();

        let digest = shard.digest(log, Epoch::new(3)).await.unwrap();
        assert_eq!(digest.max_offset(), 2);
        assert!(digest.records[&2].is_gap());
    }

    #[tokio::test]
    async fn test_lower_seal_rejected() {
        let shard = shard();
        let log = LogId::new(1);
        let high = Seal {
            epoch: Epoch::new(5),
            sealed_by: NodeIndex::new(1),
        };
        shard.seal(log, high).await.unwrap();
        let low = Seal {
            epoch: Epoch::new(4),
            sealed_by: NodeIndex::new(2),
        };
        assert!(matches!(shard.seal(log, low).await, Err(Error::Sealed { .. })));
        assert_eq!(shard.seal(log, high).await.unwrap(), high);
    }

    #[tokio::test]
    async fn test_read_respects_release_and_trim() {
        let shard = shard();
        let log = LogId::new(1);
        for o in 1..=5 {
            shard.store(log, lsn(1, o), data("x"), StoreOrigin::Sequencer).await.unwrap();
        }
        assert!(shard.read(log, lsn(1, 1), Lsn::MAX).await.unwrap().is_empty());

        shard.release(log, lsn(1, 4)).await.unwrap();
        shard.release(log, lsn(1, 2)).await.unwrap();
        shard.trim(log, lsn(1, 1)).await.unwrap();
        let records = shard.read(log, lsn(1, 1), Lsn::MAX).await.unwrap();
        let offsets: Vec<u32> = records.iter().map(|(l, _)| l.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);

        let state = shard.log_state(log).await.unwrap();
        assert_eq!(state.last_released, lsn(1, 4));
    }

    #[tokio::test]
    async fn test_digest_leaves_out_trimmed_records() {
        let shard = shard();
        let log = LogId::new(1);
        for o in 1..=6 {
            shard.store(log, lsn(2, o), data("x"), StoreOrigin::Sequencer).await.unwrap();
        }
        shard.trim(log, lsn(2, 4)).await.unwrap();

        let digest = shard.digest(log, Epoch::new(2)).await.unwrap();
        assert_eq!(digest.trim_point, lsn(2, 4));
        assert_eq!(digest.records.keys().copied().collect::<Vec<_>>(), vec![5, 6]);

        shard.trim(log, lsn(3, 1)).await.unwrap();
        assert!(shard.digest(log, Epoch::new(2)).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_and_poisoned() {
        let shard = shard();
        shard.set_available(false);
        assert!(matches!(
            shard.digest(LogId::new(1), Epoch::MIN).await,
            Err(Error::ServiceUnavailable(_))
        ));
        shard.set_available(true);
        shard.states.note_permanent_error(LogId::new(1), shard.id, "test");
        assert!(matches!(
            shard.digest(LogId::new(1), Epoch::MIN).await,
            Err(Error::PermanentError { .. })
        ));
    }

    #[test]
    fn test_directory() {
        let directory = ShardDirectory::new();
        let local = Arc::new(shard());
        let id = local.shard_id();
        directory.insert(local);
        assert!(directory.get(id).is_ok());
        assert!(directory.get(ShardId::new(NodeIndex::new(9), 0)).is_err());
    }
}
