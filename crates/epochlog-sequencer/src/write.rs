//! Sequencer write path

use crate::context::SequencerContext;
use bytes::Bytes;
use epochlog_common::{
    Epoch, Error, ExponentialBackoff, FailureDomainChecker, LogId, Lsn, NodeIndex, Result,
    ShardId,
};
use epochlog_epoch_store::EpochMetaData;
use epochlog_storage::{RecordKind, StoreOrigin};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One pass over the replica set: store on shards picked round-robin from
/// the record's offset, pulling in further shards of the set for every
/// failure, until the copies satisfy the replication property.
async fn store_once(
    ctx: &SequencerContext,
    log: LogId,
    lsn: Lsn,
    payload: &Bytes,
    metadata: &EpochMetaData,
) -> Result<()> {
    let set = &metadata.replica_set;
    if set.is_empty() {
        return Err(Error::Failed(format!("log {log}: empty replica set in {}", lsn.epoch)));
    }
    let checker = FailureDomainChecker::new(&ctx.nodes, &metadata.replication);
    let factor = usize::from(metadata.replication.replication_factor());
    let start = lsn.offset as usize % set.len();
    let mut candidates = set.iter().cycle().skip(start).take(set.len()).copied();
    let timeout = ctx.sequencer.store_timeout();

    let mut stored: Vec<ShardId> = Vec::with_capacity(factor);
    while !checker.can_replicate(&stored) {
        let wanted = factor.saturating_sub(stored.len()).max(1);
        let wave: Vec<ShardId> = candidates.by_ref().take(wanted).collect();
        if wave.is_empty() {
            return Err(Error::QuorumUnavailable {
                responded: stored.len(),
                total: set.len(),
            });
        }
        let writes = wave.iter().map(|shard| async move {
            let client = ctx.shards.get(*shard)?;
            let kind = RecordKind::Data(payload.clone());
            tokio::time::timeout(timeout, client.store(log, lsn, kind, StoreOrigin::Sequencer))
                .await
                .unwrap_or(Err(Error::Timeout))
        });
        for (shard, result) in wave.iter().zip(join_all(writes).await) {
            match result {
                Ok(()) => stored.push(*shard),
                Err(Error::Sealed { epoch, by }) => {
                    return Err(Error::Preempted {
                        by,
                        epoch: epoch.next().unwrap_or(Epoch::MAX),
                    });
                }
                Err(e) => debug!("log {}: store of {} on {} failed: {}", log, lsn, shard, e),
            }
        }
    }
    Ok(())
}

/// How storing one record ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreOutcome {
    Stored,
    /// A shard was sealed by the sequencer of a newer epoch
    Preempted { by: NodeIndex, epoch: Epoch },
}

/// Store `payload` at `lsn`, retrying with backoff until it is fully
/// replicated or the epoch is sealed by a newer sequencer. `None` once
/// `cancel` fires.
pub(crate) async fn store_record(
    ctx: Arc<SequencerContext>,
    log: LogId,
    lsn: Lsn,
    payload: Bytes,
    metadata: Arc<EpochMetaData>,
    cancel: CancellationToken,
) -> Option<StoreOutcome> {
    let mut backoff = ExponentialBackoff::new(ctx.recovery.backoff.clone());
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return None,
            result = store_once(&ctx, log, lsn, &payload, &metadata) => result,
        };
        match result {
            Ok(()) => return Some(StoreOutcome::Stored),
            Err(Error::Preempted { by, epoch }) => {
                return Some(StoreOutcome::Preempted { by, epoch });
            }
            Err(e) => {
                warn!("log {}: storing {} failed, retrying: {}", log, lsn, e);
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = backoff.wait() => {}
                }
            }
        }
    }
}

/// Tell every shard of the replica set that records up to `lsn` are
/// released. Failures are only logged.
pub(crate) async fn broadcast_release(
    ctx: Arc<SequencerContext>,
    log: LogId,
    lsn: Lsn,
    metadata: Arc<EpochMetaData>,
) {
    let timeout = ctx.sequencer.store_timeout();
    let releases = metadata.replica_set.iter().map(|shard| {
        let ctx = &ctx;
        async move {
            let client = ctx.shards.get(*shard)?;
            tokio::time::timeout(timeout, client.release(log, lsn))
                .await
                .unwrap_or(Err(Error::Timeout))
        }
    });
    for (shard, result) in metadata.replica_set.iter().zip(join_all(releases).await) {
        if let Err(e) = result {
            debug!("log {}: release of {} on {} failed: {}", log, lsn, shard, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestCluster;
    use epochlog_common::{NodeIndex, ReplicationProperty};
    use epochlog_storage::{Seal, ShardClient};

    fn metadata(epoch: u32) -> Arc<EpochMetaData> {
        Arc::new(EpochMetaData {
            epoch: Epoch::new(epoch),
            replica_set: (0..3).map(|n| ShardId::new(NodeIndex::new(n), 0)).collect(),
            replication: ReplicationProperty::nodes(2),
            nodes_config_version: 1,
            written_by: Some(NodeIndex::new(0)),
            disabled: false,
        })
    }

    #[tokio::test]
    async fn test_store_falls_back_to_other_shards() {
        let cluster = TestCluster::new();
        let ctx = cluster.context(0);
        let log = LogId::new(1);
        cluster.shard(1).set_available(false);

        for offset in 1..=3 {
            let lsn = Lsn::new(Epoch::new(1), offset);
            let outcome = store_record(
                Arc::clone(&ctx),
                log,
                lsn,
                Bytes::from_static(b"x"),
                metadata(1),
                CancellationToken::new(),
            )
            .await;
            assert_eq!(outcome, Some(StoreOutcome::Stored));
            for node in [0, 2] {
                let digest = cluster.shard(node).digest(log, Epoch::new(1)).await.unwrap();
                assert!(digest.records.contains_key(&offset));
            }
        }
    }

    #[tokio::test]
    async fn test_sealed_store_preempts() {
        let cluster = TestCluster::new();
        let ctx = cluster.context(0);
        let log = LogId::new(1);
        for node in 0..3 {
            cluster
                .shard(node)
                .seal(
                    log,
                    Seal {
                        epoch: Epoch::new(1),
                        sealed_by: NodeIndex::new(2),
                    },
                )
                .await
                .unwrap();
        }
        let outcome = store_record(
            ctx,
            log,
            Lsn::new(Epoch::new(1), 1),
            Bytes::from_static(b"x"),
            metadata(1),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(
            outcome,
            Some(StoreOutcome::Preempted {
                by: NodeIndex::new(2),
                epoch: Epoch::new(2),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_store_gives_up() {
        let cluster = TestCluster::new();
        let ctx = cluster.context(0);
        for node in 0..3 {
            cluster.shard(node).set_available(false);
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(store_record(
            ctx,
            LogId::new(1),
            Lsn::new(Epoch::new(1), 1),
            Bytes::from_static(b"x"),
            metadata(1),
            cancel.clone(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), None);
    }
}
