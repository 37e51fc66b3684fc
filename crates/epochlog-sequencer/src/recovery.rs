//! Epoch recovery
//!
//! A new sequencer must make every epoch its predecessors left unclean
//! consistent before its own records are released. For one epoch `E` that
//! means, round after round until it works or the sequencer gives up:
//!
//! 1. seal `E` on its replica set and wait for an f-majority of seals;
//!    shards being rebuilt are sealed but do not count toward it;
//! 2. collect digests of `E` from the sealed shards;
//! 3. decide every offset between the trim point and the upper bound: any
//!    copy on a digested shard confirms it, no copy (or a gap marker
//!    anywhere) makes it a gap;
//! 4. plug gaps plus a bridge gap one past the upper bound, which must reach
//!    a set of shards satisfying the replication property;
//! 5. copy under-replicated confirmed records in the background;
//! 6. advance the last clean epoch in the epoch store, then release the
//!    epoch on the participating shards.
//!
//! Seals carry the epoch just below the recovering sequencer's own, so the
//! sealing sequencer keeps writing its epoch while every older one is
//! fenced off.

use crate::context::SequencerContext;
use bytes::Bytes;
use epochlog_common::{
    Counter, Epoch, Error, ExponentialBackoff, FailureDomainChecker, LogId, Lsn, Result, ShardId,
};
use epochlog_epoch_store::{EpochMetaData, LogMetaData};
use epochlog_storage::{DigestReply, RecordKind, Seal, ShardClient, StoreOrigin};
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What recovery did to one epoch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochRecoveryOutcome {
    pub epoch: Epoch,
    pub confirmed: usize,
    pub gaps: usize,
    /// Offsets at or below this one were trimmed and left alone
    pub trimmed: u32,
    /// Copies scheduled for under-replicated confirmed records
    pub replicated: usize,
    /// End-of-epoch marker written one past the upper bound
    pub bridge: Lsn,
    /// Highest confirmed LSN of the epoch, or the previous tail if the
    /// epoch turned out empty
    pub last_released: Lsn,
    /// Tail recorded in the epoch store with the new last clean epoch
    pub tail: Lsn,
}

/// Offsets of one epoch after comparing digests
#[derive(Debug, Default)]
pub(crate) struct Reconciliation {
    pub upper: u32,
    pub trimmed: u32,
    pub confirmed: BTreeMap<u32, Confirmed>,
    pub gaps: Vec<u32>,
}

#[derive(Debug)]
pub(crate) struct Confirmed {
    pub payload: Bytes,
    pub holders: Vec<ShardId>,
}

impl Reconciliation {
    /// Highest offset readers may see: the last confirmed record, or the
    /// trim point if nothing above it survived
    fn highest_confirmed(&self) -> u32 {
        self.confirmed
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.trimmed)
    }
}

/// Offset of `epoch` at or below which a shard with `trim_point` has
/// dropped records
fn trimmed_offset(trim_point: Lsn, epoch: Epoch, held: u32) -> u32 {
    match trim_point.epoch.cmp(&epoch) {
        Ordering::Less => 0,
        Ordering::Equal => trim_point.offset,
        Ordering::Greater => held,
    }
}

/// Decide every offset above the trim point and up to the upper bound from
/// the digests of `epoch`
pub(crate) fn reconcile(digests: &[DigestReply], epoch: Epoch) -> Reconciliation {
    let held = digests
        .iter()
        .map(DigestReply::max_offset)
        .max()
        .unwrap_or(0);
    let trimmed = digests
        .iter()
        .map(|d| trimmed_offset(d.trim_point, epoch, held))
        .max()
        .unwrap_or(0);

    let mut plan = Reconciliation {
        upper: held.max(trimmed),
        trimmed,
        ..Reconciliation::default()
    };
    for offset in trimmed.saturating_add(1)..=plan.upper {
        let mut payload = None;
        let mut holders = Vec::new();
        let mut gap_seen = false;
        for digest in digests {
            match digest.records.get(&offset) {
                Some(RecordKind::Data(bytes)) => {
                    payload.get_or_insert_with(|| bytes.clone());
                    holders.push(digest.shard);
                }
                Some(RecordKind::Gap) => gap_seen = true,
                None => {}
            }
        }
        match payload {
            Some(payload) if !gap_seen => {
                plan.confirmed.insert(offset, Confirmed { payload, holders });
            }
            _ => plan.gaps.push(offset),
        }
    }
    plan
}

/// Recovery of one unclean epoch on behalf of the sequencer of
/// `sequencer_epoch`
pub struct EpochRecovery {
    ctx: Arc<SequencerContext>,
    log: LogId,
    sequencer_epoch: Epoch,
    metadata: EpochMetaData,
    prior_lce: Epoch,
    prior_tail: Lsn,
}

impl EpochRecovery {
    /// `prior_lce` and `prior_tail` are the last clean epoch and tail the
    /// epoch store is expected to hold when this epoch finishes.
    #[must_use]
    pub const fn new(
        ctx: Arc<SequencerContext>,
        log: LogId,
        sequencer_epoch: Epoch,
        metadata: EpochMetaData,
        prior_lce: Epoch,
        prior_tail: Lsn,
    ) -> Self {
        Self {
            ctx,
            log,
            sequencer_epoch,
            metadata,
            prior_lce,
            prior_tail,
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.metadata.epoch
    }

    fn seal(&self) -> Seal {
        Seal {
            epoch: Epoch::new(self.sequencer_epoch.get().saturating_sub(1)),
            sealed_by: self.ctx.node,
        }
    }

    fn origin(&self) -> StoreOrigin {
        StoreOrigin::Recovery {
            sequencer_epoch: self.sequencer_epoch,
        }
    }

    /// Run rounds until the epoch is clean, the sequencer is preempted or
    /// `cancel` fires
    pub async fn run(&self, cancel: &CancellationToken) -> Result<EpochRecoveryOutcome> {
        let stats = &self.ctx.stats;
        stats.bump(Counter::RecoveriesStarted);
        info!(
            "log {}: recovering epoch {} for sequencer epoch {}",
            self.log,
            self.epoch(),
            self.sequencer_epoch
        );
        let mut backoff = ExponentialBackoff::new(self.ctx.recovery.backoff.clone());
        loop {
            let round = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Shutdown),
                round = self.round() => round,
            };
            match round {
                Ok(outcome) => {
                    stats.bump(Counter::RecoveriesCompleted);
                    info!(
                        "log {}: epoch {} clean: {} confirmed, {} gaps, {} copies scheduled, released {}",
                        self.log,
                        outcome.epoch,
                        outcome.confirmed,
                        outcome.gaps,
                        outcome.replicated,
                        outcome.last_released
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_preempted() => {
                    warn!("log {}: recovery of epoch {} preempted: {}", self.log, self.epoch(), e);
                    return Err(e);
                }
                Err(e) => {
                    stats.bump(Counter::RecoveryRoundsRetried);
                    warn!(
                        "log {}: recovery round {} of epoch {} failed: {}",
                        self.log,
                        backoff.attempts() + 1,
                        self.epoch(),
                        e
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Shutdown),
                        () = backoff.wait() => {}
                    }
                }
            }
        }
    }

    async fn round(&self) -> Result<EpochRecoveryOutcome> {
        let checker = FailureDomainChecker::new(&self.ctx.nodes, &self.metadata.replication);
        let sealed = self.seal_phase(&checker).await?;
        let digests = self.digest_phase(&checker, &sealed).await?;

        let plan = reconcile(&digests, self.epoch());
        debug!(
            "log {}: epoch {} trimmed to {}, upper bound {}, {} confirmed, {} gaps",
            self.log,
            self.epoch(),
            plan.trimmed,
            plan.upper,
            plan.confirmed.len(),
            plan.gaps.len()
        );

        let bridge = plan.upper.saturating_add(1);
        let mut to_plug = plan.gaps.clone();
        to_plug.push(bridge);
        self.plug_gaps(&checker, &sealed, &digests, &to_plug).await?;
        self.ctx.stats.add(Counter::GapsPlugged, plan.gaps.len() as u64);

        let replicated = self.schedule_replication(&checker, &sealed, &plan);
        let tail = self.finalize(&sealed, &plan).await?;
        Ok(EpochRecoveryOutcome {
            epoch: self.epoch(),
            confirmed: plan.confirmed.len(),
            gaps: plan.gaps.len(),
            trimmed: plan.trimmed,
            replicated,
            bridge: Lsn::new(self.epoch(), bridge),
            last_released: tail,
            tail,
        })
    }

    /// Send one request to every shard in `shards`, each bounded by the
    /// round timeout
    async fn broadcast<'a, T, F, Fut>(
        &self,
        shards: &'a [Arc<dyn ShardClient>],
        request: F,
    ) -> Vec<(ShardId, Result<T>)>
    where
        F: Fn(&'a Arc<dyn ShardClient>) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let timeout = self.ctx.recovery.round_timeout();
        let requests = shards.iter().map(|client| {
            let fut = request(client);
            async move {
                let result = tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or(Err(Error::Timeout));
                (client.shard_id(), result)
            }
        });
        join_all(requests).await
    }

    /// Answers from shards being rebuilt do not count
    fn quorum(
        &self,
        checker: &FailureDomainChecker<'_>,
        responded: &HashSet<ShardId>,
    ) -> Result<()> {
        let control = &self.ctx.control;
        let authoritative: HashSet<ShardId> = responded
            .iter()
            .filter(|shard| !control.is_rebuilding(**shard))
            .copied()
            .collect();
        if checker.is_f_majority(&self.metadata.replica_set, &authoritative) {
            Ok(())
        } else {
            Err(Error::QuorumUnavailable {
                responded: responded.len(),
                total: self.metadata.replica_set.len(),
            })
        }
    }

    async fn seal_phase(
        &self,
        checker: &FailureDomainChecker<'_>,
    ) -> Result<Vec<Arc<dyn ShardClient>>> {
        let clients: Vec<Arc<dyn ShardClient>> = self
            .metadata
            .replica_set
            .iter()
            .filter_map(|shard| match self.ctx.shards.get(*shard) {
                Ok(client) => Some(client),
                Err(e) => {
                    debug!("log {}: skipping {} this round: {}", self.log, shard, e);
                    None
                }
            })
            .collect();

        let seal = self.seal();
        let replies = self
            .broadcast(&clients, |client| client.seal(self.log, seal))
            .await;

        let mut responded = HashSet::new();
        for (shard, reply) in replies {
            match reply {
                Ok(_) => {
                    responded.insert(shard);
                }
                Err(Error::Sealed { epoch, by }) => {
                    return Err(Error::Preempted {
                        by,
                        epoch: epoch.next().unwrap_or(Epoch::MAX),
                    });
                }
                Err(e) => debug!("log {}: seal on {} failed: {}", self.log, shard, e),
            }
        }
        self.quorum(checker, &responded)?;
        Ok(clients
            .into_iter()
            .filter(|c| responded.contains(&c.shard_id()))
            .collect())
    }

    async fn digest_phase(
        &self,
        checker: &FailureDomainChecker<'_>,
        sealed: &[Arc<dyn ShardClient>],
    ) -> Result<Vec<DigestReply>> {
        let epoch = self.epoch();
        let replies = self
            .broadcast(sealed, |client| client.digest(self.log, epoch))
            .await;

        let mut digests = Vec::with_capacity(replies.len());
        for (shard, reply) in replies {
            match reply {
                Ok(digest) => digests.push(digest),
                Err(e) => debug!("log {}: digest of {} on {} failed: {}", self.log, epoch, shard, e),
            }
        }
        let responded = digests.iter().map(|d| d.shard).collect();
        self.quorum(checker, &responded)?;
        Ok(digests)
    }

    async fn plug_gaps(
        &self,
        checker: &FailureDomainChecker<'_>,
        sealed: &[Arc<dyn ShardClient>],
        digests: &[DigestReply],
        offsets: &[u32],
    ) -> Result<()> {
        let digested: HashSet<ShardId> = digests.iter().map(|d| d.shard).collect();
        let targets: Vec<&Arc<dyn ShardClient>> = sealed
            .iter()
            .filter(|c| digested.contains(&c.shard_id()))
            .collect();
        let origin = self.origin();
        let epoch = self.epoch();

        for &offset in offsets {
            let mut holders: HashSet<ShardId> = digests
                .iter()
                .filter(|d| d.records.get(&offset).is_some_and(RecordKind::is_gap))
                .map(|d| d.shard)
                .collect();
            let writes = targets
                .iter()
                .filter(|c| !holders.contains(&c.shard_id()))
                .map(|client| async move {
                    let lsn = Lsn::new(epoch, offset);
                    (
                        client.shard_id(),
                        client.store(self.log, lsn, RecordKind::Gap, origin).await,
                    )
                });
            for (shard, result) in join_all(writes).await {
                match result {
                    Ok(()) => {
                        holders.insert(shard);
                    }
                    Err(Error::Sealed { epoch, by }) => {
                        return Err(Error::Preempted {
                            by,
                            epoch: epoch.next().unwrap_or(Epoch::MAX),
                        });
                    }
                    Err(e) => debug!("log {}: gap at {} on {} failed: {}", self.log, offset, shard, e),
                }
            }
            if !checker.can_replicate(&holders) {
                return Err(Error::QuorumUnavailable {
                    responded: holders.len(),
                    total: self.metadata.replica_set.len(),
                });
            }
        }
        Ok(())
    }

    /// Copy confirmed records that lack a fully replicated set of holders to
    /// sealed shards missing them. Returns the number of copies scheduled.
    fn schedule_replication(
        &self,
        checker: &FailureDomainChecker<'_>,
        sealed: &[Arc<dyn ShardClient>],
        plan: &Reconciliation,
    ) -> usize {
        let mut jobs: Vec<(Lsn, Bytes, Vec<Arc<dyn ShardClient>>)> = Vec::new();
        for (offset, confirmed) in &plan.confirmed {
            if checker.can_replicate(&confirmed.holders) {
                continue;
            }
            let mut holders = confirmed.holders.clone();
            let mut targets = Vec::new();
            for client in sealed {
                if holders.contains(&client.shard_id()) {
                    continue;
                }
                holders.push(client.shard_id());
                targets.push(Arc::clone(client));
                if checker.can_replicate(&holders) {
                    break;
                }
            }
            if !targets.is_empty() {
                jobs.push((
                    Lsn::new(self.epoch(), *offset),
                    confirmed.payload.clone(),
                    targets,
                ));
            }
        }

        let scheduled = jobs.iter().map(|(_, _, targets)| targets.len()).sum();
        if jobs.is_empty() {
            return scheduled;
        }
        let log = self.log;
        let origin = self.origin();
        let stats = Arc::clone(&self.ctx.stats);
        tokio::spawn(async move {
            for (lsn, payload, targets) in jobs {
                for client in targets {
                    match client
                        .store(log, lsn, RecordKind::Data(payload.clone()), origin)
                        .await
                    {
                        Ok(()) => stats.bump(Counter::RecordsReplicated),
                        Err(e) => warn!(
                            "log {}: copying {} to {} failed: {}",
                            log,
                            lsn,
                            client.shard_id(),
                            e
                        ),
                    }
                }
            }
        });
        scheduled
    }

    async fn finalize(
        &self,
        sealed: &[Arc<dyn ShardClient>],
        plan: &Reconciliation,
    ) -> Result<Lsn> {
        let epoch = self.epoch();
        let highest = plan.highest_confirmed();
        let released = Lsn::new(epoch, highest);
        let tail = if highest > 0 { released } else { self.prior_tail };

        let store = &self.ctx.epoch_store;
        let mut expected = self.prior_lce;
        loop {
            match store.set_last_clean_epoch(self.log, expected, epoch, tail).await {
                Ok(()) => break,
                Err(Error::Stale { current }) => {
                    debug!("log {}: last clean epoch already {}", self.log, current);
                    break;
                }
                Err(Error::Conflict(reason)) => {
                    let (current, _) = store.get_last_clean_epoch(self.log).await?;
                    if current >= epoch {
                        break;
                    }
                    if current == expected {
                        return Err(Error::conflict(reason));
                    }
                    debug!(
                        "log {}: last clean epoch moved from {} to {}",
                        self.log, expected, current
                    );
                    expected = current;
                }
                Err(e) => return Err(e),
            }
        }

        for client in sealed {
            if highest > 0
                && let Err(e) = client.release(self.log, released).await
            {
                warn!("log {}: release of {} on {} failed: {}", self.log, released, client.shard_id(), e);
            }
            if let Err(e) = client.set_last_clean_epoch(self.log, epoch).await {
                warn!(
                    "log {}: setting last clean epoch {} on {} failed: {}",
                    self.log,
                    epoch,
                    client.shard_id(),
                    e
                );
            }
        }
        Ok(tail)
    }
}

/// Recover every unclean epoch of `record`, oldest first, on behalf of
/// the sequencer of `sequencer_epoch`
pub async fn recover_log(
    ctx: Arc<SequencerContext>,
    log: LogId,
    sequencer_epoch: Epoch,
    record: LogMetaData,
    cancel: CancellationToken,
) -> Result<Vec<EpochRecoveryOutcome>> {
    let mut lce = record.last_clean_epoch;
    let mut tail = record.tail;
    let mut outcomes = Vec::new();
    for metadata in record.unclean_epochs() {
        let recovery =
            EpochRecovery::new(Arc::clone(&ctx), log, sequencer_epoch, metadata, lce, tail);
        let outcome = recovery.run(&cancel).await?;
        lce = outcome.epoch;
        tail = outcome.tail;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
