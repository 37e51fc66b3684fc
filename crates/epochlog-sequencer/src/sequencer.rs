//! Per-log sequencer state machine
//!
//! ```text
//! INACTIVE -> ACTIVATING -> RECOVERING -> ACTIVE
//!                 |              |           |
//!                 +--------------+-----------+--> PREEMPTED | DEACTIVATED
//! ```
//!
//! A [`Sequencer`] is owned by exactly one worker and is only touched from
//! that worker's loop. Everything slow (claiming an epoch, recovery, storing
//! records) runs in spawned tasks that report back through the worker's
//! queue tagged with the generation they were started in; reports from an
//! older generation are dropped.

use crate::activation::{Activation, activate};
use crate::recovery::{EpochRecoveryOutcome, recover_log};
use crate::worker::{Driver, Message};
use crate::write::{StoreOutcome, broadcast_release, store_record};
use bytes::Bytes;
use epochlog_common::{Counter, Epoch, Error, LogId, Lsn, NodeIndex, Result, ShardId};
use epochlog_epoch_store::{EpochMetaData, LogMetaData};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SequencerStatus {
    Inactive,
    Activating,
    Recovering,
    Active,
    /// A sequencer on `by` runs a higher epoch
    Preempted { by: NodeIndex, epoch: Epoch },
    Deactivated,
}

impl fmt::Display for SequencerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Activating => write!(f, "ACTIVATING"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Preempted { by, epoch } => write!(f, "PREEMPTED by {by} in {epoch}"),
            Self::Deactivated => write!(f, "DEACTIVATED"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    NotStarted,
    InProgress,
    Complete,
}

/// Snapshot of one sequencer, as reported to admin callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequencerState {
    pub log: LogId,
    pub node: NodeIndex,
    pub status: SequencerStatus,
    pub epoch: Epoch,
    /// LSN the next append will get
    pub next_lsn: Lsn,
    pub last_released: Lsn,
    pub recovery: RecoveryStatus,
    pub recovered_epochs: Vec<Epoch>,
    pub replica_set: Vec<ShardId>,
    pub buffered: usize,
    pub in_flight: usize,
}

struct PendingAppend {
    payload: Bytes,
    reply: oneshot::Sender<Result<Lsn>>,
}

struct InFlight {
    reply: Option<oneshot::Sender<Result<Lsn>>>,
    stored: bool,
}

/// Error handed to each waiter when a shared failure ends their wait
fn error_for_waiter(e: &Error) -> Error {
    match e {
        Error::Preempted { by, epoch } => Error::Preempted {
            by: *by,
            epoch: *epoch,
        },
        Error::NotFound(log) => Error::NotFound(*log),
        Error::Disabled(log) => Error::Disabled(*log),
        Error::SequencingDisabled(node) => Error::SequencingDisabled(*node),
        Error::TooManyEpochs(log) => Error::TooManyEpochs(*log),
        Error::Deferred(reason) => Error::Deferred(reason.clone()),
        Error::Shutdown => Error::Shutdown,
        other => Error::Failed(other.to_string()),
    }
}

pub(crate) struct Sequencer {
    log: LogId,
    status: SequencerStatus,
    generation: u64,
    metadata: Option<Arc<EpochMetaData>>,
    next_offset: u32,
    last_released: Lsn,
    recovery: RecoveryStatus,
    recovery_overdue: bool,
    recovered: Vec<EpochRecoveryOutcome>,
    buffered: VecDeque<PendingAppend>,
    in_flight: BTreeMap<u32, InFlight>,
    activation_waiters: Vec<oneshot::Sender<Result<SequencerState>>>,
    cancel: CancellationToken,
}

impl Sequencer {
    pub(crate) fn new(log: LogId) -> Self {
        Self {
            log,
            status: SequencerStatus::Inactive,
            generation: 0,
            metadata: None,
            next_offset: Lsn::OFFSET_MIN,
            last_released: Lsn::INVALID,
            recovery: RecoveryStatus::NotStarted,
            recovery_overdue: false,
            recovered: Vec::new(),
            buffered: VecDeque::new(),
            in_flight: BTreeMap::new(),
            activation_waiters: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) const fn status(&self) -> SequencerStatus {
        self.status
    }

    fn epoch(&self) -> Epoch {
        self.metadata.as_ref().map_or(Epoch::INVALID, |m| m.epoch)
    }

    pub(crate) fn state(&self, node: NodeIndex) -> SequencerState {
        SequencerState {
            log: self.log,
            node,
            status: self.status,
            epoch: self.epoch(),
            next_lsn: Lsn::new(self.epoch(), self.next_offset),
            last_released: self.last_released,
            recovery: self.recovery,
            recovered_epochs: self.recovered.iter().map(|o| o.epoch).collect(),
            replica_set: self
                .metadata
                .as_ref()
                .map(|m| m.replica_set.clone())
                .unwrap_or_default(),
            buffered: self.buffered.len(),
            in_flight: self.in_flight.len(),
        }
    }

    /// Start claiming a new epoch unless one is being claimed or used
    pub(crate) fn activate(
        &mut self,
        driver: &Driver,
        waiter: Option<oneshot::Sender<Result<SequencerState>>>,
    ) {
        match self.status {
            SequencerStatus::Activating => {
                self.activation_waiters.extend(waiter);
            }
            SequencerStatus::Recovering | SequencerStatus::Active => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(self.state(driver.ctx.node)));
                }
            }
            SequencerStatus::Inactive
            | SequencerStatus::Preempted { .. }
            | SequencerStatus::Deactivated => {
                if driver.ctx.control.sequencing_disabled() {
                    info!("log {}: not activating, sequencing is disabled here", self.log);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(Error::SequencingDisabled(driver.ctx.node)));
                    }
                    return;
                }
                self.activation_waiters.extend(waiter);
                self.start_activation(driver);
            }
        }
    }

    fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        self.metadata = None;
        self.next_offset = Lsn::OFFSET_MIN;
        self.recovery = RecoveryStatus::NotStarted;
        self.recovery_overdue = false;
        self.recovered.clear();
        self.in_flight.clear();
    }

    fn start_activation(&mut self, driver: &Driver) {
        self.reset();
        self.status = SequencerStatus::Activating;
        debug!("log {}: activating sequencer (generation {})", self.log, self.generation);

        let ctx = Arc::clone(&driver.ctx);
        let tx = driver.tx.clone();
        let cancel = self.cancel.clone();
        let (log, generation) = (self.log, self.generation);
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = activate(&ctx, log) => result,
            };
            let _ = tx
                .send(Message::ActivationDone {
                    log,
                    generation,
                    result,
                })
                .await;
        });
    }

    pub(crate) fn on_activation_done(
        &mut self,
        driver: &Driver,
        generation: u64,
        result: Result<Activation>,
    ) {
        if generation != self.generation || self.status != SequencerStatus::Activating {
            return;
        }
        let Activation { metadata, record } = match result {
            Ok(activation) => activation,
            Err(Error::Preempted { by, epoch }) => {
                self.preempt(driver, by, epoch);
                return;
            }
            Err(e) => {
                warn!("log {}: sequencer activation failed: {}", self.log, e);
                self.status = SequencerStatus::Inactive;
                self.fail_all(&e);
                return;
            }
        };

        let epoch = metadata.epoch;
        self.metadata = Some(Arc::new(metadata));
        self.last_released = self.last_released.max(record.tail);
        let unclean = record.unclean_epochs();
        if unclean.is_empty() {
            self.recovery = RecoveryStatus::Complete;
            self.become_active(driver);
        } else {
            info!(
                "log {}: epoch {} must recover {} earlier epochs starting at {}",
                self.log,
                epoch,
                unclean.len(),
                unclean[0].epoch
            );
            self.status = SequencerStatus::Recovering;
            self.recovery = RecoveryStatus::InProgress;
            self.start_recovery(driver, epoch, record);
        }
        self.reply_waiters(driver);
    }

    fn start_recovery(&self, driver: &Driver, epoch: Epoch, record: LogMetaData) {
        let (log, generation) = (self.log, self.generation);

        let ctx = Arc::clone(&driver.ctx);
        let tx = driver.tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let result = recover_log(ctx, log, epoch, record, cancel.clone()).await;
            if !cancel.is_cancelled() {
                let _ = tx
                    .send(Message::RecoveryDone {
                        log,
                        generation,
                        result,
                    })
                    .await;
            }
        });

        let wait = driver.ctx.sequencer.max_recovery_wait();
        let tx = driver.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(wait) => {
                    let _ = tx.send(Message::RecoveryDeadline { log, generation }).await;
                }
            }
        });
    }

    pub(crate) fn on_recovery_done(
        &mut self,
        driver: &Driver,
        generation: u64,
        result: Result<Vec<EpochRecoveryOutcome>>,
    ) {
        if generation != self.generation || self.status != SequencerStatus::Recovering {
            return;
        }
        match result {
            Ok(outcomes) => {
                if let Some(last) = outcomes.last() {
                    self.last_released = self.last_released.max(last.last_released);
                }
                self.recovered = outcomes;
                self.recovery = RecoveryStatus::Complete;
                self.become_active(driver);
            }
            Err(Error::Preempted { by, epoch }) => self.preempt(driver, by, epoch),
            Err(e) => {
                warn!("log {}: recovery ended without completing: {}", self.log, e);
                self.status = SequencerStatus::Inactive;
                self.cancel.cancel();
                self.fail_all(&e);
            }
        }
    }

    pub(crate) fn on_recovery_deadline(&mut self, driver: &Driver, generation: u64) {
        if generation != self.generation || self.status != SequencerStatus::Recovering {
            return;
        }
        self.recovery_overdue = true;
        let deferred = self.buffered.len();
        warn!(
            "log {}: recovery still running after {:?}, deferring {} appends",
            self.log,
            driver.ctx.sequencer.max_recovery_wait(),
            deferred
        );
        for pending in self.buffered.drain(..) {
            let _ = pending
                .reply
                .send(Err(Error::Deferred("log is recovering".to_string())));
        }
        driver
            .ctx
            .stats
            .add(Counter::AppendsDeferred, deferred as u64);
    }

    fn become_active(&mut self, driver: &Driver) {
        self.status = SequencerStatus::Active;
        info!(
            "log {}: sequencer active in epoch {}, {} buffered appends",
            self.log,
            self.epoch(),
            self.buffered.len()
        );
        while let Some(pending) = self.buffered.pop_front() {
            self.issue(driver, pending.payload, pending.reply);
        }
    }

    fn reply_waiters(&mut self, driver: &Driver) {
        let state = self.state(driver.ctx.node);
        for waiter in self.activation_waiters.drain(..) {
            let _ = waiter.send(Ok(state.clone()));
        }
    }

    pub(crate) fn append(
        &mut self,
        driver: &Driver,
        payload: Bytes,
        reply: oneshot::Sender<Result<Lsn>>,
    ) {
        match self.status {
            SequencerStatus::Active => self.issue(driver, payload, reply),
            SequencerStatus::Preempted { by, epoch } => {
                let _ = reply.send(Err(Error::Preempted { by, epoch }));
            }
            SequencerStatus::Inactive | SequencerStatus::Deactivated => {
                if driver.ctx.control.sequencing_disabled() {
                    let _ = reply.send(Err(Error::SequencingDisabled(driver.ctx.node)));
                } else if driver.ctx.sequencer.lazy_activation {
                    self.start_activation(driver);
                    self.buffer(driver, payload, reply);
                } else {
                    let _ = reply.send(Err(Error::NoSequencer(self.log)));
                }
            }
            SequencerStatus::Recovering if self.recovery_overdue => {
                driver.ctx.stats.bump(Counter::AppendsDeferred);
                let _ = reply.send(Err(Error::Deferred("log is recovering".to_string())));
            }
            SequencerStatus::Activating | SequencerStatus::Recovering => {
                self.buffer(driver, payload, reply);
            }
        }
    }

    fn buffer(&mut self, driver: &Driver, payload: Bytes, reply: oneshot::Sender<Result<Lsn>>) {
        if self.buffered.len() >= driver.ctx.sequencer.max_buffered_appends {
            driver.ctx.stats.bump(Counter::AppendsDeferred);
            let _ = reply.send(Err(Error::Deferred(format!(
                "{} appends already waiting for the sequencer",
                self.buffered.len()
            ))));
            return;
        }
        self.buffered.push_back(PendingAppend { payload, reply });
    }

    fn issue(&mut self, driver: &Driver, payload: Bytes, reply: oneshot::Sender<Result<Lsn>>) {
        let Some(metadata) = self.metadata.clone() else {
            let _ = reply.send(Err(Error::NoSequencer(self.log)));
            return;
        };
        if self.next_offset == u32::MAX {
            driver.ctx.stats.bump(Counter::AppendsFailed);
            let _ = reply.send(Err(Error::Failed(format!(
                "log {}: offsets of epoch {} exhausted",
                self.log, metadata.epoch
            ))));
            return;
        }
        let offset = self.next_offset;
        self.next_offset += 1;
        let lsn = Lsn::new(metadata.epoch, offset);
        self.in_flight.insert(
            offset,
            InFlight {
                reply: Some(reply),
                stored: false,
            },
        );
        driver.ctx.stats.bump(Counter::AppendsAccepted);

        let ctx = Arc::clone(&driver.ctx);
        let tx = driver.tx.clone();
        let cancel = self.cancel.clone();
        let reply_timeout = driver.ctx.sequencer.append_timeout();
        let (log, generation) = (self.log, self.generation);
        tokio::spawn(async move {
            let mut store = std::pin::pin!(store_record(ctx, log, lsn, payload, metadata, cancel));
            let outcome = match tokio::time::timeout(reply_timeout, store.as_mut()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = tx
                        .send(Message::AppendTimedOut {
                            log,
                            generation,
                            offset,
                        })
                        .await;
                    store.await
                }
            };
            let Some(outcome) = outcome else {
                return;
            };
            let _ = tx
                .send(Message::AppendStored {
                    log,
                    generation,
                    offset,
                    outcome,
                })
                .await;
        });
    }

    /// The append at `offset` is still being stored: answer its caller now.
    /// The record keeps its LSN and is released once stored.
    pub(crate) fn on_append_timed_out(&mut self, driver: &Driver, generation: u64, offset: u32) {
        if generation != self.generation {
            return;
        }
        let Some(reply) = self.in_flight.get_mut(&offset).and_then(|f| f.reply.take()) else {
            return;
        };
        driver.ctx.stats.bump(Counter::AppendsFailed);
        warn!(
            "log {}: append at offset {} not stored after {:?}",
            self.log,
            offset,
            driver.ctx.sequencer.append_timeout()
        );
        let _ = reply.send(Err(Error::Timeout));
    }

    pub(crate) fn on_append_stored(
        &mut self,
        driver: &Driver,
        generation: u64,
        offset: u32,
        outcome: StoreOutcome,
    ) {
        if generation != self.generation || self.status != SequencerStatus::Active {
            return;
        }
        let epoch = self.epoch();
        match outcome {
            StoreOutcome::Stored => {
                if let Some(entry) = self.in_flight.get_mut(&offset) {
                    entry.stored = true;
                    if let Some(reply) = entry.reply.take() {
                        let _ = reply.send(Ok(Lsn::new(epoch, offset)));
                    }
                }
                self.advance_release(driver);
            }
            StoreOutcome::Preempted { by, epoch } => self.preempt(driver, by, epoch),
        }
    }

    /// Release the longest fully stored prefix of in-flight appends
    fn advance_release(&mut self, driver: &Driver) {
        let mut released = None;
        while let Some(entry) = self.in_flight.first_entry() {
            if !entry.get().stored {
                break;
            }
            released = Some(*entry.key());
            entry.remove();
        }
        let (Some(offset), Some(metadata)) = (released, self.metadata.clone()) else {
            return;
        };
        let lsn = Lsn::new(metadata.epoch, offset);
        if lsn <= self.last_released {
            return;
        }
        self.last_released = lsn;
        tokio::spawn(broadcast_release(
            Arc::clone(&driver.ctx),
            self.log,
            lsn,
            metadata,
        ));
    }

    fn preempt(&mut self, driver: &Driver, by: NodeIndex, epoch: Epoch) {
        warn!(
            "log {}: sequencer in epoch {} preempted by {} in epoch {}",
            self.log,
            self.epoch(),
            by,
            epoch
        );
        driver.ctx.stats.bump(Counter::SequencerPreemptions);
        self.cancel.cancel();
        self.status = SequencerStatus::Preempted { by, epoch };
        self.fail_all(&Error::Preempted { by, epoch });
    }

    pub(crate) fn deactivate(&mut self, driver: &Driver) -> SequencerState {
        self.cancel.cancel();
        self.status = SequencerStatus::Deactivated;
        self.fail_all(&Error::Failed(format!("sequencer for log {} deactivated", self.log)));
        info!("log {}: sequencer deactivated in epoch {}", self.log, self.epoch());
        self.state(driver.ctx.node)
    }

    fn fail_all(&mut self, e: &Error) {
        for pending in self.buffered.drain(..) {
            let _ = pending.reply.send(Err(error_for_waiter(e)));
        }
        for (_, entry) in std::mem::take(&mut self.in_flight) {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(error_for_waiter(e)));
            }
        }
        for waiter in self.activation_waiters.drain(..) {
            let _ = waiter.send(Err(error_for_waiter(e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiter_errors_keep_redirect() {
        let by = NodeIndex::new(3);
        let e = error_for_waiter(&Error::Preempted {
            by,
            epoch: Epoch::new(9),
        });
        assert!(matches!(e, Error::Preempted { by: b, .. } if b == by));
        assert!(matches!(
            error_for_waiter(&Error::Timeout),
            Error::Failed(_)
        ));
        assert!(error_for_waiter(&Error::Deferred("x".into())).is_retryable());
    }

    #[test]
    fn test_fresh_sequencer_state() {
        let seq = Sequencer::new(LogId::new(4));
        let state = seq.state(NodeIndex::new(1));
        assert_eq!(state.status, SequencerStatus::Inactive);
        assert_eq!(state.next_lsn, Lsn::new(Epoch::INVALID, 1));
        assert!(state.replica_set.is_empty());
        assert_eq!(SequencerStatus::Active.to_string(), "ACTIVE");
    }
}
