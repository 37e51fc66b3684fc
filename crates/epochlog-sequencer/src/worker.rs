//! Worker pool owning all sequencers of a node
//!
//! Each log is pinned to one worker by hashing its id. Callers and spawned
//! tasks talk to a log's sequencer only through that worker's queue, so
//! per-log state needs no locking and LSNs follow arrival order.

use crate::activation::Activation;
use crate::context::SequencerContext;
use crate::recovery::EpochRecoveryOutcome;
use crate::sequencer::{Sequencer, SequencerState, SequencerStatus};
use crate::write::StoreOutcome;
use bytes::Bytes;
use epochlog_common::{Error, LogId, Lsn, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

pub(crate) enum Message {
    Append {
        log: LogId,
        payload: Bytes,
        reply: oneshot::Sender<Result<Lsn>>,
    },
    Activate {
        log: LogId,
        reply: oneshot::Sender<Result<SequencerState>>,
    },
    Deactivate {
        log: LogId,
        reply: oneshot::Sender<Option<SequencerState>>,
    },
    GetState {
        log: LogId,
        reply: oneshot::Sender<Option<SequencerState>>,
    },
    ActivationDone {
        log: LogId,
        generation: u64,
        result: Result<Activation>,
    },
    RecoveryDone {
        log: LogId,
        generation: u64,
        result: Result<Vec<EpochRecoveryOutcome>>,
    },
    RecoveryDeadline {
        log: LogId,
        generation: u64,
    },
    AppendTimedOut {
        log: LogId,
        generation: u64,
        offset: u32,
    },
    AppendStored {
        log: LogId,
        generation: u64,
        offset: u32,
        outcome: StoreOutcome,
    },
}

/// What a sequencer needs to start work that reports back to its worker
pub(crate) struct Driver {
    pub ctx: Arc<SequencerContext>,
    pub tx: mpsc::Sender<Message>,
}

struct Worker {
    index: usize,
    driver: Driver,
    rx: mpsc::Receiver<Message>,
    sequencers: HashMap<LogId, Sequencer>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        debug!("sequencer worker {} started", self.index);
        loop {
            let message = tokio::select! {
                () = self.shutdown.cancelled() => break,
                message = self.rx.recv() => message,
            };
            match message {
                Some(message) => self.handle(message),
                None => break,
            }
        }
        for sequencer in self.sequencers.values_mut() {
            if !matches!(
                sequencer.status(),
                SequencerStatus::Inactive | SequencerStatus::Deactivated
            ) {
                sequencer.deactivate(&self.driver);
            }
        }
        debug!("sequencer worker {} stopped", self.index);
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Append {
                log,
                payload,
                reply,
            } => {
                if !self.sequencers.contains_key(&log) && !self.driver.ctx.sequencer.lazy_activation
                {
                    let _ = reply.send(Err(Error::NoSequencer(log)));
                    return;
                }
                let driver = &self.driver;
                let sequencer = self
                    .sequencers
                    .entry(log)
                    .or_insert_with(|| Sequencer::new(log));
                sequencer.append(driver, payload, reply);
            }
            Message::Activate { log, reply } => {
                let sequencer = self
                    .sequencers
                    .entry(log)
                    .or_insert_with(|| Sequencer::new(log));
                sequencer.activate(&self.driver, Some(reply));
            }
            Message::Deactivate { log, reply } => {
                let state = self
                    .sequencers
                    .get_mut(&log)
                    .map(|s| s.deactivate(&self.driver));
                let _ = reply.send(state);
            }
            Message::GetState { log, reply } => {
                let node = self.driver.ctx.node;
                let _ = reply.send(self.sequencers.get(&log).map(|s| s.state(node)));
            }
            Message::ActivationDone {
                log,
                generation,
                result,
            } => {
                if let Some(s) = self.sequencers.get_mut(&log) {
                    s.on_activation_done(&self.driver, generation, result);
                }
            }
            Message::RecoveryDone {
                log,
                generation,
                result,
            } => {
                if let Some(s) = self.sequencers.get_mut(&log) {
                    s.on_recovery_done(&self.driver, generation, result);
                }
            }
            Message::RecoveryDeadline { log, generation } => {
                if let Some(s) = self.sequencers.get_mut(&log) {
                    s.on_recovery_deadline(&self.driver, generation);
                }
            }
            Message::AppendTimedOut {
                log,
                generation,
                offset,
            } => {
                if let Some(s) = self.sequencers.get_mut(&log) {
                    s.on_append_timed_out(&self.driver, generation, offset);
                }
            }
            Message::AppendStored {
                log,
                generation,
                offset,
                outcome,
            } => {
                if let Some(s) = self.sequencers.get_mut(&log) {
                    s.on_append_stored(&self.driver, generation, offset, outcome);
                }
            }
        }
    }
}

/// Handle to the sequencer workers of one node
pub struct AllSequencers {
    ctx: Arc<SequencerContext>,
    workers: Vec<mpsc::Sender<Message>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl AllSequencers {
    /// Spawn `ctx.sequencer.workers` workers on the current runtime
    #[must_use]
    pub fn start(ctx: Arc<SequencerContext>) -> Self {
        let count = ctx.sequencer.workers.max(1);
        let queue = ctx.sequencer.worker_queue_size.max(1);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::channel(queue);
            let worker = Worker {
                index,
                driver: Driver {
                    ctx: Arc::clone(&ctx),
                    tx: tx.clone(),
                },
                rx,
                sequencers: HashMap::new(),
                shutdown: shutdown.clone(),
            };
            tracker.spawn(worker.run());
            workers.push(tx);
        }
        tracker.close();
        info!("Started {} sequencer workers on {}", count, ctx.node);
        Self {
            ctx,
            workers,
            shutdown,
            tracker,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<SequencerContext> {
        &self.ctx
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Index of the worker that owns `log`
    #[must_use]
    pub fn worker_of(&self, log: LogId) -> usize {
        let hash = xxh64(&log.get().to_le_bytes(), 0);
        (hash % self.workers.len() as u64) as usize
    }

    async fn request<T>(
        &self,
        log: LogId,
        message: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T> {
        if !log.is_valid() {
            return Err(Error::invalid_param(format!("invalid log id {log}")));
        }
        let (tx, rx) = oneshot::channel();
        self.workers[self.worker_of(log)]
            .send(message(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Append `payload` to `log`, returning its LSN once it is stored on a
    /// fully replicated set of shards
    pub async fn append(&self, log: LogId, payload: Bytes) -> Result<Lsn> {
        self.request(log, |reply| Message::Append {
            log,
            payload,
            reply,
        })
        .await?
    }

    /// Make this node the sequencer of `log`, claiming a new epoch unless a
    /// sequencer is already running here
    pub async fn activate(&self, log: LogId) -> Result<SequencerState> {
        self.request(log, |reply| Message::Activate { log, reply })
            .await?
    }

    pub async fn deactivate(&self, log: LogId) -> Result<Option<SequencerState>> {
        self.request(log, |reply| Message::Deactivate { log, reply })
            .await
    }

    pub async fn state(&self, log: LogId) -> Result<Option<SequencerState>> {
        self.request(log, |reply| Message::GetState { log, reply })
            .await
    }

    /// Stop every worker and fail whatever is still pending
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Sequencer workers on {} stopped", self.ctx.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::activate;
    use crate::sequencer::RecoveryStatus;
    use crate::test_util::TestCluster;
    use epochlog_common::{Counter, Epoch, NodeIndex, ShardId};
    use epochlog_storage::ShardClient;
    use std::time::Duration;

    async fn wait_for(sequencers: &AllSequencers, log: LogId, status: SequencerStatus) {
        for _ in 0..200 {
            if let Ok(Some(state)) = sequencers.state(log).await
                && state.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log {log} never reached {status}");
    }

    #[tokio::test]
    async fn test_lazy_activation_and_monotonic_lsns() {
        let cluster = TestCluster::new();
        let sequencers = AllSequencers::start(cluster.context(0));
        let log = LogId::new(11);

        let mut lsns = Vec::new();
        for i in 0..20u32 {
            let payload = Bytes::from(i.to_le_bytes().to_vec());
            lsns.push(sequencers.append(log, payload).await.unwrap());
        }
        let epoch = lsns[0].epoch;
        assert_eq!(epoch, Epoch::MIN);
        let offsets: Vec<u32> = lsns.iter().map(|l| l.offset).collect();
        assert_eq!(offsets, (1..=20).collect::<Vec<_>>());

        let state = sequencers.state(log).await.unwrap().unwrap();
        assert_eq!(state.status, SequencerStatus::Active);
        assert_eq!(state.next_lsn, Lsn::new(epoch, 21));
        sequencers.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_lsns() {
        let cluster = TestCluster::new();
        let sequencers = Arc::new(AllSequencers::start(cluster.context(0)));
        let log = LogId::new(12);
        sequencers.activate(log).await.unwrap();

        let appends = (0..32).map(|_| {
            let sequencers = Arc::clone(&sequencers);
            tokio::spawn(async move { sequencers.append(log, Bytes::from_static(b"r")).await })
        });
        let mut offsets: Vec<u32> = futures::future::join_all(appends)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().offset)
            .collect();
        offsets.sort_unstable();
        assert_eq!(offsets, (1..=32).collect::<Vec<_>>());

        // Every record is released once the prefix is stored.
        for _ in 0..100 {
            let state = sequencers.state(log).await.unwrap().unwrap();
            if state.last_released.offset == 32 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let state = sequencers.state(log).await.unwrap().unwrap();
        assert_eq!(state.last_released, Lsn::new(Epoch::MIN, 32));
        sequencers.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_sequencer_preempts_old() {
        let cluster = TestCluster::new();
        let first = AllSequencers::start(cluster.context(0));
        let second = AllSequencers::start(cluster.context(1));
        let log = LogId::new(13);

        let lsn = first.append(log, Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(lsn.epoch, Epoch::MIN);

        let state = second.activate(log).await.unwrap();
        assert_eq!(state.epoch, Epoch::new(2));
        wait_for(&second, log, SequencerStatus::Active).await;
        let state = second.state(log).await.unwrap().unwrap();
        assert_eq!(state.recovered_epochs, vec![Epoch::MIN]);

        match first.append(log, Bytes::from_static(b"b")).await {
            Err(Error::Preempted { by, epoch }) => {
                assert_eq!(by, NodeIndex::new(1));
                assert_eq!(epoch, Epoch::new(2));
            }
            other => panic!("expected preemption, got {other:?}"),
        }
        assert!(matches!(
            first.state(log).await.unwrap().unwrap().status,
            SequencerStatus::Preempted { .. }
        ));

        let lsn = second.append(log, Bytes::from_static(b"c")).await.unwrap();
        assert_eq!(lsn, Lsn::new(Epoch::new(2), 1));
        assert_eq!(cluster.stats.get(Counter::SequencerPreemptions), 1);

        // Epoch 1 is clean: its only record was confirmed and released.
        let shard = cluster.shard(0);
        let state = shard.log_state(log).await.unwrap();
        assert_eq!(state.last_clean_epoch, Epoch::MIN);
        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_deadline_defers_buffered_appends() {
        let cluster = TestCluster::new();
        let log = LogId::new(14);
        let first = AllSequencers::start(cluster.context(0));
        first.append(log, Bytes::from_static(b"a")).await.unwrap();
        first.shutdown().await;

        // Two of three shards down: epoch 1 cannot be sealed by an f-majority.
        cluster.shard(1).set_available(false);
        cluster.shard(2).set_available(false);
        let second = AllSequencers::start(cluster.context(1));
        let state = second.activate(log).await.unwrap();
        assert_eq!(state.status, SequencerStatus::Recovering);

        let result = second.append(log, Bytes::from_static(b"b")).await;
        assert!(matches!(result, Err(Error::Deferred(_))));
        assert!(matches!(
            second.append(log, Bytes::from_static(b"c")).await,
            Err(Error::Deferred(_))
        ));

        cluster.shard(1).set_available(true);
        cluster.shard(2).set_available(true);
        wait_for(&second, log, SequencerStatus::Active).await;
        let lsn = second.append(log, Bytes::from_static(b"d")).await.unwrap();
        assert_eq!(lsn, Lsn::new(Epoch::new(2), 1));
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_without_lazy_activation() {
        let cluster = TestCluster::new();
        let mut ctx = SequencerContext::clone(&cluster.context(0));
        ctx.sequencer.lazy_activation = false;
        let sequencers = AllSequencers::start(Arc::new(ctx));
        let log = LogId::new(15);
        assert!(matches!(
            sequencers.append(log, Bytes::from_static(b"a")).await,
            Err(Error::NoSequencer(_))
        ));
        sequencers.activate(log).await.unwrap();
        sequencers.append(log, Bytes::from_static(b"a")).await.unwrap();

        let state = sequencers.deactivate(log).await.unwrap().unwrap();
        assert_eq!(state.status, SequencerStatus::Deactivated);
        assert!(matches!(
            sequencers.append(log, Bytes::from_static(b"b")).await,
            Err(Error::NoSequencer(_))
        ));
        assert!(matches!(
            sequencers.append(LogId::INVALID, Bytes::new()).await,
            Err(Error::InvalidParam(_))
        ));
        sequencers.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_recovery_does_not_block_other_logs() {
        let cluster = TestCluster::new();
        let (stalled, healthy) = (LogId::new(16), LogId::new(17));
        // Node 0 leaves epoch 1 of `stalled` unclean; two of its three
        // shards can no longer serve that log, so it has no f-majority.
        activate(&cluster.context(0), stalled).await.unwrap();
        for node in [1u16, 2] {
            cluster.states[usize::from(node)].note_permanent_error(
                stalled,
                ShardId::new(NodeIndex::new(node), 0),
                "unreadable",
            );
        }

        let mut ctx = SequencerContext::clone(&cluster.context(1));
        ctx.sequencer.workers = 1;
        let sequencers = AllSequencers::start(Arc::new(ctx));
        assert_eq!(sequencers.worker_of(stalled), sequencers.worker_of(healthy));

        let state = sequencers.activate(stalled).await.unwrap();
        assert_eq!(state.status, SequencerStatus::Recovering);

        for i in 1..=10u32 {
            let lsn = sequencers
                .append(healthy, Bytes::from(i.to_le_bytes().to_vec()))
                .await
                .unwrap();
            assert_eq!(lsn, Lsn::new(Epoch::MIN, i));
        }

        for _ in 0..200 {
            if cluster.stats.get(Counter::RecoveryRoundsRetried) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cluster.stats.get(Counter::RecoveryRoundsRetried) >= 1);
        let state = sequencers.state(stalled).await.unwrap().unwrap();
        assert_eq!(state.status, SequencerStatus::Recovering);
        assert_eq!(state.recovery, RecoveryStatus::InProgress);
        sequencers.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_node_refuses_sequencers() {
        let cluster = TestCluster::new();
        let sequencers = AllSequencers::start(cluster.context(0));
        let log = LogId::new(18);
        cluster.control.set_sequencing_disabled(true);

        assert!(matches!(
            sequencers.activate(log).await,
            Err(Error::SequencingDisabled(node)) if node == NodeIndex::new(0)
        ));
        assert!(matches!(
            sequencers.append(log, Bytes::from_static(b"a")).await,
            Err(Error::SequencingDisabled(_))
        ));
        let state = sequencers.state(log).await.unwrap().unwrap();
        assert_eq!(state.status, SequencerStatus::Inactive);

        cluster.control.set_sequencing_disabled(false);
        let lsn = sequencers.append(log, Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(lsn, Lsn::new(Epoch::MIN, 1));
        sequencers.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_times_out_without_replicas() {
        let cluster = TestCluster::new();
        let mut ctx = SequencerContext::clone(&cluster.context(0));
        ctx.sequencer.append_timeout_ms = 100;
        let sequencers = AllSequencers::start(Arc::new(ctx));
        let log = LogId::new(19);
        sequencers.activate(log).await.unwrap();
        wait_for(&sequencers, log, SequencerStatus::Active).await;

        for node in 0..3 {
            cluster.shard(node).set_available(false);
        }
        let result = sequencers.append(log, Bytes::from_static(b"a")).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(cluster.stats.get(Counter::AppendsFailed), 1);

        // The record keeps being stored and is released once replicas return.
        for node in 0..3 {
            cluster.shard(node).set_available(true);
        }
        for _ in 0..200 {
            let state = sequencers.state(log).await.unwrap().unwrap();
            if state.last_released == Lsn::new(Epoch::MIN, 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let state = sequencers.state(log).await.unwrap().unwrap();
        assert_eq!(state.last_released, Lsn::new(Epoch::MIN, 1));
        let lsn = sequencers.append(log, Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(lsn, Lsn::new(Epoch::MIN, 2));
        sequencers.shutdown().await;
    }
}
