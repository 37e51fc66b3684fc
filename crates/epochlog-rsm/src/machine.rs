//! Generic replicated state machine
//!
//! State = latest snapshot + every delta after it, applied in LSN order.
//! The version is the LSN of the last delta consumed. A delta that does not
//! decode or does not apply is skipped but still moves the version, so all
//! nodes reading the same log agree on both state and version.

use crate::client::LogClient;
use bytes::Bytes;
use epochlog_common::{Counter, Error, LogId, Lsn, Result, Stats};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SNAPSHOT_FORMAT: u8 = 1;
const WRITE_SYNC_ATTEMPTS: u32 = 50;
const WRITE_SYNC_DELAY: Duration = Duration::from_millis(10);

/// A state folded from a log of deltas
pub trait StateMachine: Send + Sync + 'static {
    type Delta: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static;
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    const NAME: &'static str;

    fn delta_log() -> LogId;

    fn snapshot_log() -> LogId;

    /// Apply `delta` to `state`. Must leave `state` untouched on error.
    fn apply(state: &mut Self::State, delta: &Self::Delta) -> Result<()>;
}

/// Successful outcomes of a snapshot request, with the version the
/// latest snapshot covers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SnapshotStatus {
    /// A new snapshot was written
    #[serde(rename = "OK")]
    Ok { version: Lsn },
    /// The latest snapshot already covers the current version
    #[serde(rename = "UPTODATE")]
    UpToDate { version: Lsn },
}

impl SnapshotStatus {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok { .. } => "OK",
            Self::UpToDate { .. } => "UPTODATE",
        }
    }

    #[must_use]
    pub const fn version(self) -> Lsn {
        match self {
            Self::Ok { version } | Self::UpToDate { version } => version,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord<S> {
    format: u8,
    version: u64,
    state: S,
}

/// Point-in-time copy of a state machine
#[derive(Clone, Debug, Serialize)]
pub struct RsmView<S> {
    pub state: S,
    pub version: Lsn,
    pub snapshot_version: Option<Lsn>,
    pub loaded: bool,
}

pub struct ReplicatedStateMachine<M: StateMachine> {
    client: Arc<dyn LogClient>,
    snapshotting: bool,
    stats: Arc<Stats>,
    state: M::State,
    version: Lsn,
    snapshot_version: Option<Lsn>,
    loaded: bool,
}

impl<M: StateMachine> ReplicatedStateMachine<M> {
    pub fn new(client: Arc<dyn LogClient>, snapshotting: bool, stats: Arc<Stats>) -> Self {
        Self {
            client,
            snapshotting,
            stats,
            state: M::State::default(),
            version: Lsn::INVALID,
            snapshot_version: None,
            loaded: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &M::State {
        &self.state
    }

    #[must_use]
    pub const fn version(&self) -> Lsn {
        self.version
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn view(&self) -> RsmView<M::State> {
        RsmView {
            state: self.state.clone(),
            version: self.version,
            snapshot_version: self.snapshot_version,
            loaded: self.loaded,
        }
    }

    /// Start from the latest readable snapshot and replay the deltas after it
    pub async fn load(&mut self) -> Result<()> {
        let tail = self.client.tail(M::snapshot_log()).await?;
        if tail.is_valid() {
            let records = self
                .client
                .read(M::snapshot_log(), Lsn::INVALID, tail)
                .await?;
            let latest = records.iter().rev().find_map(|(lsn, payload)| {
                match bincode::deserialize::<SnapshotRecord<M::State>>(payload) {
                    Ok(snapshot) if snapshot.format == SNAPSHOT_FORMAT => Some(snapshot),
                    Ok(snapshot) => {
                        warn!("{}: snapshot at {} has unknown format {}", M::NAME, lsn, snapshot.format);
                        None
                    }
                    Err(e) => {
                        warn!("{}: skipping undecodable snapshot at {}: {}", M::NAME, lsn, e);
                        None
                    }
                }
            });
            if let Some(snapshot) = latest {
                self.version = Lsn::from_u64(snapshot.version);
                self.snapshot_version = Some(self.version);
                self.state = snapshot.state;
                info!("{}: loaded snapshot at version {}", M::NAME, self.version);
            }
        }

        let replayed = self.catch_up(None).await?.1;
        self.loaded = true;
        info!(
            "{}: replayed {} deltas, now at version {}",
            M::NAME,
            replayed,
            self.version
        );
        Ok(())
    }

    fn apply_record(&mut self, lsn: Lsn, payload: &[u8]) -> Result<()> {
        self.version = lsn;
        let result = bincode::deserialize::<M::Delta>(payload)
            .map_err(|e| Error::malformed(format!("{} delta at {lsn}: {e}", M::NAME)))
            .and_then(|delta| {
                debug!("{}: applying {:?} at {}", M::NAME, delta, lsn);
                M::apply(&mut self.state, &delta)
            });
        match &result {
            Ok(()) => self.stats.bump(Counter::DeltasApplied),
            Err(e) => {
                self.stats.bump(Counter::DeltasRejected);
                warn!("{}: delta at {} rejected: {}", M::NAME, lsn, e);
            }
        }
        result
    }

    /// Apply every released delta after the current version. Returns the
    /// outcome of applying `watch` if it was among them, and the number of
    /// deltas consumed.
    async fn catch_up(&mut self, watch: Option<Lsn>) -> Result<(Option<Result<()>>, usize)> {
        let tail = self.client.tail(M::delta_log()).await?;
        if tail <= self.version {
            return Ok((None, 0));
        }
        let from = Lsn::from_u64(self.version.as_u64() + 1);
        let records = self.client.read(M::delta_log(), from, tail).await?;
        let count = records.len();
        let mut watched = None;
        for (lsn, payload) in records {
            let result = self.apply_record(lsn, &payload);
            if Some(lsn) == watch {
                watched = Some(result);
            }
        }
        Ok((watched, count))
    }

    /// Catch up with the delta log; returns the new version
    pub async fn sync(&mut self) -> Result<Lsn> {
        if !self.loaded {
            self.load().await?;
        } else {
            self.catch_up(None).await?;
        }
        Ok(self.version)
    }

    /// Append `delta` and wait until it has been applied locally. Returns its
    /// LSN, or the error that made it be skipped.
    pub async fn write_delta(&mut self, delta: &M::Delta) -> Result<Lsn> {
        if !self.loaded {
            return Err(Error::NodeNotReady);
        }
        let payload = bincode::serialize(delta).map_err(|e| Error::Serialization(e.to_string()))?;
        let lsn = self.client.append(M::delta_log(), Bytes::from(payload)).await?;
        for _ in 0..WRITE_SYNC_ATTEMPTS {
            if let (Some(result), _) = self.catch_up(Some(lsn)).await? {
                return result.map(|()| lsn);
            }
            tokio::time::sleep(WRITE_SYNC_DELAY).await;
        }
        Err(Error::Timeout)
    }

    /// Write a snapshot of the current state unless one already covers it
    pub async fn take_snapshot(&mut self, min_version: u64) -> Result<SnapshotStatus> {
        if !self.snapshotting {
            return Err(Error::NotSupported(format!("{} snapshotting is disabled", M::NAME)));
        }
        if !self.loaded {
            return Err(Error::NodeNotReady);
        }
        let version = self.version.as_u64();
        if min_version > 0 && version < min_version {
            return Err(Error::StaleVersion {
                server_version: version,
                requested: min_version,
            });
        }
        if self.snapshot_version.is_some_and(|v| v >= self.version) {
            info!("{}: snapshot at version {} already exists", M::NAME, self.version);
            return Ok(SnapshotStatus::UpToDate {
                version: self.version,
            });
        }

        let record = SnapshotRecord {
            format: SNAPSHOT_FORMAT,
            version,
            state: self.state.clone(),
        };
        let payload = bincode::serialize(&record).map_err(|e| Error::Serialization(e.to_string()))?;
        let lsn = self
            .client
            .append(M::snapshot_log(), Bytes::from(payload))
            .await?;
        self.snapshot_version = Some(self.version);
        self.stats.bump(Counter::SnapshotsTaken);
        info!("{}: snapshot of version {} written at {}", M::NAME, self.version, lsn);
        Ok(SnapshotStatus::Ok {
            version: self.version,
        })
    }

    /// Move the state machine onto its own task
    pub fn spawn(
        self,
        sync_interval: Duration,
        queue_size: usize,
        shutdown: CancellationToken,
    ) -> (RsmHandle<M>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let task = tokio::spawn(self.run(rx, sync_interval, shutdown));
        (RsmHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command<M>>,
        sync_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync().await {
                        warn!("{}: sync failed: {}", M::NAME, e);
                    }
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        info!("{}: state machine stopped at version {}", M::NAME, self.version);
    }

    async fn handle(&mut self, command: Command<M>) {
        match command {
            Command::WriteDelta { delta, reply } => {
                let _ = reply.send(self.write_delta(&delta).await);
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
            Command::TakeSnapshot { min_version, reply } => {
                let _ = reply.send(self.take_snapshot(min_version).await);
            }
            Command::Sync { reply } => {
                let _ = reply.send(self.sync().await);
            }
        }
    }
}

enum Command<M: StateMachine> {
    WriteDelta {
        delta: M::Delta,
        reply: oneshot::Sender<Result<Lsn>>,
    },
    View {
        reply: oneshot::Sender<RsmView<M::State>>,
    },
    TakeSnapshot {
        min_version: u64,
        reply: oneshot::Sender<Result<SnapshotStatus>>,
    },
    Sync {
        reply: oneshot::Sender<Result<Lsn>>,
    },
}

/// Sends commands to a state machine running on its own task
pub struct RsmHandle<M: StateMachine> {
    tx: mpsc::Sender<Command<M>>,
}

impl<M: StateMachine> Clone for RsmHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: StateMachine> RsmHandle<M> {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command<M>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn write_delta(&self, delta: M::Delta) -> Result<Lsn> {
        self.request(|reply| Command::WriteDelta { delta, reply }).await?
    }

    pub async fn view(&self) -> Result<RsmView<M::State>> {
        self.request(|reply| Command::View { reply }).await
    }

    pub async fn take_snapshot(&self, min_version: u64) -> Result<SnapshotStatus> {
        self.request(|reply| Command::TakeSnapshot { min_version, reply })
            .await?
    }

    pub async fn sync(&self) -> Result<Lsn> {
        self.request(|reply| Command::Sync { reply }).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryLogClient;

    /// Running total that refuses to go negative
    struct Total;

    impl StateMachine for Total {
        type Delta = i64;
        type State = i64;

        const NAME: &'static str = "total";

        fn delta_log() -> LogId {
            LogId::new(901)
        }

        fn snapshot_log() -> LogId {
            LogId::new(902)
        }

        fn apply(state: &mut i64, delta: &i64) -> Result<()> {
            let next = *state + delta;
            if next < 0 {
                return Err(Error::invalid_param(format!("total would be {next}")));
            }
            *state = next;
            Ok(())
        }
    }

    fn rsm(client: &Arc<MemoryLogClient>, snapshotting: bool) -> ReplicatedStateMachine<Total> {
        ReplicatedStateMachine::new(
            Arc::clone(client) as Arc<dyn LogClient>,
            snapshotting,
            Arc::new(Stats::new()),
        )
    }

    #[tokio::test]
    async fn test_rejected_delta_still_advances_version() {
        let client = Arc::new(MemoryLogClient::new());
        let mut machine = rsm(&client, true);
        assert!(matches!(machine.write_delta(&1).await, Err(Error::NodeNotReady)));
        machine.load().await.unwrap();

        machine.write_delta(&5).await.unwrap();
        let rejected = machine.write_delta(&-10).await;
        assert!(matches!(rejected, Err(Error::InvalidParam(_))));
        let lsn = machine.write_delta(&2).await.unwrap();
        assert_eq!(*machine.state(), 7);
        assert_eq!(machine.version(), lsn);
        assert_eq!(machine.stats.get(Counter::DeltasRejected), 1);

        // A second replica replays to the same state and version.
        let mut replica = rsm(&client, true);
        replica.load().await.unwrap();
        assert_eq!(*replica.state(), 7);
        assert_eq!(replica.version(), lsn);
    }

    #[tokio::test]
    async fn test_snapshot_statuses() {
        let client = Arc::new(MemoryLogClient::new());
        let mut machine = rsm(&client, true);
        assert!(matches!(machine.take_snapshot(0).await, Err(Error::NodeNotReady)));
        machine.load().await.unwrap();
        let first = machine.write_delta(&3).await.unwrap();

        assert_eq!(
            machine.take_snapshot(0).await.unwrap(),
            SnapshotStatus::Ok { version: first }
        );
        assert_eq!(
            machine.take_snapshot(0).await.unwrap(),
            SnapshotStatus::UpToDate { version: first }
        );

        let ahead = machine.version().as_u64() + 1;
        assert!(matches!(
            machine.take_snapshot(ahead).await,
            Err(Error::StaleVersion { requested, .. }) if requested == ahead
        ));

        let second = machine.write_delta(&4).await.unwrap();
        let status = machine.take_snapshot(0).await.unwrap();
        assert_eq!(status, SnapshotStatus::Ok { version: second });
        assert_eq!(status.version(), machine.version());
        assert_eq!(client.record_count(Total::snapshot_log()), 2);

        let mut disabled = rsm(&client, false);
        disabled.load().await.unwrap();
        assert!(matches!(disabled.take_snapshot(0).await, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_load_starts_from_latest_snapshot() {
        let client = Arc::new(MemoryLogClient::new());
        let mut machine = rsm(&client, true);
        machine.load().await.unwrap();
        machine.write_delta(&10).await.unwrap();
        machine.take_snapshot(0).await.unwrap();
        machine.write_delta(&1).await.unwrap();

        client
            .append(Total::snapshot_log(), Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let mut replica = rsm(&client, true);
        replica.load().await.unwrap();
        assert_eq!(*replica.state(), 11);
        assert_eq!(replica.version(), machine.version());
        assert!(replica.view().snapshot_version.is_some());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let client = Arc::new(MemoryLogClient::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = rsm(&client, true).spawn(Duration::from_millis(20), 16, shutdown.clone());

        handle.sync().await.unwrap();
        let lsn = handle.write_delta(4).await.unwrap();
        let view = handle.view().await.unwrap();
        assert!(view.loaded);
        assert_eq!(view.state, 4);
        assert_eq!(
            handle.take_snapshot(0).await.unwrap(),
            SnapshotStatus::Ok { version: lsn }
        );
        let again = handle.take_snapshot(0).await.unwrap();
        assert_eq!(again.name(), "UPTODATE");
        assert_eq!(again.version(), lsn);

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(handle.view().await, Err(Error::Shutdown)));
    }
}
