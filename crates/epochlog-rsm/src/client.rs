//! What a state machine needs from the log layer

use async_trait::async_trait;
use bytes::Bytes;
use epochlog_common::{Epoch, Error, LogId, Lsn, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// Append and read access to logs
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn append(&self, log: LogId, payload: Bytes) -> Result<Lsn>;

    /// Released data records with `from <= lsn <= to`, in LSN order
    async fn read(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, Bytes)>>;

    /// LSN of the last released record, `Lsn::INVALID` for an empty log
    async fn tail(&self, log: LogId) -> Result<Lsn>;
}

/// Single-process log client keeping every log in memory
#[derive(Debug, Default)]
pub struct MemoryLogClient {
    logs: Mutex<HashMap<LogId, BTreeMap<Lsn, Bytes>>>,
    unavailable: AtomicBool,
}

impl MemoryLogClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `ServiceUnavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable("log client is unavailable".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn record_count(&self, log: LogId) -> usize {
        self.logs.lock().get(&log).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    async fn append(&self, log: LogId, payload: Bytes) -> Result<Lsn> {
        self.check()?;
        let mut logs = self.logs.lock();
        let records = logs.entry(log).or_default();
        let offset = records.keys().next_back().map_or(Lsn::OFFSET_MIN, |l| l.offset + 1);
        let lsn = Lsn::new(Epoch::MIN, offset);
        records.insert(lsn, payload);
        Ok(lsn)
    }

    async fn read(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, Bytes)>> {
        self.check()?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .logs
            .lock()
            .get(&log)
            .map(|records| {
                records
                    .range(from..=to)
                    .map(|(lsn, payload)| (*lsn, payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tail(&self, log: LogId) -> Result<Lsn> {
        self.check()?;
        Ok(self
            .logs
            .lock()
            .get(&log)
            .and_then(|records| records.keys().next_back().copied())
            .unwrap_or(Lsn::INVALID))
    }
}
