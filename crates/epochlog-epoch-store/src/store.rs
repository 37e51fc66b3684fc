//! Epoch store client
//!
//! Every mutation is a versioned read-modify-write against the backend:
//! read the record, check the caller's expectation, run the updater, write
//! conditionally on the version that was read. Losing the race on the
//! version alone is retried here; a failed expectation is the caller's
//! problem and comes back as `Conflict` straight away.

use crate::backend::{EpochStoreBackend, VersionedValue};
use crate::metadata::{EpochMetaData, LogMetaData};
use crate::updater::{MetaDataUpdater, UpdateOutcome};
use epochlog_common::config::EpochStoreConfig;
use epochlog_common::{Counter, Epoch, Error, LogId, Lsn, Result, Stats};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller believes the current state is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedPrior {
    /// The log has no metadata yet
    Absent,
    /// The current epoch is exactly this one
    Epoch(Epoch),
    /// No expectation
    Any,
}

impl ExpectedPrior {
    fn matches(self, current: Option<&LogMetaData>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::Absent, None) => true,
            (Self::Epoch(e), Some(meta)) => meta.current.epoch == e,
            _ => false,
        }
    }
}

/// Linearizable access to per-log epoch metadata
#[derive(Clone)]
pub struct EpochStore {
    backend: Arc<dyn EpochStoreBackend>,
    stats: Arc<Stats>,
    max_cas_retries: u32,
    op_timeout: Duration,
}

impl EpochStore {
    pub fn new(
        backend: Arc<dyn EpochStoreBackend>,
        config: &EpochStoreConfig,
        stats: Arc<Stats>,
    ) -> Self {
        info!("Epoch store using backend {}", backend.identify());
        Self {
            backend,
            stats,
            max_cas_retries: config.max_cas_retries,
            op_timeout: config.op_timeout(),
        }
    }

    #[must_use]
    pub fn identify(&self) -> String {
        self.backend.identify()
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }

    fn check_log(log: LogId) -> Result<()> {
        if log.is_valid() {
            Ok(())
        } else {
            Err(Error::invalid_param(format!("invalid log id {log}")))
        }
    }

    async fn read_record(&self, log: LogId) -> Result<Option<LogMetaData>> {
        self.stats.bump(Counter::EpochStoreReads);
        let raw = self.with_timeout(self.backend.read(log)).await?;
        raw.map(|VersionedValue { version, value }| {
            let mut meta = LogMetaData::decode(&value)?;
            if meta.version != version {
                warn!(
                    "log {}: record carries version {} but backend reports {}",
                    log, meta.version, version
                );
                meta.version = version;
            }
            Ok(meta)
        })
        .transpose()
    }

    async fn write_record(
        &self,
        log: LogId,
        expected_version: Option<u64>,
        mut meta: LogMetaData,
    ) -> Result<LogMetaData> {
        meta.version = expected_version.map_or(1, |v| v + 1);
        let bytes = meta.encode()?;
        let version = self
            .with_timeout(self.backend.conditional_write(log, expected_version, bytes))
            .await?;
        meta.version = version;
        self.stats.bump(Counter::EpochStoreWrites);
        Ok(meta)
    }

    /// Current metadata of `log`, including its last clean epoch
    pub async fn read_metadata(&self, log: LogId) -> Result<LogMetaData> {
        Self::check_log(log)?;
        self.read_record(log).await?.ok_or(Error::NotFound(log))
    }

    /// Apply `updater` to the metadata of `log` if the current state matches
    /// `expected`. Returns the resulting current epoch metadata.
    pub async fn create_or_update_metadata(
        &self,
        log: LogId,
        updater: &dyn MetaDataUpdater,
        expected: ExpectedPrior,
    ) -> Result<EpochMetaData> {
        Self::check_log(log)?;
        for attempt in 0..=self.max_cas_retries {
            let current = self.read_record(log).await?;
            if !expected.matches(current.as_ref()) {
                self.stats.bump(Counter::EpochStoreConflicts);
                return Err(Error::conflict(format!(
                    "log {log}: expected {expected:?}, found epoch {:?}",
                    current.as_ref().map(|m| m.current.epoch)
                )));
            }

            let next = match updater.update(log, current.as_ref())? {
                UpdateOutcome::UpToDate => {
                    return current.map(|m| m.current).ok_or(Error::NotFound(log));
                }
                UpdateOutcome::Write(next) => next,
            };
            let floor = current.as_ref().map_or(Epoch::INVALID, |m| m.current.epoch);
            if next.epoch <= floor {
                return Err(Error::internal(format!(
                    "log {log}: updater produced epoch {} not above {floor}",
                    next.epoch
                )));
            }

            let expected_version = current.as_ref().map(|m| m.version);
            let record = match &current {
                Some(meta) => meta.advanced(next),
                None => LogMetaData::provisioned(next),
            };
            match self.write_record(log, expected_version, record).await {
                Ok(written) => {
                    debug!(
                        "log {}: epoch {} written at version {}",
                        log, written.current.epoch, written.version
                    );
                    return Ok(written.current);
                }
                Err(Error::Conflict(reason)) => {
                    self.stats.bump(Counter::EpochStoreConflicts);
                    debug!("log {}: CAS race on attempt {}: {}", log, attempt, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "log {log}: gave up after {} CAS retries",
            self.max_cas_retries
        )))
    }

    /// Last clean epoch of `log` and the tail recorded with it
    pub async fn get_last_clean_epoch(&self, log: LogId) -> Result<(Epoch, Lsn)> {
        let meta = self.read_metadata(log).await?;
        Ok((meta.last_clean_epoch, meta.tail))
    }

    /// Advance the last clean epoch to `lce` if it currently is
    /// `expected_prior`. Returns `Stale` when the stored value is already at
    /// or beyond `lce`.
    pub async fn set_last_clean_epoch(
        &self,
        log: LogId,
        expected_prior: Epoch,
        lce: Epoch,
        tail: Lsn,
    ) -> Result<()> {
        Self::check_log(log)?;
        for attempt in 0..=self.max_cas_retries {
            let current = self.read_record(log).await?.ok_or(Error::NotFound(log))?;
            if lce <= current.last_clean_epoch {
                return Err(Error::Stale {
                    current: current.last_clean_epoch,
                });
            }
            if current.last_clean_epoch != expected_prior {
                self.stats.bump(Counter::EpochStoreConflicts);
                return Err(Error::conflict(format!(
                    "log {log}: expected last clean epoch {expected_prior}, found {}",
                    current.last_clean_epoch
                )));
            }
            if lce >= current.current.epoch {
                return Err(Error::invalid_param(format!(
                    "log {log}: last clean epoch {lce} must be below current epoch {}",
                    current.current.epoch
                )));
            }

            let record = current.cleaned(lce, tail);
            match self.write_record(log, Some(current.version), record).await {
                Ok(_) => {
                    info!("log {}: last clean epoch {} (tail {})", log, lce, tail);
                    return Ok(());
                }
                Err(Error::Conflict(reason)) => {
                    self.stats.bump(Counter::EpochStoreConflicts);
                    debug!("log {}: LCE CAS race on attempt {}: {}", log, attempt, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "log {log}: gave up setting last clean epoch after {} retries",
            self.max_cas_retries
        )))
    }
}
