//! In-process epoch store backend

use crate::backend::{EpochStoreBackend, VersionedValue};
use async_trait::async_trait;
use epochlog_common::{Error, LogId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-durable backend shared by every sequencer of a single process
#[derive(Debug, Default)]
pub struct MemoryEpochStoreBackend {
    records: Mutex<HashMap<LogId, VersionedValue>>,
    unavailable: AtomicBool,
}

impl MemoryEpochStoreBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `ServiceUnavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite the raw bytes of a record, bumping its version
    pub fn put_raw(&self, log: LogId, value: Vec<u8>) {
        let mut records = self.records.lock();
        let version = records.get(&log).map_or(1, |v| v.version + 1);
        records.insert(log, VersionedValue { version, value });
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable("epoch store is unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EpochStoreBackend for MemoryEpochStoreBackend {
    async fn read(&self, log: LogId) -> Result<Option<VersionedValue>> {
        self.check_available()?;
        Ok(self.records.lock().get(&log).cloned())
    }

    async fn conditional_write(
        &self,
        log: LogId,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64> {
        self.check_available()?;
        let mut records = self.records.lock();
        let stored = records.get(&log).map(|v| v.version);
        if stored != expected_version {
            return Err(Error::conflict(format!(
                "log {log}: expected version {expected_version:?}, found {stored:?}"
            )));
        }
        let version = stored.map_or(1, |v| v + 1);
        records.insert(log, VersionedValue { version, value });
        Ok(version)
    }

    fn identify(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_write() {
        let backend = MemoryEpochStoreBackend::new();
        let log = LogId::new(1);
        assert_eq!(backend.read(log).await.unwrap(), None);

        assert_eq!(backend.conditional_write(log, None, vec![1]).await.unwrap(), 1);
        assert!(matches!(
            backend.conditional_write(log, None, vec![2]).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(backend.conditional_write(log, Some(1), vec![3]).await.unwrap(), 2);

        let value = backend.read(log).await.unwrap().unwrap();
        assert_eq!(value.version, 2);
        assert_eq!(value.value, vec![3]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = MemoryEpochStoreBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.read(LogId::new(1)).await,
            Err(Error::ServiceUnavailable(_))
        ));
        backend.set_unavailable(false);
        assert!(backend.read(LogId::new(1)).await.is_ok());
    }
}
