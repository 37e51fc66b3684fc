//! Backend capability interface
//!
//! A backend is a versioned blob store keyed by log id. It knows nothing
//! about epochs; the [`EpochStore`](crate::EpochStore) layers the
//! read-modify-write protocol on top.

use async_trait::async_trait;
use epochlog_common::{LogId, Result};

/// A stored value and the version it was written at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Versioned key-value storage for log metadata records
#[async_trait]
pub trait EpochStoreBackend: Send + Sync {
    /// Read the record of `log`, if any
    async fn read(&self, log: LogId) -> Result<Option<VersionedValue>>;

    /// Write `value` if the stored version equals `expected_version`
    /// (`None`: only if absent). Returns the new version. A mismatch is
    /// `Error::Conflict`.
    async fn conditional_write(
        &self,
        log: LogId,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64>;

    /// Short description for logs
    fn identify(&self) -> String;
}
