//! Local log store interface and implementations
//!
//! A local log store is one shard's record and metadata storage. The
//! on-disk engine is out of scope; [`MemoryLogStore`] keeps everything in
//! memory and [`FailingLogStore`] stands in for a shard whose store could
//! not be read.

use crate::metadata::{LogMetadata, LogMetadataType};
use bytes::Bytes;
use epochlog_common::{Epoch, Error, LogId, Lsn, Result, ShardId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// What a shard holds at an LSN
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Data(Bytes),
    /// Definitive hole plugged by recovery
    Gap,
}

impl RecordKind {
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap)
    }
}

/// Storage engine interface of one shard
pub trait LocalLogStore: Send + Sync {
    /// Call `callback` with the raw value of every `ty` metadata entry
    fn traverse_logs_metadata(
        &self,
        ty: LogMetadataType,
        callback: &mut dyn FnMut(LogId, &[u8]),
    ) -> Result<()>;

    fn write_log_metadata(&self, log: LogId, value: &LogMetadata) -> Result<()>;

    fn read_log_metadata(&self, log: LogId, ty: LogMetadataType) -> Result<Option<LogMetadata>>;

    /// Store `kind` at `lsn`, replacing what was there
    fn put_record(&self, log: LogId, lsn: Lsn, kind: RecordKind) -> Result<()>;

    /// All records of `epoch`, by offset
    fn read_epoch(&self, log: LogId, epoch: Epoch) -> Result<BTreeMap<u32, RecordKind>>;

    /// Records with `from <= lsn <= to`
    fn read_range(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, RecordKind)>>;

    fn is_failing(&self) -> bool {
        false
    }
}

/// In-memory local log store
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: RwLock<BTreeMap<(LogId, Lsn), RecordKind>>,
    metadata: RwLock<HashMap<(LogId, LogMetadataType), Vec<u8>>>,
    fail_traversal: AtomicBool,
}

impl MemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store undecodable bytes as `ty` metadata of `log`
    pub fn put_raw_metadata(&self, log: LogId, ty: LogMetadataType, bytes: Vec<u8>) {
        self.metadata.write().insert((log, ty), bytes);
    }

    /// Make metadata traversal fail, as an unreadable store would
    pub fn set_fail_traversal(&self, fail: bool) {
        self.fail_traversal.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl LocalLogStore for MemoryLogStore {
    fn traverse_logs_metadata(
        &self,
        ty: LogMetadataType,
        callback: &mut dyn FnMut(LogId, &[u8]),
    ) -> Result<()> {
        if self.fail_traversal.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("failed to traverse {ty} metadata")));
        }
        let metadata = self.metadata.read();
        let mut entries: Vec<_> = metadata.iter().filter(|((_, t), _)| *t == ty).collect();
        entries.sort_by_key(|((log, _), _)| *log);
        for ((log, _), bytes) in entries {
            callback(*log, bytes);
        }
        Ok(())
    }

    fn write_log_metadata(&self, log: LogId, value: &LogMetadata) -> Result<()> {
        let bytes = value.encode()?;
        self.metadata
            .write()
            .insert((log, value.metadata_type()), bytes);
        Ok(())
    }

    fn read_log_metadata(&self, log: LogId, ty: LogMetadataType) -> Result<Option<LogMetadata>> {
        self.metadata
            .read()
            .get(&(log, ty))
            .map(|bytes| LogMetadata::decode(ty, bytes))
            .transpose()
    }

    fn put_record(&self, log: LogId, lsn: Lsn, kind: RecordKind) -> Result<()> {
        self.records.write().insert((log, lsn), kind);
        Ok(())
    }

    fn read_epoch(&self, log: LogId, epoch: Epoch) -> Result<BTreeMap<u32, RecordKind>> {
        let from = (log, Lsn::new(epoch, 0));
        let to = (log, Lsn::new(epoch, u32::MAX));
        Ok(self
            .records
            .read()
            .range(from..=to)
            .map(|((_, lsn), kind)| (lsn.offset, kind.clone()))
            .collect())
    }

    fn read_range(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, RecordKind)>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .read()
            .range((log, from)..=(log, to))
            .map(|((_, lsn), kind)| (*lsn, kind.clone()))
            .collect())
    }
}

/// Store of a shard that could not be opened: every operation fails
#[derive(Debug)]
pub struct FailingLogStore {
    shard: ShardId,
}

impl FailingLogStore {
    #[must_use]
    pub const fn new(shard: ShardId) -> Self {
        Self { shard }
    }
}

impl LocalLogStore for FailingLogStore {
    fn traverse_logs_metadata(
        &self,
        _ty: LogMetadataType,
        _callback: &mut dyn FnMut(LogId, &[u8]),
    ) -> Result<()> {
        Err(Error::ShardFailing(self.shard))
    }

    fn write_log_metadata(&self, _log: LogId, _value: &LogMetadata) -> Result<()> {
        Err(Error::ShardFailing(self.shard))
    }

    fn read_log_metadata(&self, _log: LogId, _ty: LogMetadataType) -> Result<Option<LogMetadata>> {
        Err(Error::ShardFailing(self.shard))
    }

    fn put_record(&self, _log: LogId, _lsn: Lsn, _kind: RecordKind) -> Result<()> {
        Err(Error::ShardFailing(self.shard))
    }

    fn read_epoch(&self, _log: LogId, _epoch: Epoch) -> Result<BTreeMap<u32, RecordKind>> {
        Err(Error::ShardFailing(self.shard))
    }

    fn read_range(&self, _log: LogId, _from: Lsn, _to: Lsn) -> Result<Vec<(Lsn, RecordKind)>> {
        Err(Error::ShardFailing(self.shard))
    }

    fn is_failing(&self) -> bool {
        true
    }
}
