//! Epoch store backend persisted in a redb file.
//!
//! Each log maps to one row: an 8-byte little-endian version followed by
//! the encoded record. The compare and the write happen inside a single
//! write transaction, so concurrent writers serialize on redb's writer lock.

use crate::backend::{EpochStoreBackend, VersionedValue};
use async_trait::async_trait;
use epochlog_common::{Error, LogId, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Key: log id, value: version (u64 LE) ++ record
const LOG_METADATA: TableDefinition<u64, &[u8]> = TableDefinition::new("log_metadata");

const VERSION_LEN: usize = 8;

/// Error type for file backend operations
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row for log {0}")]
    CorruptRow(u64),
}

impl From<redb::TransactionError> for FileStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<FileStoreError> for Error {
    fn from(e: FileStoreError) -> Self {
        match e {
            FileStoreError::CorruptRow(log) => Self::MalformedRecord(format!("corrupt row for log {log}")),
            FileStoreError::Io(io) => Self::Io(io),
            other => Self::Storage(other.to_string()),
        }
    }
}

type FileStoreResult<T> = std::result::Result<T, FileStoreError>;

/// Outcome of a compare-and-write inside one transaction
enum CasOutcome {
    Written(u64),
    Mismatch(Option<u64>),
}

/// Durable backend storing every log's record in one redb table
pub struct FileEpochStoreBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl FileEpochStoreBackend {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Self::open_db(path)?;
        info!("Opened file epoch store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    fn open_db(path: &Path) -> FileStoreResult<Database> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(LOG_METADATA)?;
        }
        write_txn.commit()?;
        Ok(db)
    }

    fn split_row(log: u64, row: &[u8]) -> FileStoreResult<VersionedValue> {
        if row.len() < VERSION_LEN {
            return Err(FileStoreError::CorruptRow(log));
        }
        let (version, value) = row.split_at(VERSION_LEN);
        let mut buf = [0u8; VERSION_LEN];
        buf.copy_from_slice(version);
        Ok(VersionedValue {
            version: u64::from_le_bytes(buf),
            value: value.to_vec(),
        })
    }

    fn read_blocking(db: &Database, log: u64) -> FileStoreResult<Option<VersionedValue>> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(LOG_METADATA)?;
        let row = table.get(log)?;
        let value = match row {
            Some(row) => Some(Self::split_row(log, row.value())?),
            None => None,
        };
        Ok(value)
    }

    fn cas_blocking(
        db: &Database,
        log: u64,
        expected: Option<u64>,
        value: &[u8],
    ) -> FileStoreResult<CasOutcome> {
        let write_txn = db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(LOG_METADATA)?;
            // Read and compare, then drop the guard before mutating
            let stored = match table.get(log)? {
                Some(row) => Some(Self::split_row(log, row.value())?.version),
                None => None,
            };
            if stored == expected {
                let version = stored.map_or(1, |v| v + 1);
                let mut row = Vec::with_capacity(VERSION_LEN + value.len());
                row.extend_from_slice(&version.to_le_bytes());
                row.extend_from_slice(value);
                table.insert(log, row.as_slice())?;
                CasOutcome::Written(version)
            } else {
                CasOutcome::Mismatch(stored)
            }
        };
        if matches!(outcome, CasOutcome::Written(_)) {
            write_txn.commit()?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl EpochStoreBackend for FileEpochStoreBackend {
    async fn read(&self, log: LogId) -> Result<Option<VersionedValue>> {
        let db = Arc::clone(&self.db);
        let value = tokio::task::spawn_blocking(move || Self::read_blocking(&db, log.get()))
            .await
            .map_err(|e| Error::internal(format!("epoch store read task failed: {e}")))??;
        Ok(value)
    }

    async fn conditional_write(
        &self,
        log: LogId,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let outcome = tokio::task::spawn_blocking(move || {
            Self::cas_blocking(&db, log.get(), expected_version, &value)
        })
        .await
        .map_err(|e| Error::internal(format!("epoch store write task failed: {e}")))??;
        match outcome {
            CasOutcome::Written(version) => Ok(version),
            CasOutcome::Mismatch(stored) => Err(Error::conflict(format!(
                "log {log}: expected version {expected_version:?}, found {stored:?}"
            ))),
        }
    }

    fn identify(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
