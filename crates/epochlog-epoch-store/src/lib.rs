//! Epoch store: the single source of truth for who may write each epoch
//!
//! Maps every log to its [`LogMetaData`] record (current epoch, replica set,
//! replication policy, last clean epoch) and only ever changes it through a
//! versioned read-modify-write, so at most one writer wins each transition.

pub mod backend;
pub mod file;
pub mod memory;
pub mod metadata;
pub mod nodeset;
pub mod store;
pub mod updater;

pub use backend::{EpochStoreBackend, VersionedValue};
pub use file::FileEpochStoreBackend;
pub use memory::MemoryEpochStoreBackend;
pub use metadata::{EpochMetaData, LogMetaData};
pub use store::{EpochStore, ExpectedPrior};
pub use updater::{BumpEpochUpdater, MetaDataUpdater, ProvisionUpdater, UpdateOutcome};
