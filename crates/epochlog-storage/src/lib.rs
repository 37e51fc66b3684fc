//! Storage side of epochlog
//!
//! - **state**: per-(log, shard) watermarks (trim point, last clean epoch,
//!   last released LSN, seal), monotonic and shared across tasks
//! - **store**: the local log store interface, with in-memory and failing
//!   implementations
//! - **sharded**: the per-node set of local log stores
//! - **populate**: rebuilding the state map from persisted metadata at
//!   startup
//! - **shard**: the seal / digest / store / release surface sequencers and
//!   recovery talk to

pub mod metadata;
pub mod populate;
pub mod shard;
pub mod sharded;
pub mod state;
pub mod store;

pub use metadata::{LogMetadata, LogMetadataType, Seal};
pub use populate::{PopulateSummary, populate_state_map};
pub use shard::{
    DigestReply, LocalShard, ShardClient, ShardDirectory, ShardLogState, StoreOrigin,
};
pub use sharded::ShardedLogStore;
pub use state::{LogStorageState, LogStorageStateMap};
pub use store::{FailingLogStore, LocalLogStore, MemoryLogStore, RecordKind};
