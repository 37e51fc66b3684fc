//! Replicated state machines on top of epochlog logs
//!
//! A state machine is a pair of logs: deltas, and snapshots of the state
//! folded from them. Every node tails the delta log from its latest
//! snapshot and ends up with the same state at the same version.

pub mod client;
pub mod event_log;
pub mod machine;
pub mod maintenance_log;

pub use client::{LogClient, MemoryLogClient};
pub use event_log::{EventLog, EventLogDelta, RebuildingSet, ShardRebuild};
pub use machine::{ReplicatedStateMachine, RsmHandle, RsmView, SnapshotStatus, StateMachine};
pub use maintenance_log::{
    ClusterMaintenanceState, MaintenanceDefinition, MaintenanceDelta, MaintenanceLog,
    MaintenanceTarget,
};
