//! epochlog server
//!
//! Runs the sequencers of one node together with the in-process shards of
//! the cluster, the event and maintenance log state machines, and the admin
//! HTTP API.

pub mod admin;
pub mod http;
pub mod loopback;
pub mod server;

pub use admin::{AdminApi, ReplicationInfo, SnapshotOutcome};
pub use loopback::LoopbackLogClient;
pub use server::Server;
