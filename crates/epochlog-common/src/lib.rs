//! epochlog Common - Shared types and utilities
//!
//! This crate provides the identifiers, replication model, error taxonomy,
//! configuration and stats registry used across all epochlog components.

pub mod backoff;
pub mod config;
pub mod error;
pub mod failure_domain;
pub mod nodes;
pub mod replication;
pub mod stats;
pub mod types;

pub use backoff::ExponentialBackoff;
pub use config::Config;
pub use error::{Error, Result};
pub use failure_domain::FailureDomainChecker;
pub use nodes::{NodeInfo, NodesConfiguration};
pub use replication::{LocationScope, NodeLocation, ReplicationProperty};
pub use stats::{Counter, Stats};
pub use types::*;
