//! Configuration types for epochlog
//!
//! This module defines configuration structures used across components.
//! Every section can be omitted from the TOML file and falls back to its
//! `Default`.

use crate::error::{Error, Result};
use crate::nodes::{NodeInfo, NodesConfiguration};
use crate::replication::{NodeLocation, ReplicationProperty};
use crate::types::{LogId, NodeIndex};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for an epochlog server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's identity
    pub node: NodeConfig,
    /// Cluster membership
    pub nodes: ClusterConfig,
    /// Log ranges and their replication
    pub logs: LogsConfig,
    /// Epoch store backend
    pub epoch_store: EpochStoreConfig,
    /// Sequencer behaviour
    pub sequencer: SequencerConfig,
    /// Recovery behaviour
    pub recovery: RecoveryConfig,
    /// Local log stores
    pub storage: StorageConfig,
    /// Replicated state machines
    pub rsm: RsmConfig,
    /// Admin HTTP surface
    pub admin: AdminConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-section consistency
    pub fn validate(&self) -> Result<()> {
        let nodes = self.nodes.nodes_configuration();
        if nodes.get(self.node.node_index()).is_none() {
            return Err(Error::Configuration(format!(
                "node index {} is not part of the cluster",
                self.node.index
            )));
        }
        if self.sequencer.workers == 0 {
            return Err(Error::Configuration("sequencer.workers must be positive".into()));
        }
        for range in &self.logs.ranges {
            if range.first == 0 || range.first > range.last {
                return Err(Error::Configuration(format!(
                    "invalid log range {}..={}",
                    range.first, range.last
                )));
            }
            range
                .replication
                .validate()
                .map_err(|e| Error::Configuration(e.to_string()))?;
        }
        self.logs
            .internal_replication
            .validate()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(())
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Index of this node in the nodes configuration
    pub index: u16,
    /// Data directory for the epoch store file and local state
    pub data_dir: PathBuf,
}

impl NodeConfig {
    #[must_use]
    pub const fn node_index(&self) -> NodeIndex {
        NodeIndex::new(self.index)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            index: 0,
            data_dir: PathBuf::from("/var/lib/epochlog"),
        }
    }
}

/// Cluster membership configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Version of this membership view
    pub version: u64,
    /// Cluster nodes
    pub nodes: Vec<NodeInfo>,
}

impl ClusterConfig {
    #[must_use]
    pub fn nodes_configuration(&self) -> NodesConfiguration {
        NodesConfiguration::new(self.version, self.nodes.iter().cloned())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "epochlog".to_string(),
            version: 1,
            nodes: (0..3)
                .map(|i| NodeInfo::new(i, NodeLocation::new("default", "default", format!("rack{i}"))))
                .collect(),
        }
    }
}

/// A contiguous range of user logs sharing a replication policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRangeConfig {
    pub first: u64,
    pub last: u64,
    pub replication: ReplicationProperty,
    /// Replica set size; defaults to the replication factor
    #[serde(default)]
    pub nodeset_size: Option<usize>,
}

impl LogRangeConfig {
    #[must_use]
    pub const fn contains(&self, log: LogId) -> bool {
        log.get() >= self.first && log.get() <= self.last
    }
}

/// Logs configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub ranges: Vec<LogRangeConfig>,
    /// Replication of the event and maintenance logs
    pub internal_replication: ReplicationProperty,
    /// Version of the logs configuration reported by the admin API
    pub version: u64,
}

/// Replication attributes for one log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogAttributes {
    pub replication: ReplicationProperty,
    pub nodeset_size: usize,
}

impl LogsConfig {
    /// Replication attributes of `log`, `None` if the log is not configured
    #[must_use]
    pub fn attributes(&self, log: LogId) -> Option<LogAttributes> {
        if log.is_internal() {
            return Some(LogAttributes {
                nodeset_size: usize::from(self.internal_replication.replication_factor()),
                replication: self.internal_replication.clone(),
            });
        }
        self.ranges
            .iter()
            .find(|r| r.contains(log))
            .map(|r| LogAttributes {
                replication: r.replication.clone(),
                nodeset_size: r
                    .nodeset_size
                    .unwrap_or_else(|| usize::from(r.replication.replication_factor())),
            })
    }

    /// Replication properties of every configured log range, internal logs
    /// included
    pub fn all_replications(&self) -> impl Iterator<Item = &ReplicationProperty> + '_ {
        self.ranges
            .iter()
            .map(|r| &r.replication)
            .chain(std::iter::once(&self.internal_replication))
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            ranges: vec![LogRangeConfig {
                first: 1,
                last: 1000,
                replication: ReplicationProperty::nodes(2),
                nodeset_size: None,
            }],
            internal_replication: ReplicationProperty::nodes(2),
            version: 1,
        }
    }
}

/// Epoch store backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochStoreKind {
    /// In-process, non-durable
    #[default]
    Memory,
    /// redb file
    File,
}

/// Epoch store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochStoreConfig {
    pub backend: EpochStoreKind,
    /// Path of the redb file (file backend only)
    pub path: Option<PathBuf>,
    /// Internal retries when a read-modify-write races another writer
    pub max_cas_retries: u32,
    /// Timeout for a single store operation (milliseconds)
    pub op_timeout_ms: u64,
}

impl EpochStoreConfig {
    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for EpochStoreConfig {
    fn default() -> Self {
        Self {
            backend: EpochStoreKind::Memory,
            path: None,
            max_cas_retries: 8,
            op_timeout_ms: 5000,
        }
    }
}

/// Exponential backoff parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 5000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Sequencer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Number of worker tasks owning sequencers
    pub workers: usize,
    /// Capacity of each worker's queue
    pub worker_queue_size: usize,
    /// Timeout of one activation attempt (milliseconds)
    pub activation_timeout_ms: u64,
    /// Attempts before activation reports `Failed`
    pub activation_retries: u32,
    pub activation_backoff: BackoffConfig,
    /// Appends buffered while recovering; overflow is `Deferred`
    pub max_buffered_appends: usize,
    /// Buffered appends fail with `Deferred` once recovery runs this long
    /// (milliseconds)
    pub max_recovery_wait_ms: u64,
    /// Timeout of a single store on a shard (milliseconds)
    pub store_timeout_ms: u64,
    /// An append not fully stored after this long is answered with a
    /// timeout while the store keeps retrying (milliseconds)
    pub append_timeout_ms: u64,
    /// Activate a sequencer on the first append for a log
    pub lazy_activation: bool,
}

impl SequencerConfig {
    #[must_use]
    pub const fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    #[must_use]
    pub const fn max_recovery_wait(&self) -> Duration {
        Duration::from_millis(self.max_recovery_wait_ms)
    }

    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    #[must_use]
    pub const fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            worker_queue_size: 1024,
            activation_timeout_ms: 5000,
            activation_retries: 5,
            activation_backoff: BackoffConfig::default(),
            max_buffered_appends: 1000,
            max_recovery_wait_ms: 30_000,
            store_timeout_ms: 2000,
            append_timeout_ms: 10_000,
            lazy_activation: true,
        }
    }
}

/// Recovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Time allowed for one seal/digest round (milliseconds)
    pub round_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl RecoveryConfig {
    #[must_use]
    pub const fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            round_timeout_ms: 2000,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Local log store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Largest accepted payload (bytes)
    pub max_record_size: usize,
    /// Shards started as failing, for fault drills
    pub failing_shards: Vec<u16>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_record_size: 1024 * 1024, // 1 MB
            failing_shards: Vec::new(),
        }
    }
}

/// Replicated state machine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RsmConfig {
    pub event_log_snapshotting: bool,
    pub maintenance_log_snapshotting: bool,
    /// How often followers tail the delta log (milliseconds)
    pub sync_interval_ms: u64,
}

impl RsmConfig {
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for RsmConfig {
    fn default() -> Self {
        Self {
            event_log_snapshotting: true,
            maintenance_log_snapshotting: true,
            sync_interval_ms: 500,
        }
    }
}

/// Admin HTTP configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([0, 0, 0, 0], 6440)),
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
