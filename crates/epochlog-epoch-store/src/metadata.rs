//! Epoch metadata records and their on-store encoding
//!
//! A record is `[format version][bincode body][crc32c of both, LE]`. Any
//! checksum or decode failure surfaces as `MalformedRecord`.

use epochlog_common::{Epoch, Error, Lsn, NodeIndex, ReplicationProperty, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const FORMAT_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 4;

/// Placement of one epoch. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochMetaData {
    pub epoch: Epoch,
    /// Shards eligible to store records of this epoch, in placement order
    pub replica_set: Vec<ShardId>,
    pub replication: ReplicationProperty,
    /// Nodes configuration version the replica set was chosen from
    pub nodes_config_version: u64,
    /// Sequencer node that claimed the epoch
    pub written_by: Option<NodeIndex>,
    pub disabled: bool,
}

impl EpochMetaData {
    /// Whether `shard` belongs to the replica set
    #[must_use]
    pub fn contains(&self, shard: ShardId) -> bool {
        self.replica_set.contains(&shard)
    }
}

/// Everything the epoch store keeps for one log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetaData {
    pub current: EpochMetaData,
    /// Metadata of earlier epochs above the last clean epoch, oldest first
    pub history: Vec<EpochMetaData>,
    pub last_clean_epoch: Epoch,
    /// Tail LSN recorded together with the last clean epoch
    pub tail: Lsn,
    /// Backend version this record was written at
    pub version: u64,
    /// Milliseconds since the Unix epoch of the last change
    pub last_changed_ms: u64,
}

impl LogMetaData {
    /// Record for a freshly provisioned log
    #[must_use]
    pub fn provisioned(current: EpochMetaData) -> Self {
        Self {
            current,
            history: Vec::new(),
            last_clean_epoch: Epoch::INVALID,
            tail: Lsn::INVALID,
            version: 0,
            last_changed_ms: now_ms(),
        }
    }

    /// Replace the current epoch, keeping the old one in the history if it
    /// still needs recovery
    #[must_use]
    pub fn advanced(&self, next: EpochMetaData) -> Self {
        let mut history = self.history.clone();
        if self.current.epoch > self.last_clean_epoch {
            history.push(self.current.clone());
        }
        Self {
            current: next,
            history,
            last_clean_epoch: self.last_clean_epoch,
            tail: self.tail,
            version: self.version,
            last_changed_ms: now_ms(),
        }
    }

    /// Advance the last clean epoch and drop the history it covers
    #[must_use]
    pub fn cleaned(&self, lce: Epoch, tail: Lsn) -> Self {
        Self {
            current: self.current.clone(),
            history: self
                .history
                .iter()
                .filter(|m| m.epoch > lce)
                .cloned()
                .collect(),
            last_clean_epoch: lce,
            tail,
            version: self.version,
            last_changed_ms: now_ms(),
        }
    }

    /// Metadata of `epoch`, from the current record or the history
    #[must_use]
    pub fn epoch_metadata(&self, epoch: Epoch) -> Option<&EpochMetaData> {
        if self.current.epoch == epoch {
            return Some(&self.current);
        }
        self.history.iter().find(|m| m.epoch == epoch)
    }

    /// Epochs in (LCE, current) that still need recovery, oldest first
    #[must_use]
    pub fn unclean_epochs(&self) -> Vec<EpochMetaData> {
        let mut epochs: Vec<_> = self
            .history
            .iter()
            .filter(|m| m.epoch > self.last_clean_epoch && m.epoch < self.current.epoch)
            .cloned()
            .collect();
        epochs.sort_by_key(|m| m.epoch);
        epochs
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut buf = Vec::with_capacity(1 + body.len() + CHECKSUM_LEN);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&body);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 1 + CHECKSUM_LEN {
            return Err(Error::malformed(format!("record too short: {} bytes", bytes.len())));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let mut stored = [0u8; CHECKSUM_LEN];
        stored.copy_from_slice(crc_bytes);
        let stored = u32::from_le_bytes(stored);
        let actual = crc32c::crc32c(payload);
        if stored != actual {
            return Err(Error::malformed(format!(
                "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }
        if payload[0] != FORMAT_VERSION {
            return Err(Error::malformed(format!(
                "unsupported format version {}",
                payload[0]
            )));
        }
        bincode::deserialize(&payload[1..]).map_err(|e| Error::malformed(e.to_string()))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn epoch_meta(epoch: u32, nodes: &[u16]) -> EpochMetaData {
        EpochMetaData {
            epoch: Epoch::new(epoch),
            replica_set: nodes
                .iter()
                .map(|n| ShardId::new(NodeIndex::new(*n), 0))
                .collect(),
            replication: ReplicationProperty::nodes(2),
            nodes_config_version: 1,
            written_by: Some(NodeIndex::new(0)),
            disabled: false,
        }
    }

    #[test]
    fn test_encode_decode_identical() {
        let meta = LogMetaData::provisioned(epoch_meta(1, &[0, 1, 2])).advanced(epoch_meta(2, &[1, 2, 3]));
        let bytes = meta.encode().unwrap();
        let decoded = LogMetaData::decode(&bytes).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_corruption_detected() {
        let meta = LogMetaData::provisioned(epoch_meta(1, &[0, 1]));
        let mut bytes = meta.encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(
            LogMetaData::decode(&bytes),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(
            LogMetaData::decode(&[1, 2]),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_history_tracking() {
        let meta = LogMetaData::provisioned(epoch_meta(1, &[0, 1]))
            .advanced(epoch_meta(2, &[0, 1]))
            .advanced(epoch_meta(3, &[0, 1]));
        let unclean: Vec<_> = meta.unclean_epochs().iter().map(|m| m.epoch.get()).collect();
        assert_eq!(unclean, vec![1, 2]);

        let cleaned = meta.cleaned(Epoch::new(1), Lsn::new(Epoch::new(1), 10));
        let unclean: Vec<_> = cleaned.unclean_epochs().iter().map(|m| m.epoch.get()).collect();
        assert_eq!(unclean, vec![2]);
        assert!(cleaned.epoch_metadata(Epoch::new(2)).is_some());
        assert!(cleaned.epoch_metadata(Epoch::new(1)).is_none());
    }
}
