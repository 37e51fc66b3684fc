//! Core type definitions for epochlog
//!
//! Log identifiers, epochs, LSNs and the node/shard addressing used by the
//! sequencer, recovery and storage layers.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a log
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct LogId(u64);

impl LogId {
    /// The invalid log id
    pub const INVALID: Self = Self(0);
    /// Largest id a user log may take; everything above is internal
    pub const MAX_USER: Self = Self(0xFFFF_FFFF_FFFF_FF00);

    /// Event log delta log
    pub const EVENT_LOG_DELTAS: Self = Self(0xFFFF_FFFF_FFFF_FFF0);
    /// Event log snapshot log
    pub const EVENT_LOG_SNAPSHOTS: Self = Self(0xFFFF_FFFF_FFFF_FFF1);
    /// Maintenance log delta log
    pub const MAINTENANCE_LOG_DELTAS: Self = Self(0xFFFF_FFFF_FFFF_FFF2);
    /// Maintenance log snapshot log
    pub const MAINTENANCE_LOG_SNAPSHOTS: Self = Self(0xFFFF_FFFF_FFFF_FFF3);

    /// Create a log id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this id names a log the system may operate on
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && (self.0 <= Self::MAX_USER.0 || self.is_internal())
    }

    /// Whether this is one of the reserved internal logs
    #[must_use]
    pub const fn is_internal(self) -> bool {
        self.0 >= Self::EVENT_LOG_DELTAS.0 && self.0 <= Self::MAINTENANCE_LOG_SNAPSHOTS.0
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A generation of sequencing authority for a log
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    From,
    Into,
)]
pub struct Epoch(u32);

impl Epoch {
    pub const INVALID: Self = Self(0);
    pub const MIN: Self = Self(1);
    pub const MAX: Self = Self(u32::MAX);

    #[must_use]
    pub const fn new(epoch: u32) -> Self {
        Self(epoch)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The following epoch, or `None` once the epoch space is exhausted
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(e) => Some(Self(e)),
            None => None,
        }
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log sequence number: (epoch, offset), ordered lexicographically
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Lsn {
    pub epoch: Epoch,
    pub offset: u32,
}

impl Lsn {
    pub const INVALID: Self = Self {
        epoch: Epoch::INVALID,
        offset: 0,
    };
    /// First offset issued in every epoch
    pub const OFFSET_MIN: u32 = 1;
    pub const MAX: Self = Self {
        epoch: Epoch::MAX,
        offset: u32::MAX,
    };

    #[must_use]
    pub const fn new(epoch: Epoch, offset: u32) -> Self {
        Self { epoch, offset }
    }

    /// Highest LSN strictly below the first record of `epoch`
    #[must_use]
    pub const fn before_epoch(epoch: Epoch) -> Self {
        if epoch.get() == 0 {
            return Self::INVALID;
        }
        Self {
            epoch: Epoch::new(epoch.get() - 1),
            offset: u32::MAX,
        }
    }

    /// Packed representation `epoch << 32 | offset`
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.epoch.get() as u64) << 32) | self.offset as u64
    }

    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            epoch: Epoch::new((raw >> 32) as u32),
            offset: raw as u32,
        }
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.epoch.is_valid()
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Self::from_u64(raw)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.as_u64()
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}n{}", self.epoch.get(), self.offset)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}n{}", self.epoch.get(), self.offset)
    }
}

/// Index of a node in the nodes configuration
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
)]
pub struct NodeIndex(u16);

impl NodeIndex {
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// A storage shard: one of the local log stores of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: u16,
}

impl ShardId {
    #[must_use]
    pub const fn new(node: NodeIndex, shard: u16) -> Self {
        Self { node, shard }
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:S{}", self.node, self.shard)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:S{}", self.node, self.shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn::new(Epoch::new(3), 100);
        let b = Lsn::new(Epoch::new(4), 1);
        assert!(a < b);
        assert!(Lsn::new(Epoch::new(3), 99) < a);
        assert!(Lsn::INVALID < a);
    }

    #[test]
    fn test_lsn_packing() {
        let lsn = Lsn::new(Epoch::new(7), 42);
        assert_eq!(lsn.as_u64(), (7u64 << 32) | 42);
        assert_eq!(Lsn::from_u64(lsn.as_u64()), lsn);
        assert!(Lsn::from_u64(1 << 32) > Lsn::from_u64(u64::from(u32::MAX)));
    }

    #[test]
    fn test_lsn_before_epoch() {
        let lsn = Lsn::before_epoch(Epoch::new(4));
        assert_eq!(lsn.epoch, Epoch::new(3));
        assert!(lsn < Lsn::new(Epoch::new(4), Lsn::OFFSET_MIN));
        assert_eq!(Lsn::before_epoch(Epoch::INVALID), Lsn::INVALID);
    }

    #[test]
    fn test_epoch_next() {
        assert_eq!(Epoch::MIN.next(), Some(Epoch::new(2)));
        assert_eq!(Epoch::MAX.next(), None);
        assert!(!Epoch::INVALID.is_valid());
    }

    #[test]
    fn test_log_id_validity() {
        assert!(!LogId::INVALID.is_valid());
        assert!(LogId::new(1).is_valid());
        assert!(LogId::EVENT_LOG_DELTAS.is_valid());
        assert!(LogId::EVENT_LOG_DELTAS.is_internal());
        assert!(!LogId::new(1).is_internal());
        assert!(!LogId::new(0xFFFF_FFFF_FFFF_FFFF).is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(Lsn::new(Epoch::new(3), 100).to_string(), "e3n100");
        assert_eq!(ShardId::new(NodeIndex::new(1), 0).to_string(), "N1:S0");
    }
}
