//! Storage state tracker
//!
//! In-memory summary of what each shard knows about each log. Watermarks
//! only move forward: updates below the current value are ignored, so
//! concurrent writers need no coordination.

use crate::metadata::Seal;
use dashmap::DashMap;
use epochlog_common::{Counter, Epoch, Error, LogId, Lsn, Result, ShardId, Stats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::error;

/// Watermarks of one log on one shard
#[derive(Debug, Default)]
pub struct LogStorageState {
    trim_point: AtomicU64,
    last_clean_epoch: AtomicU32,
    last_released: AtomicU64,
    seal: Mutex<Option<Seal>>,
    permanent_error: AtomicBool,
}

impl LogStorageState {
    #[must_use]
    pub fn trim_point(&self) -> Lsn {
        Lsn::from_u64(self.trim_point.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn last_clean_epoch(&self) -> Epoch {
        Epoch::new(self.last_clean_epoch.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn last_released(&self) -> Lsn {
        Lsn::from_u64(self.last_released.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn seal(&self) -> Option<Seal> {
        *self.seal.lock()
    }

    /// Returns true if the trim point moved
    pub fn update_trim_point(&self, lsn: Lsn) -> bool {
        self.trim_point.fetch_max(lsn.as_u64(), Ordering::AcqRel) < lsn.as_u64()
    }

    /// Returns true if the last clean epoch moved
    pub fn update_last_clean_epoch(&self, epoch: Epoch) -> bool {
        self.last_clean_epoch.fetch_max(epoch.get(), Ordering::AcqRel) < epoch.get()
    }

    /// Returns true if the last released LSN moved
    pub fn update_last_released_lsn(&self, lsn: Lsn) -> bool {
        self.last_released.fetch_max(lsn.as_u64(), Ordering::AcqRel) < lsn.as_u64()
    }

    /// Raise the seal. Returns the seal in force afterwards and whether it
    /// changed.
    pub fn update_seal(&self, seal: Seal) -> (Seal, bool) {
        let mut current = self.seal.lock();
        match *current {
            Some(existing) if existing.epoch >= seal.epoch => (existing, false),
            _ => {
                *current = Some(seal);
                (seal, true)
            }
        }
    }

    /// Poison the log on this shard
    pub fn note_permanent_error(&self) {
        self.permanent_error.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn has_permanent_error(&self) -> bool {
        self.permanent_error.load(Ordering::Acquire)
    }
}

/// Tracker entries of every (log, shard) on one node
#[derive(Debug)]
pub struct LogStorageStateMap {
    states: DashMap<(LogId, ShardId), Arc<LogStorageState>>,
    stats: Arc<Stats>,
}

impl LogStorageStateMap {
    #[must_use]
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            states: DashMap::new(),
            stats,
        }
    }

    /// Entry of `log` on `shard`, created empty if missing
    pub fn insert_or_get(&self, log: LogId, shard: ShardId) -> Arc<LogStorageState> {
        Arc::clone(self.states.entry((log, shard)).or_default().value())
    }

    #[must_use]
    pub fn get(&self, log: LogId, shard: ShardId) -> Option<Arc<LogStorageState>> {
        self.states.get(&(log, shard)).map(|s| Arc::clone(s.value()))
    }

    /// Entry of `log` on `shard`, failing if the log was poisoned there
    pub fn check(&self, log: LogId, shard: ShardId) -> Result<Arc<LogStorageState>> {
        let state = self.insert_or_get(log, shard);
        if state.has_permanent_error() {
            return Err(Error::PermanentError { log, shard });
        }
        Ok(state)
    }

    /// Poison `log` on `shard`; later reads and writes there fail
    pub fn note_permanent_error(&self, log: LogId, shard: ShardId, reason: &str) {
        let state = self.insert_or_get(log, shard);
        if !state.has_permanent_error() {
            error!("Permanent error for log {} on {}: {}", log, shard, reason);
            self.stats.bump(Counter::PermanentErrors);
        }
        state.note_permanent_error();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochlog_common::NodeIndex;

    fn shard() -> ShardId {
        ShardId::new(NodeIndex::new(0), 0)
    }

    #[test]
    fn test_last_released_never_decreases() {
        let state = LogStorageState::default();
        assert!(state.update_last_released_lsn(Lsn::new(Epoch::new(3), 100)));
        assert!(!state.update_last_released_lsn(Lsn::new(Epoch::new(3), 99)));
        assert!(!state.update_last_released_lsn(Lsn::new(Epoch::new(2), 500)));
        assert_eq!(state.last_released(), Lsn::new(Epoch::new(3), 100));
        assert!(state.update_last_released_lsn(Lsn::new(Epoch::new(4), 1)));
    }

    #[test]
    fn test_monotonic_watermarks() {
        let state = LogStorageState::default();
        assert!(state.update_last_clean_epoch(Epoch::new(5)));
        assert!(!state.update_last_clean_epoch(Epoch::new(4)));
        assert_eq!(state.last_clean_epoch(), Epoch::new(5));

        assert!(state.update_trim_point(Lsn::new(Epoch::new(1), 10)));
        assert!(!state.update_trim_point(Lsn::new(Epoch::new(1), 10)));
        assert_eq!(state.trim_point(), Lsn::new(Epoch::new(1), 10));
    }

    #[test]
    fn test_seal_only_rises() {
        let state = LogStorageState::default();
        let by = NodeIndex::new(1);
        let (seal, changed) = state.update_seal(Seal { epoch: Epoch::new(4), sealed_by: by });
        assert!(changed);
        assert_eq!(seal.epoch, Epoch::new(4));
        let (seal, changed) = state.update_seal(Seal {
            epoch: Epoch::new(3),
            sealed_by: NodeIndex::new(2),
        });
        assert!(!changed);
        assert_eq!(seal.sealed_by, by);
    }

    #[test]
    fn test_insert_or_get_idempotent() {
        let map = LogStorageStateMap::new(Arc::new(Stats::new()));
        let a = map.insert_or_get(LogId::new(1), shard());
        a.update_last_clean_epoch(Epoch::new(2));
        let b = map.insert_or_get(LogId::new(1), shard());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_permanent_error_poisons_log() {
        let stats = Arc::new(Stats::new());
        let map = LogStorageStateMap::new(Arc::clone(&stats));
        assert!(map.check(LogId::new(1), shard()).is_ok());
        map.note_permanent_error(LogId::new(1), shard(), "bad trim point");
        map.note_permanent_error(LogId::new(1), shard(), "bad trim point");
        assert!(matches!(
            map.check(LogId::new(1), shard()),
            Err(Error::PermanentError { .. })
        ));
        assert!(map.check(LogId::new(2), shard()).is_ok());
        assert_eq!(stats.get(Counter::PermanentErrors), 1);
    }
}
