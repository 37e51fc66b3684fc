//! Rebuilding the storage state map at startup
//!
//! One task per shard walks the persisted trim points, last clean epochs,
//! last released LSNs and seals. A value that does not decode poisons only
//! that log on that shard. A shard whose metadata cannot be traversed at
//! all is switched to a failing store; if even that fails, startup aborts.

use crate::metadata::{LogMetadata, LogMetadataType};
use crate::sharded::ShardedLogStore;
use crate::state::LogStorageStateMap;
use epochlog_common::{Error, LogId, Result, ShardId};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Counts reported by one shard's traversal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PopulateSummary {
    pub entries: usize,
    pub malformed: usize,
    pub failed_shards: usize,
}

fn apply(map: &LogStorageStateMap, shard: ShardId, log: LogId, value: LogMetadata) {
    let state = map.insert_or_get(log, shard);
    match value {
        LogMetadata::TrimPoint(lsn) => {
            state.update_trim_point(lsn);
        }
        LogMetadata::LastClean(epoch) => {
            state.update_last_clean_epoch(epoch);
        }
        LogMetadata::LastReleased(lsn) => {
            state.update_last_released_lsn(lsn);
        }
        LogMetadata::Seal(seal) => {
            state.update_seal(seal);
        }
    }
}

fn populate_shard(
    store: &ShardedLogStore,
    map: &LogStorageStateMap,
    shard: u16,
) -> Result<PopulateSummary> {
    let id = ShardId::new(store.node(), shard);
    let local = store.get(shard)?;
    let mut summary = PopulateSummary::default();
    for ty in LogMetadataType::ALL {
        let traversed = local.traverse_logs_metadata(ty, &mut |log: LogId, bytes: &[u8]| {
            match LogMetadata::decode(ty, bytes) {
                Ok(value) => {
                    summary.entries += 1;
                    apply(map, id, log, value);
                }
                Err(e) => {
                    summary.malformed += 1;
                    map.note_permanent_error(log, id, &format!("malformed {ty}: {e}"));
                }
            }
        });
        if let Err(e) = traversed {
            error!("Failed to read {} metadata on {}: {}", ty, id, e);
            store.switch_to_failing(shard)?;
            summary.failed_shards = 1;
            break;
        }
    }
    Ok(summary)
}

/// Populate `map` from every shard of `store`, one task per shard
pub async fn populate_state_map(
    store: Arc<ShardedLogStore>,
    map: Arc<LogStorageStateMap>,
) -> Result<PopulateSummary> {
    let started = Instant::now();
    let tasks = (0..store.num_shards()).map(|shard| {
        let store = Arc::clone(&store);
        let map = Arc::clone(&map);
        tokio::task::spawn_blocking(move || populate_shard(&store, &map, shard))
    });

    let mut total = PopulateSummary::default();
    for result in join_all(tasks).await {
        let summary =
            result.map_err(|e| Error::internal(format!("populate task panicked: {e}")))??;
        total.entries += summary.entries;
        total.malformed += summary.malformed;
        total.failed_shards += summary.failed_shards;
    }
    info!(
        "Populated storage state map for {} in {:?}: {} entries, {} malformed, {} failing shards",
        store.node(),
        started.elapsed(),
        total.entries,
        total.malformed,
        total.failed_shards
    );
    Ok(total)
}
