//! Log client served by this process's own sequencers and shards
//!
//! Appends go through [`AllSequencers`]. Reads fan out to every shard of
//! the cluster and merge what they return; a record only shows up once the
//! shards holding it have seen it released. A gap plugged by recovery hides
//! any copy of the same LSN left on a shard that missed the recovery, and
//! nothing of the last clean epoch past its recovered tail is served.

use async_trait::async_trait;
use bytes::Bytes;
use epochlog_common::{Epoch, Error, LogId, Lsn, NodeInfo, Result, ShardId};
use epochlog_rsm::LogClient;
use epochlog_sequencer::AllSequencers;
use epochlog_storage::{RecordKind, ShardClient};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use tracing::debug;

/// Merge the shards' answers to one read. `clean` is the last clean epoch
/// and the tail recovery settled for it.
fn merge_reads(
    answers: impl IntoIterator<Item = Vec<(Lsn, RecordKind)>>,
    clean: Option<(Epoch, Lsn)>,
) -> Vec<(Lsn, Bytes)> {
    let mut merged = BTreeMap::new();
    for (lsn, kind) in answers.into_iter().flatten() {
        if clean.is_some_and(|(epoch, tail)| lsn.epoch == epoch && lsn > tail) {
            continue;
        }
        match merged.entry(lsn) {
            Entry::Vacant(slot) => {
                slot.insert(kind);
            }
            Entry::Occupied(mut slot) if kind.is_gap() => {
                slot.insert(kind);
            }
            Entry::Occupied(_) => {}
        }
    }
    merged
        .into_iter()
        .filter_map(|(lsn, kind)| match kind {
            RecordKind::Data(payload) => Some((lsn, payload)),
            RecordKind::Gap => None,
        })
        .collect()
}

pub struct LoopbackLogClient {
    sequencers: Arc<AllSequencers>,
    shards: Vec<ShardId>,
}

impl LoopbackLogClient {
    #[must_use]
    pub fn new(sequencers: Arc<AllSequencers>) -> Self {
        let shards = sequencers
            .context()
            .nodes
            .nodes
            .values()
            .flat_map(NodeInfo::shards)
            .collect();
        Self { sequencers, shards }
    }

    /// Ask every shard, keeping the answers of those that responded.
    /// Fails only if none did.
    async fn ask_all<T, F, Fut>(&self, log: LogId, ask: F) -> Result<Vec<T>>
    where
        F: Fn(Arc<dyn ShardClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.sequencers.context();
        let requests = self.shards.iter().map(|shard| {
            let client = ctx.shards.get(*shard);
            let ask = &ask;
            async move { ask(client?).await }
        });
        let mut answers = Vec::with_capacity(self.shards.len());
        let mut last_error = None;
        for (shard, result) in self.shards.iter().zip(join_all(requests).await) {
            match result {
                Ok(answer) => answers.push(answer),
                Err(e) => {
                    debug!("log {}: {} did not answer: {}", log, shard, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if answers.is_empty() => Err(e),
            _ => Ok(answers),
        }
    }
}

#[async_trait]
impl LogClient for LoopbackLogClient {
    async fn append(&self, log: LogId, payload: Bytes) -> Result<Lsn> {
        self.sequencers.append(log, payload).await
    }

    async fn read(&self, log: LogId, from: Lsn, to: Lsn) -> Result<Vec<(Lsn, Bytes)>> {
        if from > to {
            return Ok(Vec::new());
        }
        let clean = match self.sequencers.context().epoch_store.get_last_clean_epoch(log).await {
            Ok(clean) => Some(clean),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let answers = self
            .ask_all(log, |client| async move { client.read(log, from, to).await })
            .await?;
        Ok(merge_reads(answers, clean))
    }

    async fn tail(&self, log: LogId) -> Result<Lsn> {
        let states = self
            .ask_all(log, |client| async move { client.log_state(log).await })
            .await?;
        states
            .iter()
            .map(|state| state.last_released)
            .max()
            .ok_or_else(|| Error::ServiceUnavailable(format!("no shard knows log {log}")))
    }
}
