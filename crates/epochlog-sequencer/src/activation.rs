//! Claiming an epoch in the epoch store

use crate::context::SequencerContext;
use epochlog_common::{Counter, Error, ExponentialBackoff, LogId, Result};
use epochlog_epoch_store::{
    BumpEpochUpdater, EpochMetaData, ExpectedPrior, LogMetaData, ProvisionUpdater,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A freshly claimed epoch and the record it was claimed in
#[derive(Clone, Debug)]
pub struct Activation {
    pub metadata: EpochMetaData,
    pub record: LogMetaData,
}

/// Claim the epoch after the one in `observed`, or epoch 1 if the log has
/// no metadata yet.
///
/// Losing the conditional write to another node is `Preempted`. Losing it
/// to an earlier attempt of this node is `Conflict`, and the caller should
/// read again and retry.
pub async fn claim_epoch(
    ctx: &SequencerContext,
    log: LogId,
    observed: Option<&LogMetaData>,
) -> Result<Activation> {
    let attrs = ctx.logs.attributes(log).ok_or(Error::NotFound(log))?;
    let nodes = Arc::clone(&ctx.nodes);
    let store = &ctx.epoch_store;
    let written = match observed {
        None => {
            let updater =
                ProvisionUpdater::new(nodes, attrs.replication, attrs.nodeset_size, ctx.node);
            store
                .create_or_update_metadata(log, &updater, ExpectedPrior::Absent)
                .await
        }
        Some(record) => {
            let updater =
                BumpEpochUpdater::new(nodes, attrs.replication, attrs.nodeset_size, ctx.node);
            store
                .create_or_update_metadata(log, &updater, ExpectedPrior::Epoch(record.current.epoch))
                .await
        }
    };

    match written {
        Ok(metadata) => {
            let record = store.read_metadata(log).await?;
            if record.current.epoch != metadata.epoch {
                return Err(preempted_by(ctx, &record));
            }
            Ok(Activation { metadata, record })
        }
        Err(Error::Conflict(reason)) => {
            let record = store.read_metadata(log).await?;
            match record.current.written_by {
                Some(by) if by != ctx.node => Err(Error::Preempted {
                    by,
                    epoch: record.current.epoch,
                }),
                _ => {
                    debug!("log {}: lost epoch race to an earlier attempt: {}", log, reason);
                    Err(Error::conflict(reason))
                }
            }
        }
        Err(e) => Err(e),
    }
}

fn preempted_by(ctx: &SequencerContext, record: &LogMetaData) -> Error {
    Error::Preempted {
        by: record.current.written_by.unwrap_or(ctx.node),
        epoch: record.current.epoch,
    }
}

async fn try_activate(ctx: &SequencerContext, log: LogId) -> Result<Activation> {
    let observed = match ctx.epoch_store.read_metadata(log).await {
        Ok(record) => Some(record),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    claim_epoch(ctx, log, observed.as_ref()).await
}

/// Claim a new epoch for `log`, retrying unavailability and races with this
/// node's own earlier attempts with backoff
pub async fn activate(ctx: &SequencerContext, log: LogId) -> Result<Activation> {
    let attempts = ctx.sequencer.activation_retries.max(1);
    let mut backoff = ExponentialBackoff::new(ctx.sequencer.activation_backoff.clone());
    let mut last_error = None;
    for attempt in 1..=attempts {
        let result = tokio::time::timeout(ctx.sequencer.activation_timeout(), try_activate(ctx, log))
            .await
            .unwrap_or(Err(Error::Timeout));
        match result {
            Ok(activation) => {
                ctx.stats.bump(Counter::SequencerActivations);
                info!(
                    "log {}: activated sequencer on {} in epoch {}",
                    log, ctx.node, activation.metadata.epoch
                );
                return Ok(activation);
            }
            Err(e) if e.is_retryable() || matches!(e, Error::Conflict(_)) => {
                warn!("log {}: activation attempt {}/{} failed: {}", log, attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    backoff.wait().await;
                }
            }
            Err(e) => {
                ctx.stats.bump(Counter::SequencerActivationFailures);
                return Err(e);
            }
        }
    }
    ctx.stats.bump(Counter::SequencerActivationFailures);
    Err(Error::Failed(format!(
        "log {log}: activation gave up after {attempts} attempts: {}",
        last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
    )))
}
