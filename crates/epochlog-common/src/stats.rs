//! Server-wide counters with a Prometheus text exporter
//!
//! One [`Stats`] registry per server, shared as `Arc<Stats>` by every
//! component that reports progress or failures.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    SequencerActivations,
    SequencerActivationFailures,
    SequencerPreemptions,
    EpochStoreReads,
    EpochStoreWrites,
    EpochStoreConflicts,
    RecoveriesStarted,
    RecoveriesCompleted,
    RecoveryRoundsRetried,
    GapsPlugged,
    RecordsReplicated,
    AppendsAccepted,
    AppendsDeferred,
    AppendsFailed,
    PermanentErrors,
    FailingShards,
    SnapshotsTaken,
    DeltasApplied,
    DeltasRejected,
}

impl Counter {
    pub const ALL: [Self; 19] = [
        Self::SequencerActivations,
        Self::SequencerActivationFailures,
        Self::SequencerPreemptions,
        Self::EpochStoreReads,
        Self::EpochStoreWrites,
        Self::EpochStoreConflicts,
        Self::RecoveriesStarted,
        Self::RecoveriesCompleted,
        Self::RecoveryRoundsRetried,
        Self::GapsPlugged,
        Self::RecordsReplicated,
        Self::AppendsAccepted,
        Self::AppendsDeferred,
        Self::AppendsFailed,
        Self::PermanentErrors,
        Self::FailingShards,
        Self::SnapshotsTaken,
        Self::DeltasApplied,
        Self::DeltasRejected,
    ];

    /// Metric name without prefix
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SequencerActivations => "sequencer_activations_total",
            Self::SequencerActivationFailures => "sequencer_activation_failures_total",
            Self::SequencerPreemptions => "sequencer_preemptions_total",
            Self::EpochStoreReads => "epoch_store_reads_total",
            Self::EpochStoreWrites => "epoch_store_writes_total",
            Self::EpochStoreConflicts => "epoch_store_conflicts_total",
            Self::RecoveriesStarted => "recoveries_started_total",
            Self::RecoveriesCompleted => "recoveries_completed_total",
            Self::RecoveryRoundsRetried => "recovery_rounds_retried_total",
            Self::GapsPlugged => "recovery_gaps_plugged_total",
            Self::RecordsReplicated => "recovery_records_replicated_total",
            Self::AppendsAccepted => "appends_accepted_total",
            Self::AppendsDeferred => "appends_deferred_total",
            Self::AppendsFailed => "appends_failed_total",
            Self::PermanentErrors => "storage_permanent_errors_total",
            Self::FailingShards => "storage_failing_shards_total",
            Self::SnapshotsTaken => "rsm_snapshots_taken_total",
            Self::DeltasApplied => "rsm_deltas_applied_total",
            Self::DeltasRejected => "rsm_deltas_rejected_total",
        }
    }

    const fn help(self) -> &'static str {
        match self {
            Self::SequencerActivations => "Sequencers that claimed an epoch",
            Self::SequencerActivationFailures => "Activations that gave up",
            Self::SequencerPreemptions => "Sequencers preempted by a higher epoch",
            Self::EpochStoreReads => "Epoch store metadata reads",
            Self::EpochStoreWrites => "Successful epoch store conditional writes",
            Self::EpochStoreConflicts => "Epoch store conditional write conflicts",
            Self::RecoveriesStarted => "Epoch recoveries started",
            Self::RecoveriesCompleted => "Epoch recoveries completed",
            Self::RecoveryRoundsRetried => "Recovery rounds retried after missing quorum",
            Self::GapsPlugged => "Offsets plugged with a gap by recovery",
            Self::RecordsReplicated => "Record copies written by recovery",
            Self::AppendsAccepted => "Appends assigned an LSN",
            Self::AppendsDeferred => "Appends rejected with a retryable status",
            Self::AppendsFailed => "Appends failed",
            Self::PermanentErrors => "Logs poisoned by a permanent storage error",
            Self::FailingShards => "Shards switched to the failing store",
            Self::SnapshotsTaken => "Replicated state machine snapshots written",
            Self::DeltasApplied => "Replicated state machine deltas applied",
            Self::DeltasRejected => "Replicated state machine deltas rejected",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Counter registry
#[derive(Debug)]
pub struct Stats {
    counters: [AtomicU64; Counter::ALL.len()],
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn bump(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Render every counter in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self, prefix: &str) -> String {
        let mut output = String::new();
        for counter in Counter::ALL {
            let name = counter.name();
            let _ = writeln!(output, "# HELP {prefix}_{name} {}", counter.help());
            let _ = writeln!(output, "# TYPE {prefix}_{name} counter");
            let _ = writeln!(output, "{prefix}_{name} {}", self.get(counter));
        }
        output
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
