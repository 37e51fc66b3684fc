//! Sequencers and recovery
//!
//! A sequencer owns one log on one node: it claims an epoch in the epoch
//! store, recovers the epochs its predecessors left unclean, then hands out
//! LSNs and drives the write path. Sequencers live on a fixed pool of
//! worker tasks ([`AllSequencers`]); everything that touches a sequencer is
//! a message to the worker that owns its log.

pub mod activation;
pub mod context;
pub mod control;
pub mod recovery;
pub mod sequencer;
pub mod worker;
mod write;

pub use activation::{Activation, activate, claim_epoch};
pub use context::SequencerContext;
pub use control::ClusterControl;
pub use recovery::{EpochRecovery, EpochRecoveryOutcome, recover_log};
pub use sequencer::{RecoveryStatus, SequencerState, SequencerStatus};
pub use worker::AllSequencers;
