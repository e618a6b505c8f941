//! Reconciliation engine for the log manager.
//!
//! This library holds everything needed to keep log-collector agents
//! configured for the live log sources of a cluster, independent of how
//! the cluster is observed or how agents are configured:
//!
//! - **Sources and agents**: what must be collected and who collects it.
//! - **Match state**: per-source record of pod presence, assigned agent and
//!   written config, plus the diff that folds fresh observations into it.
//! - **Scheduling**: least-loaded placement of sources onto agents.
//! - **Classification**: the action a match needs (add, delete, move, none).
//! - **Work queue**: de-duplicating, rate-limited queue driving side effects.
//!
//! # Invariants
//!
//! - Exactly one match per known source
//! - A source is only forgotten after its config has been removed
//! - Classification is a pure function of the match, re-evaluated whenever
//!   a key is processed

use std::time::Duration;

use thiserror::Error;

pub mod matching;
pub mod queue;
pub mod scheduler;
pub mod source;
pub mod state;

pub use matching::{Action, ConfigRef, Match, MatchState};
pub use queue::{BackoffPolicy, WorkQueue};
pub use source::{Agent, Declaration, LogSource, SourceKey};
pub use state::{AgentDiff, DeleteCompletion, Plan, ReconcileState, SourceDiff};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Source not found in the known set.
    #[error("log source not found: {0}")]
    SourceNotFound(SourceKey),

    /// No agent is known to schedule onto.
    #[error("no log agent available for {0}")]
    NoAgent(SourceKey),

    /// Declaration template cannot be parsed.
    #[error("invalid config template for {declaration}: {source}")]
    InvalidTemplate {
        declaration: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(3);

/// Default bound on a single agent call.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);
