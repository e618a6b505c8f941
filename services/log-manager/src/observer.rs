//! Cluster observation interface.
//!
//! The reconcile loop only needs two answers from the cluster: which log
//! sources exist right now, and which agents of a fleet are running.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use logfleet_reconcile::{Agent, Declaration, LogSource};
use thiserror::Error;

/// Observation errors. All of them abandon the current reconcile tick.
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("unsupported workload kind {kind:?} for declaration {declaration}")]
    UnsupportedKind { declaration: String, kind: String },

    #[error("workload {declaration} has no usable pod selector")]
    EmptySelector { declaration: String },

    #[error("declaration {0} was not resolved at startup")]
    Unresolved(String),
}

/// Where a fleet of agents runs and how to recognize its pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSpec {
    /// Namespace of the agent pods.
    pub namespace: String,

    /// Labels carried by every agent pod.
    pub labels: BTreeMap<String, String>,

    /// Directory under which each agent has its own config directory.
    pub conf_root: PathBuf,
}

impl FleetSpec {
    /// Comma-separated label selector matching the fleet's pods.
    pub fn selector(&self) -> String {
        label_selector(&self.labels)
    }

    /// The agent running in pod `pod_name`.
    pub fn agent(&self, pod_name: &str) -> Agent {
        Agent::new(pod_name, self.conf_root.join(pod_name))
    }
}

/// Render `labels` as a `k=v,k=v` selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Source of truth for live log sources and agents.
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    /// List the log sources currently produced by `declarations`.
    async fn list_sources(&self, declarations: &[Declaration]) -> Result<Vec<LogSource>, ObserveError>;

    /// List the running agents of `fleet`.
    async fn list_agents(&self, fleet: &FleetSpec) -> Result<Vec<Agent>, ObserveError>;
}
