//! Log agent management.
//!
//! An [`AgentManager`] knows how one collector technology is deployed and
//! configured. The reconcile engine only talks to this trait; supporting a
//! new collector means adding an [`AgentType`] variant and an
//! implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use logfleet_reconcile::{Agent, LogSource, ReconcileError};
use thiserror::Error;

use crate::observer::{ClusterObserver, ObserveError};

pub mod logkit;

pub use logkit::LogkitAgentManager;

/// Collector technologies the manager can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentType {
    Logkit,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logkit => f.write_str("logkit"),
        }
    }
}

/// Agent management errors. All of them are retried by the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Template(#[from] ReconcileError),

    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid config template: {0}")]
    InvalidTemplate(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Observe(#[from] ObserveError),

    #[error("cannot deploy agents: {0}")]
    Deploy(String),
}

impl AgentError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Settings shared by every agent manager.
#[derive(Debug, Clone)]
pub struct AgentManagerConfig {
    /// Name of the log manager instance; the fleet is named after it.
    pub name: String,

    /// Namespace the fleet runs in.
    pub namespace: String,

    /// Directory the workload log volumes are mounted under.
    pub sources_root: PathBuf,

    /// Directory the agents' config directories are mounted under.
    pub agents_root: PathBuf,

    /// Agent container image.
    pub image: String,

    /// Replicas to deploy.
    pub replicas: i32,

    /// Volume claim shared with the agents.
    pub claim: Option<String>,
}

/// Operations on a fleet of log agents.
#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Deploy the agent fleet. An existing fleet is left as is.
    async fn deploy(&self) -> Result<(), AgentError>;

    /// List the running agents.
    async fn list(&self) -> Result<Vec<Agent>, AgentError>;

    /// Write the config of `source` to `agent`, returning its path.
    ///
    /// Overwrites an existing config.
    async fn add_config(&self, source: &LogSource, agent: &str) -> Result<PathBuf, AgentError>;

    /// Remove the config of `source` from `agent`. A missing config is not
    /// an error.
    async fn del_config(&self, source: &LogSource, agent: &str) -> Result<(), AgentError>;

    /// Check whether `agent` has finished collecting `source`.
    async fn check_lag(&self, source: &LogSource, agent: &str) -> bool;

    /// Resolve the agent a config file belongs to.
    fn agent_name_from_conf(&self, path: &Path) -> Option<String>;

    /// Release local resources of a source that is gone for good.
    async fn release(&self, _source: &LogSource) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Create the agent manager for `agent_type`.
pub fn new_agent_manager(
    agent_type: AgentType,
    config: AgentManagerConfig,
    observer: Arc<dyn ClusterObserver>,
    client: Option<kube::Client>,
) -> Arc<dyn AgentManager> {
    match agent_type {
        AgentType::Logkit => {
            let manager = LogkitAgentManager::new(config, observer);
            match client {
                Some(client) => Arc::new(manager.with_client(client)),
                None => Arc::new(manager),
            }
        }
    }
}
