//! logkit agent manager.
//!
//! Agents are the pods of the Deployment `logkit-{name}`. Each agent reads
//! runner configs from its own directory `{agents_root}/{pod}`, which the
//! manager shares through a volume; adding a source writes one JSON file
//! there, removing it deletes the file.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use logfleet_reconcile::{Agent, LogSource};
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentManager, AgentManagerConfig};
use crate::observer::{ClusterObserver, FleetSpec};

pub mod deploy;
pub mod render;

pub use render::{config_file_name, render_config};

/// Agent manager for logkit collectors.
pub struct LogkitAgentManager {
    config: AgentManagerConfig,
    fleet: FleetSpec,
    observer: Arc<dyn ClusterObserver>,
    client: Option<kube::Client>,
}

impl LogkitAgentManager {
    pub fn new(config: AgentManagerConfig, observer: Arc<dyn ClusterObserver>) -> Self {
        let fleet = FleetSpec {
            namespace: config.namespace.clone(),
            labels: deploy::fleet_labels(&config.name),
            conf_root: config.agents_root.clone(),
        };
        Self {
            config,
            fleet,
            observer,
            client: None,
        }
    }

    /// Use `client` to deploy the fleet.
    pub fn with_client(mut self, client: kube::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn fleet(&self) -> &FleetSpec {
        &self.fleet
    }

    /// Path of the config of `source` on `agent`.
    pub fn config_path(&self, source: &LogSource, agent: &str) -> PathBuf {
        self.config
            .agents_root
            .join(agent)
            .join(config_file_name(source))
    }
}

#[async_trait]
impl AgentManager for LogkitAgentManager {
    async fn deploy(&self) -> Result<(), AgentError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| AgentError::Deploy("no kubernetes client configured".to_string()))?;

        let deployment = deploy::fleet_deployment(&self.config);
        let api = Api::<Deployment>::namespaced(client, &self.config.namespace);

        match api.create(&PostParams::default(), &deployment).await {
            Ok(_) => {
                info!(
                    deployment = %deploy::deploy_name(&self.config.name),
                    namespace = %self.config.namespace,
                    "Deployed logkit agents"
                );
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                info!(
                    deployment = %deploy::deploy_name(&self.config.name),
                    "logkit agent deployment already exists"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Agent>, AgentError> {
        Ok(self.observer.list_agents(&self.fleet).await?)
    }

    async fn add_config(&self, source: &LogSource, agent: &str) -> Result<PathBuf, AgentError> {
        let content = render_config(source, &self.config.sources_root)?;
        let path = self.config_path(source, agent);
        write_atomic(&path, &content).await?;
        debug!(key = %source.key, agent, path = %path.display(), "Wrote logkit runner config");
        Ok(path)
    }

    async fn del_config(&self, source: &LogSource, agent: &str) -> Result<(), AgentError> {
        let path = self.config_path(source, agent);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %source.key, agent, path = %path.display(), "Removed logkit runner config");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::io(&path, e)),
        }
    }

    async fn check_lag(&self, source: &LogSource, agent: &str) -> bool {
        let log_dir = source.log_dir(&self.config.sources_root);
        let meta_dir = source.meta_dir(&self.config.sources_root);
        match drained(&log_dir, &meta_dir).await {
            Ok(done) => done,
            Err(e) => {
                warn!(key = %source.key, agent, error = %e, "Failed to check collection lag");
                false
            }
        }
    }

    fn agent_name_from_conf(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.config.agents_root).ok()?;
        let mut components = relative.components();
        let agent = match components.next()? {
            Component::Normal(name) => name.to_str()?.to_string(),
            _ => return None,
        };
        // The agent dir itself is not a config.
        components.next()?;
        Some(agent)
    }

    async fn release(&self, source: &LogSource) -> Result<(), AgentError> {
        let log_dir = source.log_dir(&self.config.sources_root);
        match tokio::fs::remove_dir_all(&log_dir).await {
            Ok(()) => {
                info!(key = %source.key, dir = %log_dir.display(), "Removed log dir");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::io(&log_dir, e)),
        }
    }
}

/// Write `content` to `path` through a temporary file and a rename, so an
/// agent never reads a partial config.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), AgentError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AgentError::io(dir, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| AgentError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AgentError::io(path, e))
}

/// A source is drained once logkit has recorded offsets after the last
/// write to any of its log files. A missing log dir has nothing left.
async fn drained(log_dir: &Path, meta_dir: &Path) -> std::io::Result<bool> {
    let Some(last_write) = newest_mtime(log_dir).await? else {
        return Ok(true);
    };
    let Some(last_offset) = newest_mtime(meta_dir).await? else {
        return Ok(false);
    };
    Ok(last_offset >= last_write)
}

/// Newest modification time of the files directly in `dir`. `None` if the
/// dir is missing or holds no files.
async fn newest_mtime(dir: &Path) -> std::io::Result<Option<SystemTime>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut newest = None;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        if newest.is_none_or(|n| modified > n) {
            newest = Some(modified);
        }
    }
    Ok(newest)
}
