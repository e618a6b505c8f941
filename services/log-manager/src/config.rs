//! Configuration for the log manager.
//!
//! Every flag can also be set through a `LOGFLEET_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{Parser, ValueEnum};

use crate::agent::{AgentManagerConfig, AgentType};
use crate::manager::ManagerOptions;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Command line of the log manager.
#[derive(Debug, Parser)]
#[command(name = "log-manager", version, about = "Keeps log-collector agents configured for live pods")]
pub struct Args {
    /// Directory holding the log declaration files.
    #[arg(long, env = "LOGFLEET_LOG_CONFIG_DIR")]
    pub log_config_dir: PathBuf,

    /// Name of this log manager instance.
    #[arg(long, env = "LOGFLEET_NAME")]
    pub name: String,

    /// Namespace of this log manager instance.
    #[arg(long, env = "LOGFLEET_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Collector technology used for the agent fleet.
    #[arg(long, env = "LOGFLEET_AGENT_TYPE", value_enum, default_value_t = AgentType::Logkit)]
    pub agent_type: AgentType,

    /// Directory the workload log volumes are mounted under.
    #[arg(long, env = "LOGFLEET_SOURCES_ROOT", default_value = "/")]
    pub sources_root: PathBuf,

    /// Directory the agents' config directories are mounted under.
    #[arg(long, env = "LOGFLEET_AGENTS_ROOT", default_value = "/logkit")]
    pub agents_root: PathBuf,

    /// Container image of the collector agents.
    #[arg(long, env = "LOGFLEET_AGENT_IMAGE", default_value = "logkit:latest")]
    pub agent_image: String,

    /// Replicas of the agent fleet when it has to be deployed.
    #[arg(long, env = "LOGFLEET_AGENT_REPLICAS", default_value_t = 1)]
    pub agent_replicas: i32,

    /// Persistent volume claim shared between the manager and the agents.
    #[arg(long, env = "LOGFLEET_AGENT_CLAIM")]
    pub agent_claim: Option<String>,

    /// Seconds between reconcile ticks.
    #[arg(long, env = "LOGFLEET_RECONCILE_INTERVAL", default_value_t = 3)]
    pub reconcile_interval: u64,

    /// Number of concurrent workers.
    #[arg(long, env = "LOGFLEET_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Seconds a single agent call may take before it is retried.
    #[arg(long, env = "LOGFLEET_ACTION_TIMEOUT", default_value_t = 30)]
    pub action_timeout: u64,

    /// Seconds to wait for in-flight work on shutdown.
    #[arg(long, env = "LOGFLEET_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[arg(long, env = "LOGFLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOGFLEET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Log manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_config_dir: PathBuf,
    pub name: String,
    pub namespace: String,
    pub agent_type: AgentType,
    pub sources_root: PathBuf,
    pub agents_root: PathBuf,
    pub agent_image: String,
    pub agent_replicas: i32,
    pub agent_claim: Option<String>,
    pub reconcile_interval: Duration,
    pub workers: usize,
    pub action_timeout: Duration,
    pub shutdown_grace: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed arguments into a configuration.
    pub fn from_args(args: Args) -> Result<Self> {
        ensure!(!args.name.is_empty(), "--name must not be empty");
        ensure!(args.workers > 0, "--workers must be at least 1");
        ensure!(args.agent_replicas > 0, "--agent-replicas must be at least 1");
        ensure!(
            args.reconcile_interval > 0,
            "--reconcile-interval must be at least 1 second"
        );

        Ok(Self {
            log_config_dir: args.log_config_dir,
            name: args.name,
            namespace: args.namespace,
            agent_type: args.agent_type,
            sources_root: args.sources_root,
            agents_root: args.agents_root,
            agent_image: args.agent_image,
            agent_replicas: args.agent_replicas,
            agent_claim: args.agent_claim,
            reconcile_interval: Duration::from_secs(args.reconcile_interval),
            workers: args.workers,
            action_timeout: Duration::from_secs(args.action_timeout),
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }

    /// Parse the process arguments and environment.
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn agent_manager_config(&self) -> AgentManagerConfig {
        AgentManagerConfig {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            sources_root: self.sources_root.clone(),
            agents_root: self.agents_root.clone(),
            image: self.agent_image.clone(),
            replicas: self.agent_replicas,
            claim: self.agent_claim.clone(),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            reconcile_interval: self.reconcile_interval,
            workers: self.workers,
            action_timeout: self.action_timeout,
            shutdown_grace: self.shutdown_grace,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config> {
        let mut argv = vec![
            "log-manager",
            "--log-config-dir",
            "/etc/logfleet",
            "--name",
            "kirk",
        ];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv)?)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.agent_type, AgentType::Logkit);
        assert_eq!(config.reconcile_interval, Duration::from_secs(3));
        assert_eq!(config.workers, 1);
        assert_eq!(config.agents_root, PathBuf::from("/logkit"));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_overrides() {
        let config = parse(&["--workers", "4", "--log-format", "text", "--action-timeout", "5"]).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.action_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(parse(&["--workers", "0"]).is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = parse(&["--agent-claim", "logkit-pvc", "--shutdown-grace", "20"]).unwrap();

        let agents = config.agent_manager_config();
        assert_eq!(agents.name, "kirk");
        assert_eq!(agents.claim.as_deref(), Some("logkit-pvc"));
        assert_eq!(agents.image, "logkit:latest");

        let options = config.manager_options();
        assert_eq!(options.shutdown_grace, Duration::from_secs(20));
        assert_eq!(options.action_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_unknown_agent_type() {
        assert!(parse(&["--agent-type", "fluentd"]).is_err());
    }
}
