//! logfleet log manager.
//!
//! Keeps a fleet of log-collector agents configured so that every pod of a
//! declared workload has its log volume collected by exactly one agent.
//!
//! ## Architecture
//!
//! - **Declarations**: which workloads to collect, loaded once at startup
//! - **Observer**: lists the live pods of those workloads and of the agents
//! - **Reconciler**: folds observations into the match state and queues work
//! - **Workers**: add, delete or move agent configs
//! - **Agent manager**: the collector-specific side (logkit for now)

pub mod agent;
pub mod config;
pub mod declarations;
pub mod kube_observer;
pub mod manager;
pub mod observer;

pub use agent::{new_agent_manager, AgentError, AgentManager, AgentManagerConfig, AgentType};
pub use config::Config;
pub use declarations::load_declarations;
pub use manager::{LogManager, ManagerOptions};
pub use observer::{ClusterObserver, FleetSpec, ObserveError};
