//! The log manager: reconcile loop plus workers around shared match state.
//!
//! ```text
//! ClusterObserver ─┐
//!                  ├─> Reconciler ──> ReconcileState ──> WorkQueue ──> Worker(s) ──> AgentManager
//! AgentManager ────┘        (diff, schedule, lag check)          (add / delete / move)
//! ```
//!
//! The reconciler and the workers share one [`ReconcileState`] behind a
//! single mutex. The lock is never held across a call to the cluster or
//! to an agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use logfleet_reconcile::{BackoffPolicy, Declaration, ReconcileState, SourceKey, WorkQueue};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::agent::AgentManager;
use crate::observer::ClusterObserver;

pub mod reconciler;
pub mod worker;

pub use reconciler::{Reconciler, TickError, TickStats};
pub use worker::{SyncError, SyncOutcome, Worker};

/// State and collaborators shared by the reconciler and the workers.
#[derive(Clone)]
pub struct Context {
    pub state: Arc<Mutex<ReconcileState>>,
    pub queue: WorkQueue<SourceKey>,
    pub agents: Arc<dyn AgentManager>,

    /// Bound on every agent call.
    pub action_timeout: Duration,
}

impl Context {
    pub fn new(agents: Arc<dyn AgentManager>, backoff: BackoffPolicy, action_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReconcileState::new())),
            queue: WorkQueue::new(backoff),
            agents,
            action_timeout,
        }
    }
}

/// Runtime options of the log manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub reconcile_interval: Duration,
    pub workers: usize,
    pub action_timeout: Duration,
    pub shutdown_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: logfleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
            workers: 1,
            action_timeout: logfleet_reconcile::DEFAULT_ACTION_TIMEOUT,
            shutdown_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The log manager.
pub struct LogManager {
    ctx: Context,
    reconciler: Reconciler,
    options: ManagerOptions,
}

impl LogManager {
    /// Observe the initial sources and agents, deploying the agent fleet if
    /// none is running.
    ///
    /// Any failure here is fatal: the manager does not start half blind.
    pub async fn bootstrap(
        declarations: Vec<Declaration>,
        observer: Arc<dyn ClusterObserver>,
        agents: Arc<dyn AgentManager>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let sources = observer
            .list_sources(&declarations)
            .await
            .context("failed to list log sources")?;
        info!(count = sources.len(), "Listed current log sources");

        let mut fleet = agents.list().await.context("failed to list log agents")?;
        if fleet.is_empty() {
            info!("No log agent running, deploying the agent fleet");
            agents.deploy().await.context("failed to deploy log agents")?;
            fleet = agents.list().await.context("failed to list log agents")?;
        }
        info!(count = fleet.len(), "Listed current log agents");

        let ctx = Context::new(agents, options.backoff.clone(), options.action_timeout);
        {
            let mut state = ctx.state.lock().await;
            state.update_sources(sources);
            state.update_agents(fleet);
        }

        let reconciler = Reconciler::new(
            ctx.clone(),
            observer,
            Arc::new(declarations),
            options.reconcile_interval,
        );

        Ok(Self {
            ctx,
            reconciler,
            options,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run the reconciler and the workers until `shutdown` flips to true.
    ///
    /// On shutdown no new tick starts, queued and in-flight keys get
    /// `shutdown_grace` to finish, then the queue is closed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.options.workers,
            interval_secs = self.options.reconcile_interval.as_secs(),
            "Starting log manager"
        );

        let reconciler = self.reconciler;
        let reconciler_handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { reconciler.run(shutdown).await }
        });

        let mut workers = JoinSet::new();
        for id in 0..self.options.workers {
            let worker = Worker::new(id, self.ctx.clone());
            workers.spawn(async move { worker.run().await });
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        if let Err(e) = reconciler_handle.await {
            error!(error = %e, "Reconciler task failed");
        }

        info!(queued = self.ctx.queue.len(), "Draining work queue");
        if tokio::time::timeout(self.options.shutdown_grace, self.ctx.queue.shut_down_with_drain())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.options.shutdown_grace.as_secs(),
                "Work queue did not drain in time, aborting workers"
            );
            workers.abort_all();
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Worker task failed");
                }
            }
        }

        info!("Log manager stopped");
    }
}
