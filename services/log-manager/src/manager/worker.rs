//! Workers that carry out the actions the reconcile loop queued.
//!
//! A worker snapshots the record under the lock, calls the agent with the
//! lock released, and reacquires it to record the result. A key that fails
//! goes back on the queue with backoff; one that cannot make progress yet
//! is retried at the base delay.

use std::future::Future;
use std::time::Duration;

use logfleet_reconcile::{
    Action, ConfigRef, DeleteCompletion, LogSource, MatchState, SourceKey,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::agent::AgentError;

/// Result of one successful sync of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The record converged or no longer needs work.
    Done,

    /// Nothing failed but the record cannot converge yet (no agent, or
    /// collection still draining). Retried after the base backoff delay,
    /// without growing the key's backoff.
    Pending,
}

/// A failed sync. Always retried.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{op} failed: {source}")]
    Agent {
        op: &'static str,
        #[source]
        source: AgentError,
    },

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

/// A queue consumer.
pub struct Worker {
    id: usize,
    ctx: Context,
}

impl Worker {
    pub fn new(id: usize, ctx: Context) -> Self {
        Self { id, ctx }
    }

    /// Process keys until the queue shuts down.
    pub async fn run(&self) {
        debug!(worker = self.id, "Worker started");
        while self.process_next().await {}
        debug!(worker = self.id, "Worker stopped");
    }

    /// Take one key off the queue and sync it. Returns false once the queue
    /// has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.ctx.queue.get().await else {
            return false;
        };

        match self.sync(&key).await {
            Ok(SyncOutcome::Done) => self.ctx.queue.forget(&key),
            Ok(SyncOutcome::Pending) => {
                debug!(key = %key, "Log source not ready, requeueing");
                let delay = self.ctx.queue.backoff().base;
                self.ctx.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = self.ctx.queue.num_requeues(&key),
                    "Failed to sync log source, requeueing"
                );
                self.ctx.queue.add_rate_limited(key.clone());
            }
        }

        self.ctx.queue.done(&key);
        true
    }

    /// Converge the record of `key`.
    #[instrument(skip(self), fields(worker = self.id))]
    pub async fn sync(&self, key: &SourceKey) -> Result<SyncOutcome, SyncError> {
        let Some((source, record)) = self.ctx.state.lock().await.snapshot(key) else {
            debug!("Log source already removed");
            return Ok(SyncOutcome::Done);
        };

        let state = record.state();
        debug!(action = %Action::from(state), "Syncing log source");

        match state {
            MatchState::Unassigned { agent: None } => Ok(SyncOutcome::Pending),
            MatchState::Unassigned { agent: Some(agent) } => self.add(&source, agent).await,
            MatchState::PendingDelete { agent, .. } => self.delete(&source, agent).await,
            MatchState::Moving { agent, conf } => self.relocate(&source, agent, conf).await,
            MatchState::Assigned { .. } | MatchState::Orphaned { .. } | MatchState::Detached => {
                Ok(SyncOutcome::Done)
            }
        }
    }

    async fn add(&self, source: &LogSource, agent: &str) -> Result<SyncOutcome, SyncError> {
        let path = self
            .call("add_config", self.ctx.agents.add_config(source, agent))
            .await?;

        let recorded = self
            .ctx
            .state
            .lock()
            .await
            .record_config(&source.key, ConfigRef::new(path, agent));
        if recorded {
            info!(key = %source.key, agent, "Added log source to agent");
        } else {
            debug!(key = %source.key, "Log source removed while adding");
        }
        Ok(SyncOutcome::Done)
    }

    async fn delete(&self, source: &LogSource, agent: &str) -> Result<SyncOutcome, SyncError> {
        if !source.collection_done {
            debug!(key = %source.key, agent, "Waiting for agent to drain log source");
            return Ok(SyncOutcome::Pending);
        }

        self.call("del_config", self.ctx.agents.del_config(source, agent))
            .await?;

        let completion = self.ctx.state.lock().await.complete_delete(&source.key);
        match completion {
            DeleteCompletion::Removed => {
                info!(key = %source.key, agent, "Removed log source");
                if let Err(e) = self.call("release", self.ctx.agents.release(source)).await {
                    warn!(key = %source.key, error = %e, "Failed to release log source");
                }
            }
            DeleteCompletion::Revived => {
                info!(key = %source.key, "Log source came back during delete, adding again");
                self.ctx.queue.add(source.key.clone());
            }
            DeleteCompletion::Missing => debug!(key = %source.key, "Log source already removed"),
        }
        Ok(SyncOutcome::Done)
    }

    async fn relocate(
        &self,
        source: &LogSource,
        agent: &str,
        conf: &ConfigRef,
    ) -> Result<SyncOutcome, SyncError> {
        let previous = self
            .ctx
            .agents
            .agent_name_from_conf(&conf.path)
            .unwrap_or_else(|| conf.owner.clone());

        self.call("del_config", self.ctx.agents.del_config(source, &previous))
            .await?;
        let path = self
            .call("add_config", self.ctx.agents.add_config(source, agent))
            .await?;

        self.ctx
            .state
            .lock()
            .await
            .record_config(&source.key, ConfigRef::new(path, agent));
        info!(key = %source.key, from = %previous, to = agent, "Moved log source");
        Ok(SyncOutcome::Done)
    }

    /// Run an agent call bounded by the action timeout.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        let after = self.ctx.action_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result.map_err(|source| SyncError::Agent { op, source }),
            Err(_) => Err(SyncError::Timeout { op, after }),
        }
    }
}
