//! The reconcile loop.
//!
//! Every tick:
//! 1. Lists the live sources and agents; any failure abandons the tick
//! 2. Folds them into the match state and schedules unassigned sources
//! 3. Asks the agents whether sources pending deletion are drained
//! 4. Queues every key that needs an add, delete or move

use std::sync::Arc;
use std::time::Duration;

use logfleet_reconcile::Declaration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::Context;
use crate::agent::AgentError;
use crate::observer::{ClusterObserver, ObserveError};

/// Why a tick was abandoned.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to list log sources: {0}")]
    Sources(#[from] ObserveError),

    #[error("failed to list log agents: {0}")]
    Agents(#[from] AgentError),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// Outcome of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub sources: usize,
    pub agents: usize,
    pub added: usize,
    pub vanished: usize,
    pub scheduled: usize,
    pub unplaced: usize,
    pub drained: usize,
    pub enqueued: usize,
}

/// Periodic driver of the match state.
pub struct Reconciler {
    ctx: Context,
    observer: Arc<dyn ClusterObserver>,
    declarations: Arc<Vec<Declaration>>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        ctx: Context,
        observer: Arc<dyn ClusterObserver>,
        declarations: Arc<Vec<Declaration>>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            observer,
            declarations,
            interval,
        }
    }

    /// Run ticks until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            declarations = self.declarations.len(),
            "Starting reconcile loop"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.enqueued > 0 => {
                            info!(
                                sources = stats.sources,
                                agents = stats.agents,
                                scheduled = stats.scheduled,
                                enqueued = stats.enqueued,
                                "Reconcile tick complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Reconcile tick abandoned, will retry"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconcile loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconcile tick.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickStats, TickError> {
        let timeout = self.ctx.action_timeout;

        let sources = tokio::time::timeout(timeout, self.observer.list_sources(&self.declarations))
            .await
            .map_err(|_| TickError::Timeout("listing log sources", timeout))??;
        let agents = tokio::time::timeout(timeout, self.ctx.agents.list())
            .await
            .map_err(|_| TickError::Timeout("listing log agents", timeout))??;

        let mut stats = TickStats {
            sources: sources.len(),
            agents: agents.len(),
            ..Default::default()
        };

        let (plan, draining) = {
            let mut state = self.ctx.state.lock().await;
            let source_diff = state.update_sources(sources);
            state.update_agents(agents);
            stats.added = source_diff.added.len();
            stats.vanished = source_diff.vanished.len();
            (state.plan(), state.awaiting_drain())
        };
        stats.scheduled = plan.scheduled;
        stats.unplaced = plan.unplaced;
        if plan.unplaced > 0 {
            warn!(unplaced = plan.unplaced, "No log agent available for some sources");
        }

        for (source, agent) in draining {
            match tokio::time::timeout(timeout, self.ctx.agents.check_lag(&source, &agent)).await {
                Ok(true) => {
                    info!(key = %source.key, agent = %agent, "Log source drained");
                    self.ctx.state.lock().await.mark_collection_done(&source.key);
                    stats.drained += 1;
                }
                Ok(false) => debug!(key = %source.key, agent = %agent, "Log source still draining"),
                Err(_) => error!(key = %source.key, agent = %agent, "Lag check timed out"),
            }
        }

        for (key, action) in plan.work {
            debug!(key = %key, action = %action, "Enqueueing log source");
            self.ctx.queue.add(key);
            stats.enqueued += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_error_display() {
        let e = TickError::Timeout("listing log agents", Duration::from_secs(30));
        assert_eq!(e.to_string(), "listing log agents timed out after 30s");
    }
}
