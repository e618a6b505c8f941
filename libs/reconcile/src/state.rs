//! Reconciliation ground truth.
//!
//! [`ReconcileState`] owns the known sources, the known agents and one
//! [`Match`] per known source. The reconcile loop and the workers share it
//! behind a single lock; every method here is one read-modify-write step.
//!
//! # Invariants
//!
//! - `matches` and `sources` always have the same key set
//! - A source is only removed by [`ReconcileState::complete_delete`]
//! - No match references an agent that is absent from `agents` once
//!   [`ReconcileState::update_agents`] has run

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::matching::{Action, ConfigRef, Match, MatchState};
use crate::scheduler;
use crate::source::{Agent, LogSource, SourceKey};
use crate::ReconcileError;

/// Changes applied by [`ReconcileState::update_sources`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceDiff {
    pub added: Vec<SourceKey>,
    pub vanished: Vec<SourceKey>,
    pub revived: Vec<SourceKey>,
}

/// Changes applied by [`ReconcileState::update_agents`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgentDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Sources whose agent vanished and must be rescheduled.
    pub unassigned: Vec<SourceKey>,
}

/// Output of a planning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Sources that were given an agent during this pass.
    pub scheduled: usize,

    /// Sources the scheduler could not place (no agent known).
    pub unplaced: usize,

    /// Keys that need a worker, with the action they classified as.
    pub work: Vec<(SourceKey, Action)>,
}

/// Result of finishing a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCompletion {
    /// Source and match were removed.
    Removed,

    /// The pod came back while the config was being removed. The records
    /// are kept and the config reference cleared so it is added again.
    Revived,

    /// The source was already gone.
    Missing,
}

/// Known sources, known agents and their matches.
#[derive(Debug, Default)]
pub struct ReconcileState {
    sources: BTreeMap<SourceKey, LogSource>,
    agents: BTreeMap<String, Agent>,
    matches: BTreeMap<SourceKey, Match>,
}

impl ReconcileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> &BTreeMap<SourceKey, LogSource> {
        &self.sources
    }

    pub fn agents(&self) -> &BTreeMap<String, Agent> {
        &self.agents
    }

    pub fn matches(&self) -> &BTreeMap<SourceKey, Match> {
        &self.matches
    }

    pub fn get(&self, key: &SourceKey) -> Option<(&LogSource, &Match)> {
        Some((self.sources.get(key)?, self.matches.get(key)?))
    }

    /// Owned copy of a source and its match, for use outside the lock.
    pub fn snapshot(&self, key: &SourceKey) -> Option<(LogSource, Match)> {
        self.get(key)
            .map(|(source, m)| (source.clone(), m.clone()))
    }

    /// Fold a fresh list of observed sources into the known set.
    ///
    /// New sources get an empty match. Known sources missing from
    /// `observed` lose their pod presence but keep agent and config, which
    /// marks them for deletion. A source marked absent that is observed
    /// again is revived.
    pub fn update_sources(&mut self, observed: Vec<LogSource>) -> SourceDiff {
        let mut diff = SourceDiff::default();
        let mut seen = BTreeSet::new();

        for source in observed {
            let key = source.key.clone();
            seen.insert(key.clone());

            if !self.sources.contains_key(&key) {
                info!(key = %key, pod = %source.pod_name, "Found new log source");
                self.sources.insert(key.clone(), source);
                self.matches.insert(key.clone(), Match::observed());
                diff.added.push(key);
                continue;
            }

            let m = self.matches.entry(key.clone()).or_insert_with(Match::observed);
            if !m.pod_present {
                info!(key = %key, "Log source pod observed again");
                m.pod_present = true;
                if let Some(known) = self.sources.get_mut(&key) {
                    known.collection_done = false;
                }
                diff.revived.push(key);
            }
        }

        for (key, m) in self.matches.iter_mut() {
            if m.pod_present && !seen.contains(key) {
                info!(key = %key, "Log source pod disappeared");
                m.pod_present = false;
                diff.vanished.push(key.clone());
            }
        }

        diff
    }

    /// Fold a fresh list of observed agents into the known set.
    ///
    /// Matches pointing at a vanished agent lose their assignment. Vanished
    /// agents are dropped from the known set so they are never scheduled.
    pub fn update_agents(&mut self, observed: Vec<Agent>) -> AgentDiff {
        let mut diff = AgentDiff::default();
        let current: BTreeMap<String, Agent> = observed
            .into_iter()
            .map(|agent| (agent.name.clone(), agent))
            .collect();

        for (key, m) in self.matches.iter_mut() {
            let Some(agent) = m.agent.as_deref() else {
                continue;
            };
            if !current.contains_key(agent) {
                info!(key = %key, agent, "Assigned agent no longer exists, unassigning");
                m.agent = None;
                diff.unassigned.push(key.clone());
            }
        }

        let gone: Vec<String> = self
            .agents
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            info!(agent = %name, "Log agent removed");
            self.agents.remove(&name);
            diff.removed.push(name);
        }

        for (name, agent) in current {
            if !self.agents.contains_key(&name) {
                info!(agent = %name, "Found new log agent");
                self.agents.insert(name.clone(), agent);
                diff.added.push(name);
            }
        }

        diff
    }

    /// Assign the least loaded known agent to `key`.
    pub fn schedule(&mut self, key: &SourceKey) -> Result<String, ReconcileError> {
        if !self.matches.contains_key(key) {
            return Err(ReconcileError::SourceNotFound(key.clone()));
        }
        let agent = scheduler::pick_agent(&self.agents, &self.matches)
            .ok_or_else(|| ReconcileError::NoAgent(key.clone()))?;
        if let Some(m) = self.matches.get_mut(key) {
            m.agent = Some(agent.clone());
        }
        debug!(key = %key, agent = %agent, "Scheduled log source");
        Ok(agent)
    }

    /// Schedule every live, unassigned source and collect the keys that
    /// need a worker.
    pub fn plan(&mut self) -> Plan {
        let mut plan = Plan::default();

        let unassigned: Vec<SourceKey> = self
            .matches
            .iter()
            .filter(|(_, m)| m.needs_scheduling())
            .map(|(key, _)| key.clone())
            .collect();

        for key in unassigned {
            match self.schedule(&key) {
                Ok(_) => plan.scheduled += 1,
                Err(e) => {
                    debug!(error = %e, "Log source left unscheduled");
                    plan.unplaced += 1;
                }
            }
        }

        plan.work = self
            .matches
            .iter()
            .map(|(key, m)| (key.clone(), m.action()))
            .filter(|(_, action)| action.needs_work())
            .collect();

        plan
    }

    /// Sources waiting for deletion whose collection is not yet done,
    /// paired with the agent that is draining them.
    pub fn awaiting_drain(&self) -> Vec<(LogSource, String)> {
        self.matches
            .iter()
            .filter_map(|(key, m)| match m.state() {
                MatchState::PendingDelete { agent, .. } => {
                    let source = self.sources.get(key)?;
                    (!source.collection_done).then(|| (source.clone(), agent.to_string()))
                }
                _ => None,
            })
            .collect()
    }

    /// Record that the agent finished draining `key`.
    pub fn mark_collection_done(&mut self, key: &SourceKey) -> bool {
        match self.sources.get_mut(key) {
            Some(source) => {
                source.collection_done = true;
                true
            }
            None => false,
        }
    }

    /// Record the config written for `key`. Returns false if the source is
    /// gone.
    pub fn record_config(&mut self, key: &SourceKey, conf: ConfigRef) -> bool {
        match self.matches.get_mut(key) {
            Some(m) => {
                m.conf = Some(conf);
                true
            }
            None => false,
        }
    }

    /// Finish a delete whose config has been removed.
    pub fn complete_delete(&mut self, key: &SourceKey) -> DeleteCompletion {
        let Some(m) = self.matches.get_mut(key) else {
            return DeleteCompletion::Missing;
        };

        if m.pod_present {
            m.conf = None;
            return DeleteCompletion::Revived;
        }

        self.matches.remove(key);
        self.sources.remove(key);
        DeleteCompletion::Removed
    }
}
