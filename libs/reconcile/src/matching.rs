//! Match records and action classification.
//!
//! A [`Match`] stores the raw observations for one source: whether its pod
//! is live, which agent the scheduler picked, and which config file was
//! written for it. The raw fields are mutated independently by the differ,
//! the scheduler and the workers, so the record itself admits every shape.
//! [`Match::state`] is the single translation from those fields into the
//! [`MatchState`] sum type, and the action is derived from that.
//!
//! | pod | agent | conf | owner != agent | state           | action |
//! |-----|-------|------|----------------|-----------------|--------|
//! | yes | any   | no   | -              | `Unassigned`    | Add    |
//! | no  | yes   | yes  | -              | `PendingDelete` | Delete |
//! | yes | yes   | yes  | yes            | `Moving`        | Move   |
//! | yes | yes   | yes  | no             | `Assigned`      | NoOp   |
//! | yes | no    | yes  | -              | `Orphaned`      | NoOp   |
//! | *   | *     | *    | *              | `Detached`      | NoOp   |

use std::fmt;
use std::path::PathBuf;

/// A config file written for a source, and the agent it was written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRef {
    pub path: PathBuf,
    pub owner: String,
}

impl ConfigRef {
    pub fn new(path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
        }
    }
}

/// Reconciliation record for one log source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Match {
    /// The source's pod was seen in the last observation.
    pub pod_present: bool,

    /// Agent the scheduler assigned the source to.
    pub agent: Option<String>,

    /// Config currently written for the source.
    pub conf: Option<ConfigRef>,
}

/// Shape of a match record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState<'a> {
    /// Pod is live and no config is written yet. `agent` is the scheduler's
    /// pick, if it made one.
    Unassigned { agent: Option<&'a str> },

    /// Config is written to the assigned agent.
    Assigned { agent: &'a str, conf: &'a ConfigRef },

    /// Config is written to an agent other than the assigned one.
    Moving { agent: &'a str, conf: &'a ConfigRef },

    /// Pod is gone; the config must be removed once collection is done.
    PendingDelete { agent: &'a str, conf: &'a ConfigRef },

    /// Pod is live, config exists, but its agent vanished. The reconcile
    /// loop reschedules it, which turns it into `Moving`.
    Orphaned { conf: &'a ConfigRef },

    /// Any other shape. Nothing can be done for it.
    ///
    /// These records are never removed. A pod that vanished before its add
    /// ran keeps its agent (the scheduler ignores it for load). A pending
    /// delete whose agent vanished keeps its config reference, and its log
    /// dir is never released.
    Detached,
}

/// Side effect required to converge a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
    Move,
    NoOp,
}

impl Action {
    /// Returns true if the key must be handed to a worker.
    pub fn needs_work(&self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::NoOp => "noop",
        };
        f.write_str(name)
    }
}

impl Match {
    /// Record for a source seen for the first time.
    pub fn observed() -> Self {
        Self {
            pod_present: true,
            agent: None,
            conf: None,
        }
    }

    /// Translate the raw fields into a [`MatchState`].
    pub fn state(&self) -> MatchState<'_> {
        match (self.pod_present, self.agent.as_deref(), self.conf.as_ref()) {
            (true, agent, None) => MatchState::Unassigned { agent },
            (false, Some(agent), Some(conf)) => MatchState::PendingDelete { agent, conf },
            (true, Some(agent), Some(conf)) if conf.owner != agent => {
                MatchState::Moving { agent, conf }
            }
            (true, Some(agent), Some(conf)) => MatchState::Assigned { agent, conf },
            (true, None, Some(conf)) => MatchState::Orphaned { conf },
            (false, _, _) => MatchState::Detached,
        }
    }

    /// Classify the side effect this record needs.
    pub fn action(&self) -> Action {
        self.state().into()
    }

    /// The pod is live but no agent is assigned.
    pub fn needs_scheduling(&self) -> bool {
        self.pod_present && self.agent.is_none()
    }
}

impl From<MatchState<'_>> for Action {
    fn from(state: MatchState<'_>) -> Self {
        match state {
            MatchState::Unassigned { .. } => Action::Add,
            MatchState::PendingDelete { .. } => Action::Delete,
            MatchState::Moving { .. } => Action::Move,
            MatchState::Assigned { .. } | MatchState::Orphaned { .. } | MatchState::Detached => {
                Action::NoOp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(pod: bool, agent: Option<&str>, owner: Option<&str>) -> Match {
        Match {
            pod_present: pod,
            agent: agent.map(str::to_string),
            conf: owner.map(|o| ConfigRef::new(format!("/logkit/{o}/applog_web-1.json"), o)),
        }
    }

    #[rstest]
    #[case::new_source(true, None, None, Action::Add)]
    #[case::scheduled_not_written(true, Some("agent-0"), None, Action::Add)]
    #[case::pending_delete(false, Some("agent-0"), Some("agent-0"), Action::Delete)]
    #[case::pending_delete_after_move(false, Some("agent-1"), Some("agent-0"), Action::Delete)]
    #[case::moving(true, Some("agent-2"), Some("agent-1"), Action::Move)]
    #[case::assigned(true, Some("agent-2"), Some("agent-2"), Action::NoOp)]
    #[case::orphaned(true, None, Some("agent-1"), Action::NoOp)]
    #[case::vanished_before_add(false, None, None, Action::NoOp)]
    #[case::vanished_after_schedule(false, Some("agent-0"), None, Action::NoOp)]
    #[case::vanished_with_dead_agent(false, None, Some("agent-0"), Action::NoOp)]
    fn test_classify(
        #[case] pod: bool,
        #[case] agent: Option<&str>,
        #[case] owner: Option<&str>,
        #[case] expected: Action,
    ) {
        assert_eq!(record(pod, agent, owner).action(), expected);
    }

    #[test]
    fn test_classify_is_total() {
        let agents = [None, Some("agent-1"), Some("agent-2")];
        for pod in [true, false] {
            for agent in agents {
                for owner in agents {
                    let m = record(pod, agent, owner);
                    // Deterministic and never panics.
                    assert_eq!(m.action(), m.clone().action());
                }
            }
        }
    }

    #[test]
    fn test_owner_decides_move_not_path() {
        // Path mentions agent-2 but the config was written to agent-1.
        let m = Match {
            pod_present: true,
            agent: Some("agent-2".to_string()),
            conf: Some(ConfigRef::new("/logkit/agent-2-old/x.json", "agent-1")),
        };
        assert_eq!(m.action(), Action::Move);
    }

    #[test]
    fn test_needs_scheduling() {
        assert!(Match::observed().needs_scheduling());
        assert!(record(true, None, Some("agent-0")).needs_scheduling());
        assert!(!record(true, Some("agent-0"), None).needs_scheduling());
        assert!(!record(false, None, None).needs_scheduling());
    }
}
