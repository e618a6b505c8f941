//! Load-based placement of sources onto agents.
//!
//! The load of an agent is the number of match records that reference it,
//! except records whose pod is gone and that never got a config: those put
//! no work on the agent.
//! A source goes to the least loaded agent; ties go to the agent whose name
//! sorts first. That tie-break is stable but carries no other meaning.

use std::collections::BTreeMap;

use crate::matching::Match;
use crate::source::{Agent, SourceKey};

/// Count, per known agent, the matches that reference it.
pub fn agent_loads<'a>(
    agents: &'a BTreeMap<String, Agent>,
    matches: &BTreeMap<SourceKey, Match>,
) -> BTreeMap<&'a str, usize> {
    let mut loads: BTreeMap<&str, usize> = agents.keys().map(|name| (name.as_str(), 0)).collect();
    // A pod that vanished before its config was written stays Detached for
    // good and keeps its agent; counting it would skew placement under churn.
    for m in matches.values().filter(|m| m.pod_present || m.conf.is_some()) {
        if let Some(count) = m.agent.as_deref().and_then(|agent| loads.get_mut(agent)) {
            *count += 1;
        }
    }
    loads
}

/// Pick the least loaded known agent. Returns `None` if no agent is known.
pub fn pick_agent(
    agents: &BTreeMap<String, Agent>,
    matches: &BTreeMap<SourceKey, Match>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;
    for (name, load) in agent_loads(agents, matches) {
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((name, load)),
        }
    }
    best.map(|(name, _)| name.to_string())
}
