//! Integration tests for the reconcile flow.
//!
//! These drive the reconciler and a worker by hand against an in-memory
//! cluster and agent fleet:
//! 1. A tick observes pods and agents and queues work
//! 2. The worker adds, deletes or moves agent configs
//!
//! Retries are scheduled an hour out so the queue only holds what a test
//! put there.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use logfleet_manager::manager::{Context, Reconciler, SyncError, SyncOutcome, TickError, Worker};
use logfleet_manager::{
    AgentError, AgentManager, ClusterObserver, FleetSpec, LogManager, ManagerOptions, ObserveError,
};
use logfleet_reconcile::{
    Action, Agent, BackoffPolicy, Declaration, LogSource, Match, ReconcileState, SourceKey,
};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Add(String, String),
    Del(String, String),
    Release(String),
}

#[derive(Default)]
struct FakeCluster {
    pods: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeCluster {
    fn set_pods(&self, pods: &[&str]) {
        *self.pods.lock().unwrap() = pods.iter().map(|p| p.to_string()).collect();
    }
}

#[async_trait]
impl ClusterObserver for FakeCluster {
    async fn list_sources(&self, declarations: &[Declaration]) -> Result<Vec<LogSource>, ObserveError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ObserveError::Unresolved("apiserver unavailable".to_string()));
        }
        let pods = self.pods.lock().unwrap();
        Ok(declarations
            .iter()
            .flat_map(|d| pods.iter().map(move |pod| LogSource::new(d, &d.namespace, pod)))
            .collect())
    }

    async fn list_agents(&self, _fleet: &FleetSpec) -> Result<Vec<Agent>, ObserveError> {
        Ok(Vec::new())
    }
}

type SharedState = Arc<tokio::sync::Mutex<ReconcileState>>;

#[derive(Default)]
struct FakeAgents {
    agents: Mutex<Vec<String>>,
    calls: Mutex<Vec<Call>>,
    drained: AtomicBool,
    fail_list: AtomicBool,
    stall: AtomicBool,
    deploys: AtomicUsize,
    revive_on_del: Mutex<Option<(SharedState, Vec<LogSource>)>>,
}

impl FakeAgents {
    fn set_agents(&self, agents: &[&str]) {
        *self.agents.lock().unwrap() = agents.iter().map(|a| a.to_string()).collect();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn maybe_stall(&self) {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl AgentManager for FakeAgents {
    async fn deploy(&self) -> Result<(), AgentError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        self.set_agents(&["agent-0"]);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Agent>, AgentError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(AgentError::Deploy("agents unavailable".to_string()));
        }
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .map(|name| Agent::new(name.clone(), Path::new("/conf").join(name)))
            .collect())
    }

    async fn add_config(&self, source: &LogSource, agent: &str) -> Result<PathBuf, AgentError> {
        self.maybe_stall().await;
        self.record(Call::Add(source.key.to_string(), agent.to_string()));
        Ok(Path::new("/conf").join(agent).join(format!("{}.json", source.runner_name())))
    }

    async fn del_config(&self, source: &LogSource, agent: &str) -> Result<(), AgentError> {
        self.maybe_stall().await;
        self.record(Call::Del(source.key.to_string(), agent.to_string()));
        let revive = self.revive_on_del.lock().unwrap().take();
        if let Some((state, sources)) = revive {
            state.lock().await.update_sources(sources);
        }
        Ok(())
    }

    async fn check_lag(&self, _source: &LogSource, _agent: &str) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    fn agent_name_from_conf(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix("/conf").ok()?;
        relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .map(str::to_string)
    }

    async fn release(&self, source: &LogSource) -> Result<(), AgentError> {
        self.record(Call::Release(source.key.to_string()));
        Ok(())
    }
}

fn declaration() -> Declaration {
    Declaration {
        name: "web".to_string(),
        namespace: "prod".to_string(),
        kind: "deployment".to_string(),
        volume_mount: "applog".to_string(),
        config: serde_json::json!({"reader": {}}),
        selector: None,
    }
}

fn no_retries() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(3600),
        max: Duration::from_secs(3600),
        jitter: 0.0,
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    agents: Arc<FakeAgents>,
    ctx: Context,
    reconciler: Reconciler,
    worker: Worker,
    key: SourceKey,
}

impl Harness {
    fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    fn with_timeout(action_timeout: Duration) -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let agents = Arc::new(FakeAgents::default());
        let ctx = Context::new(agents.clone(), no_retries(), action_timeout);
        let reconciler = Reconciler::new(
            ctx.clone(),
            cluster.clone(),
            Arc::new(vec![declaration()]),
            Duration::from_secs(3),
        );
        let worker = Worker::new(0, ctx.clone());
        let key = SourceKey::derive(&declaration(), "web-1");

        Self {
            cluster,
            agents,
            ctx,
            reconciler,
            worker,
            key,
        }
    }

    async fn record(&self) -> Option<Match> {
        self.ctx.state.lock().await.get(&self.key).map(|(_, m)| m.clone())
    }

    /// Process everything currently queued.
    async fn drain(&self) {
        while !self.ctx.queue.is_empty() {
            tokio::time::timeout(Duration::from_secs(5), self.worker.process_next())
                .await
                .expect("worker stalled");
        }
    }

    /// Bring `web-1` to a converged match on `agent`.
    async fn converge(&self, agent: &str) {
        self.cluster.set_pods(&["web-1"]);
        self.agents.set_agents(&[agent]);
        self.reconciler.tick().await.unwrap();
        self.drain().await;
        self.agents.calls.lock().unwrap().clear();
    }
}

#[tokio::test]
async fn test_new_pod_is_added_to_least_loaded_agent() {
    let h = Harness::new();
    h.cluster.set_pods(&["web-1"]);
    h.agents.set_agents(&["agent-0"]);

    let stats = h.reconciler.tick().await.unwrap();
    assert_eq!(stats.added, 1);
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.enqueued, 1);

    let record = h.record().await.unwrap();
    assert_eq!(record.agent.as_deref(), Some("agent-0"));
    assert_eq!(record.action(), Action::Add);

    h.drain().await;

    assert_eq!(
        h.agents.calls(),
        vec![Call::Add(h.key.to_string(), "agent-0".to_string())]
    );
    assert_eq!(h.ctx.queue.num_requeues(&h.key), 0);
    let record = h.record().await.unwrap();
    let conf = record.conf.unwrap();
    assert_eq!(conf.owner, "agent-0");
    assert_eq!(conf.path, PathBuf::from("/conf/agent-0/applog_web-1.json"));

    // Converged: the next tick has nothing to do.
    assert_eq!(h.reconciler.tick().await.unwrap().enqueued, 0);
}

#[tokio::test]
async fn test_converged_record_is_noop() {
    let h = Harness::new();
    h.converge("agent-0").await;
    let before = h.record().await.unwrap();

    let outcome = h.worker.sync(&h.key).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Done);
    assert!(h.agents.calls().is_empty());
    assert_eq!(h.record().await.unwrap(), before);
}

#[tokio::test]
async fn test_delete_waits_for_collection() {
    let h = Harness::new();
    h.converge("agent-0").await;
    h.cluster.set_pods(&[]);

    let stats = h.reconciler.tick().await.unwrap();
    assert_eq!(stats.vanished, 1);
    assert_eq!(stats.drained, 0);
    assert_eq!(h.record().await.unwrap().action(), Action::Delete);

    assert_eq!(h.worker.sync(&h.key).await.unwrap(), SyncOutcome::Pending);
    assert!(h.agents.calls().is_empty());
    let record = h.record().await.unwrap();
    assert!(!record.pod_present);
    assert!(record.conf.is_some());

    h.agents.drained.store(true, Ordering::SeqCst);
    let stats = h.reconciler.tick().await.unwrap();
    assert_eq!(stats.drained, 1);
    h.drain().await;

    assert_eq!(
        h.agents.calls(),
        vec![
            Call::Del(h.key.to_string(), "agent-0".to_string()),
            Call::Release(h.key.to_string()),
        ]
    );
    assert!(h.record().await.is_none());
    assert!(h.ctx.state.lock().await.sources().is_empty());
}

#[tokio::test]
async fn test_waiting_for_drain_does_not_grow_backoff() {
    let h = Harness::new();
    h.converge("agent-0").await;
    h.cluster.set_pods(&[]);

    for _ in 0..5 {
        h.reconciler.tick().await.unwrap();
        h.drain().await;
    }

    assert_eq!(h.ctx.queue.num_requeues(&h.key), 0);
    assert!(h.agents.calls().is_empty());
    assert!(h.record().await.is_some());
}

#[tokio::test]
async fn test_pod_revived_during_delete_is_added_again() {
    let h = Harness::new();
    h.converge("agent-0").await;
    h.cluster.set_pods(&[]);
    h.agents.drained.store(true, Ordering::SeqCst);
    h.reconciler.tick().await.unwrap();

    // The pod comes back while its config is being removed.
    let revived = LogSource::new(&declaration(), "prod", "web-1");
    *h.agents.revive_on_del.lock().unwrap() = Some((h.ctx.state.clone(), vec![revived]));

    assert!(h.worker.process_next().await);

    assert_eq!(
        h.agents.calls(),
        vec![Call::Del(h.key.to_string(), "agent-0".to_string())]
    );
    let record = h.record().await.unwrap();
    assert!(record.pod_present);
    assert!(record.conf.is_none());
    assert_eq!(record.action(), Action::Add);
    assert_eq!(h.ctx.queue.len(), 1);

    h.drain().await;

    assert_eq!(
        h.agents.calls(),
        vec![
            Call::Del(h.key.to_string(), "agent-0".to_string()),
            Call::Add(h.key.to_string(), "agent-0".to_string()),
        ]
    );
    assert_eq!(h.record().await.unwrap().conf.unwrap().owner, "agent-0");
}

#[tokio::test]
async fn test_move_after_agent_loss() {
    let h = Harness::new();
    h.converge("agent-1").await;
    h.agents.set_agents(&["agent-2"]);

    let stats = h.reconciler.tick().await.unwrap();
    assert_eq!(stats.scheduled, 1);
    let record = h.record().await.unwrap();
    assert_eq!(record.agent.as_deref(), Some("agent-2"));
    assert_eq!(record.action(), Action::Move);

    h.drain().await;

    assert_eq!(
        h.agents.calls(),
        vec![
            Call::Del(h.key.to_string(), "agent-1".to_string()),
            Call::Add(h.key.to_string(), "agent-2".to_string()),
        ]
    );
    let record = h.record().await.unwrap();
    assert_eq!(record.conf.as_ref().unwrap().owner, "agent-2");
    assert_eq!(record.action(), Action::NoOp);
}

#[tokio::test]
async fn test_pod_that_vanishes_before_add_is_left_alone() {
    let h = Harness::new();
    h.cluster.set_pods(&["web-1"]);
    h.agents.set_agents(&["agent-0"]);
    h.reconciler.tick().await.unwrap();

    h.cluster.set_pods(&[]);
    h.reconciler.tick().await.unwrap();
    assert_eq!(h.record().await.unwrap().action(), Action::NoOp);

    h.drain().await;

    assert!(h.agents.calls().is_empty());
    assert_eq!(h.ctx.queue.num_requeues(&h.key), 0);
}

#[tokio::test]
async fn test_no_agent_keeps_source_pending() {
    let h = Harness::new();
    h.cluster.set_pods(&["web-1"]);

    let stats = h.reconciler.tick().await.unwrap();
    assert_eq!(stats.unplaced, 1);

    assert_eq!(h.worker.sync(&h.key).await.unwrap(), SyncOutcome::Pending);
    assert!(h.agents.calls().is_empty());

    // An agent shows up: the source is placed on the next tick.
    h.agents.set_agents(&["agent-0"]);
    h.reconciler.tick().await.unwrap();
    h.drain().await;
    assert_eq!(
        h.agents.calls(),
        vec![Call::Add(h.key.to_string(), "agent-0".to_string())]
    );
}

#[tokio::test]
async fn test_fetch_failure_abandons_tick() {
    let h = Harness::new();
    h.converge("agent-0").await;
    let before = h.record().await.unwrap();

    h.cluster.set_pods(&[]);
    h.cluster.fail.store(true, Ordering::SeqCst);
    assert!(matches!(h.reconciler.tick().await, Err(TickError::Sources(_))));

    h.cluster.fail.store(false, Ordering::SeqCst);
    h.agents.fail_list.store(true, Ordering::SeqCst);
    assert!(matches!(h.reconciler.tick().await, Err(TickError::Agents(_))));

    assert_eq!(h.record().await.unwrap(), before);
    assert!(h.ctx.queue.is_empty());
}

#[tokio::test]
async fn test_agent_timeout_is_retried() {
    let h = Harness::with_timeout(Duration::from_millis(20));
    h.cluster.set_pods(&["web-1"]);
    h.agents.set_agents(&["agent-0"]);
    h.reconciler.tick().await.unwrap();
    h.agents.stall.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.worker.sync(&h.key).await,
        Err(SyncError::Timeout { op: "add_config", .. })
    ));

    h.drain().await;
    assert_eq!(h.ctx.queue.num_requeues(&h.key), 1);
    assert!(h.record().await.unwrap().conf.is_none());
}

#[tokio::test]
async fn test_bootstrap_deploys_missing_fleet() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set_pods(&["web-1"]);
    let agents = Arc::new(FakeAgents::default());

    let manager = LogManager::bootstrap(
        vec![declaration()],
        cluster,
        agents.clone(),
        ManagerOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(agents.deploys.load(Ordering::SeqCst), 1);
    let state = manager.context().state.lock().await;
    assert!(state.agents().contains_key("agent-0"));
    assert_eq!(state.sources().len(), 1);
}

#[tokio::test]
async fn test_bootstrap_fails_when_cluster_is_unreachable() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.fail.store(true, Ordering::SeqCst);

    let result = LogManager::bootstrap(
        vec![declaration()],
        cluster,
        Arc::new(FakeAgents::default()),
        ManagerOptions::default(),
    )
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_converges_and_shuts_down() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set_pods(&["web-1", "web-2"]);
    let agents = Arc::new(FakeAgents::default());
    agents.set_agents(&["agent-0", "agent-1"]);

    let options = ManagerOptions {
        reconcile_interval: Duration::from_millis(10),
        workers: 2,
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    };
    let manager = LogManager::bootstrap(vec![declaration()], cluster, agents.clone(), options)
        .await
        .unwrap();
    let ctx = manager.context().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let converged = {
                let state = ctx.state.lock().await;
                state.matches().len() == 2 && state.matches().values().all(|m| m.conf.is_some())
            };
            if converged {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sources never converged");

    // One source per agent.
    let mut placed: Vec<_> = agents
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Add(_, agent) => Some(agent),
            _ => None,
        })
        .collect();
    placed.sort();
    assert_eq!(placed, vec!["agent-0".to_string(), "agent-1".to_string()]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("manager did not stop")
        .unwrap();
    assert!(ctx.queue.is_shutting_down());
}
