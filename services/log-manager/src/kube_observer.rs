//! Kubernetes implementation of [`ClusterObserver`].
//!
//! Pod selectors of the declared workloads are resolved once at startup;
//! every tick then lists pods by those selectors.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use logfleet_reconcile::{Agent, Declaration, LogSource};
use tracing::{debug, info};

use crate::observer::{label_selector, ClusterObserver, FleetSpec, ObserveError};

/// Observer backed by the Kubernetes API.
pub struct KubeObserver {
    client: Client,

    /// Pod selector per declaration key.
    selectors: BTreeMap<String, String>,
}

impl KubeObserver {
    /// Resolve the pod selector of every declaration.
    ///
    /// Fails if any workload cannot be read or has no selector.
    pub async fn connect(client: Client, declarations: &[Declaration]) -> Result<Self, ObserveError> {
        let mut selectors = BTreeMap::new();
        for declaration in declarations {
            let selector = resolve_selector(&client, declaration).await?;
            info!(
                declaration = %declaration.key(),
                selector = %selector,
                "Resolved workload pod selector"
            );
            selectors.insert(declaration.key(), selector);
        }
        Ok(Self { client, selectors })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

async fn resolve_selector(client: &Client, declaration: &Declaration) -> Result<String, ObserveError> {
    if let Some(labels) = &declaration.selector {
        return non_empty(declaration, labels.clone());
    }

    let namespace = &declaration.namespace;
    let labels = match declaration.kind.as_str() {
        "deployment" => Api::<Deployment>::namespaced(client.clone(), namespace)
            .get(&declaration.name)
            .await?
            .spec
            .and_then(|spec| spec.selector.match_labels),
        "statefulset" => Api::<StatefulSet>::namespaced(client.clone(), namespace)
            .get(&declaration.name)
            .await?
            .spec
            .and_then(|spec| spec.selector.match_labels),
        "daemonset" => Api::<DaemonSet>::namespaced(client.clone(), namespace)
            .get(&declaration.name)
            .await?
            .spec
            .and_then(|spec| spec.selector.match_labels),
        other => {
            return Err(ObserveError::UnsupportedKind {
                declaration: declaration.key(),
                kind: other.to_string(),
            })
        }
    };

    non_empty(declaration, labels.unwrap_or_default())
}

fn non_empty(
    declaration: &Declaration,
    labels: BTreeMap<String, String>,
) -> Result<String, ObserveError> {
    if labels.is_empty() {
        return Err(ObserveError::EmptySelector {
            declaration: declaration.key(),
        });
    }
    Ok(label_selector(&labels))
}

/// Build the log sources `declaration` produces on `pods`.
pub fn sources_from_pods(declaration: &Declaration, pods: &[Pod]) -> Vec<LogSource> {
    pods.iter()
        .filter_map(|pod| pod.metadata.name.as_deref())
        .map(|name| LogSource::new(declaration, &declaration.namespace, name))
        .collect()
}

/// Build the agents of `fleet` from its pods, skipping pods being deleted.
pub fn agents_from_pods(fleet: &FleetSpec, pods: &[Pod]) -> Vec<Agent> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter_map(|pod| pod.metadata.name.as_deref())
        .map(|name| fleet.agent(name))
        .collect()
}

#[async_trait]
impl ClusterObserver for KubeObserver {
    async fn list_sources(&self, declarations: &[Declaration]) -> Result<Vec<LogSource>, ObserveError> {
        let mut sources = Vec::new();
        for declaration in declarations {
            let selector = self
                .selectors
                .get(&declaration.key())
                .ok_or_else(|| ObserveError::Unresolved(declaration.key()))?;

            let pods = Api::<Pod>::namespaced(self.client.clone(), &declaration.namespace)
                .list(&ListParams::default().labels(selector))
                .await?;

            debug!(
                declaration = %declaration.key(),
                pods = pods.items.len(),
                "Listed workload pods"
            );
            sources.extend(sources_from_pods(declaration, &pods.items));
        }
        Ok(sources)
    }

    async fn list_agents(&self, fleet: &FleetSpec) -> Result<Vec<Agent>, ObserveError> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), &fleet.namespace)
            .list(&ListParams::default().labels(&fleet.selector()))
            .await?;
        Ok(agents_from_pods(fleet, &pods.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn declaration() -> Declaration {
        Declaration {
            name: "web".to_string(),
            namespace: "prod".to_string(),
            kind: "deployment".to_string(),
            volume_mount: "applog".to_string(),
            config: serde_json::json!({}),
            selector: None,
        }
    }

    #[test]
    fn test_sources_from_pods() {
        let sources = sources_from_pods(&declaration(), &[pod("web-1"), pod("web-2"), Pod::default()]);

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].pod_name, "web-1");
        assert_eq!(sources[0].namespace, "prod");
        assert_eq!(sources[1].key.as_str(), "deployment_web_applog_web-2");
    }

    #[test]
    fn test_agents_skip_terminating_pods() {
        let fleet = FleetSpec {
            namespace: "logging".to_string(),
            labels: BTreeMap::from([("app".to_string(), "logkit-kirk".to_string())]),
            conf_root: PathBuf::from("/logkit"),
        };
        let mut terminating = pod("logkit-old");
        terminating.metadata.deletion_timestamp = Some(Time(Default::default()));

        let agents = agents_from_pods(&fleet, &[pod("logkit-a"), terminating]);

        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "logkit-a");
        assert_eq!(agents[0].conf_dir, PathBuf::from("/logkit/logkit-a"));
    }

    #[test]
    fn test_explicit_selector_must_not_be_empty() {
        let mut decl = declaration();
        assert!(matches!(
            non_empty(&decl, BTreeMap::new()),
            Err(ObserveError::EmptySelector { .. })
        ));

        decl.selector = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        assert_eq!(non_empty(&decl, decl.selector.clone().unwrap()).unwrap(), "app=web");
    }
}
