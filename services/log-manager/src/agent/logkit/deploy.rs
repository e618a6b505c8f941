//! The logkit agent Deployment.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::agent::AgentManagerConfig;

const CONTAINER_NAME: &str = "logkit";
const CONF_VOLUME: &str = "logkit-conf";

/// Name of the agent Deployment of the instance `name`.
pub fn deploy_name(name: &str) -> String {
    format!("logkit-{name}")
}

/// Labels carried by every agent pod of the instance `name`.
pub fn fleet_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), deploy_name(name))])
}

/// Build the agent Deployment.
///
/// Each agent learns its pod name through `POD_NAME` and reads its runner
/// configs from `{agents_root}/$(POD_NAME)`.
pub fn fleet_deployment(config: &AgentManagerConfig) -> Deployment {
    let labels = fleet_labels(&config.name);
    let agents_root = config.agents_root.display().to_string();

    let mut container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        env: Some(vec![
            EnvVar {
                name: "POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvVar {
                name: "LOGKIT_CONFS_PATH".to_string(),
                value: Some(format!("{agents_root}/$(POD_NAME)")),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut volumes = None;
    if let Some(claim) = &config.claim {
        container.volume_mounts = Some(vec![VolumeMount {
            name: CONF_VOLUME.to_string(),
            mount_path: agents_root,
            ..Default::default()
        }]);
        volumes = Some(vec![Volume {
            name: CONF_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(deploy_name(&config.name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
