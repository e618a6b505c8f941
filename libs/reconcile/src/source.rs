//! Declarations, log sources and agents.
//!
//! A [`Declaration`] names a workload whose pods write logs into a shared
//! volume. Every live pod of that workload becomes one [`LogSource`], which
//! must be collected by exactly one [`Agent`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// Static description of a workload to collect logs from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Name of the workload object.
    pub name: String,

    /// Namespace of the workload object.
    pub namespace: String,

    /// Workload kind (`deployment`, `statefulset`, `daemonset`).
    pub kind: String,

    /// Volume mount of the workload that holds the log files.
    pub volume_mount: String,

    /// Collector config template rendered for every source.
    ///
    /// Either a JSON object or a string holding one.
    pub config: serde_json::Value,

    /// Explicit pod label selector. Resolved from the workload when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
}

impl Declaration {
    /// Identity of the declaration: (kind, name, volume mount).
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.kind, self.name, self.volume_mount)
    }

    /// The controller label shared by all sources of this declaration.
    pub fn controller(&self) -> String {
        format!("{}_{}", self.kind, self.name)
    }

    /// Parse the config template into a JSON object.
    ///
    /// A template stored as a string is decoded; objects are returned as is.
    pub fn template(&self) -> Result<serde_json::Value, ReconcileError> {
        parse_template(&self.config).map_err(|source| ReconcileError::InvalidTemplate {
            declaration: self.key(),
            source,
        })
    }
}

/// Key of a log source, stable for the lifetime of the pod.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key of the source produced by `declaration` on `pod_name`.
    pub fn derive(declaration: &Declaration, pod_name: &str) -> Self {
        Self(format!("{}_{}", declaration.key(), pod_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One pod's log stream to be collected.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSource {
    pub key: SourceKey,

    /// Namespace of the pod.
    pub namespace: String,

    /// Pod that writes the logs.
    pub pod_name: String,

    /// `{kind}_{name}` of the owning workload.
    pub controller: String,

    /// Volume mount holding the logs.
    pub volume_mount: String,

    /// Collector config template from the declaration.
    pub config: serde_json::Value,

    /// Set once the assigned agent has finished draining the source.
    pub collection_done: bool,
}

impl LogSource {
    /// Materialize `declaration` against the pod `pod_name` in `namespace`.
    pub fn new(declaration: &Declaration, namespace: &str, pod_name: &str) -> Self {
        Self {
            key: SourceKey::derive(declaration, pod_name),
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            controller: declaration.controller(),
            volume_mount: declaration.volume_mount.clone(),
            config: declaration.config.clone(),
            collection_done: false,
        }
    }

    /// Directory the shared volume of this source is mounted at.
    ///
    /// A `deployment` named `web` with volume mount `applog` is mounted at
    /// `{root}/deployment_web_applog`.
    pub fn volume_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("{}_{}", self.controller, self.volume_mount))
    }

    /// Directory holding this pod's log files.
    pub fn log_dir(&self, root: &Path) -> PathBuf {
        self.volume_dir(root)
            .join(format!("{}_{}", self.namespace, self.pod_name))
    }

    /// Directory the collector keeps its read offsets in.
    pub fn meta_dir(&self, root: &Path) -> PathBuf {
        self.log_dir(root).join(".meta")
    }

    /// Parse the config template carried from the declaration.
    pub fn template(&self) -> Result<serde_json::Value, ReconcileError> {
        parse_template(&self.config).map_err(|source| ReconcileError::InvalidTemplate {
            declaration: self.controller.clone(),
            source,
        })
    }

    /// Name of the collector runner for this source.
    pub fn runner_name(&self) -> String {
        format!("{}_{}", self.volume_mount, self.pod_name)
    }
}

fn parse_template(config: &serde_json::Value) -> Result<serde_json::Value, serde_json::Error> {
    let value = match config {
        serde_json::Value::String(raw) => serde_json::from_str(raw)?,
        other => other.clone(),
    };
    if value.is_object() {
        Ok(value)
    } else {
        // Surface non-object templates as a decode error.
        serde_json::from_value::<serde_json::Map<String, serde_json::Value>>(value)
            .map(serde_json::Value::Object)
    }
}

/// One running collector instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Unique name (the agent's pod name).
    pub name: String,

    /// Directory the agent reads source configs from.
    pub conf_dir: PathBuf,
}

impl Agent {
    pub fn new(name: impl Into<String>, conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            conf_dir: conf_dir.into(),
        }
    }
}
