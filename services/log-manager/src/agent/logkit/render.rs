//! Rendering logkit runner configs.
//!
//! The declaration template is kept as is, with the fields that tie the
//! runner to one pod injected on top:
//!
//! - `name`: the runner name
//! - `reader.mode`, `reader.log_path`, `reader.meta_path`,
//!   `reader.datasource_tag`: read the pod's log directory
//! - a `k8sdir` transform that turns the source file path into pod tags,
//!   unless the template already has one

use std::path::Path;

use logfleet_reconcile::LogSource;
use serde_json::{json, Map, Value};

use crate::agent::AgentError;

/// Field the reader records the source file path under.
const DATASOURCE_TAG: &str = "log_source";

/// Render the runner config of `source` whose volumes live under
/// `sources_root`.
pub fn render_config(source: &LogSource, sources_root: &Path) -> Result<Vec<u8>, AgentError> {
    let Value::Object(mut config) = source.template()? else {
        return Err(AgentError::InvalidTemplate(source.controller.clone()));
    };

    config.insert("name".to_string(), Value::String(source.runner_name()));

    let reader = config
        .entry("reader")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(reader) = reader else {
        return Err(AgentError::InvalidTemplate(format!(
            "{}: reader is not an object",
            source.controller
        )));
    };
    reader.insert("mode".to_string(), json!("dir"));
    reader.insert(
        "log_path".to_string(),
        json!(source.log_dir(sources_root).display().to_string()),
    );
    reader.insert(
        "meta_path".to_string(),
        json!(source.meta_dir(sources_root).display().to_string()),
    );
    reader.insert("datasource_tag".to_string(), json!(DATASOURCE_TAG));

    let transforms = config
        .entry("transforms")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(transforms) = transforms else {
        return Err(AgentError::InvalidTemplate(format!(
            "{}: transforms is not a list",
            source.controller
        )));
    };
    let has_k8sdir = transforms
        .iter()
        .any(|t| t.get("type").and_then(Value::as_str) == Some("k8sdir"));
    if !has_k8sdir {
        transforms.push(json!({
            "type": "k8sdir",
            "sourcefilefield": DATASOURCE_TAG,
        }));
    }

    Ok(serde_json::to_vec_pretty(&Value::Object(config))?)
}

/// File name of the runner config of `source`.
pub fn config_file_name(source: &LogSource) -> String {
    format!("{}.json", source.runner_name())
}
