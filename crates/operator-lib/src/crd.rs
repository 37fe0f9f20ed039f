//! The `MonitoringConfig` custom resource
//!
//! A `MonitoringConfig` describes which pods should carry the monitoring
//! agent and how to install it: a label selector, a container name pattern,
//! and the command (plus optional stdin payload) executed in the container.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::models::ConfigKey;

/// Default stderr marker signalling the agent is already in place.
pub const DEFAULT_ALREADY_PRESENT_MARKER: &str = "already installed";

/// Desired agent injection for a set of pods.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agentinjector.io",
    version = "v1alpha1",
    kind = "MonitoringConfig",
    namespaced,
    shortname = "moncfg",
    printcolumn = r#"{"name":"Container","type":"string","jsonPath":".spec.container"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfigSpec {
    /// Labels a pod must carry, all of them, to be selected.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    /// Glob pattern for the target container name.
    #[serde(default = "default_container_pattern")]
    pub container: String,

    /// Command argument vector. Supports `{{namespace}}`, `{{pod}}`,
    /// `{{container}}` and `{{config}}` placeholders.
    pub command: Vec<String>,

    /// Payload streamed to the command's standard input.
    #[serde(default)]
    pub stdin: Option<String>,

    /// Standard-error substrings meaning the agent is already installed.
    #[serde(default = "default_already_present_markers")]
    pub already_present_markers: Vec<String>,

    /// Standard-error substrings meaning retrying is futile until this
    /// config changes.
    #[serde(default)]
    pub permanent_error_markers: Vec<String>,
}

fn default_container_pattern() -> String {
    "*".to_string()
}

fn default_already_present_markers() -> Vec<String> {
    vec![DEFAULT_ALREADY_PRESENT_MARKER.to_string()]
}

impl MonitoringConfig {
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Spec generation, bumped by the API server on every spec change.
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// A config without selector labels or without a command selects nothing.
    pub fn is_actionable(&self) -> bool {
        !self.spec.selector.is_empty() && !self.spec.command.is_empty()
    }

    /// Whether the given label set satisfies every selector entry.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.is_actionable()
            && self
                .spec
                .selector
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Whether a container name matches the configured pattern.
    pub fn matches_container(&self, name: &str) -> bool {
        glob_match::glob_match(&self.spec.container, name)
    }

    /// Render the command template for one pod container.
    pub fn render_command(&self, namespace: &str, pod: &str, container: &str) -> Vec<String> {
        self.spec
            .command
            .iter()
            .map(|arg| self.render(arg, namespace, pod, container))
            .collect()
    }

    /// Render the stdin payload, if any.
    pub fn render_stdin(&self, namespace: &str, pod: &str, container: &str) -> Option<Vec<u8>> {
        self.spec
            .stdin
            .as_deref()
            .map(|payload| self.render(payload, namespace, pod, container).into_bytes())
    }

    fn render(&self, template: &str, namespace: &str, pod: &str, container: &str) -> String {
        template
            .replace("{{namespace}}", namespace)
            .replace("{{pod}}", pod)
            .replace("{{container}}", container)
            .replace("{{config}}", &self.name_any())
    }
}
