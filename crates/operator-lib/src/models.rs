//! Core data models for the injection operator

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// Annotation written on a pod once its agent injection succeeded.
pub const INJECTED_ANNOTATION: &str = "agentinjector.io/injected";

/// Identity of a pod: namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a `MonitoringConfig`. Orders by namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub namespace: String,
    pub name: String,
}

impl ConfigKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// State of one container as seen in a pod observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerObservation {
    pub name: String,
    pub running: bool,
    pub ready: bool,
}

/// Snapshot of a pod delivered by the watch stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodObservation {
    pub key: PodKey,
    pub uid: String,
    /// Monotonic per pod; larger means newer.
    pub sequence: u64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Containers in pod spec order.
    pub containers: Vec<ContainerObservation>,
    /// Deletion requested or the pod reached a final phase.
    pub terminating: bool,
}

impl PodObservation {
    /// Build an observation from a pod object.
    ///
    /// The sequence is the pod's `resourceVersion` when it parses as an
    /// integer, otherwise `fallback_sequence`.
    pub fn from_pod(pod: &Pod, fallback_sequence: u64) -> Self {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());

        let containers = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|c| {
                        let status = statuses.and_then(|all| all.iter().find(|s| s.name == c.name));
                        ContainerObservation {
                            name: c.name.clone(),
                            running: status
                                .and_then(|s| s.state.as_ref())
                                .map(|state| state.running.is_some())
                                .unwrap_or(false),
                            ready: status.map(|s| s.ready).unwrap_or(false),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let phase_final = matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        );

        let sequence = pod
            .resource_version()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(fallback_sequence);

        Self {
            key: PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any()),
            uid: pod.uid().unwrap_or_default(),
            sequence,
            labels: pod.labels().clone(),
            annotations: pod.annotations().clone(),
            containers,
            terminating: pod.metadata.deletion_timestamp.is_some() || phase_final,
        }
    }

    /// Config name recorded by a previous successful injection, if any.
    pub fn injected_by(&self) -> Option<&str> {
        self.annotations.get(INJECTED_ANNOTATION).map(String::as_str)
    }
}

/// A single remote command to run inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub namespace: String,
    pub pod_name: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecutionRequest {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container: container.into(),
            command,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Everything a finished remote process produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Failure message reported by the control plane on exit, if any.
    pub exit_message: Option<String>,
}
