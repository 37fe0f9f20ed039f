//! In-cluster Kubernetes API client
//!
//! Builds one authenticated client at startup from the pod's service
//! account and hands out typed API handles. The client is cheap to clone
//! and shared read-only by the executor, the watchers and the marker.

use crate::crd::MonitoringConfig;
use crate::error::{ClusterError, ExecError};
use crate::exec::{attach_params, validate};
use crate::models::{ExecutionRequest, PodKey, INJECTED_ANNOTATION};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Config, Resource};
use tracing::{debug, info};

/// Well-known DNS name of the API server service.
pub const API_SERVER_HOST: &str = "kubernetes.default.svc";

const DEFAULT_API_SERVER_PORT: &str = "443";

/// Field manager used for pod patches.
const FIELD_MANAGER: &str = "agent-injector";

/// Shared handle to the control plane
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Wrap an existing client (tests, out-of-cluster tooling).
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account.
    ///
    /// When the service host variable is missing the API server name is
    /// resolved explicitly. Any failure here is fatal for the process.
    pub async fn in_cluster() -> Result<Self, ClusterError> {
        let config = if std::env::var("KUBERNETES_SERVICE_HOST").map_or(true, |h| h.is_empty()) {
            let port = std::env::var("KUBERNETES_SERVICE_PORT")
                .ok()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_API_SERVER_PORT.to_string());
            let target = format!("{}:{}", API_SERVER_HOST, port);

            let addr = tokio::net::lookup_host(&target)
                .await
                .map_err(|source| ClusterError::Resolve {
                    host: target.clone(),
                    source,
                })?
                .next()
                .ok_or_else(|| ClusterError::NoAddress(target.clone()))?;

            info!(host = API_SERVER_HOST, addr = %addr, "Resolved API server address");

            let mut config = Config::incluster_dns()?;
            config.cluster_url = format!("https://{}", addr)
                .parse()
                .map_err(|e| ClusterError::Endpoint(format!("{}: {}", addr, e)))?;
            config
        } else {
            Config::incluster()?
        };

        info!(cluster_url = %config.cluster_url, "Using in-cluster configuration");

        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    /// Pods in one namespace.
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Pods in the watch scope, cluster-wide when `namespace` is `None`.
    pub fn pods_in_scope(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Monitoring configs in the watch scope.
    pub fn configs_in_scope(&self, namespace: Option<&str>) -> Api<MonitoringConfig> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Record on the pod that injection succeeded.
    pub async fn annotate_injected(&self, pod: &PodKey, config_name: &str) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { INJECTED_ANNOTATION: config_name }
            }
        });

        self.pods(&pod.namespace)
            .patch(&pod.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        debug!(pod = %pod, config = %config_name, "Annotated pod as injected");
        Ok(())
    }
}

/// Path and query of the `exec` sub-resource call for a request.
pub fn exec_uri(request: &ExecutionRequest) -> Result<String, ExecError> {
    validate(request)?;

    let url_path = Pod::url_path(&(), Some(&request.namespace));
    let http_request = kube::core::Request::new(url_path)
        .exec(
            &request.pod_name,
            request.command.clone(),
            &attach_params(request),
        )
        .map_err(|e| ExecError::InvalidRequest(e.to_string()))?;

    Ok(http_request.uri().to_string())
}

/// Records successful injections somewhere observable.
#[async_trait]
pub trait InjectionMarker: Send + Sync {
    async fn mark_injected(&self, pod: &PodKey, config_name: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl InjectionMarker for ClusterClient {
    async fn mark_injected(&self, pod: &PodKey, config_name: &str) -> anyhow::Result<()> {
        self.annotate_injected(pod, config_name).await?;
        Ok(())
    }
}
