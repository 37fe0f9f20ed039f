//! Remote command execution inside pod containers
//!
//! This module opens a streaming `exec` session against one container,
//! pipes an optional payload to the process and captures its output.
//! A non-empty standard error or a failed exit status counts as failure of
//! the command itself. Transport problems, including a session that ends
//! without reporting an exit status, are reported separately so callers
//! can retry them.

mod stream;


pub use stream::drain_streams;

use crate::cluster::{exec_uri, ClusterClient};
use crate::error::ExecError;
use crate::models::ExecutionRequest;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, Api};
use std::time::Duration;
use tracing::{debug, info};

/// Default bound on a single remote execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs commands inside containers.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the command and return its standard output.
    async fn execute(&self, request: ExecutionRequest) -> Result<Vec<u8>, ExecError>;
}

/// Executor backed by the pod `exec` sub-resource
#[derive(Clone)]
pub struct PodExecutor {
    client: ClusterClient,
    timeout: Duration,
}

impl PodExecutor {
    pub fn new(client: ClusterClient) -> Self {
        Self {
            client,
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<Vec<u8>, ExecError> {
        let pods: Api<Pod> = self.client.pods(&request.namespace);
        let params = attach_params(request);

        debug!(
            namespace = %request.namespace,
            pod = %request.pod_name,
            container = %request.container,
            command = ?request.command,
            uri = %exec_uri(request).unwrap_or_default(),
            "Executing command"
        );

        let mut process = pods
            .exec(&request.pod_name, request.command.clone(), &params)
            .await
            .map_err(|e| {
                info!(
                    pod = %request.pod_name,
                    error = %e,
                    "Creating remote command session failed"
                );
                ExecError::transport(e)
            })?;

        let stdout = process
            .stdout()
            .ok_or_else(|| ExecError::transport("stdout stream not attached"))?;
        let stderr = process
            .stderr()
            .ok_or_else(|| ExecError::transport("stderr stream not attached"))?;
        let stdin = match request.stdin.as_deref() {
            Some(input) => Some((
                process
                    .stdin()
                    .ok_or_else(|| ExecError::transport("stdin stream not attached"))?,
                input,
            )),
            None => None,
        };
        let status = process
            .take_status()
            .ok_or_else(|| ExecError::transport("status channel not attached"))?;

        let mut output = drain_streams(stdout, stderr, stdin).await.map_err(|e| {
            info!(pod = %request.pod_name, error = %e, "Executing command failed");
            ExecError::transport(e)
        })?;

        let status = status.await.ok_or_else(|| {
            info!(pod = %request.pod_name, "Session closed before exit status");
            ExecError::transport("session closed before exit status")
        })?;
        if status.status.as_deref() == Some("Failure") {
            output.exit_message = Some(
                status
                    .message
                    .or(status.reason)
                    .unwrap_or_else(|| "command failed".to_string()),
            );
        }

        process.join().await.map_err(|e| {
            info!(pod = %request.pod_name, error = %e, "Executing command failed");
            ExecError::transport(e)
        })?;

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            exit_message = ?output.exit_message,
            "Command finished"
        );

        output.into_result()
    }
}

#[async_trait]
impl CommandExecutor for PodExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<Vec<u8>, ExecError> {
        validate(&request)?;

        match tokio::time::timeout(self.timeout, self.run(&request)).await {
            Ok(result) => result,
            Err(_) => {
                info!(
                    pod = %request.pod_name,
                    timeout_secs = self.timeout.as_secs(),
                    "Remote command timed out, tearing down stream"
                );
                Err(ExecError::Timeout(self.timeout))
            }
        }
    }
}

/// Reject requests that cannot possibly run.
pub(crate) fn validate(request: &ExecutionRequest) -> Result<(), ExecError> {
    if request.command.is_empty() {
        return Err(ExecError::InvalidRequest("empty command".into()));
    }
    if request.pod_name.is_empty() || request.namespace.is_empty() {
        return Err(ExecError::InvalidRequest("missing pod identity".into()));
    }
    if request.container.is_empty() {
        return Err(ExecError::InvalidRequest("missing container name".into()));
    }
    Ok(())
}

/// Non-interactive attach parameters for a request.
pub(crate) fn attach_params(request: &ExecutionRequest) -> AttachParams {
    AttachParams::default()
        .container(request.container.clone())
        .stdin(request.stdin.is_some())
        .stdout(true)
        .stderr(true)
        .tty(false)
}
