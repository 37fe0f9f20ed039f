use std::time::Duration;

use thiserror::Error;

/// Failure of a single remote command execution.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The request was rejected before any connection was made.
    #[error("invalid exec request: {0}")]
    InvalidRequest(String),

    /// Session setup or the stream itself failed.
    #[error("exec transport error: {0}")]
    Transport(String),

    /// The remote process did not finish within the configured bound.
    #[error("exec timed out after {0:?}")]
    Timeout(Duration),

    /// The remote command wrote to standard error.
    #[error("stderr: {0}")]
    Stderr(String),

    /// The remote command exited with a failure status and no stderr output.
    #[error("command failed: {0}")]
    NonZeroExit(String),
}

impl ExecError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ExecError::Transport(err.to_string())
    }

    /// Whether retrying the same request without any state change may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transport(_) | ExecError::Timeout(_))
    }

    /// Text the remote command reported, if this is an application failure.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecError::Stderr(text) => Some(text),
            _ => None,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::InvalidRequest(_) => "invalid_request",
            ExecError::Transport(_) => "transport",
            ExecError::Timeout(_) => "timeout",
            ExecError::Stderr(_) => "stderr",
            ExecError::NonZeroExit(_) => "non_zero_exit",
        }
    }
}

/// Startup failure while building the in-cluster client.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("failed to resolve API server address {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no address found for API server host {0}")]
    NoAddress(String),

    #[error("invalid API server endpoint: {0}")]
    Endpoint(String),

    #[error("in-cluster configuration unavailable: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}
