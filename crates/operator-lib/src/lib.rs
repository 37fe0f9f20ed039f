//! Agent injection operator library
//!
//! This crate provides the core functionality for:
//! - The `MonitoringConfig` custom resource
//! - Remote command execution inside pod containers
//! - Correlating config and pod events into injection decisions
//! - Watch plumbing, health checks and observability

pub mod cluster;
pub mod crd;
pub mod error;
pub mod exec;
pub mod health;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod server;
pub mod watch;

pub use cluster::ClusterClient;
pub use crd::{MonitoringConfig, MonitoringConfigSpec};
pub use error::{ClusterError, ExecError};
pub use exec::{CommandExecutor, PodExecutor};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry};
pub use models::*;
pub use observability::{InjectorMetrics, StructuredLogger};
pub use reconciler::{Correlator, ReconcileLoop, ReconcilerConfig};
