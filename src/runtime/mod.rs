//! Container runtime adapter.
//!
//! The reconciler only talks to the container engine through
//! [`ContainerRuntime`]. [`docker::DockerRuntime`] is the production
//! implementation.

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::image::{Digest, ImageRef};
use crate::model::{ServiceSpec, StartedContainer};

pub mod docker;
#[cfg(test)]
pub mod memory;

pub const LABEL_MANAGED: &str = "steward.managed";
pub const LABEL_SERVICE: &str = "steward.service";
pub const LABEL_DIGEST: &str = "steward.digest";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),
    #[error("Registry unreachable: {0}")]
    RegistryUnreachable(String),
    #[error("Port conflict: {0}")]
    PortConflict(String),
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

impl RuntimeError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ImageNotFound(_) | Self::RegistryUnreachable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHealth {
    /// The image declares no healthcheck.
    None,
    Starting,
    Healthy,
    Unhealthy,
    /// The container does not exist.
    NotFound,
}

/// Live state of one container. Queried on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRuntimeState {
    pub container_id: String,
    pub running: bool,
    pub health_status: ContainerHealth,
    /// Address on the agent's network.
    pub address: Option<IpAddr>,
}

impl ServiceRuntimeState {
    pub fn not_found(container: &str) -> Self {
        Self {
            container_id: container.to_string(),
            running: false,
            health_status: ContainerHealth::NotFound,
            address: None,
        }
    }
}

/// A container carrying the agent's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub service: Option<String>,
    pub digest: Option<Digest>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make the image available locally and return its digest.
    async fn pull(&self, image: &ImageRef) -> Result<Digest, RuntimeError>;

    /// Create and start a container for `service` next to any running ones.
    async fn start(&self, service: &ServiceSpec) -> Result<StartedContainer, RuntimeError>;

    /// Stop and remove a container. Missing or stopped containers succeed.
    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, container: &str) -> Result<ServiceRuntimeState, RuntimeError>;

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
}

/// Name of the container running `digest` for `service`.
pub fn container_name(prefix: &str, service: &str, digest: &Digest) -> String {
    format!("{prefix}-{service}-{}", digest.short())
}
