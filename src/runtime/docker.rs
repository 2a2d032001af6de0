//! Docker implementation of the runtime adapter, using bollard.
//!
//! Every managed container carries the `steward.*` labels and is attached
//! to the agent's bridge network, where the proxy and the health prober
//! reach it by address. Nothing is published on host ports, so an old and
//! a new container of the same service can run side by side.

use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    models::{ContainerCreateBody, HealthStatusEnum, HostConfig, ImageInspect, NetworkCreateRequest, RestartPolicy, RestartPolicyNameEnum},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptionsBuilder,
        InspectNetworkOptionsBuilder, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptionsBuilder, StopContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;

use super::{
    ContainerHealth, ContainerRuntime, LABEL_DIGEST, LABEL_MANAGED, LABEL_SERVICE,
    ManagedContainer, RuntimeError, ServiceRuntimeState, container_name,
};
use crate::config::{AgentConfig, Restart};
use crate::image::{Digest, ImageRef};
use crate::login;
use crate::model::{ServiceSpec, StartedContainer};

#[derive(Debug, Clone, Copy)]
pub struct RuntimeTimeouts {
    pub pull: Duration,
    pub start: Duration,
    pub stop: Duration,
    pub inspect: Duration,
}

pub struct DockerRuntime {
    docker: Docker,
    network: String,
    prefix: String,
    timeouts: RuntimeTimeouts,
}

impl DockerRuntime {
    /// Connect to the local engine and make sure the agent network exists.
    pub async fn connect(config: &AgentConfig) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;

        let runtime = Self {
            docker,
            network: config.agent.network.clone(),
            prefix: config.agent.container_prefix.clone(),
            timeouts: RuntimeTimeouts {
                pull: Duration::from_secs(config.timeouts.pull),
                start: Duration::from_secs(config.timeouts.start),
                stop: Duration::from_secs(config.timeouts.stop),
                inspect: Duration::from_secs(config.timeouts.inspect),
            },
        };
        runtime.ensure_network().await?;
        Ok(runtime)
    }

    async fn ensure_network(&self) -> Result<(), RuntimeError> {
        let options = InspectNetworkOptionsBuilder::new().build();
        match self.docker.inspect_network(&self.network, Some(options)).await {
            Ok(_) => {
                log::debug!("Network {} already exists", self.network);
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(RuntimeError::RuntimeUnavailable(e.to_string())),
        }

        log::info!("Creating network: {}", self.network);
        let mut labels = HashMap::new();
        labels.insert("managed-by".to_string(), "steward".to_string());
        let request = NetworkCreateRequest {
            name: self.network.clone(),
            driver: Some("bridge".to_string()),
            attachable: Some(true),
            labels: Some(labels),
            ..Default::default()
        };
        self.docker
            .create_network(request)
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        log::info!("Network {} created successfully", self.network);
        Ok(())
    }

    /// Digest of a locally present image, `None` if it is not present.
    async fn local_digest(
        &self,
        reference: &str,
        image: &ImageRef,
    ) -> Result<Option<Digest>, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => Ok(extract_digest(&inspect, &image.repository)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(RuntimeError::RuntimeUnavailable(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<Digest, RuntimeError> {
        if let Some(digest) = image.digest {
            // Pinned images already on disk need no registry round-trip
            if self.local_digest(&image.pinned(&digest), image).await? == Some(digest)
                || self.local_digest(&digest.to_string(), image).await?.is_some()
            {
                log::debug!("Image {image} already present");
                return Ok(digest);
            }
        }

        log::info!("Pulling image: {image}");
        let tag = match image.digest {
            Some(digest) => digest.to_string(),
            None => image.tag_or_latest().to_string(),
        };
        let options = CreateImageOptionsBuilder::new()
            .from_image(&image.repository)
            .tag(&tag)
            .build();
        let credentials = login::registry_credentials(image.registry(), self.timeouts.inspect).await;

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::warn!("Failed to pull image {image}: {e}");
                    return Err(pull_error(e, image));
                }
            }
        }

        let reference = match image.digest {
            Some(digest) => image.pinned(&digest),
            None => format!("{}:{}", image.repository, image.tag_or_latest()),
        };
        let digest = self.local_digest(&reference, image).await?.ok_or_else(|| {
            RuntimeError::ImageNotFound(format!("{image}: no digest found after pull"))
        })?;
        log::info!("Image {image} pulled successfully ({digest})");
        Ok(digest)
    }

    /// Reference to create a container from: `repo@digest` when the engine
    /// knows it, the bare image id otherwise.
    async fn local_reference(&self, service: &ServiceSpec) -> Result<String, RuntimeError> {
        let pinned = service.image.pinned(&service.digest);
        match self.local_digest(&pinned, &service.image).await? {
            Some(_) => Ok(pinned),
            None => Ok(service.digest.to_string()),
        }
    }

    async fn start_container(&self, service: &ServiceSpec) -> Result<StartedContainer, RuntimeError> {
        let name = container_name(&self.prefix, service.name(), &service.digest);
        // A leftover from an interrupted attempt would block the name
        self.remove_container(&name).await?;

        let image = self.local_reference(service).await?;
        let settings = &service.settings;

        let env: Vec<String> = settings
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SERVICE.to_string(), settings.name.clone());
        labels.insert(LABEL_DIGEST.to_string(), service.digest.to_string());

        let restart_policy = RestartPolicy {
            name: Some(match settings.restart {
                Restart::Always => RestartPolicyNameEnum::ALWAYS,
                Restart::No => RestartPolicyNameEnum::NO,
                Restart::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
                Restart::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            }),
            maximum_retry_count: None,
        };

        // Limits were validated when the catalog was loaded
        let memory = settings
            .memory_bytes()
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;
        let nano_cpus = settings
            .nano_cpus()
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory,
            nano_cpus,
            network_mode: Some(self.network.clone()),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(image),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        log::info!("Creating container: {name}");
        let options = CreateContainerOptionsBuilder::new().name(&name).build();
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(start_error)?;

        let options = StartContainerOptionsBuilder::new().build();
        if let Err(e) = self.docker.start_container(&created.id, Some(options)).await {
            log::error!("Failed to start container {name}: {e}");
            let _ = self.remove_container(&created.id).await;
            return Err(start_error(e));
        }

        log::info!("Container {name} started successfully");
        Ok(StartedContainer {
            service: settings.name.clone(),
            id: created.id,
            name,
        })
    }

    async fn stop_container(&self, container: &str) -> Result<(), RuntimeError> {
        log::info!("Stopping container: {container}");
        let options = StopContainerOptionsBuilder::new().t(10).build();

        match self.docker.stop_container(container, Some(options)).await {
            Ok(_) => log::info!("Container {container} stopped successfully"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::debug!("Container {container} not found, skipping stop");
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => log::debug!("Container {container} already stopped"),
            Err(e) => {
                log::warn!("Failed to stop container {container}: {e}");
                return Err(RuntimeError::RuntimeUnavailable(e.to_string()));
            }
        }
        self.remove_container(container).await
    }

    async fn remove_container(&self, container: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();

        match self.docker.remove_container(container, Some(options)).await {
            Ok(_) => {
                log::info!("Container {container} removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                log::error!("Failed to remove container {container}: {e}");
                Err(RuntimeError::RuntimeUnavailable(e.to_string()))
            }
        }
    }

    async fn inspect_container(&self, container: &str) -> Result<ServiceRuntimeState, RuntimeError> {
        let options = InspectContainerOptionsBuilder::new().build();

        let info = match self.docker.inspect_container(container, Some(options)).await {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(ServiceRuntimeState::not_found(container)),
            Err(e) => return Err(RuntimeError::RuntimeUnavailable(e.to_string())),
        };

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let health_status = info
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map(|status| match status {
                HealthStatusEnum::STARTING => ContainerHealth::Starting,
                HealthStatusEnum::HEALTHY => ContainerHealth::Healthy,
                HealthStatusEnum::UNHEALTHY => ContainerHealth::Unhealthy,
                _ => ContainerHealth::None,
            })
            .unwrap_or(ContainerHealth::None);
        let address = info
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(&self.network))
            .and_then(|endpoint| endpoint.ip_address)
            .and_then(|ip| ip.parse().ok());

        Ok(ServiceRuntimeState {
            container_id: info.id.unwrap_or_else(|| container.to_string()),
            running,
            health_status,
            address,
        })
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let label = format!("{LABEL_MANAGED}=true");
        let mut filters = HashMap::new();
        filters.insert("label", vec![label.as_str()]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::RuntimeUnavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let labels = summary.labels.unwrap_or_default();
                Some(ManagedContainer {
                    id,
                    name,
                    service: labels.get(LABEL_SERVICE).cloned(),
                    digest: labels.get(LABEL_DIGEST).and_then(|d| Digest::parse(d).ok()),
                })
            })
            .collect())
    }
}

/// Run an engine call under a deadline.
async fn bounded<T>(
    limit: Duration,
    on_timeout: impl FnOnce() -> RuntimeError,
    call: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &ImageRef) -> Result<Digest, RuntimeError> {
        bounded(
            self.timeouts.pull,
            || RuntimeError::RegistryUnreachable(format!("pull of {image} timed out")),
            self.pull_image(image),
        )
        .await
    }

    async fn start(&self, service: &ServiceSpec) -> Result<StartedContainer, RuntimeError> {
        bounded(
            self.timeouts.start,
            || RuntimeError::RuntimeUnavailable(format!("start of {} timed out", service.name())),
            self.start_container(service),
        )
        .await
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        bounded(
            self.timeouts.stop,
            || RuntimeError::RuntimeUnavailable(format!("stop of {container} timed out")),
            self.stop_container(container),
        )
        .await
    }

    async fn inspect(&self, container: &str) -> Result<ServiceRuntimeState, RuntimeError> {
        bounded(
            self.timeouts.inspect,
            || RuntimeError::RuntimeUnavailable(format!("inspect of {container} timed out")),
            self.inspect_container(container),
        )
        .await
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        bounded(
            self.timeouts.inspect,
            || RuntimeError::RuntimeUnavailable("listing containers timed out".to_string()),
            self.list_managed_containers(),
        )
        .await
    }
}

/// Pick the registry digest of `repository`, falling back to the image id.
fn extract_digest(inspect: &ImageInspect, repository: &str) -> Option<Digest> {
    // RepoDigests format is like "repository@sha256:..."
    let repo_digest = inspect.repo_digests.as_ref().and_then(|digests| {
        let prefix = format!("{repository}@");
        digests
            .iter()
            .find(|d| d.starts_with(&prefix))
            .or_else(|| digests.first())
            .and_then(|d| d.split_once('@'))
            .and_then(|(_, digest)| Digest::parse(digest).ok())
    });
    repo_digest.or_else(|| inspect.id.as_deref().and_then(|id| Digest::parse(id).ok()))
}

fn engine_message(e: &bollard::errors::Error) -> Option<(Option<u16>, String)> {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => Some((Some(*status_code), message.to_lowercase())),
        bollard::errors::Error::DockerStreamError { error } => Some((None, error.to_lowercase())),
        _ => None,
    }
}

fn pull_error(e: bollard::errors::Error, image: &ImageRef) -> RuntimeError {
    let detail = format!("{image}: {e}");
    match engine_message(&e) {
        Some((Some(404), _)) => RuntimeError::ImageNotFound(detail),
        Some((_, message))
            if ["not found", "manifest unknown", "does not exist", "pull access denied"]
                .iter()
                .any(|needle| message.contains(needle)) =>
        {
            RuntimeError::ImageNotFound(detail)
        }
        // The engine answered; the registry behind it did not
        Some(_) => RuntimeError::RegistryUnreachable(detail),
        None => RuntimeError::RuntimeUnavailable(detail),
    }
}

fn start_error(e: bollard::errors::Error) -> RuntimeError {
    match engine_message(&e) {
        Some((_, message))
            if message.contains("port is already allocated")
                || message.contains("address already in use") =>
        {
            RuntimeError::PortConflict(e.to_string())
        }
        Some((Some(404), _)) => RuntimeError::ImageNotFound(e.to_string()),
        _ => RuntimeError::RuntimeUnavailable(e.to_string()),
    }
}
