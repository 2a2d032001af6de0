//! The deployment state machine.
//!
//! One spec at a time is driven through
//! `Planning -> Pulling -> Starting -> HealthChecking -> Switching -> Finalizing`.
//! New containers always start next to the old ones and traffic only moves
//! once every new container answered its health check, so a failure at any
//! step before the switch leaves the active deployment serving untouched.
//! Every attempt ends with exactly one appended record.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::health::{BackoffPolicy, HealthOutcome, HealthProber};
use crate::intake::DeploymentQueue;
use crate::model::{
    DeploymentRecord, DeploymentResult, DeploymentSpec, Journal, JournalPhase, ServiceRecord,
    ServiceSpec, ServiceStatus, StartedContainer,
};
use crate::proxy::{ProxyError, ProxyManager};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::{StateStore, StoreError};

mod recovery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    Pulling,
    Starting,
    HealthChecking,
    Switching,
    Finalizing,
    RollingBack,
}

impl AsRef<str> for Phase {
    fn as_ref(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Pulling => "pulling",
            Self::Starting => "starting",
            Self::HealthChecking => "healthChecking",
            Self::Switching => "switching",
            Self::Finalizing => "finalizing",
            Self::RollingBack => "rollingBack",
        }
    }
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Image not found for {service}: {message}")]
    ImageNotFound { service: String, message: String },
    #[error("Registry unreachable for {service}: {message}")]
    RegistryUnreachable { service: String, message: String },
    #[error("Port conflict for {service}: {message}")]
    PortConflict { service: String, message: String },
    #[error("Container runtime unavailable for {service}: {message}")]
    RuntimeUnavailable { service: String, message: String },
    #[error("Health check failed for {service}: {outcome}")]
    HealthCheckFailed { service: String, outcome: String },
    #[error("Config syntax error: {0}")]
    ConfigSyntax(String),
    #[error("Proxy switch failed: {0}")]
    Proxy(ProxyError),
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl DeployError {
    fn runtime(service: &str, error: RuntimeError) -> Self {
        let service = service.to_string();
        match error {
            RuntimeError::ImageNotFound(message) => Self::ImageNotFound { service, message },
            RuntimeError::RegistryUnreachable(message) => {
                Self::RegistryUnreachable { service, message }
            }
            RuntimeError::PortConflict(message) => Self::PortConflict { service, message },
            RuntimeError::RuntimeUnavailable(message) => {
                Self::RuntimeUnavailable { service, message }
            }
        }
    }

    /// The service the failing step was working on.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::ImageNotFound { service, .. }
            | Self::RegistryUnreachable { service, .. }
            | Self::PortConflict { service, .. }
            | Self::RuntimeUnavailable { service, .. }
            | Self::HealthCheckFailed { service, .. } => Some(service),
            _ => None,
        }
    }
}

impl From<ProxyError> for DeployError {
    fn from(error: ProxyError) -> Self {
        match error {
            ProxyError::ConfigSyntax(message) => Self::ConfigSyntax(message),
            other => Self::Proxy(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub health_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Retries after the first failed pull.
    pub pull_retries: u32,
    /// The n-th retry waits `n * pull_step`.
    pub pull_step: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            pull_retries: 3,
            pull_step: Duration::from_secs(2),
        }
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            health_timeout: Duration::from_secs(config.timeouts.health),
            backoff: config.health.backoff(),
            pull_retries: config.retry.pull_retries,
            pull_step: Duration::from_secs(config.retry.pull_step),
        }
    }
}

/// What an attempt changed so far, enough to undo it.
struct Attempt {
    /// Services of the record the attempt is building.
    services: BTreeMap<String, ServiceRecord>,
    /// Services that get a new container.
    changed: Vec<ServiceSpec>,
    /// Containers replaced by the new ones.
    retired: Vec<String>,
    started: Vec<StartedContainer>,
    switched: bool,
    previous_proxy: Option<u64>,
}

pub struct Reconciler {
    store: Arc<StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<ProxyManager>,
    prober: HealthProber,
    queue: Arc<DeploymentQueue>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<ProxyManager>,
        prober: HealthProber,
        queue: Arc<DeploymentQueue>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            proxy,
            prober,
            queue,
            settings,
        }
    }

    /// Work the queue until it is closed. Only a persistence failure stops
    /// the loop early; the queue is halted before it returns.
    pub async fn run(&self) -> Result<(), StoreError> {
        while let Some(spec) = self.queue.next().await {
            match self.reconcile(&spec).await {
                Ok(record) => self.queue.complete(spec.id, record.result, record.id),
                Err(e) => {
                    log::error!("Persistence failure, halting the reconciler: {e}");
                    self.queue.abort(spec.id, e.to_string());
                    self.queue.halt(e.to_string());
                    return Err(e);
                }
            }
        }
        log::info!("Reconciler stopped");
        Ok(())
    }

    /// Drive the system to `spec` and persist the outcome.
    pub async fn reconcile(&self, spec: &DeploymentSpec) -> Result<DeploymentRecord, StoreError> {
        log::info!(
            "Reconciling deployment {} ({} service(s), {:?})",
            spec.id,
            spec.services.len(),
            spec.trigger
        );
        self.enter(spec, Phase::Planning);

        let previous = self.store.active();
        let mut attempt = Attempt {
            services: BTreeMap::new(),
            changed: Vec::new(),
            retired: Vec::new(),
            started: Vec::new(),
            switched: false,
            previous_proxy: self.proxy.active_version(),
        };

        let planned = self.plan(spec, previous.as_ref(), &mut attempt).await;
        let outcome = match planned {
            Ok(()) if attempt.changed.is_empty() && self.routes_current(spec, &attempt) => {
                return self.unchanged(spec, attempt);
            }
            Ok(()) => self.execute(spec, previous.as_ref(), &mut attempt).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(record) => Ok(record),
            Err(DeployError::Persistence(e)) => Err(e),
            Err(error) => self.roll_back(spec, attempt, error).await,
        }
    }

    fn enter(&self, spec: &DeploymentSpec, phase: Phase) {
        log::info!("Deployment {}: {}", spec.id, phase.as_ref());
        self.queue.set_phase(spec.id, phase);
    }

    /// Carry over the active services and pick the ones needing a new
    /// container: a different digest, or an active container that died.
    /// Carried services the spec does not name are checked live too and
    /// redeployed from their record when their container is gone.
    async fn plan(
        &self,
        spec: &DeploymentSpec,
        previous: Option<&DeploymentRecord>,
        attempt: &mut Attempt,
    ) -> Result<(), DeployError> {
        if let Some(previous) = previous {
            attempt.services.extend(
                previous
                    .services
                    .iter()
                    .filter(|(_, service)| service.status == ServiceStatus::Running)
                    .map(|(name, service)| (name.clone(), service.clone())),
            );
        }

        let mut targets = spec.services.clone();
        targets.extend(
            attempt
                .services
                .values()
                .filter(|service| {
                    !spec
                        .services
                        .iter()
                        .any(|target| target.name() == service.settings.name)
                })
                .map(ServiceRecord::to_spec),
        );

        for target in &targets {
            let name = target.name();
            if let Some(current) = attempt.services.get_mut(name) {
                if current.digest == target.digest {
                    if let Some(upstream) = self.live_upstream(current).await? {
                        if current.upstream.as_deref() != Some(upstream.as_str()) {
                            log::info!("{name}: address changed to {upstream}");
                            current.upstream = Some(upstream);
                        }
                        log::info!("{name}: {} unchanged, leaving it running", target.digest.short());
                        continue;
                    }
                    log::warn!("{name}: active container is not running, redeploying");
                }
                if let Some(old) = current.container_id.clone() {
                    attempt.retired.push(old);
                }
            }
            log::info!("{name}: scheduling {}", target.pinned_image());
            attempt
                .services
                .insert(name.to_string(), ServiceRecord::pending(target));
            attempt.changed.push(target.clone());
        }
        Ok(())
    }

    /// `ip:port` of a record's container, `None` if it is not running.
    async fn live_upstream(&self, service: &ServiceRecord) -> Result<Option<String>, DeployError> {
        let Some(container) = &service.container_id else {
            return Ok(None);
        };
        let state = self
            .runtime
            .inspect(container)
            .await
            .map_err(|e| DeployError::runtime(&service.settings.name, e))?;
        Ok(state
            .address
            .filter(|_| state.running)
            .map(|ip| SocketAddr::new(ip, service.settings.container_port).to_string()))
    }

    /// Whether the live routes already match what the attempt would render.
    fn routes_current(&self, spec: &DeploymentSpec, attempt: &Attempt) -> bool {
        let draft = DeploymentRecord::new(
            spec,
            attempt.services.clone(),
            None,
            DeploymentResult::Success,
            None,
        );
        let wanted = self.proxy.render(&draft);
        match self.proxy.active() {
            Some(active) => active.config == wanted,
            None => wanted.rules.is_empty(),
        }
    }

    fn unchanged(
        &self,
        spec: &DeploymentSpec,
        attempt: Attempt,
    ) -> Result<DeploymentRecord, StoreError> {
        let record = DeploymentRecord::new(
            spec,
            attempt.services,
            self.proxy.active_version(),
            DeploymentResult::Success,
            None,
        );
        let previous = self.store.active_id();
        self.store.append(&record)?;
        self.store.activate(previous, record.id)?;
        log::info!("Deployment {}: nothing to change", spec.id);
        Ok(record)
    }

    async fn execute(
        &self,
        spec: &DeploymentSpec,
        previous: Option<&DeploymentRecord>,
        attempt: &mut Attempt,
    ) -> Result<DeploymentRecord, DeployError> {
        self.enter(spec, Phase::Pulling);
        join_all(attempt.changed.iter().map(|target| self.pull(target)))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;

        self.enter(spec, Phase::Starting);
        let results = join_all(attempt.changed.iter().map(|target| async move {
            self.runtime
                .start(target)
                .await
                .map_err(|e| DeployError::runtime(target.name(), e))
        }))
        .await;
        let mut failure = None;
        for result in results {
            match result {
                Ok(started) => {
                    log::info!("{}: started container {}", started.service, started.name);
                    attempt.started.push(started);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut endpoints = Vec::with_capacity(attempt.started.len());
        for started in &attempt.started {
            let Some(service) = attempt.services.get_mut(&started.service) else {
                continue;
            };
            service.container_id = Some(started.id.clone());
            service.container_name = Some(started.name.clone());
            service.status = ServiceStatus::Running;
            let upstream = self.live_upstream(service).await?.ok_or_else(|| {
                DeployError::RuntimeUnavailable {
                    service: started.service.clone(),
                    message: format!("{} is not running on the agent network", started.name),
                }
            })?;
            endpoints.push((
                started.service.clone(),
                format!("http://{upstream}{}", service.settings.health_check_path),
            ));
            service.upstream = Some(upstream);
        }

        self.enter(spec, Phase::HealthChecking);
        let outcomes = join_all(endpoints.iter().map(|(service, endpoint)| {
            self.prober.wait_healthy(
                service,
                endpoint,
                self.settings.health_timeout,
                &self.settings.backoff,
            )
        }))
        .await;
        if let Some(((service, _), outcome)) = endpoints
            .iter()
            .zip(outcomes)
            .find(|(_, outcome)| *outcome != HealthOutcome::Healthy)
        {
            return Err(DeployError::HealthCheckFailed {
                service: service.clone(),
                outcome: outcome.as_ref().to_string(),
            });
        }

        self.enter(spec, Phase::Switching);
        let candidate = DeploymentRecord::new(
            spec,
            attempt.services.clone(),
            None,
            DeploymentResult::Success,
            None,
        );
        let config = self.proxy.render(&candidate);
        self.proxy.validate(&config).await?;

        let mut journal = Journal {
            phase: JournalPhase::Switching,
            spec: spec.clone(),
            previous_active: previous.map(|record| record.id),
            previous_proxy_version: attempt.previous_proxy,
            candidate,
            started: attempt.started.clone(),
            retired: attempt.retired.clone(),
        };
        self.store.write_journal(&journal)?;
        attempt.switched = true;
        let version = self.proxy.apply(&config).await?;

        journal.phase = JournalPhase::Finalizing;
        journal.candidate.proxy_config_version = Some(version);
        self.store.write_journal(&journal)?;

        self.enter(spec, Phase::Finalizing);
        Ok(self.finalize(&journal).await?)
    }

    /// Pull with linear backoff on retryable errors.
    async fn pull(&self, target: &ServiceSpec) -> Result<(), DeployError> {
        let image = target.pinned_image();
        let mut retries = 0;
        loop {
            match self.runtime.pull(&image).await {
                Ok(digest) if digest == target.digest => return Ok(()),
                Ok(digest) => {
                    return Err(DeployError::ImageNotFound {
                        service: target.name().to_string(),
                        message: format!("{image} resolved to {digest}"),
                    });
                }
                Err(e) if e.is_retryable() && retries < self.settings.pull_retries => {
                    retries += 1;
                    let delay = self.settings.pull_step * retries;
                    log::warn!(
                        "{}: pull failed ({e}), retry {retries}/{} in {delay:?}",
                        target.name(),
                        self.settings.pull_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(DeployError::runtime(target.name(), e)),
            }
        }
    }

    /// Retire the replaced containers and make the candidate active.
    /// Safe to run again for the same journal.
    async fn finalize(&self, journal: &Journal) -> Result<DeploymentRecord, StoreError> {
        for container in &journal.retired {
            if let Err(e) = self.runtime.stop(container).await {
                log::warn!("Failed to stop retired container {container}: {e}");
            }
        }

        let record = &journal.candidate;
        if self.store.get(record.id).is_none() {
            self.store.append(record)?;
        }
        if self.store.active_id() != Some(record.id) {
            self.store.activate(journal.previous_active, record.id)?;
        }
        self.store.clear_journal()?;
        log::info!("Deployment {} succeeded", journal.spec.id);
        Ok(record.clone())
    }

    async fn roll_back(
        &self,
        spec: &DeploymentSpec,
        attempt: Attempt,
        error: DeployError,
    ) -> Result<DeploymentRecord, StoreError> {
        self.enter(spec, Phase::RollingBack);
        log::warn!("Deployment {} failed, rolling back: {error}", spec.id);

        let mut clean = true;
        if attempt.switched {
            if let Err(e) = self.proxy.rollback(attempt.previous_proxy).await {
                log::error!("Failed to restore proxy config {:?}: {e}", attempt.previous_proxy);
                clean = false;
            }
        }
        for started in &attempt.started {
            if let Err(e) = self.runtime.stop(&started.id).await {
                log::error!("Failed to stop {}: {e}", started.name);
                clean = false;
            }
        }

        let mut services = attempt.services;
        for target in &attempt.changed {
            let name = target.name();
            if let Some(service) = services.get_mut(name) {
                service.status = if error.service() == Some(name) {
                    ServiceStatus::Failed
                } else if attempt.started.iter().any(|s| s.service == name) {
                    ServiceStatus::RolledBack
                } else {
                    ServiceStatus::Skipped
                };
            }
        }

        let result = if clean {
            DeploymentResult::RolledBack
        } else {
            DeploymentResult::Failed
        };
        let record = DeploymentRecord::new(
            spec,
            services,
            self.proxy.active_version(),
            result,
            Some(error.to_string()),
        );
        self.store.append(&record)?;
        if attempt.switched {
            self.store.clear_journal()?;
        }
        log::warn!("Deployment {} concluded as {}", spec.id, result.as_ref());
        Ok(record)
    }
}
