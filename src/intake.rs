//! Deployment request intake and the FIFO queue feeding the reconciler.
//!
//! Submissions are validated against the service catalog, their image
//! references resolved to digests, and the resulting spec queued. The
//! caller gets a tracking id back right away; the outcome shows up in the
//! tracking table and, once concluded, in the state store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{ServiceCatalog, ServiceSettings};
use crate::image::{Digest, ImageRef};
use crate::model::{DeploymentResult, DeploymentSpec, ServiceSpec, Trigger};
use crate::reconciler::Phase;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Concluded entries kept in the tracking table.
const TRACKED_LIMIT: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),
    #[error("An identical deployment is already pending: {0}")]
    Conflict(Uuid),
    #[error("Reconciler unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WithdrawError {
    #[error("Unknown deployment {0}")]
    NotFound(Uuid),
    #[error("Deployment {0} is no longer queued")]
    NotQueued(Uuid),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedService {
    pub name: String,
    #[serde(alias = "image_reference", alias = "image")]
    pub image_reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRequest {
    pub services: Vec<RequestedService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TrackedState {
    Queued,
    #[serde(rename_all = "camelCase")]
    InProgress { phase: Phase },
    #[serde(rename_all = "camelCase")]
    Completed {
        result: DeploymentResult,
        record_id: Uuid,
    },
    Withdrawn,
    /// The attempt ended without a persisted record.
    Aborted { reason: String },
}

impl TrackedState {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Tracked {
    pub state: TrackedState,
    pub services: Vec<ServiceSpec>,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<DeploymentSpec>,
    in_flight: Option<DeploymentSpec>,
    phase: Phase,
    tracked: HashMap<Uuid, Tracked>,
    /// Tracking ids in submission order, for pruning.
    order: VecDeque<Uuid>,
    closed: bool,
    halted: Option<String>,
    accepted_total: u64,
}

impl QueueInner {
    fn set_state(&mut self, id: Uuid, state: TrackedState) {
        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.state = state;
        }
    }

    fn prune(&mut self) {
        let terminal = self
            .tracked
            .values()
            .filter(|t| t.state.is_terminal())
            .count();
        let mut excess = terminal.saturating_sub(TRACKED_LIMIT);
        let mut kept = VecDeque::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            let terminal = self.tracked.get(&id).is_some_and(|t| t.state.is_terminal());
            if excess > 0 && terminal {
                self.tracked.remove(&id);
                excess -= 1;
            } else {
                kept.push_back(id);
            }
        }
        self.order = kept;
    }
}

/// FIFO of specs waiting for the reconciler. One spec is in flight at a time.
pub struct DeploymentQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl DeploymentQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails fast when nothing can be queued right now.
    pub fn ensure_accepting(&self) -> Result<(), SubmitError> {
        let inner = self.lock();
        if let Some(reason) = &inner.halted {
            return Err(SubmitError::Unavailable(format!("reconciler halted: {reason}")));
        }
        if inner.closed {
            return Err(SubmitError::Unavailable("agent is shutting down".to_string()));
        }
        Ok(())
    }

    pub fn push(&self, spec: DeploymentSpec) -> Result<Uuid, SubmitError> {
        self.ensure_accepting()?;
        let mut inner = self.lock();

        if let Some(existing) = inner
            .in_flight
            .iter()
            .chain(inner.pending.iter())
            .find(|pending| pending.same_target(&spec))
        {
            return Err(SubmitError::Conflict(existing.id));
        }
        if inner.pending.len() >= self.capacity {
            return Err(SubmitError::Unavailable(format!(
                "queue is full ({} pending)",
                inner.pending.len()
            )));
        }

        let id = spec.id;
        inner.tracked.insert(
            id,
            Tracked {
                state: TrackedState::Queued,
                services: spec.services.clone(),
            },
        );
        inner.order.push_back(id);
        inner.pending.push_back(spec);
        inner.accepted_total += 1;
        log::info!(
            "Deployment {id} queued ({} pending)",
            inner.pending.len()
        );
        drop(inner);

        self.notify.notify_one();
        Ok(id)
    }

    /// Wait for the next spec. `None` once the queue is closed or halted.
    pub async fn next(&self) -> Option<DeploymentSpec> {
        loop {
            {
                let mut inner = self.lock();
                inner.in_flight = None;
                inner.phase = Phase::Idle;
                if inner.closed || inner.halted.is_some() {
                    return None;
                }
                if let Some(spec) = inner.pending.pop_front() {
                    inner.in_flight = Some(spec.clone());
                    inner.phase = Phase::Planning;
                    inner.set_state(spec.id, TrackedState::InProgress { phase: Phase::Planning });
                    return Some(spec);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn set_phase(&self, id: Uuid, phase: Phase) {
        let mut inner = self.lock();
        inner.phase = phase;
        inner.set_state(id, TrackedState::InProgress { phase });
    }

    pub fn complete(&self, id: Uuid, result: DeploymentResult, record_id: Uuid) {
        let mut inner = self.lock();
        inner.set_state(id, TrackedState::Completed { result, record_id });
        inner.prune();
    }

    pub fn abort(&self, id: Uuid, reason: String) {
        let mut inner = self.lock();
        inner.set_state(id, TrackedState::Aborted { reason });
        inner.prune();
    }

    /// Remove a spec that has not been picked up yet.
    pub fn withdraw(&self, id: Uuid) -> Result<(), WithdrawError> {
        let mut inner = self.lock();
        let Some(position) = inner.pending.iter().position(|spec| spec.id == id) else {
            return match inner.tracked.contains_key(&id) {
                true => Err(WithdrawError::NotQueued(id)),
                false => Err(WithdrawError::NotFound(id)),
            };
        };
        inner.pending.remove(position);
        inner.set_state(id, TrackedState::Withdrawn);
        inner.prune();
        log::info!("Deployment {id} withdrawn");
        Ok(())
    }

    pub fn status(&self, id: Uuid) -> Option<Tracked> {
        self.lock().tracked.get(&id).cloned()
    }

    /// Stop handing out specs. The one in flight is unaffected.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if !inner.pending.is_empty() {
            log::warn!(
                "Shutting down with {} queued deployment(s) not started",
                inner.pending.len()
            );
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Refuse all further work after a persistence failure.
    pub fn halt(&self, reason: String) {
        let mut inner = self.lock();
        inner.halted = Some(reason);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted.is_some()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn accepted_total(&self) -> u64 {
        self.lock().accepted_total
    }
}

pub fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

pub struct Intake {
    queue: Arc<DeploymentQueue>,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: RwLock<Arc<ServiceCatalog>>,
}

impl Intake {
    pub fn new(
        queue: Arc<DeploymentQueue>,
        runtime: Arc<dyn ContainerRuntime>,
        catalog: ServiceCatalog,
    ) -> Self {
        Self {
            queue,
            runtime,
            catalog: RwLock::new(Arc::new(catalog)),
        }
    }

    /// Swap the catalog used for new submissions.
    pub fn reload_catalog(&self, catalog: ServiceCatalog) {
        log::info!("Service catalog reloaded ({} service(s))", catalog.len());
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    fn catalog(&self) -> Arc<ServiceCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn submit(&self, request: DeploymentRequest) -> Result<Uuid, SubmitError> {
        self.queue.ensure_accepting()?;

        let catalog = self.catalog();
        if request.services.is_empty() {
            return Err(SubmitError::InvalidSpec("no services requested".to_string()));
        }

        let mut validated: Vec<(ServiceSettings, ImageRef)> = Vec::with_capacity(request.services.len());
        for service in &request.services {
            if service.name.is_empty() {
                return Err(SubmitError::InvalidSpec("service name is empty".to_string()));
            }
            if !is_valid_service_name(&service.name) {
                return Err(SubmitError::InvalidSpec(format!(
                    "invalid service name '{}'",
                    service.name
                )));
            }
            if validated.iter().any(|(settings, _)| settings.name == service.name) {
                return Err(SubmitError::InvalidSpec(format!(
                    "service '{}' requested twice",
                    service.name
                )));
            }
            let settings = catalog.get(&service.name).ok_or_else(|| {
                SubmitError::InvalidSpec(format!("unknown service '{}'", service.name))
            })?;
            let image = ImageRef::parse(&service.image_reference).map_err(|e| {
                SubmitError::InvalidSpec(format!(
                    "service '{}': {e}: '{}'",
                    service.name, service.image_reference
                ))
            })?;
            validated.push((settings.clone(), image));
        }

        let resolved = join_all(validated.iter().map(|(_, image)| self.resolve(image))).await;

        let mut services = Vec::with_capacity(validated.len());
        for ((settings, image), digest) in validated.into_iter().zip(resolved) {
            let digest = digest.map_err(|e| match e {
                RuntimeError::ImageNotFound(message) => {
                    SubmitError::InvalidSpec(format!("image not found: {message}"))
                }
                other => SubmitError::Unavailable(other.to_string()),
            })?;
            services.push(ServiceSpec {
                settings,
                image,
                digest,
            });
        }

        self.queue.push(DeploymentSpec::new(services, Trigger::Request))
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Digest, RuntimeError> {
        match image.digest {
            Some(digest) => Ok(digest),
            None => self.runtime.pull(image).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Restart;
    use crate::runtime::memory::MemoryRuntime;

    fn digest(c: char) -> Digest {
        Digest::parse(&format!("sha256:{}", c.to_string().repeat(64))).unwrap()
    }

    fn catalog() -> ServiceCatalog {
        let service = |name: &str, route: &str| ServiceSettings {
            name: name.to_string(),
            container_port: 8000,
            health_check_path: "/health".to_string(),
            route: route.to_string(),
            env: Default::default(),
            restart: Restart::default(),
            memory: None,
            cpus: None,
        };
        ServiceCatalog::try_from(vec![service("backend", "/api"), service("frontend", "/")]).unwrap()
    }

    fn request(services: &[(&str, &str)]) -> DeploymentRequest {
        DeploymentRequest {
            services: services
                .iter()
                .map(|(name, image)| RequestedService {
                    name: name.to_string(),
                    image_reference: image.to_string(),
                })
                .collect(),
        }
    }

    fn intake(capacity: usize) -> (Intake, Arc<DeploymentQueue>, Arc<MemoryRuntime>) {
        let queue = Arc::new(DeploymentQueue::new(capacity));
        let runtime = Arc::new(MemoryRuntime::default());
        runtime.publish("acme/backend:1", digest('a'));
        runtime.publish("acme/backend:2", digest('b'));
        runtime.publish("acme/frontend:1", digest('c'));
        (Intake::new(queue.clone(), runtime.clone(), catalog()), queue, runtime)
    }

    #[test]
    fn test_service_names() {
        assert!(is_valid_service_name("backend"));
        assert!(is_valid_service_name("api-v2.internal_1"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("-backend"));
        assert!(!is_valid_service_name("Backend"));
        assert!(!is_valid_service_name("back end"));
    }

    #[test]
    fn test_request_accepts_camel_and_snake_case() {
        let camel: DeploymentRequest =
            serde_json::from_str(r#"{"services":[{"name":"backend","imageReference":"acme/backend:1"}]}"#)
                .unwrap();
        let snake: DeploymentRequest =
            serde_json::from_str(r#"{"services":[{"name":"backend","image_reference":"acme/backend:1"}]}"#)
                .unwrap();
        assert_eq!(camel.services[0].image_reference, snake.services[0].image_reference);
    }

    #[tokio::test]
    async fn test_submit_resolves_digests_and_queues() {
        let (intake, queue, _) = intake(4);
        let id = intake
            .submit(request(&[("backend", "acme/backend:1"), ("frontend", "acme/frontend:1")]))
            .await
            .unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.accepted_total(), 1);
        let tracked = queue.status(id).unwrap();
        assert_eq!(tracked.state, TrackedState::Queued);
        assert_eq!(tracked.services[0].digest, digest('a'));
        assert_eq!(tracked.services[1].digest, digest('c'));

        let spec = queue.next().await.unwrap();
        assert_eq!(spec.id, id);
        assert_eq!(
            queue.status(id).unwrap().state,
            TrackedState::InProgress { phase: Phase::Planning }
        );
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let (intake, queue, _) = intake(4);
        let cases = [
            request(&[]),
            request(&[("", "acme/backend:1")]),
            request(&[("unknown", "acme/backend:1")]),
            request(&[("backend", "acme/backend:1"), ("backend", "acme/backend:2")]),
            request(&[("backend", "Acme/Backend")]),
            request(&[("backend", "acme/backend:404")]),
        ];
        for case in cases {
            let err = intake.submit(case.clone()).await.unwrap_err();
            assert!(matches!(err, SubmitError::InvalidSpec(_)), "{case:?}: {err}");
        }
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_registry_outage_is_unavailable() {
        let (intake, _, runtime) = intake(4);
        runtime.fail_pulls(
            "acme/backend",
            &[RuntimeError::RegistryUnreachable("timeout".to_string())],
        );
        let err = intake
            .submit(request(&[("backend", "acme/backend:1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_duplicate_and_capacity() {
        let (intake, queue, _) = intake(1);
        let first = intake.submit(request(&[("backend", "acme/backend:1")])).await.unwrap();

        let duplicate = intake.submit(request(&[("backend", "acme/backend:1")])).await;
        assert_eq!(duplicate, Err(SubmitError::Conflict(first)));

        let full = intake.submit(request(&[("backend", "acme/backend:2")])).await;
        assert!(matches!(full, Err(SubmitError::Unavailable(_))));

        // In flight still counts as a duplicate
        queue.next().await.unwrap();
        let duplicate = intake.submit(request(&[("backend", "acme/backend:1")])).await;
        assert_eq!(duplicate, Err(SubmitError::Conflict(first)));
    }

    #[tokio::test]
    async fn test_withdraw() {
        let (intake, queue, _) = intake(4);
        let first = intake.submit(request(&[("backend", "acme/backend:1")])).await.unwrap();
        let second = intake.submit(request(&[("backend", "acme/backend:2")])).await.unwrap();

        assert_eq!(queue.next().await.unwrap().id, first);
        assert_eq!(queue.withdraw(first), Err(WithdrawError::NotQueued(first)));
        assert_eq!(queue.withdraw(Uuid::nil()), Err(WithdrawError::NotFound(Uuid::nil())));

        queue.withdraw(second).unwrap();
        assert_eq!(queue.status(second).unwrap().state, TrackedState::Withdrawn);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_closed_and_halted_queue_refuse_work() {
        let (intake, queue, _) = intake(4);
        queue.close();
        assert!(queue.next().await.is_none());
        let err = intake.submit(request(&[("backend", "acme/backend:1")])).await;
        assert!(matches!(err, Err(SubmitError::Unavailable(_))));

        let queue = DeploymentQueue::new(4);
        queue.halt("disk full".to_string());
        assert!(queue.is_halted());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = Arc::new(DeploymentQueue::new(4));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await.map(|spec| spec.id) }
        });
        tokio::task::yield_now().await;

        let spec = DeploymentSpec::new(Vec::new(), Trigger::Repair);
        let id = queue.push(spec).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }
}
