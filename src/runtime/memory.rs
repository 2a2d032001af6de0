//! In-memory runtime for reconciler and intake tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{
    ContainerHealth, ContainerRuntime, ManagedContainer, RuntimeError, ServiceRuntimeState,
    container_name,
};
use crate::image::{Digest, ImageRef};
use crate::model::{ServiceSpec, StartedContainer};

#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub id: String,
    pub name: String,
    pub service: String,
    pub digest: Digest,
    pub running: bool,
    pub address: IpAddr,
}

#[derive(Default)]
struct MemoryState {
    /// `repo:tag` -> digest a pull resolves to.
    published: HashMap<String, Digest>,
    /// Errors returned by the next pulls of a repository.
    pull_failures: HashMap<String, VecDeque<RuntimeError>>,
    start_failures: HashMap<String, RuntimeError>,
    containers: BTreeMap<String, MemoryContainer>,
    next_id: u32,
    pulls: Vec<(String, Instant)>,
    starts: Vec<String>,
    stops: Vec<String>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn publish(&self, image: &str, digest: Digest) {
        let image = ImageRef::parse(image).unwrap();
        let key = format!("{}:{}", image.repository, image.tag_or_latest());
        self.state.lock().unwrap().published.insert(key, digest);
    }

    pub fn fail_pulls(&self, repository: &str, errors: &[RuntimeError]) {
        self.state
            .lock()
            .unwrap()
            .pull_failures
            .insert(repository.to_string(), errors.iter().cloned().collect());
    }

    pub fn fail_start(&self, service: &str, error: RuntimeError) {
        self.state
            .lock()
            .unwrap()
            .start_failures
            .insert(service.to_string(), error);
    }

    /// Simulate a container dying behind the agent's back.
    pub fn kill(&self, container: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
            c.running = false;
        }
    }

    /// `(service, digest)` of every running container, sorted.
    pub fn running(&self) -> Vec<(String, Digest)> {
        let state = self.state.lock().unwrap();
        let mut running: Vec<_> = state
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| (c.service.clone(), c.digest))
            .collect();
        running.sort_by(|a, b| (a.0.as_str(), a.1.hex()).cmp(&(b.0.as_str(), b.1.hex())));
        running
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<MemoryContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn pull_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().pulls.iter().map(|(_, t)| *t).collect()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts.len()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn pull(&self, image: &ImageRef) -> Result<Digest, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.pulls.push((image.to_string(), Instant::now()));

        if let Some(error) = state
            .pull_failures
            .get_mut(&image.repository)
            .and_then(|errors| errors.pop_front())
        {
            return Err(error);
        }

        match image.digest {
            Some(digest) if state.published.values().any(|d| *d == digest) => Ok(digest),
            Some(digest) => Err(RuntimeError::ImageNotFound(format!("{image}: {digest}"))),
            None => {
                let key = format!("{}:{}", image.repository, image.tag_or_latest());
                state
                    .published
                    .get(&key)
                    .copied()
                    .ok_or_else(|| RuntimeError::ImageNotFound(key))
            }
        }
    }

    async fn start(&self, service: &ServiceSpec) -> Result<StartedContainer, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.start_failures.get(service.name()) {
            return Err(error.clone());
        }

        let name = container_name("steward", service.name(), &service.digest);
        state.containers.retain(|_, c| c.name != name);

        state.next_id += 1;
        let n = state.next_id;
        let id = format!("c{n:04}");
        let container = MemoryContainer {
            id: id.clone(),
            name: name.clone(),
            service: service.name().to_string(),
            digest: service.digest,
            running: true,
            address: IpAddr::V4(Ipv4Addr::new(10, 0, (n / 256) as u8, (n % 256) as u8)),
        };
        state.containers.insert(id.clone(), container);
        state.starts.push(id.clone());

        Ok(StartedContainer {
            service: service.name().to_string(),
            id,
            name,
        })
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(container).is_some() {
            state.stops.push(container.to_string());
        }
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ServiceRuntimeState, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(match state.containers.get(container) {
            Some(c) => ServiceRuntimeState {
                container_id: c.id.clone(),
                running: c.running,
                health_status: ContainerHealth::None,
                address: c.running.then_some(c.address),
            },
            None => ServiceRuntimeState::not_found(container),
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .map(|c| ManagedContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                service: Some(c.service.clone()),
                digest: Some(c.digest),
            })
            .collect())
    }
}
