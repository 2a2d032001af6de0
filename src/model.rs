//! Deployment data model.
//!
//! A [`DeploymentSpec`] is what the agent is asked to converge to, a
//! [`DeploymentRecord`] is what it persisted once an attempt concluded, and
//! a [`Journal`] is the in-flight intent written around the proxy switch so
//! that a restarted agent knows which way to converge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServiceSettings;
use crate::image::{Digest, ImageRef};

/// Microseconds since the unix epoch (UTC).
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Submitted through the deployment API.
    Request,
    /// Queued by crash recovery to bring dead active containers back.
    Repair,
}

/// One service of a deployment, with its image already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub settings: ServiceSettings,
    pub image: ImageRef,
    pub digest: Digest,
}

impl ServiceSpec {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Reference the container is created from.
    pub fn pinned_image(&self) -> ImageRef {
        self.image.with_digest(self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub id: Uuid,
    pub services: Vec<ServiceSpec>,
    pub trigger: Trigger,
    /// Timestamp in microseconds (UTC)
    pub submitted_at: i64,
}

impl DeploymentSpec {
    pub fn new(services: Vec<ServiceSpec>, trigger: Trigger) -> Self {
        Self {
            id: Uuid::now_v7(),
            services,
            trigger,
            submitted_at: now_micros(),
        }
    }

    /// A spec re-deploying exactly what `record` describes.
    pub fn repair(record: &DeploymentRecord) -> Self {
        let services = record
            .services
            .values()
            .filter(|service| service.status == ServiceStatus::Running)
            .map(ServiceRecord::to_spec)
            .collect();
        Self::new(services, Trigger::Repair)
    }

    /// Whether both specs ask for the same images of the same services.
    pub fn same_target(&self, other: &Self) -> bool {
        let target = |spec: &Self| {
            spec.services
                .iter()
                .map(|s| (s.name().to_string(), s.digest))
                .collect::<BTreeMap<_, _>>()
        };
        target(self) == target(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    /// Serving traffic as part of the record.
    Running,
    /// Started during the attempt and stopped again by the rollback.
    RolledBack,
    /// The step that failed the attempt happened on this service.
    Failed,
    /// Never started because the attempt failed first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub settings: ServiceSettings,
    pub image: ImageRef,
    pub digest: Digest,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    /// `ip:port` the proxy forwards to.
    pub upstream: Option<String>,
    pub status: ServiceStatus,
}

impl ServiceRecord {
    /// What it takes to deploy this service again.
    pub fn to_spec(&self) -> ServiceSpec {
        ServiceSpec {
            settings: self.settings.clone(),
            image: self.image.clone(),
            digest: self.digest,
        }
    }

    pub fn pending(spec: &ServiceSpec) -> Self {
        Self {
            settings: spec.settings.clone(),
            image: spec.image.clone(),
            digest: spec.digest,
            container_id: None,
            container_name: None,
            upstream: None,
            status: ServiceStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentResult {
    Success,
    RolledBack,
    /// Rollback itself could not restore the previous state.
    Failed,
}

impl AsRef<str> for DeploymentResult {
    fn as_ref(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolledBack",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    /// Id of the spec this attempt reconciled. Specs are time-ordered
    /// (uuid v7), so this doubles as the spec version.
    pub spec_id: Uuid,
    pub trigger: Trigger,
    pub services: BTreeMap<String, ServiceRecord>,
    pub proxy_config_version: Option<u64>,
    /// Timestamp in microseconds (UTC)
    pub timestamp: i64,
    pub result: DeploymentResult,
    #[serde(default)]
    pub reason: Option<String>,
}

impl DeploymentRecord {
    pub fn new(
        spec: &DeploymentSpec,
        services: BTreeMap<String, ServiceRecord>,
        proxy_config_version: Option<u64>,
        result: DeploymentResult,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            spec_id: spec.id,
            trigger: spec.trigger,
            services,
            proxy_config_version,
            timestamp: now_micros(),
            result,
            reason,
        }
    }

    /// Container ids serving as part of this record.
    pub fn container_ids(&self) -> impl Iterator<Item = &str> {
        self.services
            .values()
            .filter(|s| s.status == ServiceStatus::Running)
            .filter_map(|s| s.container_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalPhase {
    /// Written before the proxy switch. A restart rolls back.
    Switching,
    /// Written once the new proxy config is live. A restart completes.
    Finalizing,
}

/// A container started by an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedContainer {
    pub service: String,
    pub id: String,
    pub name: String,
}

/// In-flight intent of the attempt currently switching traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub phase: JournalPhase,
    pub spec: DeploymentSpec,
    pub previous_active: Option<Uuid>,
    pub previous_proxy_version: Option<u64>,
    /// The record that becomes active if the attempt completes.
    pub candidate: DeploymentRecord,
    pub started: Vec<StartedContainer>,
    /// Old containers to stop once the attempt completes.
    pub retired: Vec<String>,
}
