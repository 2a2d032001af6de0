//! Start-up convergence after a crash or an unclean stop.

use std::collections::HashSet;

use super::Reconciler;
use crate::model::{
    DeploymentRecord, DeploymentResult, DeploymentSpec, Journal, JournalPhase, ServiceStatus,
};
use crate::store::StoreError;

impl Reconciler {
    /// Bring live state back in line with the store before taking new work.
    ///
    /// An attempt interrupted before its proxy switch was confirmed is
    /// rolled back; one interrupted while finalizing is completed. Stray
    /// managed containers are stopped, and a repair deployment is queued
    /// when an active container is no longer running.
    pub async fn recover(&self) -> Result<(), StoreError> {
        if let Some(journal) = self.store.read_journal()? {
            match journal.phase {
                JournalPhase::Switching => self.abandon(&journal).await?,
                JournalPhase::Finalizing => {
                    log::info!(
                        "Deployment {} was interrupted while finalizing, completing it",
                        journal.spec.id
                    );
                    self.finalize(&journal).await?;
                }
            }
        }

        if let Err(e) = self.proxy.recover().await {
            log::error!("Failed to restore the active proxy config: {e}");
        }

        let active = self.store.active();
        self.stop_orphans(active.as_ref()).await;
        if let Some(active) = active {
            self.queue_repair(&active).await;
        }
        Ok(())
    }

    async fn abandon(&self, journal: &Journal) -> Result<(), StoreError> {
        log::warn!(
            "Deployment {} was interrupted while switching traffic, rolling back",
            journal.spec.id
        );

        let mut clean = true;
        if let Err(e) = self.proxy.rollback(journal.previous_proxy_version).await {
            log::error!(
                "Failed to restore proxy config {:?}: {e}",
                journal.previous_proxy_version
            );
            clean = false;
        }
        for started in &journal.started {
            if let Err(e) = self.runtime.stop(&started.id).await {
                log::error!("Failed to stop {}: {e}", started.name);
                clean = false;
            }
        }

        if self.store.find_by_spec(journal.spec.id).is_none() {
            let mut services = journal.candidate.services.clone();
            for started in &journal.started {
                if let Some(service) = services.get_mut(&started.service) {
                    service.status = ServiceStatus::RolledBack;
                }
            }
            let result = if clean {
                DeploymentResult::RolledBack
            } else {
                DeploymentResult::Failed
            };
            let record = DeploymentRecord::new(
                &journal.spec,
                services,
                self.proxy.active_version(),
                result,
                Some("agent restarted while switching traffic".to_string()),
            );
            self.store.append(&record)?;
        }
        self.store.clear_journal()
    }

    /// Stop managed containers the active record does not reference.
    async fn stop_orphans(&self, active: Option<&DeploymentRecord>) {
        let keep: HashSet<&str> = active
            .map(|record| record.container_ids().collect())
            .unwrap_or_default();

        let containers = match self.runtime.list_managed().await {
            Ok(containers) => containers,
            Err(e) => {
                log::error!("Failed to list managed containers: {e}");
                return;
            }
        };

        for container in containers
            .iter()
            .filter(|container| !keep.contains(container.id.as_str()))
        {
            log::warn!(
                "Stopping orphaned container {} (service {:?})",
                container.name,
                container.service
            );
            if let Err(e) = self.runtime.stop(&container.id).await {
                log::error!("Failed to stop {}: {e}", container.name);
            }
        }
    }

    async fn queue_repair(&self, active: &DeploymentRecord) {
        let mut dead = Vec::new();
        for service in active
            .services
            .values()
            .filter(|service| service.status == ServiceStatus::Running)
        {
            let Some(container) = &service.container_id else {
                continue;
            };
            match self.runtime.inspect(container).await {
                Ok(state) if state.running => {}
                Ok(_) => dead.push(service.settings.name.as_str()),
                Err(e) => log::warn!("Failed to inspect {container}: {e}"),
            }
        }
        if dead.is_empty() {
            return;
        }

        log::warn!(
            "Active containers are not running ({}), queueing a repair deployment",
            dead.join(", ")
        );
        match self.queue.push(DeploymentSpec::repair(active)) {
            Ok(id) => log::info!("Repair deployment {id} queued"),
            Err(e) => log::error!("Failed to queue repair deployment: {e}"),
        }
    }
}
