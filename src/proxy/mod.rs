//! Reverse proxy routing configuration.
//!
//! Every applied configuration gets a version number and a JSON snapshot
//! under `{state_dir}/proxy/versions`. The live file is only ever replaced
//! through an atomic rename, so the proxy sees either the old or the new
//! rule set. The active version and the one before it are kept on disk.

use std::{
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProxySettings;
use crate::model::{DeploymentRecord, ServiceStatus, now_micros};
use crate::store::write_atomic;

mod render;

const STATE_FILE: &str = "state.json";
const VERSIONS_DIR: &str = "versions";
const CANDIDATE_FILE: &str = "candidate.conf";

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Config syntax error: {0}")]
    ConfigSyntax(String),
    #[error("IO error on {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Command `{0}` failed: {1}")]
    Command(String, String),
    #[error("Command `{0}` timed out")]
    Timeout(String),
    #[error("Proxy config version {0} is not retained")]
    VersionNotRetained(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub service: String,
    pub route_prefix: String,
    /// `host:port` requests are forwarded to.
    pub upstream: String,
}

/// Routing table, most specific prefix first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub rules: Vec<ProxyRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedProxyConfig {
    pub version: u64,
    pub config: ProxyConfig,
    /// Native text installed as the live file.
    pub rendered: String,
    /// Timestamp in microseconds (UTC)
    pub applied_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ProxyState {
    active: Option<u64>,
    previous: Option<u64>,
    /// Set while a version is being installed.
    #[serde(default)]
    pending: Option<u64>,
    #[serde(default)]
    latest: u64,
}

pub struct ProxyManager {
    settings: ProxySettings,
    dir: PathBuf,
    template: String,
    command_timeout: Duration,
    state: RwLock<ProxyState>,
}

impl ProxyManager {
    pub fn open(
        settings: ProxySettings,
        state_dir: &Path,
        command_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let dir = state_dir.join("proxy");
        let versions = dir.join(VERSIONS_DIR);
        std::fs::create_dir_all(&versions).map_err(|e| ProxyError::Io(versions.clone(), e))?;

        let template = match &settings.template {
            Some(path) => {
                std::fs::read_to_string(path).map_err(|e| ProxyError::Io(path.clone(), e))?
            }
            None => render::DEFAULT_TEMPLATE.to_string(),
        };

        let state_path = dir.join(STATE_FILE);
        let state = match std::fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProxyState::default(),
            Err(e) => return Err(ProxyError::Io(state_path, e)),
        };

        Ok(Self {
            settings,
            dir,
            template,
            command_timeout,
            state: RwLock::new(state),
        })
    }

    /// One rule per running service that has an upstream.
    pub fn render(&self, record: &DeploymentRecord) -> ProxyConfig {
        let mut rules: Vec<ProxyRule> = record
            .services
            .values()
            .filter(|service| service.status == ServiceStatus::Running)
            .filter_map(|service| {
                Some(ProxyRule {
                    service: service.settings.name.clone(),
                    route_prefix: service.settings.route.clone(),
                    upstream: service.upstream.clone()?,
                })
            })
            .collect();
        rules.sort_by(|a, b| {
            b.route_prefix
                .len()
                .cmp(&a.route_prefix.len())
                .then_with(|| a.route_prefix.cmp(&b.route_prefix))
        });
        ProxyConfig { rules }
    }

    /// Check `config` without touching the live file.
    pub async fn validate(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        let rendered = self.prepare(config)?;

        if let Some(command) = &self.settings.validate_command {
            let candidate = self.dir.join(CANDIDATE_FILE);
            write_atomic(&candidate, rendered.as_bytes())
                .map_err(|e| ProxyError::Io(candidate.clone(), e))?;
            let result = self.run_command(command, &candidate).await;
            let _ = std::fs::remove_file(&candidate);
            match result {
                Ok(()) => {}
                Err(ProxyError::Command(cmd, output)) => {
                    return Err(ProxyError::ConfigSyntax(format!("`{cmd}` rejected config: {output}")));
                }
                Err(e) => return Err(e),
            }
        }
        log::debug!("Proxy config with {} rule(s) is valid", config.rules.len());
        Ok(())
    }

    /// Install `config` as the live file and reload the proxy.
    pub async fn apply(&self, config: &ProxyConfig) -> Result<u64, ProxyError> {
        let rendered = self.prepare(config)?;
        let current = self.state();
        let version = current
            .latest
            .max(current.active.unwrap_or(0))
            .max(current.previous.unwrap_or(0))
            + 1;

        let applied = AppliedProxyConfig {
            version,
            config: config.clone(),
            rendered,
            applied_at: now_micros(),
        };
        let path = self.version_path(version);
        write_atomic(&path, &serde_json::to_vec_pretty(&applied)?)
            .map_err(|e| ProxyError::Io(path, e))?;
        self.save_state(ProxyState {
            pending: Some(version),
            latest: version,
            ..current
        })?;

        self.install(Some(&applied.rendered))?;
        if let Err(e) = self.reload().await {
            log::error!("Proxy reload failed for version {version}: {e}");
            // Put the previous file back so the proxy keeps serving it
            let previous = current.active.map(|v| self.load_version(v)).transpose()?;
            self.install(previous.as_ref().map(|p| p.rendered.as_str()))?;
            if let Err(e) = self.reload().await {
                log::error!("Proxy reload failed after restoring the previous config: {e}");
            }
            self.save_state(ProxyState {
                pending: None,
                latest: version,
                ..current
            })?;
            return Err(e);
        }

        self.save_state(ProxyState {
            active: Some(version),
            previous: current.active,
            pending: None,
            latest: version,
        })?;
        self.prune();
        log::info!(
            "Proxy config version {version} is live ({} rule(s))",
            config.rules.len()
        );
        Ok(version)
    }

    /// Reinstall a retained version. `None` removes the live file, which is
    /// the state before the first deployment.
    pub async fn rollback(&self, to: Option<u64>) -> Result<(), ProxyError> {
        let current = self.state();
        let applied = to.map(|v| self.load_version(v)).transpose()?;

        self.install(applied.as_ref().map(|a| a.rendered.as_str()))?;
        self.reload().await?;

        // Restoring the active version keeps its predecessor retained
        let previous = if to == current.active {
            current.previous
        } else {
            current.active
        };
        self.save_state(ProxyState {
            active: to,
            previous,
            pending: None,
            latest: current.latest,
        })?;
        self.prune();
        match to {
            Some(version) => log::info!("Proxy config rolled back to version {version}"),
            None => log::info!("Proxy config removed"),
        }
        Ok(())
    }

    /// Make the live file match the active version again, e.g. after a
    /// crash in the middle of `apply`.
    pub async fn recover(&self) -> Result<(), ProxyError> {
        let state = self.state();
        let expected = state.active.map(|v| self.load_version(v)).transpose()?;
        let live = match std::fs::read_to_string(&self.settings.config_path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ProxyError::Io(self.settings.config_path.clone(), e)),
        };

        let diverged = match (&expected, &live) {
            (Some(applied), Some(text)) => applied.rendered != *text,
            (Some(_), None) => true,
            // Without an active version only an interrupted first apply
            // leaves a file behind that belongs to us.
            (None, Some(_)) => state.pending.is_some(),
            (None, None) => false,
        };

        if diverged {
            log::warn!(
                "Live proxy config does not match version {:?}, reinstalling",
                state.active
            );
            self.install(expected.as_ref().map(|a| a.rendered.as_str()))?;
            self.reload().await?;
        }
        if state.pending.is_some() {
            self.save_state(ProxyState {
                pending: None,
                ..state
            })?;
        }
        self.prune();
        Ok(())
    }

    pub fn active_version(&self) -> Option<u64> {
        self.state().active
    }

    pub fn active(&self) -> Option<AppliedProxyConfig> {
        let version = self.active_version()?;
        match self.load_version(version) {
            Ok(applied) => Some(applied),
            Err(e) => {
                log::error!("Failed to load active proxy config: {e}");
                None
            }
        }
    }

    /// Versions currently kept on disk.
    pub fn retained(&self) -> Vec<u64> {
        let mut versions: Vec<u64> = std::fs::read_dir(self.dir.join(VERSIONS_DIR))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()?
                            .strip_suffix(".json")?
                            .parse()
                            .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_unstable();
        versions
    }

    fn prepare(&self, config: &ProxyConfig) -> Result<String, ProxyError> {
        render::check_structure(config)?;
        render::render(&self.template, config)
            .map_err(|e| ProxyError::ConfigSyntax(format!("template failed to render: {e}")))
    }

    fn state(&self) -> ProxyState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_state(&self, state: ProxyState) -> Result<(), ProxyError> {
        let path = self.dir.join(STATE_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(&state)?)
            .map_err(|e| ProxyError::Io(path, e))?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.dir.join(VERSIONS_DIR).join(format!("{version}.json"))
    }

    fn load_version(&self, version: u64) -> Result<AppliedProxyConfig, ProxyError> {
        let path = self.version_path(version);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProxyError::VersionNotRetained(version))
            }
            Err(e) => Err(ProxyError::Io(path, e)),
        }
    }

    fn install(&self, rendered: Option<&str>) -> Result<(), ProxyError> {
        let path = &self.settings.config_path;
        let result = match rendered {
            Some(text) => write_atomic(path, text.as_bytes()),
            None => match std::fs::remove_file(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        result.map_err(|e| ProxyError::Io(path.clone(), e))
    }

    /// Delete every version that is neither active nor previous.
    fn prune(&self) {
        let state = self.state();
        for version in self.retained() {
            if Some(version) == state.active
                || Some(version) == state.previous
                || Some(version) == state.pending
            {
                continue;
            }
            let path = self.version_path(version);
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("Pruned proxy config version {version}"),
                Err(e) => log::warn!("Failed to prune {path:?}: {e}"),
            }
        }
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        match &self.settings.reload_command {
            Some(command) => self.run_command(command, &self.settings.config_path).await,
            None => Ok(()),
        }
    }

    /// Run `command` with `{config}` replaced by `config`.
    async fn run_command(&self, command: &[String], config: &Path) -> Result<(), ProxyError> {
        let config = config.to_string_lossy();
        let args: Vec<String> = command
            .iter()
            .map(|arg| arg.replace("{config}", &config))
            .collect();
        let display = args.join(" ");
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ProxyError::Command(display.clone(), "empty command".to_string()))?;

        log::debug!("Running `{display}`");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest).kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProxyError::Command(display, e.to_string())),
            Err(_) => return Err(ProxyError::Timeout(display)),
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(ProxyError::Command(
            display,
            format!("{}: {}", output.status, detail.trim()),
        ))
    }
}
