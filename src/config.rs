use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::health::BackoffPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error in {0:?}: {1}")]
    Template(PathBuf, minijinja::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Variables substituted into the config file before it is parsed.
#[derive(Debug, Default, Clone)]
pub struct ConfigVars {
    inner: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for ConfigVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl Serialize for ConfigVars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Files that match steward.vars | *.steward.vars
/// Sorted
fn list_vars_files(config_path: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let search_dir = config_path.parent().map_or(Path::new("."), |p| {
        if p.as_os_str().is_empty() {
            Path::new(".")
        } else {
            p
        }
    });
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() {
                if let Some(file_name) = path.file_name().and_then(|s| s.to_str()) {
                    if file_name == "steward.vars" || file_name.ends_with(".steward.vars") {
                        files.push(path);
                    }
                }
            }
        }
    }

    files.sort();
    files
}

impl ConfigVars {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn combine(vars: Vec<Self>) -> Self {
        let mut combined_inner = HashMap::new();
        vars.into_iter().for_each(|var_set| {
            combined_inner.extend(var_set.inner);
        });
        Self {
            inner: combined_inner,
        }
    }

    pub fn try_init(config_path: &Path) -> Result<Self, ConfigError> {
        let mut vars = Vec::new();
        for vars_file in list_vars_files(config_path) {
            match std::fs::read_to_string(&vars_file) {
                Ok(this_vars) => match Self::try_init_from_string(&this_vars) {
                    Ok(this_vars) => vars.push(this_vars),
                    Err(e) => log::error!("Error parsing vars file {vars_file:?}: {e}"),
                },
                Err(e) => log::error!("Error reading vars file {vars_file:?}: {e}"),
            }
        }
        Ok(Self::combine(vars))
    }
}

pub fn render_template(template_str: &str, vars: &ConfigVars) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub retry: RetrySection,
    pub proxy: ProxySettings,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub state_dir: PathBuf,
    /// Docker network every managed container is attached to.
    #[serde(default = "default_network")]
    pub network: String,
    /// Prefix for the names of managed containers.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// Maximum number of specs waiting behind the one in flight.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Bearer token required on the deployment API. Unset disables auth.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7878))
}

fn default_network() -> String {
    "steward".to_string()
}

fn default_container_prefix() -> String {
    "steward".to_string()
}

fn default_queue_capacity() -> usize {
    16
}

/// Timeouts for every external call, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub pull: u64,
    pub start: u64,
    pub stop: u64,
    pub inspect: u64,
    pub health: u64,
    pub proxy_command: u64,
    pub probe_request: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            pull: 300,
            start: 60,
            stop: 30,
            inspect: 10,
            health: 60,
            proxy_command: 30,
            probe_request: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub base_ms: u64,
    pub factor: u32,
    pub cap_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 2,
            cap_ms: 8000,
        }
    }
}

impl HealthSection {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            factor: self.factor.max(1),
            cap: Duration::from_millis(self.cap_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries after the first failed pull.
    pub pull_retries: u32,
    /// Linear step between pull retries, in seconds (2s, 4s, 6s, ...).
    pub pull_step: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            pull_retries: 3,
            pull_step: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    /// The routing file the reverse proxy includes.
    pub config_path: PathBuf,
    /// Optional minijinja template replacing the built-in nginx one.
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// Command validating a candidate file. `{config}` is replaced with its path.
    #[serde(default)]
    pub validate_command: Option<Vec<String>>,
    /// Command making the proxy pick up the live file.
    #[serde(default)]
    pub reload_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum Restart {
    #[serde(alias = "always")]
    Always,
    #[serde(alias = "no", alias = "never")]
    No,
    #[serde(alias = "on-failure", alias = "on_failure", alias = "onfailure")]
    OnFailure,
    #[default]
    #[serde(
        alias = "unless-stopped",
        alias = "unless_stopped",
        alias = "unlessstopped"
    )]
    UnlessStopped,
}

/// Static settings of a deployable service. Requests only name the
/// service and its image; everything else comes from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSettings {
    pub name: String,
    pub container_port: u16,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// Route prefix the proxy forwards to this service.
    pub route: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart: Restart,
    /// Memory limit (e.g., "512m", "2g")
    #[serde(default)]
    pub memory: Option<String>,
    /// Number of CPUs (e.g., "1.5", "2")
    #[serde(default)]
    pub cpus: Option<String>,
}

impl ServiceSettings {
    /// Memory limit in bytes (e.g., "512m" or "2g").
    pub fn memory_bytes(&self) -> Result<Option<i64>, ConfigError> {
        let Some(raw) = &self.memory else {
            return Ok(None);
        };
        let limit = raw.trim().to_lowercase();
        let (number, multiplier) = if let Some(n) = limit.strip_suffix('g') {
            (n, 1024 * 1024 * 1024)
        } else if let Some(n) = limit.strip_suffix('m') {
            (n, 1024 * 1024)
        } else if let Some(n) = limit.strip_suffix('k') {
            (n, 1024)
        } else if let Some(n) = limit.strip_suffix('b') {
            (n, 1)
        } else {
            (limit.as_str(), 1)
        };
        match number.parse::<i64>().ok().and_then(|n| n.checked_mul(multiplier)) {
            Some(bytes) if bytes > 0 => Ok(Some(bytes)),
            _ => Err(ConfigError::Invalid(format!(
                "memory limit '{raw}' of service '{}' is not a positive size",
                self.name
            ))),
        }
    }

    /// CPU quota in units of 10^-9 CPUs.
    pub fn nano_cpus(&self) -> Result<Option<i64>, ConfigError> {
        let Some(raw) = &self.cpus else {
            return Ok(None);
        };
        match raw.trim().parse::<f64>() {
            Ok(cpus) if cpus.is_finite() && cpus > 0.0 && cpus < 1_000_000.0 => {
                Ok(Some((cpus * 1_000_000_000.0) as i64))
            }
            _ => Err(ConfigError::Invalid(format!(
                "cpus '{raw}' of service '{}' is not a positive number",
                self.name
            ))),
        }
    }
}

fn default_health_check_path() -> String {
    "/".to_string()
}

/// The set of services the agent is allowed to deploy.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    inner: BTreeMap<String, ServiceSettings>,
}

impl ServiceCatalog {
    pub fn get(&self, name: &str) -> Option<&ServiceSettings> {
        self.inner.get(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl TryFrom<Vec<ServiceSettings>> for ServiceCatalog {
    type Error = ConfigError;

    fn try_from(services: Vec<ServiceSettings>) -> Result<Self, Self::Error> {
        let mut inner = BTreeMap::new();
        for service in services {
            if !crate::intake::is_valid_service_name(&service.name) {
                return Err(ConfigError::Invalid(format!(
                    "invalid service name '{}'",
                    service.name
                )));
            }
            if !service.route.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "route of service '{}' must start with '/'",
                    service.name
                )));
            }
            if !service.health_check_path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "health check path of service '{}' must start with '/'",
                    service.name
                )));
            }
            service.memory_bytes()?;
            service.nano_cpus()?;
            if let Some(other) = inner
                .values()
                .find(|other: &&ServiceSettings| other.route == service.route)
            {
                return Err(ConfigError::Invalid(format!(
                    "services '{}' and '{}' share the route '{}'",
                    other.name, service.name, service.route
                )));
            }
            let name = service.name.clone();
            if inner.insert(name.clone(), service).is_some() {
                return Err(ConfigError::Invalid(format!("service '{name}' declared twice")));
            }
        }
        Ok(Self { inner })
    }
}

impl AgentConfig {
    fn try_init_from_string(config: &str, path: &Path, vars: &ConfigVars) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars)
            .map_err(|e| ConfigError::Template(path.to_path_buf(), e))?;
        let config: AgentConfig = toml::from_str(&rendered)?;
        // Surface catalog errors at load time, not at the first request
        config.catalog()?;
        Ok(config)
    }

    pub fn try_init_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        let vars = ConfigVars::try_init(path)?;
        Self::try_init_from_string(&config, path, &vars)
    }

    pub fn try_init() -> Result<Self, ConfigError> {
        Self::try_init_from_path(&crate::cli::get_cli_args().config)
    }

    pub fn catalog(&self) -> Result<ServiceCatalog, ConfigError> {
        ServiceCatalog::try_from(self.services.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> ConfigVars {
        ConfigVars {
            inner: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    const CONFIG: &str = r#"
        [agent]
        listen = "0.0.0.0:9000"
        state_dir = "${ state_dir }"
        token = "${ token }"

        [proxy]
        config_path = "/etc/nginx/conf.d/steward.conf"
        validate_command = ["nginx", "-t", "-c", "{config}"]
        reload_command = ["nginx", "-s", "reload"]

        [[service]]
        name = "backend"
        container_port = 8000
        health_check_path = "/health"
        route = "/api"
        restart = "always"

        [service.env]
        DATABASE_URL = "postgres://db/app"

        [[service]]
        name = "frontend"
        container_port = 3000
        route = "/"
    "#;

    #[test]
    fn test_vars_parsing() {
        let input = r#"
            var1 = "value1"
            var2 = "value2"
        "#;
        let vars = ConfigVars::try_init_from_string(input).expect("Failed to parse vars");
        assert_eq!(vars.inner.get("var1").map(|s| s.as_str()), Some("value1"));
        assert_eq!(vars.inner.get("var2").map(|s| s.as_str()), Some("value2"));
    }

    #[test]
    fn test_later_vars_files_override_earlier_ones() {
        let combined = ConfigVars::combine(vec![
            vars(&[("a", "1"), ("b", "1")]),
            vars(&[("b", "2")]),
        ]);
        assert_eq!(combined.inner.get("a").map(String::as_str), Some("1"));
        assert_eq!(combined.inner.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_config_loading_with_templates() {
        let vars = vars(&[("state_dir", "/var/lib/steward"), ("token", "s3cret")]);
        let config = AgentConfig::try_init_from_string(CONFIG, Path::new("steward.toml"), &vars)
            .expect("Failed to parse config");

        assert_eq!(config.agent.listen.port(), 9000);
        assert_eq!(config.agent.state_dir, PathBuf::from("/var/lib/steward"));
        assert_eq!(config.agent.token.as_deref(), Some("s3cret"));
        assert_eq!(config.agent.network, "steward");
        assert_eq!(config.agent.queue_capacity, 16);
        assert_eq!(config.retry.pull_retries, 3);
        assert_eq!(config.health.backoff(), BackoffPolicy::default());

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 2);
        let backend = catalog.get("backend").unwrap();
        assert_eq!(backend.container_port, 8000);
        assert_eq!(backend.restart, Restart::Always);
        assert_eq!(
            backend.env.get("DATABASE_URL").map(String::as_str),
            Some("postgres://db/app")
        );
        let frontend = catalog.get("frontend").unwrap();
        assert_eq!(frontend.health_check_path, "/");
        assert_eq!(frontend.restart, Restart::UnlessStopped);
    }

    #[test]
    fn test_template_failure() {
        let res = AgentConfig::try_init_from_string(CONFIG, Path::new("steward.toml"), &vars(&[]));
        assert!(matches!(res, Err(ConfigError::Template(_, _))), "{:?}", res);
    }

    #[test]
    fn test_duplicate_service_is_rejected() {
        let config = r#"
            [agent]
            state_dir = "/tmp/steward"
            [proxy]
            config_path = "/tmp/steward.conf"
            [[service]]
            name = "api"
            container_port = 80
            route = "/"
            [[service]]
            name = "api"
            container_port = 81
            route = "/v2"
        "#;
        let res = AgentConfig::try_init_from_string(config, Path::new("steward.toml"), &vars(&[]));
        assert!(matches!(res, Err(ConfigError::Invalid(_))), "{:?}", res);
    }

    fn service(name: &str, route: &str) -> ServiceSettings {
        ServiceSettings {
            name: name.to_string(),
            container_port: 8000,
            health_check_path: "/health".to_string(),
            route: route.to_string(),
            env: BTreeMap::new(),
            restart: Restart::default(),
            memory: None,
            cpus: None,
        }
    }

    #[test]
    fn test_resource_limits() {
        let mut backend = service("backend", "/api");
        backend.memory = Some("512m".to_string());
        backend.cpus = Some("1.5".to_string());
        assert_eq!(backend.memory_bytes().unwrap(), Some(512 * 1024 * 1024));
        assert_eq!(backend.nano_cpus().unwrap(), Some(1_500_000_000));

        backend.memory = Some("2G".to_string());
        assert_eq!(backend.memory_bytes().unwrap(), Some(2 * 1024 * 1024 * 1024));
        backend.memory = Some("1024".to_string());
        assert_eq!(backend.memory_bytes().unwrap(), Some(1024));

        assert_eq!(service("frontend", "/").memory_bytes().unwrap(), None);
        assert_eq!(service("frontend", "/").nano_cpus().unwrap(), None);
    }

    #[test]
    fn test_bad_resource_limits_are_rejected() {
        for memory in ["lots", "0", "-1m", ""] {
            let mut backend = service("backend", "/api");
            backend.memory = Some(memory.to_string());
            let res = ServiceCatalog::try_from(vec![backend]);
            assert!(matches!(res, Err(ConfigError::Invalid(_))), "memory {memory:?}: {res:?}");
        }
        for cpus in ["two", "0", "-0.5", "NaN", "inf"] {
            let mut backend = service("backend", "/api");
            backend.cpus = Some(cpus.to_string());
            let res = ServiceCatalog::try_from(vec![backend]);
            assert!(matches!(res, Err(ConfigError::Invalid(_))), "cpus {cpus:?}: {res:?}");
        }
    }

    #[test]
    fn test_shared_route_is_rejected() {
        let res = ServiceCatalog::try_from(vec![service("backend", "/api"), service("admin", "/api")]);
        assert!(matches!(res, Err(ConfigError::Invalid(_))), "{res:?}");

        let catalog =
            ServiceCatalog::try_from(vec![service("backend", "/api"), service("admin", "/admin")]);
        assert_eq!(catalog.unwrap().len(), 2);
    }
}
