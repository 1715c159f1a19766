//! Supervisor configuration loaded from `supervisor.toml`.
//!
//! Every section is optional. Values present in the file are overlaid onto
//! the built-in defaults, unknown keys are rejected, and the merged result is
//! validated before use. CLI flags are applied on top by `main`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::ContainerSettings;
use crate::container::models::StartConfig;

/// Merged supervisor configuration: defaults overlaid with the TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorConfig {
    pub container: ContainerConfig,
    pub startup: StartupConfig,
    pub server: ServerSection,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerConfig {
    pub entrypoint: Vec<String>,
    pub enable_internet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    pub required_ports: Vec<u16>,
    pub sleep_after_secs: u64,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupConfig {
    pub instance_poll_interval_ms: u64,
    pub instance_timeout_ms: u64,
    pub ports_timeout_ms: u64,
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            entrypoint: Vec::new(),
            enable_internet: true,
            default_port: None,
            required_ports: Vec::new(),
            sleep_after_secs: 600,
            env: HashMap::new(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            instance_poll_interval_ms: 300,
            instance_timeout_ms: 8_000,
            ports_timeout_ms: 20_000,
            ping_timeout_ms: 5_000,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sandbox-supervisor"),
        }
    }
}

/// Raw TOML structure; every key is optional.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorToml {
    container: Option<ContainerSection>,
    startup: Option<StartupSection>,
    server: Option<ServerToml>,
    storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerSection {
    entrypoint: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
    enable_internet: Option<bool>,
    default_port: Option<u16>,
    required_ports: Option<Vec<u16>>,
    sleep_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartupSection {
    instance_poll_interval_ms: Option<u64>,
    instance_timeout_ms: Option<u64>,
    ports_timeout_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerToml {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageSection {
    data_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Load configuration from `path`. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let toml: SupervisorToml = toml::from_str(content)?;

        let mut config = Self::default();
        if let Some(section) = toml.container {
            if let Some(entrypoint) = section.entrypoint {
                config.container.entrypoint = entrypoint;
            }
            if let Some(env) = section.env {
                config.container.env = env;
            }
            if let Some(enable_internet) = section.enable_internet {
                config.container.enable_internet = enable_internet;
            }
            if let Some(port) = section.default_port {
                config.container.default_port = Some(port);
            }
            if let Some(ports) = section.required_ports {
                config.container.required_ports = ports;
            }
            if let Some(secs) = section.sleep_after_secs {
                config.container.sleep_after_secs = secs;
            }
        }
        if let Some(section) = toml.startup {
            if let Some(ms) = section.instance_poll_interval_ms {
                config.startup.instance_poll_interval_ms = ms;
            }
            if let Some(ms) = section.instance_timeout_ms {
                config.startup.instance_timeout_ms = ms;
            }
            if let Some(ms) = section.ports_timeout_ms {
                config.startup.ports_timeout_ms = ms;
            }
            if let Some(ms) = section.ping_timeout_ms {
                config.startup.ping_timeout_ms = ms;
            }
        }
        if let Some(section) = toml.server {
            if let Some(host) = section.host {
                config.server.host = host;
            }
            if let Some(port) = section.port {
                config.server.port = port;
            }
        }
        if let Some(section) = toml.storage
            && let Some(dir) = section.data_dir
        {
            config.storage.data_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.startup.instance_poll_interval_ms == 0 {
            anyhow::bail!("startup.instance_poll_interval_ms must be greater than zero");
        }
        if self.container.required_ports.contains(&0) || self.container.default_port == Some(0) {
            anyhow::bail!("container ports must be non-zero");
        }
        Ok(())
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.startup.ping_timeout_ms)
    }

    /// Actor-level settings derived from this configuration.
    pub fn to_settings(&self) -> ContainerSettings {
        ContainerSettings {
            start_defaults: StartConfig {
                env: self.container.env.clone(),
                entrypoint: self.container.entrypoint.clone(),
                enable_internet: self.container.enable_internet,
            },
            default_port: self.container.default_port,
            required_ports: self.container.required_ports.clone(),
            sleep_after: Duration::from_secs(self.container.sleep_after_secs),
            wait_interval: Duration::from_millis(self.startup.instance_poll_interval_ms),
            instance_timeout: Duration::from_millis(self.startup.instance_timeout_ms),
            ports_timeout: Duration::from_millis(self.startup.ports_timeout_ms),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert!(config.container.entrypoint.is_empty());
        assert!(config.container.enable_internet);
        assert_eq!(config.container.sleep_after_secs, 600);
        assert_eq!(config.startup.instance_poll_interval_ms, 300);
        assert_eq!(config.server.port, 8787);
        assert!(config.storage.data_dir.ends_with("sandbox-supervisor"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load(&dir.path().join("supervisor.toml")).unwrap();
        assert_eq!(config, SupervisorConfig::default());
    }

    #[test]
    fn test_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.toml");
        fs::write(
            &path,
            r#"
[container]
entrypoint = ["node", "server.js"]
enable_internet = false
default_port = 8080
required_ports = [8080, 9229]
sleep_after_secs = 120

[container.env]
NODE_ENV = "production"

[startup]
instance_poll_interval_ms = 100
ports_timeout_ms = 5000

[server]
port = 9000

[storage]
data_dir = "/var/lib/sandboxes"
"#,
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.container.entrypoint, vec!["node", "server.js"]);
        assert!(!config.container.enable_internet);
        assert_eq!(config.container.default_port, Some(8080));
        assert_eq!(config.container.env.get("NODE_ENV").unwrap(), "production");
        assert_eq!(config.startup.instance_poll_interval_ms, 100);
        // Untouched keys keep their defaults.
        assert_eq!(config.startup.instance_timeout_ms, 8_000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/sandboxes"));
    }

    #[test]
    fn test_to_settings_derives_try_budgets() {
        let config = SupervisorConfig::from_toml(
            r#"
[startup]
instance_poll_interval_ms = 300
instance_timeout_ms = 8000
ports_timeout_ms = 20000
"#,
        )
        .unwrap();
        let settings = config.to_settings();
        assert_eq!(settings.start_tries(), 26);
        assert_eq!(settings.port_tries(), 66);
        assert_eq!(settings.sleep_after, Duration::from_secs(600));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(SupervisorConfig::from_toml("[startup]\ninstance_poll_interval_ms = 0").is_err());
        assert!(SupervisorConfig::from_toml("[container]\nrequired_ports = [0]").is_err());
        assert!(SupervisorConfig::from_toml("[container]\nunknown = 1").is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = SupervisorConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[container]"));
        assert!(rendered.contains("sleep_after_secs = 600"));
        assert_eq!(SupervisorConfig::from_toml(&rendered).unwrap(), config);
    }
}
