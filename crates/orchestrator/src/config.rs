use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub driver: DriverConfig,
    pub cargo: CargoConfig,
    pub security: SecurityConfig,
    pub idempotency: IdempotencyConfig,
    pub gc: GcConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    LocalEngine,
    Cluster,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImagePullPolicySetting {
    Always,
    IfNotPresent,
    Never,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    #[serde(rename = "type")]
    pub kind: DriverKind,
    pub socket_path: String,
    pub image_pull_policy: ImagePullPolicySetting,
    pub connect_mode: bay_driver::ConnectMode,
    pub host_address: String,
    pub publish_ports: bool,
    pub host_port: Option<u16>,
    pub network: Option<String>,
    pub pod_startup_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CargoConfig {
    pub root_path: String,
    pub default_size_limit_mb: u64,
    pub mount_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub api_key: Option<String>,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    pub ttl_hours: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcTaskConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    pub enabled: bool,
    pub run_on_startup: bool,
    pub interval_seconds: u64,
    pub instance_id: Option<String>,
    pub idle_session: GcTaskConfig,
    pub expired_sandbox: GcTaskConfig,
    pub orphan_cargo: GcTaskConfig,
    pub orphan_container: GcTaskConfig,
}

impl GcConfig {
    /// Resolution chain: configured instance id, else `HOSTNAME`, else `"bay"`.
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "bay".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// One container within a profile's session template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerProfileConfig {
    pub name: String,
    pub image: String,
    pub runtime_type: String,
    pub runtime_port: u16,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub primary_for: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A named sandbox profile: one or more container templates plus idle timeout.
///
/// `model_post_init` in the original normalizes a legacy single-image shape
/// (`image` + `runtime_port` at the top level) into a one-element `containers`
/// list; `normalize()` below plays that role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub id: String,
    #[serde(default)]
    pub containers: Vec<ContainerProfileConfig>,
    // Legacy single-container shape.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub runtime_port: Option<u16>,
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_startup_order")]
    pub startup_order: StartupOrderSetting,
    #[serde(default = "default_wait_for_all")]
    pub wait_for_all: bool,
}

fn default_startup_order() -> StartupOrderSetting {
    StartupOrderSetting::Sequential
}

fn default_wait_for_all() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupOrderSetting {
    Parallel,
    Sequential,
}

impl ProfileConfig {
    /// Normalize the legacy single-image shape into `containers`, in place.
    pub fn normalize(&mut self) {
        if self.containers.is_empty() {
            if let Some(image) = self.image.clone() {
                self.containers.push(ContainerProfileConfig {
                    name: "primary".to_string(),
                    image,
                    runtime_type: "ship".to_string(),
                    runtime_port: self.runtime_port.unwrap_or(8123),
                    cpu_limit: None,
                    memory_limit_mb: None,
                    capabilities: vec![
                        "python".to_string(),
                        "shell".to_string(),
                        "filesystem".to_string(),
                        "terminal".to_string(),
                    ],
                    primary_for: vec![],
                    env: HashMap::new(),
                });
            }
        }
    }

    /// First container whose `primary_for` contains this capability, else the
    /// first one whose `capabilities` contains it.
    pub fn find_container_for_capability(&self, capability: &str) -> Option<&ContainerProfileConfig> {
        self.containers
            .iter()
            .find(|c| c.primary_for.iter().any(|p| p == capability))
            .or_else(|| self.containers.iter().find(|c| c.capabilities.iter().any(|p| p == capability)))
    }

    /// The container named "primary" or "ship", else the first declared.
    pub fn primary_container(&self) -> Option<&ContainerProfileConfig> {
        self.containers
            .iter()
            .find(|c| c.name == "primary" || c.name == "ship")
            .or_else(|| self.containers.first())
    }

    pub fn is_multi(&self) -> bool {
        self.containers.len() > 1
    }
}

impl OrchestratorConfig {
    /// Load configuration from `bay.toml` (or candidate locations) and
    /// environment variables, layered over compiled-in defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&OrchestratorConfig::default())
            .context("failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let config_paths = ["/etc/bay/bay", "config/bay", "bay"];
        for path in config_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BAY")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: OrchestratorConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        for profile in &mut cfg.profiles {
            profile.normalize();
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_address()
            .parse::<std::net::SocketAddr>()
            .context("invalid server.host/server.port")?;

        if self.gc.enabled && self.gc.interval_seconds == 0 {
            anyhow::bail!("gc.interval_seconds must be > 0 when gc.enabled is true");
        }

        if self.driver.pod_startup_timeout_seconds == 0 {
            anyhow::bail!("driver.pod_startup_timeout_seconds must be > 0");
        }

        for profile in &self.profiles {
            if profile.containers.is_empty() {
                anyhow::bail!("profile '{}' declares no containers", profile.id);
            }
        }

        Ok(())
    }

    pub fn profile(&self, id: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 8080 },
            database: DatabaseConfig { url: "sqlite://bay.db?mode=rwc".to_string(), echo: false },
            driver: DriverConfig {
                kind: DriverKind::LocalEngine,
                socket_path: "/var/run/docker.sock".to_string(),
                image_pull_policy: ImagePullPolicySetting::IfNotPresent,
                connect_mode: bay_driver::ConnectMode::Auto,
                host_address: "127.0.0.1".to_string(),
                publish_ports: true,
                host_port: None,
                network: None,
                pod_startup_timeout_seconds: 120,
            },
            cargo: CargoConfig {
                root_path: "./cargos".to_string(),
                default_size_limit_mb: 1024,
                mount_path: "/workspace".to_string(),
            },
            security: SecurityConfig { api_key: None, allow_anonymous: true, blocked_hosts: vec![] },
            idempotency: IdempotencyConfig { enabled: true, ttl_hours: 24 },
            gc: GcConfig {
                enabled: true,
                run_on_startup: false,
                interval_seconds: 60,
                instance_id: None,
                idle_session: GcTaskConfig { enabled: true },
                expired_sandbox: GcTaskConfig { enabled: true },
                orphan_cargo: GcTaskConfig { enabled: true },
                orphan_container: GcTaskConfig { enabled: false },
            },
            logging: LoggingConfig { level: "info,bay_orchestrator=debug".to_string(), format: LogFormat::Pretty },
            profiles: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn gc_instance_id_falls_back_to_literal_bay() {
        let mut cfg = GcConfig {
            enabled: true,
            run_on_startup: false,
            interval_seconds: 60,
            instance_id: None,
            idle_session: GcTaskConfig { enabled: true },
            expired_sandbox: GcTaskConfig { enabled: true },
            orphan_cargo: GcTaskConfig { enabled: true },
            orphan_container: GcTaskConfig { enabled: false },
        };
        std::env::remove_var("HOSTNAME");
        assert_eq!(cfg.resolved_instance_id(), "bay");

        cfg.instance_id = Some("explicit".to_string());
        assert_eq!(cfg.resolved_instance_id(), "explicit");
    }

    #[test]
    fn legacy_profile_normalizes_to_single_container() {
        let mut profile = ProfileConfig {
            id: "python-default".to_string(),
            containers: vec![],
            image: Some("bay/ship:latest".to_string()),
            runtime_port: Some(8123),
            idle_timeout_seconds: 300,
            startup_order: StartupOrderSetting::Sequential,
            wait_for_all: true,
        };
        profile.normalize();
        assert_eq!(profile.containers.len(), 1);
        assert_eq!(profile.containers[0].image, "bay/ship:latest");
        assert!(!profile.is_multi());
    }

    #[test]
    fn find_container_for_capability_prefers_primary_for() {
        let profile = ProfileConfig {
            id: "multi".to_string(),
            containers: vec![
                ContainerProfileConfig {
                    name: "ship".to_string(),
                    image: "bay/ship:latest".to_string(),
                    runtime_type: "ship".to_string(),
                    runtime_port: 8123,
                    cpu_limit: None,
                    memory_limit_mb: None,
                    capabilities: vec!["python".to_string(), "shell".to_string(), "filesystem".to_string()],
                    primary_for: vec!["filesystem".to_string()],
                    env: HashMap::new(),
                },
                ContainerProfileConfig {
                    name: "gull".to_string(),
                    image: "bay/gull:latest".to_string(),
                    runtime_type: "gull".to_string(),
                    runtime_port: 9000,
                    cpu_limit: None,
                    memory_limit_mb: None,
                    capabilities: vec!["browser".to_string()],
                    primary_for: vec!["browser".to_string()],
                    env: HashMap::new(),
                },
            ],
            image: None,
            runtime_port: None,
            idle_timeout_seconds: 300,
            startup_order: StartupOrderSetting::Sequential,
            wait_for_all: true,
        };
        assert_eq!(profile.find_container_for_capability("browser").unwrap().name, "gull");
        assert_eq!(profile.find_container_for_capability("python").unwrap().name, "ship");
        assert!(profile.find_container_for_capability("gpu").is_none());
        assert!(profile.is_multi());
    }
}
