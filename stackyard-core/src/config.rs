//! Runtime settings.
//!
//! Resolution order: built-in defaults, then `~/.stackyard/config.yaml`
//! (every field optional), then `STACKYARD_*` environment variables.
//!
//! Like the rest of the crate, loading has two forms:
//! - `load_at(home)`: explicit home; used in tests with `TempDir`
//! - `load()`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment '{other}'; expected development or production")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSettings {
    /// Base URL of the cluster API. `None` means no cluster is available.
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub datastore_image: String,
    pub datastore_port: u16,
    /// Fixed datastore password. Unset means every stack gets a fresh one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore_password: Option<String>,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            datastore_image: "postgres:15-alpine".to_string(),
            datastore_port: 5432,
            datastore_password: None,
        }
    }
}

/// Per-call bounds for external steps, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub namespace_secs: u64,
    pub workload_secs: u64,
    pub storage_secs: u64,
    pub store_secs: u64,
    pub registry_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            namespace_secs: 5,
            workload_secs: 15,
            storage_secs: 15,
            store_secs: 5,
            registry_secs: 35,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryLockSettings {
    pub write_secs: u64,
    pub read_secs: u64,
}

impl Default for RegistryLockSettings {
    fn default() -> Self {
        Self {
            write_secs: 30,
            read_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Concurrent blocking external calls.
    pub pool_size: usize,
    /// Lifecycle tasks running at once.
    pub max_in_flight: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_in_flight: 16,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub environment: Environment,
    /// Tolerate control-plane step failures. Defaults to `true` in development.
    pub permissive: Option<bool>,
    pub platform_root: PathBuf,
    /// Defaults to `<platform_root>/runtime/graphs.json`.
    pub registry_path: Option<PathBuf>,
    /// Prefix of registered code paths as seen by the consuming runtime.
    pub graph_prefix: String,
    pub entry_file: String,
    pub entry_symbol: String,
    pub default_slug: String,
    pub runtime_public_url: String,
    pub chat_ui_base_url: String,
    pub control_plane: ControlPlaneSettings,
    pub timeouts: TimeoutSettings,
    pub registry_lock: RegistryLockSettings,
    pub workers: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            permissive: None,
            platform_root: PathBuf::from("/var/agent-platform"),
            registry_path: None,
            graph_prefix: "./graphs".to_string(),
            entry_file: "graph.py".to_string(),
            entry_symbol: "graph".to_string(),
            default_slug: "agent".to_string(),
            runtime_public_url: "http://localhost:8001".to_string(),
            chat_ui_base_url: "http://localhost:3002".to_string(),
            control_plane: ControlPlaneSettings::default(),
            timeouts: TimeoutSettings::default(),
            registry_lock: RegistryLockSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings for `home`, applying process environment overrides.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::from_file_at(home)?;
        settings.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Self::load_at(&home)
    }

    /// Defaults merged with `~/.stackyard/config.yaml`, if present.
    pub fn from_file_at(home: &Path) -> Result<Self, ConfigError> {
        let path = paths::config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Apply `STACKYARD_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("STACKYARD_ENVIRONMENT") {
            self.environment = value.parse().map_err(|message| ConfigError::Invalid {
                key: "STACKYARD_ENVIRONMENT".to_string(),
                message,
            })?;
        }
        if let Some(value) = get("STACKYARD_PERMISSIVE") {
            self.permissive = Some(parse_bool("STACKYARD_PERMISSIVE", &value)?);
        }
        if let Some(value) = get("STACKYARD_PLATFORM_ROOT") {
            self.platform_root = PathBuf::from(value);
        }
        if let Some(value) = get("STACKYARD_REGISTRY_PATH") {
            self.registry_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get("STACKYARD_CONTROL_PLANE_URL") {
            self.control_plane.api_url = Some(value);
        }
        if let Some(value) = get("STACKYARD_CONTROL_PLANE_TOKEN") {
            self.control_plane.token = Some(value);
        }
        if let Some(value) = get("STACKYARD_DATASTORE_PASSWORD") {
            self.control_plane.datastore_password = Some(value);
        }
        if let Some(value) = get("STACKYARD_RUNTIME_PUBLIC_URL") {
            self.runtime_public_url = value;
        }
        if let Some(value) = get("STACKYARD_CHAT_UI_URL") {
            self.chat_ui_base_url = value;
        }
        self.check()
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.workers.pool_size == 0 {
            return Err(invalid("workers.pool_size", "must be at least 1"));
        }
        if self.workers.max_in_flight == 0 {
            return Err(invalid("workers.max_in_flight", "must be at least 1"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(invalid("workers.queue_capacity", "must be at least 1"));
        }
        if self.entry_file.is_empty() || self.entry_file.contains('/') {
            return Err(invalid("entry_file", "must be a bare file name"));
        }
        if self.default_slug.is_empty() || self.default_slug.contains('/') {
            return Err(invalid("default_slug", "must be a bare directory name"));
        }
        // A registry call must outlive its own lock wait or a contended lock
        // surfaces as a step timeout.
        let lock_wait = self.registry_lock.write_secs.max(self.registry_lock.read_secs);
        if self.timeouts.registry_secs <= lock_wait {
            return Err(ConfigError::Invalid {
                key: "timeouts.registry_secs".to_string(),
                message: format!("must be greater than the registry lock wait ({lock_wait}s)"),
            });
        }
        Ok(())
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
            .unwrap_or(self.environment == Environment::Development)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.platform_root.join("runtime").join("graphs.json"))
    }

    pub fn namespace_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.namespace_secs)
    }

    pub fn workload_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.workload_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.storage_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.store_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.registry_secs)
    }

    pub fn registry_write_lock(&self) -> Duration {
        Duration::from_secs(self.registry_lock.write_secs)
    }

    pub fn registry_read_lock(&self) -> Duration {
        Duration::from_secs(self.registry_lock.read_secs)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}
