//! Configuration management for the virtnode CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use virtnode_hypervisor::{ManagerOptions, OvfDefaults};

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtnode/virtnode.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub simulation: SimulationConfig,
    pub metrics: MetricsConfig,
    pub openvz: OpenVzConfig,
    /// Per-family template defaults
    pub ovf_defaults: OvfDefaults,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Write the configuration as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Persist `backends` as the allow-list in the file at `path`, keeping
    /// the rest of its settings. A missing file starts from defaults.
    pub fn store_backends<P: AsRef<Path>>(path: P, backends: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() { Self::load(path)? } else { Self::default() };
        config.general.backends = backends.to_vec();
        config.save(path)?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref backend) = args.backend {
            self.general.default_backend = Some(backend.clone());
        }

        if let Some(ref pool) = args.pool {
            self.storage.default_pool = Some(pool.clone());
        }

        if let Some(ref level) = args.log_level {
            self.general.log_level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.general.log_format = format.clone();
        }

        self
    }

    /// The backend URI commands run against.
    pub fn target_backend(&self) -> Result<String> {
        self.general
            .default_backend
            .clone()
            .or_else(|| self.general.backends.first().cloned())
            .context("No backend selected: pass --backend or configure general.backends")
    }

    /// Options for the VM manager.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            backends: self.general.backends.clone(),
            storage_endpoint: self.storage.endpoint.clone(),
            default_pool: self.storage.default_pool.clone(),
            snapshot_path: self.simulation.snapshot_path.clone(),
            counter_dir: self.metrics.counter_dir.clone(),
            template_cache: self.openvz.template_cache.clone(),
            ovf_defaults: self.ovf_defaults.clone(),
        }
    }
}

/// General settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Allowed backend URIs. Empty allows any.
    pub backends: Vec<String>,
    /// Backend used when `--backend` is not given
    pub default_backend: Option<String>,
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            default_backend: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Template storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the storage pools
    pub endpoint: PathBuf,
    pub default_pool: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let defaults = ManagerOptions::default();
        Self {
            endpoint: defaults.storage_endpoint,
            default_pool: defaults.default_pool,
        }
    }
}

/// Simulation driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Where fixture sessions write their node snapshot
    pub snapshot_path: PathBuf,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            snapshot_path: ManagerOptions::default().snapshot_path,
        }
    }
}

/// Metrics sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Directory holding counter samples between runs
    pub counter_dir: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            counter_dir: ManagerOptions::default().counter_dir,
        }
    }
}

/// OpenVZ settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVzConfig {
    /// `vzctl` OS template cache
    pub template_cache: PathBuf,
}

impl Default for OpenVzConfig {
    fn default() -> Self {
        Self {
            template_cache: ManagerOptions::default().template_cache,
        }
    }
}
