//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and converts it into the settings the renderer and supervisor consume.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::runner::SupervisorSettings;
use crate::scripts::LogRotation;
use crate::service::{DataServices, ServiceDescriptor};
use crate::shortcuts::ShortcutTable;

pub const DEFAULT_CONFIG_FILE: &str = "devrack.toml";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Installation root; defaults to the directory holding the file.
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Extra or overriding name shortcuts.
    #[serde(default)]
    pub shortcuts: BTreeMap<String, String>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisionConfig {
    /// Seconds `sv -w` waits for a state change.
    pub control_timeout_secs: Option<u64>,
    pub stop_attempts: Option<u32>,
    /// Delay in milliseconds between stop attempts.
    pub retry_delay_ms: Option<u64>,
    pub ready_attempts: Option<u32>,
    pub ready_interval_ms: Option<u64>,
    /// Replaces the built-in list of data-oriented services.
    pub data_services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Size at which `svlogd` rotates `current`.
    pub max_bytes: Option<u64>,
    /// Rotated files to keep.
    pub keep: Option<u32>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Shell command run in the foreground under supervision.
    pub cmd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub enabled: Option<bool>,
    /// Printed once the service has been started.
    pub ready_message: Option<String>,
}

impl Config {
    /// Effective installation root for a config loaded from `path`, made
    /// absolute against the working directory.
    pub fn root(&self, path: &Path) -> Result<PathBuf> {
        let base = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let root = match &self.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => base.join(root),
            None => base.to_path_buf(),
        };
        std::path::absolute(&root)
            .with_context(|| format!("failed to resolve installation root {}", root.display()))
    }

    pub fn service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|service| ServiceDescriptor {
                env: service.env.clone(),
                enabled: service.enabled.unwrap_or(true),
                ready_message: service.ready_message.clone(),
                ..ServiceDescriptor::new(&service.name, &service.cmd)
            })
            .collect()
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let defaults = SupervisorSettings::default();
        let supervision = &self.supervision;
        SupervisorSettings {
            control_timeout: supervision
                .control_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.control_timeout),
            stop_attempts: supervision.stop_attempts.unwrap_or(defaults.stop_attempts),
            retry_delay: supervision
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            ready_attempts: supervision.ready_attempts.unwrap_or(defaults.ready_attempts),
            ready_interval: supervision
                .ready_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_interval),
            data_services: supervision
                .data_services
                .clone()
                .map(DataServices::new)
                .unwrap_or(defaults.data_services),
        }
    }

    pub fn log_rotation(&self) -> LogRotation {
        let defaults = LogRotation::default();
        LogRotation {
            max_bytes: self.log.max_bytes.unwrap_or(defaults.max_bytes),
            keep: self.log.keep.unwrap_or(defaults.keep),
        }
    }

    pub fn shortcut_table(&self) -> ShortcutTable {
        ShortcutTable::with_overrides(self.shortcuts.clone())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if !is_plain_name(&service.name) {
                bail!("invalid service name '{}'", service.name);
            }
            if !seen.insert(service.name.as_str()) {
                bail!("service '{}' is defined more than once", service.name);
            }
        }
        Ok(())
    }
}

// A name must be a single ordinary path component, so `sv/<name>` and
// `services/<name>` stay directly inside their directories.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<Config> {
    let config: Config = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}
