//! Delivery configuration, typically stored as `delivery.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Pattern Spring Boot prints once the application context is up.
pub const SPRING_BOOT_STARTED: &str = "Started [A-Za-z0-9_$]+ in [0-9.]+ seconds";

/// Default wall-clock limit for one spawned build command.
pub const DEFAULT_GOAL_TIMEOUT_MS: u64 = 600_000;

/// Delivery configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Timeout applied to each spawned build command.
    pub goal_timeout_ms: u64,

    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    /// First port handed out to local deployments.
    pub lower_port: u16,

    /// Scheme and host prefixed to every endpoint, without a port.
    pub base_url: String,

    /// Regexes; the first output line matching any of them marks the
    /// service as started.
    pub success_patterns: Vec<String>,

    /// How long a stopped service gets to exit before it is killed.
    pub terminate_grace_ms: u64,

    /// Give up on a service that has not matched a success pattern in time.
    /// Unset means the goal timeout applies.
    pub startup_timeout_ms: Option<u64>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            lower_port: 8080,
            base_url: "http://localhost".to_string(),
            success_patterns: vec![SPRING_BOOT_STARTED.to_string()],
            terminate_grace_ms: 5_000,
            startup_timeout_ms: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            goal_timeout_ms: DEFAULT_GOAL_TIMEOUT_MS,
            deploy: DeployConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.goal_timeout_ms == 0 {
            return Err(invalid("goal_timeout_ms must be > 0"));
        }
        self.deploy.validate()
    }

    pub fn goal_timeout(&self) -> Duration {
        Duration::from_millis(self.goal_timeout_ms)
    }
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lower_port == 0 {
            return Err(invalid("deploy.lower_port must be > 0"));
        }
        if self.base_url.trim().is_empty() {
            return Err(invalid("deploy.base_url must not be empty"));
        }
        if self.terminate_grace_ms == 0 {
            return Err(invalid("deploy.terminate_grace_ms must be > 0"));
        }
        if self.startup_timeout_ms == Some(0) {
            return Err(invalid("deploy.startup_timeout_ms must be > 0 when set"));
        }
        self.compiled_success_patterns()?;
        Ok(())
    }

    /// Compile `success_patterns`. At least one pattern is required.
    pub fn compiled_success_patterns(&self) -> Result<Vec<Regex>> {
        if self.success_patterns.is_empty() {
            return Err(invalid("deploy.success_patterns must not be empty"));
        }
        self.success_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    invalid(format!("deploy.success_patterns: invalid regex {pattern:?}: {e}"))
                })
            })
            .collect()
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    DeliveryError::InvalidConfig(msg.into()).into()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeliveryConfig::default()`.
pub fn load_config(path: &Path) -> Result<DeliveryConfig> {
    if !path.exists() {
        let cfg = DeliveryConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DeliveryConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DeliveryConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
