//! Configuration
//!
//! YAML file (path from `IDV_CONFIG`) with environment overrides applied on
//! top. Every section is optional; missing sections take their defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::manager::DEFAULT_MAX_CAS_ATTEMPTS;
use crate::monitor::MonitorConfig;
use crate::thresholds::{TenantOverride, ThresholdProvider, ThresholdTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdvConfig {
    #[serde(default)]
    pub thresholds: ThresholdTable,

    /// Per-tenant overrides keyed by tenant id
    #[serde(default)]
    pub tenants: HashMap<String, TenantOverride>,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,

    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub vision_endpoint: Option<String>,
}

fn default_collaborator_timeout_ms() -> u64 {
    30_000
}

fn default_max_cas_attempts() -> u32 {
    DEFAULT_MAX_CAS_ATTEMPTS
}

impl Default for IdvConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdTable::default(),
            tenants: HashMap::new(),
            monitor: MonitorConfig::default(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            max_cas_attempts: default_max_cas_attempts(),
            database_url: None,
            vision_endpoint: None,
        }
    }
}

impl IdvConfig {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: IdvConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// `.env`, then `IDV_CONFIG` (if set), then environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("IDV_CONFIG") {
            Ok(path) => {
                info!(path = %path, "loading verification config");
                Self::load(&path)?
            }
            Err(_) => {
                debug!("IDV_CONFIG not set; using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `IDV_*` / `DATABASE_URL` overrides from a key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IDV_MONITOR_INTERVAL_SECS") {
            let secs: u64 = parse(&v, "IDV_MONITOR_INTERVAL_SECS")?;
            self.monitor.interval = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("IDV_CONSISTENCY_FLOOR") {
            self.monitor.consistency_floor = parse(&v, "IDV_CONSISTENCY_FLOOR")?;
        }
        if let Some(v) = lookup("IDV_COLLABORATOR_TIMEOUT_MS") {
            self.collaborator_timeout_ms = parse(&v, "IDV_COLLABORATOR_TIMEOUT_MS")?;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("IDV_VISION_ENDPOINT") {
            self.vision_endpoint = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tables = [
            ("thresholds.production".to_string(), Some(self.thresholds.production)),
            ("thresholds.sandbox".to_string(), Some(self.thresholds.sandbox)),
        ];
        let tenant_tables = self.tenants.iter().flat_map(|(tenant, o)| {
            [
                (format!("tenants.{}.production", tenant), o.production),
                (format!("tenants.{}.sandbox", tenant), o.sandbox),
            ]
        });

        for (key, set) in tables.into_iter().chain(tenant_tables) {
            if let Some(field) = set.and_then(|s| s.invalid_field()) {
                return Err(ConfigError::invalid(
                    format!("{}.{}", key, field),
                    "threshold must be within 0..=1",
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.monitor.consistency_floor) {
            return Err(ConfigError::invalid(
                "monitor.consistency_floor",
                "must be within 0..=1",
            ));
        }
        if self.monitor.interval.is_zero() {
            return Err(ConfigError::invalid("monitor.interval", "must be positive"));
        }
        if self.collaborator_timeout_ms == 0 {
            return Err(ConfigError::invalid("collaborator_timeout_ms", "must be positive"));
        }
        if self.max_cas_attempts == 0 {
            return Err(ConfigError::invalid("max_cas_attempts", "must be positive"));
        }
        Ok(())
    }

    pub fn threshold_provider(&self) -> ThresholdProvider {
        ThresholdProvider::new(self.thresholds, self.tenants.clone())
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("cannot parse '{}'", value)))
}
