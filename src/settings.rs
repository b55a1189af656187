//! Engine settings.
//!
//! Loaded from an optional TOML file and `ROWFERRY_`-prefixed environment
//! variables, environment winning:
//!
//! ```toml
//! [engine]
//! fetch_size = 10000
//! permit_wait_ms = 10
//! io_threads = 4
//!
//! [logging]
//! level = "info"
//!
//! [datasources.warehouse]
//! type = "postgresql"
//! host = "db.internal"
//! username = "loader"
//!
//! [properties]
//! schema = "sales"
//! ```
//!
//! ```bash
//! ROWFERRY_ENGINE__FETCH_SIZE=500
//! ROWFERRY_DATASOURCES__WAREHOUSE__PASSWORD=secret
//! ```

use crate::db_types::ConnectionConfig;
use crate::error::{Result, TransferError};
use crate::template::ConfigValue;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "ROWFERRY_";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub datasources: BTreeMap<String, ConnectionConfig>,
    /// External template overrides, the lowest configuration layer.
    #[serde(default)]
    pub properties: BTreeMap<String, ConfigValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Rows a fetcher moves from the cursor per turn when a job sets none.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// Bounded wait for the fetcher permit.
    #[serde(default = "default_permit_wait_ms")]
    pub permit_wait_ms: u64,
    /// Worker threads of the driver I/O runtime.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_fetch_size() -> usize {
    10_000
}
fn default_permit_wait_ms() -> u64 {
    10
}
fn default_io_threads() -> usize {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            fetch_size: default_fetch_size(),
            permit_wait_ms: default_permit_wait_ms(),
            io_threads: default_io_threads(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
        }
    }
}

impl EngineSettings {
    pub fn permit_wait(&self) -> Duration {
        Duration::from_millis(self.permit_wait_ms)
    }
}

impl Settings {
    /// Merges the TOML file (when given) with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(TransferError::Config(format!(
                    "Settings file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.fetch_size == 0 {
            return Err(TransferError::Config(
                "engine.fetch_size must be at least 1".to_string(),
            ));
        }
        if self.engine.io_threads == 0 {
            return Err(TransferError::Config(
                "engine.io_threads must be at least 1".to_string(),
            ));
        }
        for (name, config) in &self.datasources {
            config.validate(name).map_err(TransferError::Config)?;
        }
        Ok(())
    }

    /// Properties as an external configuration layer, with `-D` style
    /// overrides applied on top.
    pub fn external_properties(
        &self,
        overrides: &[(String, String)],
    ) -> BTreeMap<String, ConfigValue> {
        let mut properties = self.properties.clone();
        for (key, value) in overrides {
            properties.insert(key.clone(), ConfigValue::from(value.as_str()));
        }
        properties
    }
}

#[cfg(test)]
mod tests;
