// =====================================================
// METRICS REGISTRATION
// =====================================================
//
// Jobs, tasks and worker pools publish live counters through an injected
// `MetricsRegistry`. A source is visible from the moment its `Registration`
// is created until the guard is dropped.

use crate::error::{Result, TransferError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            MetricValue::Integer(v) => Some(*v),
            MetricValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            MetricValue::Text(raw) => raw.trim().parse().ok(),
            MetricValue::Float(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{:.2}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

pub trait MetricsSource: Send + Sync {
    /// Current values of every published property.
    fn snapshot(&self) -> Vec<(String, MetricValue)>;

    /// Updates a writable property. Most properties are read-only.
    fn set(&self, property: &str, _value: MetricValue) -> Result<()> {
        Err(TransferError::Config(format!(
            "Metric property '{}' is read-only",
            property
        )))
    }
}

pub trait MetricsRegistry: Send + Sync {
    fn register(&self, name: &str, source: Arc<dyn MetricsSource>) -> Result<()>;

    fn unregister(&self, name: &str);
}

/// Object name under which a job, task or pool is published.
pub fn object_name(kind: &str, name: &str) -> String {
    format!("rowferry:type={},name={}", kind, name)
}

// --- Registration Guard ---

/// Keeps a source registered for as long as the guard lives.
pub struct Registration {
    registry: Arc<dyn MetricsRegistry>,
    name: String,
}

impl Registration {
    pub fn new(
        registry: Arc<dyn MetricsRegistry>,
        name: impl Into<String>,
        source: Arc<dyn MetricsSource>,
    ) -> Result<Self> {
        let name = name.into();
        registry.register(&name, source)?;
        Ok(Self { registry, name })
    }

    /// Registers and logs instead of failing; metrics never stop a transfer.
    pub fn try_new(
        registry: &Arc<dyn MetricsRegistry>,
        name: impl Into<String>,
        source: Arc<dyn MetricsSource>,
    ) -> Option<Self> {
        let name = name.into();
        match Self::new(Arc::clone(registry), name.clone(), source) {
            Ok(registration) => Some(registration),
            Err(e) => {
                log::warn!("Failed to register metrics '{}': {}", name, e);
                None
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.name);
    }
}

// --- Registries ---

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl MetricsRegistry for NoopRegistry {
    fn register(&self, _name: &str, _source: Arc<dyn MetricsSource>) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _name: &str) {}
}

/// Registry kept in process memory, readable by name.
#[derive(Default)]
pub struct InMemoryRegistry {
    sources: RwLock<BTreeMap<String, Arc<dyn MetricsSource>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.read().contains_key(name)
    }

    pub fn snapshot(&self, name: &str) -> Option<Vec<(String, MetricValue)>> {
        let source = self.sources.read().get(name).cloned()?;
        Some(source.snapshot())
    }

    pub fn read(&self, name: &str, property: &str) -> Option<MetricValue> {
        self.snapshot(name)?
            .into_iter()
            .find(|(key, _)| key == property)
            .map(|(_, value)| value)
    }

    pub fn set(&self, name: &str, property: &str, value: MetricValue) -> Result<()> {
        let source = self.sources.read().get(name).cloned().ok_or_else(|| {
            TransferError::Config(format!("No metrics registered as '{}'", name))
        })?;
        source.set(property, value)
    }
}

impl MetricsRegistry for InMemoryRegistry {
    fn register(&self, name: &str, source: Arc<dyn MetricsSource>) -> Result<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(name) {
            return Err(TransferError::Config(format!(
                "Metrics name '{}' is already registered",
                name
            )));
        }
        sources.insert(name.to_string(), source);
        Ok(())
    }

    fn unregister(&self, name: &str) {
        self.sources.write().remove(name);
    }
}

#[cfg(test)]
mod tests;
