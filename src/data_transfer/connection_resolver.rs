use crate::datasource::{DataSource, SqlxDataSource};
use crate::error::{Result, TransferError};
use crate::settings::Settings;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Named datasources a job can reference from `select`/`insert`.
///
/// Built from settings, the registry also owns the I/O runtime every sqlx
/// datasource drives its driver calls on.
pub struct DataSourceRegistry {
    sources: BTreeMap<String, Arc<dyn DataSource>>,
    runtime: Option<Runtime>,
}

fn normalize_datasource_name(value: &str) -> String {
    value.trim().to_string()
}

impl DataSourceRegistry {
    /// Empty registry without a runtime; datasources are registered by hand.
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            runtime: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.engine.io_threads)
            .thread_name("rowferry-io")
            .enable_all()
            .build()
            .map_err(|e| TransferError::Execution(format!("Failed to start I/O runtime: {}", e)))?;

        let mut sources: BTreeMap<String, Arc<dyn DataSource>> = BTreeMap::new();
        for (name, config) in &settings.datasources {
            let name = normalize_datasource_name(name);
            let source = SqlxDataSource::new(&name, config.clone(), runtime.handle().clone())?;
            log::debug!(
                "Registered {} datasource '{}'",
                config.db_type.label(),
                name
            );
            sources.insert(name, Arc::new(source));
        }

        Ok(Self {
            sources,
            runtime: Some(runtime),
        })
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources
            .insert(normalize_datasource_name(source.name()), source);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        let normalized = normalize_datasource_name(name);
        if normalized.is_empty() {
            return Err(TransferError::Config("datasource is required".to_string()));
        }
        self.sources
            .get(&normalized)
            .cloned()
            .ok_or_else(|| TransferError::Config(format!("Datasource '{}' not found", normalized)))
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataSourceRegistry {
    fn drop(&mut self) {
        // pools hold handles into the runtime; drop them inside it, first
        if let Some(runtime) = self.runtime.take() {
            {
                let _context = runtime.enter();
                self.sources.clear();
            }
            runtime.shutdown_background();
        }
    }
}
