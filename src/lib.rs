// Core modules
pub mod error;
pub mod metadata;
pub mod value;
pub mod template;
pub mod settings;
pub mod metrics;
pub mod execution;

// Database modules
pub mod db_types;
pub mod datasource;
mod mysql;
mod postgres;
mod sqlite;

// Transfer engine
pub mod data_transfer;

#[cfg(test)]
mod testing;

pub use data_transfer::{Engine, JobFile, JobResult, TaskResult};
pub use error::{Result, TransferError};
pub use metrics::{InMemoryRegistry, MetricsRegistry, MetricsSource, NoopRegistry};
pub use settings::Settings;
