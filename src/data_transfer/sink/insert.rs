// --- Insert Sink ---

use super::RowWriter;
use crate::data_transfer::result::TaskResult;
use crate::datasource::{Connection, DataSource, NamedStatement};
use crate::error::{Result, TransferError};
use crate::metadata::RowMetadata;
use crate::template::LayeredConfig;
use crate::value::{Parameter, Row, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Binding {
    Column(usize),
    Constant(Parameter),
}

/// How each statement parameter is filled, decided once per task.
#[derive(Debug, Clone)]
pub struct InsertProjection {
    statement: NamedStatement,
    metadata: Arc<RowMetadata>,
    bindings: Vec<Binding>,
}

impl InsertProjection {
    /// Binds parameters from row columns by name, falling back to the task
    /// configuration. A parameter found in neither is a configuration error.
    pub fn new(
        statement: NamedStatement,
        metadata: Arc<RowMetadata>,
        config: &LayeredConfig,
    ) -> Result<Self> {
        let bindings = statement
            .parameters
            .iter()
            .map(|name| {
                if let Some(index) = metadata.find(name) {
                    return Ok(Binding::Column(index));
                }
                match config.get(name) {
                    Some(value) => Ok(Binding::Constant(Parameter::infer(value.to_value()))),
                    None => Err(TransferError::Config(format!(
                        "Insert parameter ':{}' matches no selected column and no configuration value",
                        name
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let unused = metadata
            .columns()
            .iter()
            .filter(|column| !statement.has_parameter(&column.name))
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>();
        if !unused.is_empty() {
            log::warn!(
                "Selected column(s) {} are not used by the insert statement and will be skipped",
                unused.join(", ")
            );
        }

        Ok(Self {
            statement,
            metadata,
            bindings,
        })
    }

    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    fn bind(&self, row: &Row, connection: &mut dyn Connection) -> Result<Vec<Parameter>> {
        self.bindings
            .iter()
            .map(|binding| match binding {
                Binding::Constant(parameter) => Ok(parameter.clone()),
                Binding::Column(index) => {
                    let sql_type = self
                        .metadata
                        .column_at(*index)
                        .map(|column| column.sql_type)
                        .ok_or_else(|| {
                            TransferError::Metadata(format!("No column at position {}", index))
                        })?;
                    let value = match row.get(*index) {
                        Some(Value::Lob(lob)) => connection.create_large_object(lob)?,
                        Some(value) => value.clone(),
                        None => Value::Null,
                    };
                    Ok(Parameter::new(sql_type, value))
                }
            })
            .collect()
    }
}

/// One sink worker's insert connection and batch.
pub struct InsertWriter {
    datasource: String,
    projection: Arc<InsertProjection>,
    connection: Option<Box<dyn Connection>>,
    batch_size: usize,
    batch: Vec<Vec<Parameter>>,
    result: Arc<TaskResult>,
}

impl InsertWriter {
    pub fn open(
        datasource: &dyn DataSource,
        projection: Arc<InsertProjection>,
        batch_size: usize,
        result: Arc<TaskResult>,
    ) -> Result<Self> {
        let connection = datasource.connect()?;
        Ok(Self {
            datasource: datasource.name().to_string(),
            projection,
            connection: Some(connection),
            batch_size,
            batch: Vec::with_capacity(batch_size.min(10_000)),
            result,
        })
    }

    fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        self.connection.as_mut().ok_or_else(|| {
            TransferError::Execution(format!(
                "Insert connection to '{}' is already closed",
                self.datasource
            ))
        })
    }

    fn execute_single(&mut self, parameters: Vec<Parameter>) -> Result<()> {
        let sql = self.projection.sql().to_string();
        let datasource = self.datasource.clone();
        match self.connection()?.execute(&sql, parameters) {
            Ok(count) => self.result.add_processed(count.processed_rows()),
            Err(e) => log::warn!("Failed to insert row into '{}': {}", datasource, e),
        }
        Ok(())
    }

    /// Executes and commits the pending batch. A failed batch is rolled back
    /// and counts no rows; the writer keeps going.
    fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let size = batch.len();
        let sql = self.projection.sql().to_string();
        let datasource = self.datasource.clone();
        let connection = self.connection()?;

        let processed = match connection.execute_batch(&sql, batch) {
            Ok(outcome) => match connection.commit() {
                Ok(()) => outcome.processed_rows(),
                Err(e) => {
                    log::warn!(
                        "Failed to commit batch of {} row(s) to '{}': {}",
                        size,
                        datasource,
                        e
                    );
                    rollback_quietly(&mut **connection, &datasource);
                    0
                }
            },
            Err(failure) => {
                log::warn!(
                    "Failed to write batch of {} row(s) to '{}': {}",
                    size,
                    datasource,
                    failure
                );
                for statement in &failure.statements {
                    log::debug!(
                        "  batch statement {}: {}",
                        statement
                            .index
                            .map(|index| (index + 1).to_string())
                            .unwrap_or_else(|| "*".to_string()),
                        statement.message
                    );
                }
                rollback_quietly(&mut **connection, &datasource);
                0
            }
        };
        self.result.add_processed(processed);
        Ok(())
    }

    fn close_connection(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        }
    }
}

fn rollback_quietly(connection: &mut dyn Connection, datasource: &str) {
    if let Err(e) = connection.rollback() {
        log::warn!("Failed to roll back batch on '{}': {}", datasource, e);
    }
}

impl RowWriter for InsertWriter {
    fn write(&mut self, row: &Row) -> Result<()> {
        let projection = Arc::clone(&self.projection);
        let parameters = projection.bind(row, &mut **self.connection()?)?;

        if self.batch_size == 0 {
            return self.execute_single(parameters);
        }
        self.batch.push(parameters);
        if self.batch.len() >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let flushed = self.flush_batch();
        let closed = self.close_connection();
        flushed.and(closed)
    }
}

impl Drop for InsertWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close_connection() {
            log::warn!("Failed to close insert connection to '{}': {}", self.datasource, e);
        }
    }
}
