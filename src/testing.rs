//! Scripted datasources for unit tests.

use crate::datasource::{
    BatchFailure, BatchOutcome, Connection, DataSource, RowCursor, StatementCount,
    StatementFailure,
};
use crate::db_types::PlaceholderStyle;
use crate::error::{Result, TransferError};
use crate::metadata::{ColumnMetadata, SqlType};
use crate::value::{LargeObject, Parameter, Row, Value};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn int_column(name: &str, ordinal: usize) -> ColumnMetadata {
    ColumnMetadata::new(name, ordinal, SqlType::Integer)
}

pub fn text_column(name: &str, ordinal: usize) -> ColumnMetadata {
    ColumnMetadata::new(name, ordinal, SqlType::VarChar)
}

/// `count` rows of `(id, name)` with ids starting at 1.
pub fn id_name_rows(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| Row::new(vec![Value::Integer(i as i64), Value::Text(format!("name-{}", i))]))
        .collect()
}

// --- Cursor ---

pub struct ScriptedCursor {
    columns: Vec<ColumnMetadata>,
    rows: VecDeque<Result<Row>>,
    closed: bool,
    delay: Option<Duration>,
    advances: Arc<AtomicUsize>,
}

impl ScriptedCursor {
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().map(Ok).collect(),
            closed: false,
            delay: None,
            advances: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails once `after` rows were produced.
    pub fn failing_after(mut self, after: usize, message: &str) -> Self {
        self.rows.truncate(after);
        self.rows
            .push_back(Err(TransferError::Query(message.to_string())));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn advance_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.advances)
    }
}

impl RowCursor for ScriptedCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        self.advances.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match self.rows.pop_front() {
            Some(row) => row.map(Some),
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// --- Connection ---

/// Everything a recording connection saw.
#[derive(Default)]
pub struct ConnectionLog {
    pub statements: Mutex<Vec<(String, Vec<Parameter>)>>,
    pub batches: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub closes: AtomicUsize,
    pub large_objects: AtomicUsize,
    /// 1-based batch numbers (counted across connections) that fail.
    pub failing_batches: Mutex<HashSet<usize>>,
    /// Values that make a single `execute` fail.
    pub failing_values: Mutex<Vec<Value>>,
}

impl ConnectionLog {
    pub fn committed_rows(&self) -> usize {
        self.statements.lock().len()
    }

    pub fn parameter_sets(&self) -> Vec<Vec<Parameter>> {
        self.statements
            .lock()
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }
}

pub struct RecordingConnection {
    log: Arc<ConnectionLog>,
    /// Statements of the open transaction.
    pending: Vec<(String, Vec<Parameter>)>,
    closed: bool,
}

impl Connection for RecordingConnection {
    fn execute(&mut self, sql: &str, params: Vec<Parameter>) -> Result<StatementCount> {
        let failing = self.log.failing_values.lock();
        if params
            .iter()
            .any(|param| failing.contains(&param.value))
        {
            return Err(TransferError::Query("rejected value".to_string()));
        }
        drop(failing);
        self.log.statements.lock().push((sql.to_string(), params));
        Ok(StatementCount::Rows(1))
    }

    fn execute_batch(
        &mut self,
        sql: &str,
        batch: Vec<Vec<Parameter>>,
    ) -> std::result::Result<BatchOutcome, BatchFailure> {
        let number = self.log.batches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.log.failing_batches.lock().contains(&number) {
            return Err(BatchFailure {
                statements: vec![StatementFailure {
                    index: Some(0),
                    message: format!("batch {} rejected", number),
                }],
            });
        }
        let counts = batch
            .iter()
            .enumerate()
            .map(|(i, _)| {
                // alternate drivers that do not report counts
                if i % 2 == 0 {
                    StatementCount::Rows(1)
                } else {
                    StatementCount::SuccessNoInfo
                }
            })
            .collect();
        self.pending
            .extend(batch.into_iter().map(|params| (sql.to_string(), params)));
        Ok(BatchOutcome { counts })
    }

    fn commit(&mut self) -> Result<()> {
        self.log.commits.fetch_add(1, Ordering::SeqCst);
        self.log.statements.lock().append(&mut self.pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.log.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        Ok(())
    }

    fn create_large_object(&mut self, source: &LargeObject) -> Result<Value> {
        self.log.large_objects.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Lob(source.clone()))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// --- Datasource ---

pub struct ScriptedDataSource {
    name: String,
    columns: Vec<ColumnMetadata>,
    rows: Vec<Row>,
    open_error: Option<String>,
    connect_error: Option<String>,
    fail_after: Option<(usize, String)>,
    /// Range filter on the first column: rows with `low <= id < high`.
    filter_by_bounds: bool,
    pub log: Arc<ConnectionLog>,
    pub opened: Mutex<Vec<(String, Vec<Parameter>)>>,
}

impl ScriptedDataSource {
    pub fn new(name: &str, columns: Vec<ColumnMetadata>, rows: Vec<Row>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rows,
            open_error: None,
            connect_error: None,
            fail_after: None,
            filter_by_bounds: false,
            log: Arc::new(ConnectionLog::default()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn sink(name: &str) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    pub fn failing_open(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    pub fn failing_connect(mut self, message: &str) -> Self {
        self.connect_error = Some(message.to_string());
        self
    }

    pub fn failing_after(mut self, rows: usize, message: &str) -> Self {
        self.fail_after = Some((rows, message.to_string()));
        self
    }

    /// Serves only rows whose first column lies in `[params[0], params[1])`.
    pub fn filtered_by_bounds(mut self) -> Self {
        self.filter_by_bounds = true;
        self
    }
}

impl DataSource for ScriptedDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::QuestionMark
    }

    fn open_cursor(
        &self,
        sql: &str,
        params: Vec<Parameter>,
        _fetch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        if let Some(message) = &self.open_error {
            return Err(TransferError::connection(&self.name, message.clone()));
        }
        self.opened.lock().push((sql.to_string(), params.clone()));

        let rows = if self.filter_by_bounds {
            let bound = |index: usize| match params.get(index).map(|p| &p.value) {
                Some(Value::Integer(v)) => *v,
                _ => 0,
            };
            let (low, high) = (bound(0), bound(1));
            self.rows
                .iter()
                .filter(|row| matches!(row.get(0), Some(Value::Integer(id)) if *id >= low && *id < high))
                .cloned()
                .collect()
        } else {
            self.rows.clone()
        };

        let cursor = ScriptedCursor::new(self.columns.clone(), rows);
        Ok(match &self.fail_after {
            Some((after, message)) => Box::new(cursor.failing_after(*after, message)),
            None => Box::new(cursor),
        })
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        if let Some(message) = &self.connect_error {
            return Err(TransferError::connection(&self.name, message.clone()));
        }
        Ok(Box::new(RecordingConnection {
            log: Arc::clone(&self.log),
            pending: Vec::new(),
            closed: false,
        }))
    }
}
