// =====================================================
// DATASOURCE CAPABILITY
// =====================================================
//
// The engine never talks to a driver directly. It receives a named
// `DataSource` that opens forward-only cursors for the read side and
// transactional connections for the write side. `SqlxDataSource` is the
// production implementation (MySQL, PostgreSQL, SQLite through sqlx); tests
// inject scripted ones.

use crate::db_types::{ConnectionConfig, DatabaseType, PlaceholderStyle};
use crate::error::{Result, TransferError};
use crate::metadata::{ColumnMetadata, SqlType, TypeCategory};
use crate::template::LiteralStyle;
use crate::value::{LargeObject, Parameter, Row, Value};
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, Pool, Postgres, Sqlite};
use std::fmt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

// --- Traits ---

/// Forward-only, non-reentrant read cursor.
pub trait RowCursor: Send {
    /// Result description, available before the first row.
    fn columns(&self) -> &[ColumnMetadata];

    /// Next row, or `None` once the cursor is exhausted.
    fn advance(&mut self) -> Result<Option<Row>>;

    fn is_closed(&self) -> bool;

    fn close(&mut self) {}
}

/// Write-side connection. Batches run inside a transaction that `commit`
/// ends; single statements run in autocommit.
pub trait Connection: Send {
    fn execute(&mut self, sql: &str, params: Vec<Parameter>) -> Result<StatementCount>;

    fn execute_batch(
        &mut self,
        sql: &str,
        batch: Vec<Vec<Parameter>>,
    ) -> std::result::Result<BatchOutcome, BatchFailure>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Copies a large object into storage owned by this connection.
    fn create_large_object(&mut self, source: &LargeObject) -> Result<Value> {
        Ok(Value::Lob(source.clone()))
    }

    fn close(&mut self) -> Result<()>;
}

pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Quoting rules for string literals rendered into statements.
    fn literal_style(&self) -> LiteralStyle {
        LiteralStyle::Standard
    }

    fn open_cursor(
        &self,
        sql: &str,
        params: Vec<Parameter>,
        fetch_size: usize,
    ) -> Result<Box<dyn RowCursor>>;

    fn connect(&self) -> Result<Box<dyn Connection>>;
}

// --- Batch Outcome ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementCount {
    Rows(u64),
    /// Statement succeeded but the driver reported no count.
    SuccessNoInfo,
}

impl StatementCount {
    pub fn processed_rows(&self) -> u64 {
        match self {
            StatementCount::Rows(count) => *count,
            StatementCount::SuccessNoInfo => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub counts: Vec<StatementCount>,
}

impl BatchOutcome {
    pub fn processed_rows(&self) -> u64 {
        self.counts.iter().map(StatementCount::processed_rows).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    /// Position inside the batch; `None` when the batch failed as a whole.
    pub index: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub statements: Vec<StatementFailure>,
}

impl BatchFailure {
    pub fn whole(message: impl Into<String>) -> Self {
        Self {
            statements: vec![StatementFailure {
                index: None,
                message: message.into(),
            }],
        }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let details = self
            .statements
            .iter()
            .map(|failure| match failure.index {
                Some(index) => format!("statement {}: {}", index + 1, failure.message),
                None => failure.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", details)
    }
}

// --- Named Parameters ---

/// SQL with `:name` placeholders rewritten to positional ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStatement {
    pub sql: String,
    /// Parameter names in positional order; a name appears once per use.
    pub parameters: Vec<String>,
}

impl NamedStatement {
    pub fn compile(sql: &str, style: PlaceholderStyle) -> Result<Self> {
        let chars = sql.chars().collect::<Vec<char>>();
        let mut out = String::with_capacity(sql.len());
        let mut parameters = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' | '`' => {
                    let end = find_closing_quote(&chars, i, c).ok_or_else(|| {
                        TransferError::Config(format!("Unterminated quote in statement: {}", sql))
                    })?;
                    out.extend(&chars[i..=end]);
                    i = end + 1;
                }
                '-' if chars.get(i + 1) == Some(&'-') => {
                    let end = chars[i..]
                        .iter()
                        .position(|ch| *ch == '\n')
                        .map(|offset| i + offset)
                        .unwrap_or(chars.len() - 1);
                    out.extend(&chars[i..=end]);
                    i = end + 1;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    let mut end = i + 2;
                    while end + 1 < chars.len() && !(chars[end] == '*' && chars[end + 1] == '/') {
                        end += 1;
                    }
                    let end = (end + 1).min(chars.len() - 1);
                    out.extend(&chars[i..=end]);
                    i = end + 1;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    out.push_str("::");
                    i += 2;
                }
                ':' if chars
                    .get(i + 1)
                    .map(|next| next.is_ascii_alphabetic() || *next == '_')
                    .unwrap_or(false) =>
                {
                    let mut end = i + 1;
                    while end < chars.len()
                        && (chars[end].is_ascii_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                    {
                        end += 1;
                    }
                    while chars[end - 1] == '.' {
                        end -= 1;
                    }
                    let name = chars[i + 1..end].iter().collect::<String>();
                    parameters.push(name);
                    match style {
                        PlaceholderStyle::QuestionMark => out.push('?'),
                        PlaceholderStyle::Dollar => out.push_str(&format!("${}", parameters.len())),
                    }
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        Ok(Self {
            sql: out,
            parameters,
        })
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters
            .iter()
            .any(|parameter| parameter.eq_ignore_ascii_case(name))
    }
}

fn find_closing_quote(chars: &[char], start: usize, quote: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            // doubled quote is an escaped quote
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i);
        }
        if chars[i] == '\\' && quote == '\'' {
            i += 2;
            continue;
        }
        i += 1;
    }
    None
}

// --- Parameter Binding ---

/// Rust type a parameter is bound as. NULLs use it too, so the driver sees a
/// typed NULL matching the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindKind {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    Date,
    Time,
    Timestamp,
    Bytes,
}

impl BindKind {
    pub(crate) fn for_type(sql_type: SqlType) -> Self {
        match sql_type.category() {
            TypeCategory::Boolean => BindKind::Boolean,
            TypeCategory::Integer => BindKind::Integer,
            TypeCategory::Float => BindKind::Float,
            TypeCategory::Decimal => BindKind::Decimal,
            TypeCategory::Date => BindKind::Date,
            TypeCategory::Time => BindKind::Time,
            TypeCategory::Timestamp => BindKind::Timestamp,
            TypeCategory::Binary | TypeCategory::BinaryLob => BindKind::Bytes,
            TypeCategory::Text
            | TypeCategory::CharacterLob
            | TypeCategory::Xml
            | TypeCategory::Unsupported => BindKind::Text,
        }
    }
}

// =====================================================
// SQLX IMPLEMENTATION
// =====================================================

#[derive(Clone)]
enum SqlxPool {
    MySql(Pool<MySql>),
    Postgres(Pool<Postgres>),
    Sqlite(Pool<Sqlite>),
}

/// sqlx-backed datasource. Engine threads are plain OS threads, so every
/// driver call is driven on the shared I/O runtime through `handle`.
pub struct SqlxDataSource {
    name: String,
    config: ConnectionConfig,
    handle: Handle,
    pool: Mutex<Option<SqlxPool>>,
}

impl SqlxDataSource {
    pub fn new(name: &str, config: ConnectionConfig, handle: Handle) -> Result<Self> {
        config.validate(name).map_err(TransferError::Config)?;
        Ok(Self {
            name: name.to_string(),
            config,
            handle,
            pool: Mutex::new(None),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.config.db_type
    }

    fn pool(&self) -> Result<SqlxPool> {
        ensure_blocking_context(&self.name)?;
        let mut guard = self.pool.lock();
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        log::info!(
            "Opening {} pool for datasource '{}'",
            self.config.db_type.label(),
            self.name
        );
        let created = match self.config.db_type {
            DatabaseType::MySQL => self
                .handle
                .block_on(crate::mysql::create_pool(&self.config))
                .map(SqlxPool::MySql),
            DatabaseType::PostgreSQL => self
                .handle
                .block_on(crate::postgres::create_pool(&self.config))
                .map(SqlxPool::Postgres),
            DatabaseType::SQLite => self
                .handle
                .block_on(crate::sqlite::create_pool(&self.config))
                .map(SqlxPool::Sqlite),
        }
        .map_err(|e| TransferError::connection(&self.name, e))?;

        *guard = Some(created.clone());
        Ok(created)
    }
}

impl DataSource for SqlxDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::from(self.config.db_type)
    }

    fn literal_style(&self) -> LiteralStyle {
        LiteralStyle::from(self.config.db_type)
    }

    fn open_cursor(
        &self,
        sql: &str,
        params: Vec<Parameter>,
        fetch_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let pool = self.pool()?;
        let (columns_tx, columns_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(fetch_size.max(1));
        let sql = sql.to_string();

        match pool {
            SqlxPool::MySql(pool) => {
                self.handle
                    .spawn(crate::mysql::stream_query(pool, sql, params, columns_tx, rows_tx));
            }
            SqlxPool::Postgres(pool) => {
                self.handle
                    .spawn(crate::postgres::stream_query(pool, sql, params, columns_tx, rows_tx));
            }
            SqlxPool::Sqlite(pool) => {
                self.handle
                    .spawn(crate::sqlite::stream_query(pool, sql, params, columns_tx, rows_tx));
            }
        }

        let columns = columns_rx
            .blocking_recv()
            .map_err(|_| TransferError::connection(&self.name, "Query task ended before describing the result"))?
            .map_err(TransferError::Query)?;

        Ok(Box::new(StreamingCursor {
            datasource: self.name.clone(),
            columns,
            receiver: rows_rx,
            closed: false,
        }))
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        let session = match self.pool()? {
            SqlxPool::MySql(pool) => self.handle.block_on(pool.acquire()).map(SqlxSession::MySql),
            SqlxPool::Postgres(pool) => {
                self.handle.block_on(pool.acquire()).map(SqlxSession::Postgres)
            }
            SqlxPool::Sqlite(pool) => self.handle.block_on(pool.acquire()).map(SqlxSession::Sqlite),
        }
        .map_err(|e| {
            TransferError::connection(&self.name, format!("Failed to acquire connection: {}", e))
        })?;

        Ok(Box::new(SqlxConnection {
            datasource: self.name.clone(),
            handle: self.handle.clone(),
            session: Some(session),
            in_transaction: false,
        }))
    }
}

// --- Streaming Cursor ---

/// Cursor fed by a driver task on the I/O runtime. The bounded channel
/// between them holds at most `fetch_size` prefetched rows.
struct StreamingCursor {
    datasource: String,
    columns: Vec<ColumnMetadata>,
    receiver: mpsc::Receiver<std::result::Result<Row, String>>,
    closed: bool,
}

impl RowCursor for StreamingCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        ensure_blocking_context(&self.datasource)?;
        match self.receiver.blocking_recv() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(message)) => {
                self.close();
                Err(TransferError::Query(message))
            }
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
        self.receiver.close();
        self.closed = true;
    }
}

// --- Write Connection ---

/// The worker's own pool connection, held from `connect` until `close`.
enum SqlxSession {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

impl SqlxSession {
    /// Takes the connection out of the pool for good.
    fn discard(self) {
        match self {
            SqlxSession::MySql(conn) => drop(conn.detach()),
            SqlxSession::Postgres(conn) => drop(conn.detach()),
            SqlxSession::Sqlite(conn) => drop(conn.detach()),
        }
    }
}

async fn run_control<'c, E>(
    executor: E,
    statement: &'static str,
) -> std::result::Result<(), String>
where
    E: Executor<'c>,
{
    executor
        .execute(statement)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

struct SqlxConnection {
    datasource: String,
    handle: Handle,
    /// `None` once closed.
    session: Option<SqlxSession>,
    /// A batch began a transaction that has not been ended yet.
    in_transaction: bool,
}

impl SqlxConnection {
    fn session(&mut self) -> Result<&mut SqlxSession> {
        let datasource = self.datasource.clone();
        self.session
            .as_mut()
            .ok_or_else(|| TransferError::connection(&datasource, "Connection is closed"))
    }

    fn control(&mut self, statement: &'static str) -> Result<()> {
        ensure_blocking_context(&self.datasource)?;
        let handle = self.handle.clone();
        match self.session()? {
            SqlxSession::MySql(conn) => handle.block_on(run_control(&mut **conn, statement)),
            SqlxSession::Postgres(conn) => handle.block_on(run_control(&mut **conn, statement)),
            SqlxSession::Sqlite(conn) => handle.block_on(run_control(&mut **conn, statement)),
        }
        .map_err(|e| {
            TransferError::Query(format!("Failed to {}: {}", statement.to_lowercase(), e))
        })
    }

    fn finish(&mut self, statement: &'static str) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.control(statement)?;
        self.in_transaction = false;
        Ok(())
    }

    /// Pool connections hand themselves back through the runtime.
    fn release(&mut self, discard: bool) {
        if let Some(session) = self.session.take() {
            let _context = self.handle.enter();
            if discard {
                session.discard();
            } else {
                drop(session);
            }
        }
    }
}

impl Connection for SqlxConnection {
    fn execute(&mut self, sql: &str, params: Vec<Parameter>) -> Result<StatementCount> {
        ensure_blocking_context(&self.datasource)?;
        let handle = self.handle.clone();
        let affected = match self.session()? {
            SqlxSession::MySql(conn) => {
                handle.block_on(crate::mysql::execute_statement(conn, sql, params))
            }
            SqlxSession::Postgres(conn) => {
                handle.block_on(crate::postgres::execute_statement(conn, sql, params))
            }
            SqlxSession::Sqlite(conn) => {
                handle.block_on(crate::sqlite::execute_statement(conn, sql, params))
            }
        }
        .map_err(TransferError::Query)?;
        Ok(StatementCount::Rows(affected))
    }

    fn execute_batch(
        &mut self,
        sql: &str,
        batch: Vec<Vec<Parameter>>,
    ) -> std::result::Result<BatchOutcome, BatchFailure> {
        ensure_blocking_context(&self.datasource).map_err(|e| BatchFailure::whole(e.to_string()))?;
        if !self.in_transaction {
            self.control("BEGIN")
                .map_err(|e| BatchFailure::whole(e.to_string()))?;
            self.in_transaction = true;
        }

        let handle = self.handle.clone();
        let results = match self
            .session()
            .map_err(|e| BatchFailure::whole(e.to_string()))?
        {
            SqlxSession::MySql(conn) => {
                handle.block_on(crate::mysql::execute_statements(conn, sql, batch))
            }
            SqlxSession::Postgres(conn) => {
                handle.block_on(crate::postgres::execute_statements(conn, sql, batch))
            }
            SqlxSession::Sqlite(conn) => {
                handle.block_on(crate::sqlite::execute_statements(conn, sql, batch))
            }
        };

        collect_batch_results(results)
    }

    fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn close(&mut self) -> Result<()> {
        // an open transaction that was never committed is rolled back
        let outcome = self.rollback();
        self.release(outcome.is_err());
        outcome
    }
}

impl Drop for SqlxConnection {
    fn drop(&mut self) {
        let unfinished = self.in_transaction;
        self.release(unfinished);
    }
}

/// Driver calls block on the I/O runtime, which tokio refuses on a thread
/// that is already running async code.
fn ensure_blocking_context(datasource: &str) -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(TransferError::Execution(format!(
            "Datasource '{}' must be driven from a non-async thread, not inside a tokio runtime",
            datasource
        )));
    }
    Ok(())
}

fn collect_batch_results(
    results: Vec<std::result::Result<u64, String>>,
) -> std::result::Result<BatchOutcome, BatchFailure> {
    let mut counts = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(affected) => counts.push(StatementCount::Rows(affected)),
            Err(message) => failures.push(StatementFailure {
                index: Some(index),
                message,
            }),
        }
    }

    if failures.is_empty() {
        Ok(BatchOutcome { counts })
    } else {
        Err(BatchFailure {
            statements: failures,
        })
    }
}
