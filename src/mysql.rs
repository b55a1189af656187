// =====================================================
// MySQL SPECIFIC DATABASE OPERATIONS
// =====================================================

use crate::datasource::BindKind;
use crate::db_types::ConnectionConfig;
use crate::metadata::{ColumnMetadata, RowMetadata, TypeCategory};
use crate::value::{LargeObject, LargeObjectKind, Parameter, Row, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Executor, MySql, Pool, Row as _, TypeInfo};
use tokio::sync::{mpsc, oneshot};

// --- Connection ---

pub async fn create_pool(config: &ConnectionConfig) -> Result<Pool<MySql>, String> {
    let port = config.port_or_default();
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(port)
        .username(&config.username);

    if let Some(pwd) = &config.password {
        options = options.password(pwd);
    }

    if let Some(db) = &config.database {
        if !db.is_empty() {
            options = options.database(db);
        }
    }

    options = options.log_statements(log::LevelFilter::Debug);

    sqlx::mysql::MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .idle_timeout(std::time::Duration::from_secs(300))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("os error 111") {
                return format!(
                    "Connection refused ({}); check if MySQL is running on {}:{}",
                    err_msg, config.host, port
                );
            }
            if err_msg.contains("timed out") {
                return format!(
                    "Connection timed out; the server at {}:{} did not respond within 10 seconds",
                    config.host, port
                );
            }
            format!("Failed to create pool: {}", e)
        })
}

// --- Streaming Reads ---

/// Describes `sql`, reports the columns, then pushes decoded rows into
/// `rows_tx` until the result ends, the receiver hangs up or a row fails.
pub async fn stream_query(
    pool: Pool<MySql>,
    sql: String,
    params: Vec<Parameter>,
    columns_tx: oneshot::Sender<Result<Vec<ColumnMetadata>, String>>,
    rows_tx: mpsc::Sender<Result<Row, String>>,
) {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            let _ = columns_tx.send(Err(format!("Failed to acquire connection: {}", e)));
            return;
        }
    };

    let metadata = match (&mut *conn).describe(&sql).await {
        Ok(describe) => {
            let columns: Vec<ColumnMetadata> = describe
                .columns()
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    ColumnMetadata::from_driver(
                        column.name(),
                        column.ordinal() + 1,
                        column.type_info().name(),
                        describe.nullable(i).unwrap_or(true),
                    )
                })
                .collect::<Vec<_>>();
            let columns = with_declared_scales(&mut *conn, &sql, &params, columns).await;
            RowMetadata::new(columns).map_err(|e| e.to_string())
        }
        Err(e) => Err(format!("Failed to describe query: {}", e)),
    };

    let metadata = match metadata {
        Ok(metadata) => {
            if columns_tx.send(Ok(metadata.columns().to_vec())).is_err() {
                return;
            }
            metadata
        }
        Err(message) => {
            let _ = columns_tx.send(Err(message));
            return;
        }
    };

    let mut query = sqlx::query(&sql);
    for parameter in params {
        query = bind_parameter(query, parameter);
    }

    let mut stream = query.fetch(&mut *conn);
    while let Some(item) = stream.next().await {
        let row = item
            .map_err(|e| format!("Failed to fetch row: {}", e))
            .and_then(|row| decode_row(&row, &metadata));
        let failed = row.is_err();
        if rows_tx.send(row).await.is_err() || failed {
            break;
        }
    }
}

const DESCRIBE_TABLE: &str = "rowferry_describe";

/// The protocol reports DECIMAL without its scale. An empty temporary table
/// built from the query keeps the declared types, which `SHOW COLUMNS` reads
/// back. Columns are left as described when the server refuses.
async fn with_declared_scales(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[Parameter],
    columns: Vec<ColumnMetadata>,
) -> Vec<ColumnMetadata> {
    if !columns.iter().any(|column| column.category() == TypeCategory::Decimal) {
        return columns;
    }
    match declared_types(conn, sql, params).await {
        Ok(declared) => apply_declared_types(columns, declared),
        Err(e) => {
            log::debug!("Failed to read declared decimal scales: {}", e);
            columns
        }
    }
}

fn apply_declared_types(
    columns: Vec<ColumnMetadata>,
    declared: Vec<String>,
) -> Vec<ColumnMetadata> {
    if declared.len() != columns.len() {
        return columns;
    }
    columns
        .into_iter()
        .zip(declared)
        .map(|(column, declared)| match column.category() {
            TypeCategory::Decimal => column.with_declared_type(&declared),
            _ => column,
        })
        .collect()
}

async fn declared_types(
    conn: &mut MySqlConnection,
    sql: &str,
    params: &[Parameter],
) -> Result<Vec<String>, sqlx::Error> {
    let create = format!(
        "CREATE TEMPORARY TABLE {} AS SELECT * FROM ({}) AS q LIMIT 0",
        DESCRIBE_TABLE, sql
    );
    let mut query = sqlx::query(&create);
    for parameter in params {
        query = bind_parameter(query, parameter.clone());
    }
    query.execute(&mut *conn).await?;

    let show = format!("SHOW COLUMNS FROM {}", DESCRIBE_TABLE);
    let rows = (&mut *conn).fetch_all(show.as_str()).await;
    let cleanup = format!("DROP TEMPORARY TABLE IF EXISTS {}", DESCRIBE_TABLE);
    (&mut *conn).execute(cleanup.as_str()).await?;

    rows?
        .iter()
        .map(|row| {
            row.try_get::<String, _>("Type").or_else(|_| {
                row.try_get::<Vec<u8>, _>("Type")
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
        })
        .collect()
}

fn decode_row(row: &MySqlRow, metadata: &RowMetadata) -> Result<Row, String> {
    metadata
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            decode_column(row, i, column).map_err(|e| {
                format!(
                    "Failed to decode column '{}' ({}): {}",
                    column.name, column.type_name, e
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Row::new)
}

fn decode_column(row: &MySqlRow, i: usize, column: &ColumnMetadata) -> Result<Value, sqlx::Error> {
    match column.category() {
        TypeCategory::Boolean => row
            .try_get::<Option<bool>, _>(i)
            .map(Value::from)
            .or_else(|_| {
                row.try_get::<Option<i64>, _>(i)
                    .map(|v| Value::from(v.map(|n| n != 0)))
            }),
        TypeCategory::Integer => row
            .try_get::<Option<i64>, _>(i)
            .map(Value::from)
            .or_else(|_| {
                row.try_get::<Option<u64>, _>(i).map(|v| match v {
                    Some(n) => i64::try_from(n)
                        .map(Value::Integer)
                        .unwrap_or_else(|_| Value::Decimal(Decimal::from(n))),
                    None => Value::Null,
                })
            }),
        TypeCategory::Float => row
            .try_get::<Option<f64>, _>(i)
            .map(Value::from)
            .or_else(|_| {
                row.try_get::<Option<f32>, _>(i)
                    .map(|v| Value::from(v.map(f64::from)))
            }),
        TypeCategory::Decimal => row.try_get::<Option<Decimal>, _>(i).map(Value::from),
        TypeCategory::Date => row
            .try_get::<Option<NaiveDate>, _>(i)
            .map(|v| v.map(Value::Date).unwrap_or(Value::Null)),
        TypeCategory::Time => row
            .try_get::<Option<NaiveTime>, _>(i)
            .map(|v| v.map(Value::Time).unwrap_or(Value::Null)),
        TypeCategory::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(i)
            .or_else(|_| {
                row.try_get::<Option<DateTime<Utc>>, _>(i)
                    .map(|v| v.map(|ts| ts.naive_utc()))
            })
            .map(|v| v.map(Value::Timestamp).unwrap_or(Value::Null)),
        TypeCategory::Binary => row
            .try_get::<Option<Vec<u8>>, _>(i)
            .map(|v| v.map(Value::Bytes).unwrap_or(Value::Null)),
        TypeCategory::BinaryLob => row
            .try_get::<Option<Vec<u8>>, _>(i)
            .map(|v| v.map(|bytes| Value::Lob(LargeObject::binary(bytes))).unwrap_or(Value::Null)),
        TypeCategory::CharacterLob | TypeCategory::Xml => {
            let kind = if column.category() == TypeCategory::Xml {
                LargeObjectKind::Xml
            } else {
                LargeObjectKind::Character
            };
            decode_text(row, i).map(|v| match v {
                Some(text) if kind == LargeObjectKind::Xml => Value::Lob(LargeObject::xml(text)),
                Some(text) => Value::Lob(LargeObject::character(text)),
                None => Value::Null,
            })
        }
        TypeCategory::Text => decode_text(row, i).map(Value::from),
        TypeCategory::Unsupported => {
            decode_text(row, i).map(|v| v.map(Value::Other).unwrap_or(Value::Null))
        }
    }
}

// JSON, ENUM and SET columns come back as text or raw bytes depending on the
// server, so fall back to a lossy byte read.
fn decode_text(row: &MySqlRow, i: usize) -> Result<Option<String>, sqlx::Error> {
    row.try_get::<Option<String>, _>(i).or_else(|_| {
        row.try_get::<Option<Vec<u8>>, _>(i)
            .map(|v| v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    })
}

// --- Writes ---

fn bind_parameter(
    query: Query<'_, MySql, MySqlArguments>,
    parameter: Parameter,
) -> Query<'_, MySql, MySqlArguments> {
    let kind = BindKind::for_type(parameter.sql_type);
    match parameter.value {
        Value::Null => match kind {
            BindKind::Boolean => query.bind(None::<bool>),
            BindKind::Integer => query.bind(None::<i64>),
            BindKind::Float => query.bind(None::<f64>),
            BindKind::Decimal => query.bind(None::<Decimal>),
            BindKind::Text => query.bind(None::<String>),
            BindKind::Date => query.bind(None::<NaiveDate>),
            BindKind::Time => query.bind(None::<NaiveTime>),
            BindKind::Timestamp => query.bind(None::<NaiveDateTime>),
            BindKind::Bytes => query.bind(None::<Vec<u8>>),
        },
        Value::Boolean(v) => query.bind(v),
        Value::Integer(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Decimal(v) => query.bind(v),
        Value::Text(v) | Value::Other(v) => query.bind(v),
        Value::Date(v) => query.bind(v),
        Value::Time(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
        Value::Bytes(v) => query.bind(v),
        Value::Lob(lob) => match lob.kind {
            LargeObjectKind::Binary => query.bind(lob.into_bytes()),
            LargeObjectKind::Character | LargeObjectKind::Xml => query.bind(lob.to_text()),
        },
    }
}

/// Runs one statement outside any transaction.
pub async fn execute_statement(
    conn: &mut MySqlConnection,
    sql: &str,
    params: Vec<Parameter>,
) -> Result<u64, String> {
    let mut query = sqlx::query(sql);
    for parameter in params {
        query = bind_parameter(query, parameter);
    }
    query
        .execute(&mut *conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(|e| format!("Failed to execute statement: {}", e))
}

/// Runs every parameter set on `conn`, inside the transaction the caller
/// began. MySQL keeps the transaction usable after a failed statement, so the
/// remaining statements still run.
pub async fn execute_statements(
    conn: &mut MySqlConnection,
    sql: &str,
    batch: Vec<Vec<Parameter>>,
) -> Vec<Result<u64, String>> {
    let mut results = Vec::with_capacity(batch.len());
    for params in batch {
        let mut query = sqlx::query(sql);
        for parameter in params {
            query = bind_parameter(query, parameter);
        }
        results.push(
            query
                .execute(&mut *conn)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| e.to_string()),
        );
    }
    results
}

#[cfg(test)]
mod tests;
