// =====================================================
// SQLITE SPECIFIC DATABASE OPERATIONS
// =====================================================

use crate::datasource::BindKind;
use crate::db_types::ConnectionConfig;
use crate::metadata::{ColumnMetadata, RowMetadata, TypeCategory};
use crate::value::{LargeObject, LargeObjectKind, Parameter, Row, Value};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::StreamExt;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{
    Column, ConnectOptions, Executor, Pool, Row as _, Sqlite, TypeInfo, ValueRef,
};
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};

// --- Connection ---

fn build_connect_options(db_path: &str) -> SqliteConnectOptions {
    let mut options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    options = options.log_statements(log::LevelFilter::Debug);

    options
}

/// The database file path is taken from `host`.
pub async fn create_pool(config: &ConnectionConfig) -> Result<Pool<Sqlite>, String> {
    let db_path = config.host.trim();
    if db_path.is_empty() {
        return Err("Database file path is required".to_string());
    }

    let options = build_connect_options(db_path);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .idle_timeout(std::time::Duration::from_secs(300))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| format!("Failed to create SQLite pool: {}", e))
}

// --- Streaming Reads ---

pub async fn stream_query(
    pool: Pool<Sqlite>,
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
            let columns = describe
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

fn decode_row(row: &SqliteRow, metadata: &RowMetadata) -> Result<Row, String> {
    let mut values = Vec::with_capacity(metadata.column_count());
    for (i, column) in metadata.columns().iter().enumerate() {
        let value = decode_column(row, i, column).map_err(|e| {
            format!(
                "Failed to decode column '{}' ({}): {}",
                column.name, column.type_name, e
            )
        })?;
        values.push(value);
    }
    Ok(Row::new(values))
}

// SQLite columns are dynamically typed: the declared type drives the
// decoding, the stored value's own type is the fallback.
fn decode_column(row: &SqliteRow, i: usize, column: &ColumnMetadata) -> Result<Value, sqlx::Error> {
    if row.try_get_raw(i)?.is_null() {
        return Ok(Value::Null);
    }

    let declared = match column.category() {
        TypeCategory::Boolean => row.try_get::<bool, _>(i).map(Value::Boolean),
        TypeCategory::Integer => row.try_get::<i64, _>(i).map(Value::Integer),
        TypeCategory::Float => row.try_get::<f64, _>(i).map(Value::Float),
        TypeCategory::Decimal => decode_decimal(row, i),
        TypeCategory::Date => row.try_get::<NaiveDate, _>(i).map(Value::Date),
        TypeCategory::Time => row.try_get::<NaiveTime, _>(i).map(Value::Time),
        TypeCategory::Timestamp => row.try_get::<NaiveDateTime, _>(i).map(Value::Timestamp),
        TypeCategory::Binary => row.try_get::<Vec<u8>, _>(i).map(Value::Bytes),
        TypeCategory::BinaryLob => row
            .try_get::<Vec<u8>, _>(i)
            .map(|bytes| Value::Lob(LargeObject::binary(bytes))),
        TypeCategory::CharacterLob => row
            .try_get::<String, _>(i)
            .map(|text| Value::Lob(LargeObject::character(text))),
        TypeCategory::Xml => row
            .try_get::<String, _>(i)
            .map(|text| Value::Lob(LargeObject::xml(text))),
        TypeCategory::Text => row.try_get::<String, _>(i).map(Value::Text),
        TypeCategory::Unsupported => decode_stored(row, i),
    };

    declared.or_else(|_| decode_stored(row, i))
}

fn decode_decimal(row: &SqliteRow, i: usize) -> Result<Value, sqlx::Error> {
    row.try_get::<i64, _>(i)
        .map(|n| Value::Decimal(Decimal::from(n)))
        .or_else(|_| {
            row.try_get::<f64, _>(i).map(|f| {
                Decimal::from_f64(f)
                    .map(Value::Decimal)
                    .unwrap_or(Value::Float(f))
            })
        })
        .or_else(|_| {
            row.try_get::<String, _>(i).map(|text| {
                Decimal::from_str(text.trim())
                    .map(Value::Decimal)
                    .unwrap_or(Value::Text(text))
            })
        })
}

/// Decodes by the storage class of the stored value.
fn decode_stored(row: &SqliteRow, i: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(i)?;
    let storage = raw.type_info().name().to_string();
    match storage.as_str() {
        "NULL" => Ok(Value::Null),
        "INTEGER" => row.try_get_unchecked::<i64, _>(i).map(Value::Integer),
        "REAL" => row.try_get_unchecked::<f64, _>(i).map(Value::Float),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(i).map(Value::Bytes),
        _ => row.try_get_unchecked::<String, _>(i).map(Value::Text),
    }
}

// --- Writes ---

fn bind_parameter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    parameter: Parameter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let kind = BindKind::for_type(parameter.sql_type);
    match parameter.value {
        Value::Null => match kind {
            BindKind::Boolean => query.bind(None::<bool>),
            BindKind::Integer => query.bind(None::<i64>),
            BindKind::Float => query.bind(None::<f64>),
            // no native decimal type; NUMERIC affinity converts the text form
            BindKind::Decimal | BindKind::Text => query.bind(None::<String>),
            BindKind::Date => query.bind(None::<NaiveDate>),
            BindKind::Time => query.bind(None::<NaiveTime>),
            BindKind::Timestamp => query.bind(None::<NaiveDateTime>),
            BindKind::Bytes => query.bind(None::<Vec<u8>>),
        },
        Value::Boolean(v) => query.bind(v),
        Value::Integer(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Decimal(v) => query.bind(v.to_string()),
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

pub async fn execute_statement(
    conn: &mut SqliteConnection,
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

pub async fn execute_statements(
    conn: &mut SqliteConnection,
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
