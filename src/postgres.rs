// =====================================================
// PostgreSQL SPECIFIC DATABASE OPERATIONS
// =====================================================

use crate::datasource::BindKind;
use crate::db_types::ConnectionConfig;
use crate::metadata::{ColumnMetadata, RowMetadata, TypeCategory};
use crate::value::{LargeObject, LargeObjectKind, Parameter, Row, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Executor, Pool, Postgres, Row as _, TypeInfo};
use tokio::sync::{mpsc, oneshot};

// --- Connection ---

pub async fn create_pool(config: &ConnectionConfig) -> Result<Pool<Postgres>, String> {
    let port = config.port_or_default();
    let mut options = PgConnectOptions::new()
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

    if let Some(ssl) = &config.ssl_mode {
        options = match ssl.as_str() {
            "disable" => options.ssl_mode(sqlx::postgres::PgSslMode::Disable),
            "prefer" => options.ssl_mode(sqlx::postgres::PgSslMode::Prefer),
            "require" => options.ssl_mode(sqlx::postgres::PgSslMode::Require),
            _ => options,
        };
    }

    if let Some(schema) = config.schema.as_deref().filter(|s| !s.is_empty()) {
        options = options.options([("search_path", schema)]);
    }

    options = options.log_statements(log::LevelFilter::Debug);

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .idle_timeout(std::time::Duration::from_secs(300))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("connection refused") {
                return format!(
                    "Connection refused; check if PostgreSQL is running on {}:{}",
                    config.host, port
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

pub async fn stream_query(
    pool: Pool<Postgres>,
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
            let mut columns = Vec::with_capacity(describe.columns().len());
            for (i, column) in describe.columns().iter().enumerate() {
                let mut metadata = ColumnMetadata::from_driver(
                    column.name(),
                    column.ordinal() + 1,
                    column.type_info().name(),
                    describe.nullable(i).unwrap_or(true),
                );
                // The wire type carries no typmod; table columns have it in the catalog.
                if metadata.category() == TypeCategory::Decimal {
                    if let (Some(table), Some(attribute)) =
                        (column.relation_id(), column.relation_attribute_no())
                    {
                        let declared = declared_numeric(&mut *conn, table, attribute).await;
                        if let Some(declared) = declared {
                            metadata = metadata.with_declared_type(&declared);
                        }
                    }
                }
                columns.push(metadata);
            }
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

async fn declared_numeric(
    conn: &mut PgConnection,
    table: Oid,
    attribute: i16,
) -> Option<String> {
    let typmod = sqlx::query_scalar::<_, i32>(
        "SELECT atttypmod FROM pg_catalog.pg_attribute WHERE attrelid = $1 AND attnum = $2",
    )
    .bind(table)
    .bind(attribute)
    .fetch_optional(&mut *conn)
    .await;
    match typmod {
        Ok(typmod) => typmod.and_then(numeric_declaration),
        Err(e) => {
            log::debug!("Failed to read numeric typmod of {}.{}: {}", table.0, attribute, e);
            None
        }
    }
}

/// `numeric(p,s)` encoded by a column typmod, `None` when unconstrained.
/// Negative scales (PostgreSQL 15+) round to whole numbers.
pub(crate) fn numeric_declaration(typmod: i32) -> Option<String> {
    if typmod < 4 {
        return None;
    }
    let packed = typmod - 4;
    let precision = (packed >> 16) & 0xffff;
    let scale = ((packed & 0x7ff) ^ 1024) - 1024;
    if precision == 0 {
        return None;
    }
    Some(format!("numeric({},{})", precision, scale.max(0)))
}

fn decode_row(row: &PgRow, metadata: &RowMetadata) -> Result<Row, String> {
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

// Postgres decoding is strict about widths, so integer and float columns
// try each width in turn.
fn decode_column(row: &PgRow, i: usize, column: &ColumnMetadata) -> Result<Value, sqlx::Error> {
    match column.category() {
        TypeCategory::Boolean => row.try_get::<Option<bool>, _>(i).map(Value::from),
        TypeCategory::Integer => row
            .try_get::<Option<i64>, _>(i)
            .or_else(|_| row.try_get::<Option<i32>, _>(i).map(|v| v.map(i64::from)))
            .or_else(|_| row.try_get::<Option<i16>, _>(i).map(|v| v.map(i64::from)))
            .or_else(|_| row.try_get::<Option<i8>, _>(i).map(|v| v.map(i64::from)))
            .map(Value::from),
        TypeCategory::Float => row
            .try_get::<Option<f64>, _>(i)
            .or_else(|_| row.try_get::<Option<f32>, _>(i).map(|v| v.map(f64::from)))
            .map(Value::from),
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
        TypeCategory::CharacterLob => decode_text(row, i)
            .map(|v| v.map(|text| Value::Lob(LargeObject::character(text))).unwrap_or(Value::Null)),
        TypeCategory::Xml => decode_text(row, i)
            .map(|v| v.map(|text| Value::Lob(LargeObject::xml(text))).unwrap_or(Value::Null)),
        TypeCategory::Text => decode_text(row, i).map(Value::from),
        TypeCategory::Unsupported => {
            decode_text(row, i).map(|v| v.map(Value::Other).unwrap_or(Value::Null))
        }
    }
}

fn decode_text(row: &PgRow, i: usize) -> Result<Option<String>, sqlx::Error> {
    row.try_get::<Option<String>, _>(i)
        .or_else(|_| {
            row.try_get::<Option<uuid::Uuid>, _>(i)
                .map(|v| v.map(|id| id.to_string()))
        })
        .or_else(|_| {
            row.try_get::<Option<serde_json::Value>, _>(i)
                .map(|v| v.map(|json| json.to_string()))
        })
}

// --- Writes ---

fn bind_parameter(
    query: Query<'_, Postgres, PgArguments>,
    parameter: Parameter,
) -> Query<'_, Postgres, PgArguments> {
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

pub async fn execute_statement(
    conn: &mut PgConnection,
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

/// Runs the batch on `conn` inside the caller's transaction, stopping at the
/// first failure because PostgreSQL aborts the transaction on any error.
pub async fn execute_statements(
    conn: &mut PgConnection,
    sql: &str,
    batch: Vec<Vec<Parameter>>,
) -> Vec<Result<u64, String>> {
    let mut results = Vec::with_capacity(batch.len());
    for params in batch {
        let mut query = sqlx::query(sql);
        for parameter in params {
            query = bind_parameter(query, parameter);
        }
        let result = query
            .execute(&mut *conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| e.to_string());
        let failed = result.is_err();
        results.push(result);
        if failed {
            break;
        }
    }
    results
}
