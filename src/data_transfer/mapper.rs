// =====================================================
// EXPORT TYPE MAPPING
// =====================================================
//
// Decides once per task how every result column is written by the text and
// columnar sinks, then converts row values accordingly.

use crate::data_transfer::models::ExportKind;
use crate::error::{Result, TransferError};
use crate::metadata::{ColumnMetadata, RowMetadata, SqlType, TypeCategory};
use crate::value::{Row, Value};
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, Timelike};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Days from 0001-01-01 to 1970-01-01.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    Boolean,
    Integer,
    Float,
    /// Decimal without a reported scale: integral values print as integers.
    Number,
    Text,
    Date,
    Time,
    Timestamp,
    Binary,
}

impl ExportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportType::Boolean => "boolean",
            ExportType::Integer => "integer",
            ExportType::Float => "float",
            ExportType::Number => "number",
            ExportType::Text => "text",
            ExportType::Date => "date",
            ExportType::Time => "time",
            ExportType::Timestamp => "timestamp",
            ExportType::Binary => "binary",
        }
    }

    fn arrow_type(&self) -> DataType {
        match self {
            ExportType::Boolean => DataType::Boolean,
            ExportType::Integer => DataType::Int64,
            ExportType::Float | ExportType::Number => DataType::Float64,
            ExportType::Text => DataType::Utf8,
            ExportType::Date => DataType::Date32,
            ExportType::Time => DataType::Time64(TimeUnit::Microsecond),
            ExportType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            ExportType::Binary => DataType::Binary,
        }
    }
}

fn unsupported(column: &ColumnMetadata, kind: ExportKind) -> TransferError {
    TransferError::UnsupportedType {
        column: column.name.clone(),
        type_name: column.type_name.clone(),
        sink: kind.as_str(),
    }
}

/// Picks the export type of a column, or refuses it for this sink.
pub fn export_type(column: &ColumnMetadata, kind: ExportKind) -> Result<ExportType> {
    let export_type = match column.category() {
        TypeCategory::Boolean => ExportType::Boolean,
        TypeCategory::Integer => ExportType::Integer,
        TypeCategory::Float => ExportType::Float,
        TypeCategory::Decimal => match (column.scale, kind) {
            (Some(0), _) => ExportType::Integer,
            (Some(_), _) => ExportType::Float,
            (None, ExportKind::Text) => ExportType::Number,
            (None, ExportKind::Columnar) => ExportType::Float,
        },
        TypeCategory::Text | TypeCategory::CharacterLob | TypeCategory::Xml => ExportType::Text,
        TypeCategory::Date => ExportType::Date,
        TypeCategory::Time => ExportType::Time,
        TypeCategory::Timestamp => ExportType::Timestamp,
        TypeCategory::Binary => ExportType::Binary,
        TypeCategory::BinaryLob => match kind {
            ExportKind::Text => return Err(unsupported(column, kind)),
            ExportKind::Columnar => ExportType::Binary,
        },
        TypeCategory::Unsupported => return Err(unsupported(column, kind)),
    };
    Ok(export_type)
}

// --- Column Plan ---

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub type_name: String,
    pub category: TypeCategory,
    pub nullable: bool,
    pub export_type: ExportType,
}

/// Export types of every column of a result, fixed for the whole task.
#[derive(Debug, Clone)]
pub struct ExportColumns {
    kind: ExportKind,
    columns: Vec<ExportColumn>,
}

impl ExportColumns {
    pub fn new(metadata: &RowMetadata, kind: ExportKind) -> Result<Self> {
        let columns = metadata
            .columns()
            .iter()
            .map(|column| {
                Ok(ExportColumn {
                    name: column.name.clone(),
                    sql_type: column.sql_type,
                    type_name: column.type_name.clone(),
                    category: column.category(),
                    nullable: column.nullable,
                    export_type: export_type(column, kind)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { kind, columns })
    }

    pub fn kind(&self) -> ExportKind {
        self.kind
    }

    pub fn columns(&self) -> &[ExportColumn] {
        &self.columns
    }

    pub fn header(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    /// One text field per column.
    pub fn text_record(&self, row: &Row) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .map(|(index, column)| text_field(row.get(index).unwrap_or(&Value::Null), column))
            .collect()
    }

    /// Arrow schema with one nullable field per column.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields = self
            .columns
            .iter()
            .map(|column| Field::new(&column.name, column.export_type.arrow_type(), true))
            .collect::<Vec<_>>();
        Arc::new(Schema::new(fields))
    }

    pub fn record_batch(&self, schema: &SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
        let arrays = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| column_array(column, index, rows))
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new(Arc::clone(schema), arrays)?)
    }
}

// --- Text Conversion ---

fn decimal_integer(value: &Decimal) -> String {
    value.trunc().normalize().to_string()
}

fn decimal_float(value: &Decimal) -> String {
    match value.to_f64() {
        Some(float) => float.to_string(),
        None => value.normalize().to_string(),
    }
}

fn binary_hex(value: &Value) -> Option<String> {
    match value {
        Value::Bytes(bytes) => Some(hex::encode(bytes)),
        Value::Lob(lob) => Some(hex::encode(lob.as_bytes())),
        _ => None,
    }
}

/// Text rendering of one value; NULL is an empty field.
pub fn text_field(value: &Value, column: &ExportColumn) -> String {
    if value.is_null() {
        return String::new();
    }

    match (column.export_type, value) {
        (ExportType::Boolean, Value::Boolean(flag)) => flag.to_string(),
        (ExportType::Boolean, Value::Integer(number)) => (*number != 0).to_string(),

        (ExportType::Integer, Value::Decimal(decimal)) => decimal_integer(decimal),
        (ExportType::Integer, Value::Float(float)) => (float.trunc() as i64).to_string(),
        (ExportType::Integer, Value::Boolean(flag)) => i64::from(*flag).to_string(),

        (ExportType::Float, Value::Decimal(decimal)) => decimal_float(decimal),
        (ExportType::Float, Value::Integer(number)) => (*number as f64).to_string(),

        (ExportType::Number, Value::Decimal(decimal)) => {
            if decimal.fract().is_zero() {
                decimal_integer(decimal)
            } else {
                decimal_float(decimal)
            }
        }

        (ExportType::Date, Value::Date(date)) => date.format("%Y-%m-%d").to_string(),
        (ExportType::Date, Value::Timestamp(timestamp)) => {
            timestamp.date().format("%Y-%m-%d").to_string()
        }
        (ExportType::Time, Value::Time(time)) => time.format("%H:%M:%S%.f").to_string(),
        (ExportType::Timestamp, Value::Timestamp(timestamp)) => {
            timestamp.format("%Y-%m-%d %H:%M:%S%.f").to_string()
        }

        (ExportType::Text, Value::Lob(lob)) => lob.to_text(),
        (ExportType::Binary, other) => match binary_hex(other) {
            Some(hex) => hex,
            None => other.to_string(),
        },

        // values already in the target shape, or driver text
        (_, Value::Bytes(bytes)) => hex::encode(bytes),
        (_, Value::Lob(lob)) => lob.to_text(),
        (_, other) => other.to_string(),
    }
}

// --- Columnar Conversion ---

fn mismatch(column: &ExportColumn, value: &Value) -> TransferError {
    TransferError::UnsupportedType {
        column: column.name.clone(),
        type_name: format!("{} value", value.kind_label()),
        sink: "columnar",
    }
}

fn as_i64(column: &ExportColumn, value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(number) => Ok(Some(*number)),
        Value::Boolean(flag) => Ok(Some(i64::from(*flag))),
        Value::Decimal(decimal) => decimal
            .trunc()
            .to_i64()
            .map(Some)
            .ok_or_else(|| mismatch(column, value)),
        Value::Float(float) => Ok(Some(float.trunc() as i64)),
        Value::Text(text) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| mismatch(column, value)),
        _ => Err(mismatch(column, value)),
    }
}

fn as_f64(column: &ExportColumn, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Float(float) => Ok(Some(*float)),
        Value::Integer(number) => Ok(Some(*number as f64)),
        Value::Decimal(decimal) => decimal
            .to_f64()
            .map(Some)
            .ok_or_else(|| mismatch(column, value)),
        Value::Text(text) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| mismatch(column, value)),
        _ => Err(mismatch(column, value)),
    }
}

fn as_bool(column: &ExportColumn, value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Boolean(flag) => Ok(Some(*flag)),
        Value::Integer(number) => Ok(Some(*number != 0)),
        _ => Err(mismatch(column, value)),
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Lob(lob) => Some(lob.to_text()),
        Value::Bytes(bytes) => Some(hex::encode(bytes)),
        other => Some(other.to_string()),
    }
}

fn as_days(column: &ExportColumn, value: &Value) -> Result<Option<i32>> {
    match value {
        Value::Null => Ok(None),
        Value::Date(date) => Ok(Some(date.num_days_from_ce() - EPOCH_DAYS_FROM_CE)),
        Value::Timestamp(timestamp) => {
            Ok(Some(timestamp.date().num_days_from_ce() - EPOCH_DAYS_FROM_CE))
        }
        _ => Err(mismatch(column, value)),
    }
}

fn as_time_micros(column: &ExportColumn, value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Time(time) => Ok(Some(
            i64::from(time.num_seconds_from_midnight()) * 1_000_000
                + i64::from(time.nanosecond()) / 1_000,
        )),
        _ => Err(mismatch(column, value)),
    }
}

fn as_timestamp_micros(column: &ExportColumn, value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Timestamp(timestamp) => Ok(Some(timestamp.and_utc().timestamp_micros())),
        Value::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Some(midnight.and_utc().timestamp_micros()))
            .ok_or_else(|| mismatch(column, value)),
        _ => Err(mismatch(column, value)),
    }
}

fn as_bytes(column: &ExportColumn, value: &Value) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        Value::Bytes(bytes) => Ok(Some(bytes.clone())),
        Value::Lob(lob) => Ok(Some(lob.as_bytes().to_vec())),
        _ => Err(mismatch(column, value)),
    }
}

fn column_array(column: &ExportColumn, index: usize, rows: &[Row]) -> Result<ArrayRef> {
    let values = rows.iter().map(|row| row.get(index).unwrap_or(&Value::Null));

    let array: ArrayRef = match column.export_type {
        ExportType::Boolean => Arc::new(BooleanArray::from(
            values
                .map(|value| as_bool(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Integer => Arc::new(Int64Array::from(
            values
                .map(|value| as_i64(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Float | ExportType::Number => Arc::new(Float64Array::from(
            values
                .map(|value| as_f64(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Text => Arc::new(StringArray::from(
            values.map(as_text).collect::<Vec<_>>(),
        )),
        ExportType::Date => Arc::new(Date32Array::from(
            values
                .map(|value| as_days(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Time => Arc::new(Time64MicrosecondArray::from(
            values
                .map(|value| as_time_micros(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .map(|value| as_timestamp_micros(column, value))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExportType::Binary => {
            let owned = values
                .map(|value| as_bytes(column, value))
                .collect::<Result<Vec<_>>>()?;
            Arc::new(BinaryArray::from(
                owned.iter().map(|bytes| bytes.as_deref()).collect::<Vec<_>>(),
            ))
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests;
