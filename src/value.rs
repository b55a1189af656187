// =====================================================
// ROW VALUES
// =====================================================

use crate::metadata::{SqlType, TypeCategory};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeObjectKind {
    Character,
    Binary,
    Xml,
}

/// Content of a character, binary or XML large object.
///
/// The value owns its bytes; a destination never receives the source's
/// storage, it receives a copy made by `Connection::create_large_object`.
#[derive(Debug, Clone, PartialEq)]
pub struct LargeObject {
    pub kind: LargeObjectKind,
    data: Vec<u8>,
}

impl LargeObject {
    pub fn character(text: impl Into<String>) -> Self {
        Self {
            kind: LargeObjectKind::Character,
            data: text.into().into_bytes(),
        }
    }

    pub fn xml(text: impl Into<String>) -> Self {
        Self {
            kind: LargeObjectKind::Xml,
            data: text.into().into_bytes(),
        }
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            kind: LargeObjectKind::Binary,
            data: bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reads the object as text; binary content is decoded lossily.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamps are normalized to UTC wall-clock time.
    Timestamp(NaiveDateTime),
    Bytes(Vec<u8>),
    Lob(LargeObject),
    /// Driver value the engine has no native representation for.
    Other(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Lob(_) => "lob",
            Value::Other(_) => "other",
        }
    }

    /// Whether this value can be stored in a column of the given category.
    pub fn fits_category(&self, category: TypeCategory) -> bool {
        match (self, category) {
            (Value::Null, _) => true,
            (Value::Boolean(_), TypeCategory::Boolean) => true,
            (Value::Integer(_), TypeCategory::Integer | TypeCategory::Boolean) => true,
            (Value::Float(_), TypeCategory::Float) => true,
            (Value::Decimal(_), TypeCategory::Decimal) => true,
            (Value::Text(_), TypeCategory::Text) => true,
            (Value::Lob(lob), TypeCategory::CharacterLob) => lob.kind == LargeObjectKind::Character,
            (Value::Lob(lob), TypeCategory::Xml) => lob.kind == LargeObjectKind::Xml,
            (Value::Lob(lob), TypeCategory::BinaryLob) => lob.kind == LargeObjectKind::Binary,
            (Value::Date(_), TypeCategory::Date) => true,
            (Value::Time(_), TypeCategory::Time) => true,
            (Value::Timestamp(_), TypeCategory::Timestamp) => true,
            (Value::Bytes(_), TypeCategory::Binary) => true,
            (Value::Other(_), TypeCategory::Unsupported) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Lob(v) => write!(f, "<lob {} bytes>", v.len()),
            Value::Other(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

// --- Row ---

/// Values of one result row, positionally aligned with its `RowMetadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

// --- Statement Parameters ---

/// A statement parameter carrying the SQL type it binds as, so NULLs keep a type.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub sql_type: SqlType,
    pub value: Value,
}

impl Parameter {
    pub fn new(sql_type: SqlType, value: Value) -> Self {
        Self { sql_type, value }
    }

    /// Infers the SQL type from the value; NULLs bind as VARCHAR.
    pub fn infer(value: Value) -> Self {
        let sql_type = match &value {
            Value::Boolean(_) => SqlType::Boolean,
            Value::Integer(_) => SqlType::BigInt,
            Value::Float(_) => SqlType::Double,
            Value::Decimal(_) => SqlType::Decimal,
            Value::Date(_) => SqlType::Date,
            Value::Time(_) => SqlType::Time,
            Value::Timestamp(_) => SqlType::Timestamp,
            Value::Bytes(_) => SqlType::VarBinary,
            Value::Lob(lob) => match lob.kind {
                LargeObjectKind::Character => SqlType::Clob,
                LargeObjectKind::Binary => SqlType::Blob,
                LargeObjectKind::Xml => SqlType::SqlXml,
            },
            Value::Null | Value::Text(_) | Value::Other(_) => SqlType::VarChar,
        };
        Self { sql_type, value }
    }
}
