// =====================================================
// COLUMN AND ROW METADATA
// =====================================================

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};

// --- SQL Types ---

/// SQL type of a result column, as reported by the driver.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SqlType {
    Boolean,
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Numeric,
    Decimal,
    Char,
    VarChar,
    LongVarChar,
    NChar,
    NVarChar,
    Clob,
    NClob,
    SqlXml,
    Date,
    Time,
    Timestamp,
    TimestampWithTimezone,
    Binary,
    VarBinary,
    LongVarBinary,
    Blob,
    Struct,
    Ref,
    Array,
    RowId,
    Other,
}

/// Conversion taxonomy shared by every sink.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TypeCategory {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    CharacterLob,
    Xml,
    Date,
    Time,
    Timestamp,
    Binary,
    BinaryLob,
    Unsupported,
}

impl SqlType {
    pub fn category(&self) -> TypeCategory {
        match self {
            SqlType::Boolean | SqlType::Bit => TypeCategory::Boolean,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => {
                TypeCategory::Integer
            }
            SqlType::Real | SqlType::Float | SqlType::Double => TypeCategory::Float,
            SqlType::Numeric | SqlType::Decimal => TypeCategory::Decimal,
            SqlType::Char
            | SqlType::VarChar
            | SqlType::LongVarChar
            | SqlType::NChar
            | SqlType::NVarChar => TypeCategory::Text,
            SqlType::Clob | SqlType::NClob => TypeCategory::CharacterLob,
            SqlType::SqlXml => TypeCategory::Xml,
            SqlType::Date => TypeCategory::Date,
            SqlType::Time => TypeCategory::Time,
            SqlType::Timestamp | SqlType::TimestampWithTimezone => TypeCategory::Timestamp,
            SqlType::Binary | SqlType::VarBinary | SqlType::LongVarBinary => TypeCategory::Binary,
            SqlType::Blob => TypeCategory::BinaryLob,
            SqlType::Struct | SqlType::Ref | SqlType::Array | SqlType::RowId | SqlType::Other => {
                TypeCategory::Unsupported
            }
        }
    }

    pub fn is_large_object(&self) -> bool {
        matches!(
            self.category(),
            TypeCategory::CharacterLob | TypeCategory::BinaryLob | TypeCategory::Xml
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Bit => "BIT",
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Float => "FLOAT",
            SqlType::Double => "DOUBLE",
            SqlType::Numeric => "NUMERIC",
            SqlType::Decimal => "DECIMAL",
            SqlType::Char => "CHAR",
            SqlType::VarChar => "VARCHAR",
            SqlType::LongVarChar => "LONGVARCHAR",
            SqlType::NChar => "NCHAR",
            SqlType::NVarChar => "NVARCHAR",
            SqlType::Clob => "CLOB",
            SqlType::NClob => "NCLOB",
            SqlType::SqlXml => "SQLXML",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampWithTimezone => "TIMESTAMP_WITH_TIMEZONE",
            SqlType::Binary => "BINARY",
            SqlType::VarBinary => "VARBINARY",
            SqlType::LongVarBinary => "LONGVARBINARY",
            SqlType::Blob => "BLOB",
            SqlType::Struct => "STRUCT",
            SqlType::Ref => "REF",
            SqlType::Array => "ARRAY",
            SqlType::RowId => "ROWID",
            SqlType::Other => "OTHER",
        }
    }

    /// Classifies a driver type name (MySQL, PostgreSQL and SQLite spellings).
    pub fn from_type_name(type_name: &str) -> SqlType {
        let normalized = type_name.trim().to_ascii_lowercase();
        if normalized.ends_with("[]") || normalized.starts_with('_') {
            return SqlType::Array;
        }
        let base = normalized
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_end_matches(" unsigned")
            .to_string();

        if normalized == "tinyint(1)" || matches!(base.as_str(), "bool" | "boolean") {
            return SqlType::Boolean;
        }

        match base.as_str() {
            "bit" => SqlType::Bit,
            "tinyint" | "int1" => SqlType::TinyInt,
            "smallint" | "int2" | "smallserial" | "year" => SqlType::SmallInt,
            "int" | "int4" | "integer" | "mediumint" | "serial" => SqlType::Integer,
            "bigint" | "int8" | "bigserial" => SqlType::BigInt,
            "real" | "float4" => SqlType::Real,
            "float" => SqlType::Float,
            "double" | "double precision" | "float8" => SqlType::Double,
            "numeric" => SqlType::Numeric,
            "decimal" | "money" => SqlType::Decimal,
            "char" | "bpchar" | "character" => SqlType::Char,
            "varchar" | "character varying" | "name" | "citext" | "uuid" | "enum" | "set"
            | "json" | "jsonb" | "inet" | "cidr" => SqlType::VarChar,
            "text" | "tinytext" => SqlType::LongVarChar,
            "nchar" => SqlType::NChar,
            "nvarchar" => SqlType::NVarChar,
            "mediumtext" | "longtext" | "clob" => SqlType::Clob,
            "nclob" => SqlType::NClob,
            "xml" => SqlType::SqlXml,
            "date" => SqlType::Date,
            "time" | "timetz" | "time without time zone" | "time with time zone" => SqlType::Time,
            "timestamp" | "datetime" | "timestamp without time zone" => SqlType::Timestamp,
            "timestamptz" | "timestamp with time zone" => SqlType::TimestampWithTimezone,
            "binary" => SqlType::Binary,
            "varbinary" | "bytea" => SqlType::VarBinary,
            "tinyblob" => SqlType::LongVarBinary,
            "blob" | "mediumblob" | "longblob" => SqlType::Blob,
            "record" | "composite" => SqlType::Struct,
            "ref" => SqlType::Ref,
            "array" => SqlType::Array,
            "rowid" | "oid" | "tid" => SqlType::RowId,
            _ => SqlType::Other,
        }
    }
}

/// Extracts `(precision, scale)` from a declared type such as `DECIMAL(12,2)`.
pub fn parse_precision_scale(type_name: &str) -> (Option<u32>, Option<u32>) {
    let left = type_name.find('(');
    let right = type_name.find(')');
    let (Some(left), Some(right)) = (left, right) else {
        return (None, None);
    };
    if right <= left + 1 {
        return (None, None);
    }

    let parts = type_name[left + 1..right]
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return (None, None);
    }

    let precision = parts[0].parse::<u32>().ok();
    let scale = parts.get(1).and_then(|value| value.parse::<u32>().ok());
    (precision, scale)
}

// --- Column Metadata ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    /// 1-based position in the result.
    pub ordinal_index: usize,
    pub sql_type: SqlType,
    /// Driver spelling of the type, kept for messages.
    pub type_name: String,
    pub precision: u32,
    /// `None` when the driver does not report a scale.
    pub scale: Option<u32>,
    pub nullable: bool,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, ordinal_index: usize, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            ordinal_index,
            sql_type,
            type_name: sql_type.as_str().to_string(),
            precision: 0,
            scale: None,
            nullable: true,
        }
    }

    /// Builds metadata from a driver type name, picking precision and scale
    /// out of the declaration when present.
    pub fn from_driver(name: &str, ordinal_index: usize, type_name: &str, nullable: bool) -> Self {
        let (precision, scale) = parse_precision_scale(type_name);
        Self {
            name: name.to_string(),
            ordinal_index,
            sql_type: SqlType::from_type_name(type_name),
            type_name: type_name.to_string(),
            precision: precision.unwrap_or(0),
            scale,
            nullable,
        }
    }

    pub fn with_precision_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = Some(scale);
        self
    }

    /// Takes precision and scale from a catalog declaration such as
    /// `numeric(12,0)`, keeping the driver's type. `decimal(p)` has scale 0.
    pub fn with_declared_type(mut self, declared: &str) -> Self {
        if let (Some(precision), scale) = parse_precision_scale(declared) {
            self.precision = precision;
            self.scale = Some(scale.unwrap_or(0));
        }
        self
    }

    pub fn category(&self) -> TypeCategory {
        self.sql_type.category()
    }
}

// --- Row Metadata ---

/// Shape of a query result. Columns are stored at `ordinal_index - 1`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RowMetadata {
    columns: Vec<ColumnMetadata>,
}

impl RowMetadata {
    pub fn new(mut columns: Vec<ColumnMetadata>) -> Result<Self> {
        columns.sort_by_key(|column| column.ordinal_index);

        for (position, column) in columns.iter().enumerate() {
            if column.ordinal_index == 0 {
                return Err(TransferError::Metadata(format!(
                    "Column '{}' has ordinal index 0; indices are 1-based",
                    column.name
                )));
            }
            if position > 0 && columns[position - 1].ordinal_index == column.ordinal_index {
                return Err(TransferError::Metadata(format!(
                    "Columns '{}' and '{}' share ordinal index {}",
                    columns[position - 1].name,
                    column.name,
                    column.ordinal_index
                )));
            }
            if column.ordinal_index != position + 1 {
                return Err(TransferError::Metadata(format!(
                    "Column ordinal indices are not dense: expected {} but found {} ('{}')",
                    position + 1,
                    column.ordinal_index,
                    column.name
                )));
            }
        }

        Ok(Self { columns })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column at a 0-based position.
    pub fn column_at(&self, index: usize) -> Option<&ColumnMetadata> {
        self.columns.get(index)
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    #[cfg(test)]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    /// Case-insensitive lookup returning the 0-based position.
    pub fn find(&self, name: &str) -> Option<usize> {
        let needle = name.trim();
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(needle))
    }
}
