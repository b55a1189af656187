// =====================================================
// COMMON DATABASE TYPES AND STRUCTURES
// =====================================================

use crate::template::LiteralStyle;
use serde::{Deserialize, Serialize};

// --- Database Type Enum ---
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    MySQL,
    #[serde(alias = "postgres")]
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn label(&self) -> &'static str {
        match self {
            DatabaseType::MySQL => "mysql",
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::SQLite => "sqlite",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::MySQL => 3306,
            DatabaseType::PostgreSQL => 5432,
            DatabaseType::SQLite => 0,
        }
    }
}

// --- Connection Configuration ---
//
// One entry per named datasource in the settings file. For SQLite the
// database file path goes in `host`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConnectionConfig {
    #[serde(rename = "type", alias = "dbType", default)]
    pub db_type: DatabaseType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub database: Option<String>,
    // PostgreSQL specific
    #[serde(alias = "sslMode")]
    pub ssl_mode: Option<String>,
    pub schema: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl ConnectionConfig {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.db_type.default_port())
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(match self.db_type {
                DatabaseType::SQLite => {
                    format!("Datasource '{}' requires the database file path in 'host'", name)
                }
                _ => format!("Datasource '{}' requires a host", name),
            });
        }
        if self.max_connections == 0 {
            return Err(format!("Datasource '{}' must allow at least one connection", name));
        }
        Ok(())
    }
}

/// Placeholder spelling used when compiling named-parameter statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    QuestionMark,
    /// `$1`, `$2`, ...
    Dollar,
}

impl From<DatabaseType> for PlaceholderStyle {
    fn from(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::PostgreSQL => PlaceholderStyle::Dollar,
            DatabaseType::MySQL | DatabaseType::SQLite => PlaceholderStyle::QuestionMark,
        }
    }
}

impl From<DatabaseType> for LiteralStyle {
    fn from(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::MySQL => LiteralStyle::BackslashEscapes,
            DatabaseType::PostgreSQL | DatabaseType::SQLite => LiteralStyle::Standard,
        }
    }
}

#[cfg(test)]
mod tests;
