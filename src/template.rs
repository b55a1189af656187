// =====================================================
// LAYERED CONFIGURATION AND ${...} SUBSTITUTION
// =====================================================

use crate::error::{Result, TransferError};
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static VARIABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z0-9_\-]+)*$").expect("valid variable pattern")
});

/// Value bound to a configuration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Integer(i64),
    Text(String),
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    /// Typed statement value for `:name` binding. Text that parses as an
    /// integer binds as an integer.
    pub fn to_value(&self) -> Value {
        match self {
            ConfigValue::Integer(v) => Value::Integer(*v),
            ConfigValue::Text(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(raw.clone())),
            ConfigValue::List(_) => Value::Text(self.to_string()),
        }
    }

    /// Rendering used inside SQL templates: lists become comma separated
    /// literals so `IN (${v.values})` works.
    fn render(&self, style: LiteralStyle) -> String {
        match self {
            ConfigValue::Integer(v) => v.to_string(),
            ConfigValue::Text(raw) => raw.clone(),
            ConfigValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ConfigValue::Integer(v) => v.to_string(),
                    ConfigValue::Text(raw) => format!("'{}'", style.escape(raw)),
                    nested => nested.render(style),
                })
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Integer(v) => write!(f, "{}", v),
            ConfigValue::Text(raw) => write!(f, "{}", raw),
            ConfigValue::List(items) => write!(
                f,
                "{}",
                items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

/// How string literals are quoted when list values are rendered into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiteralStyle {
    /// Only `'` is special and is doubled.
    #[default]
    Standard,
    /// Backslash is an escape character too (MySQL default `sql_mode`).
    BackslashEscapes,
}

impl LiteralStyle {
    pub fn escape(self, value: &str) -> String {
        match self {
            LiteralStyle::Standard => value.replace('\'', "''"),
            LiteralStyle::BackslashEscapes => value.replace('\\', "\\\\").replace('\'', "''"),
        }
    }
}

// --- Layers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    External,
    Environment,
    Job,
    Task,
}

#[derive(Debug, Clone)]
struct Layer {
    kind: LayerKind,
    values: BTreeMap<String, ConfigValue>,
}

/// Ordered configuration layers; later layers shadow earlier ones.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    layers: Vec<Layer>,
}

impl LayeredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer on top of the existing ones.
    pub fn with_layer<I, K, V>(mut self, kind: LayerKind, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.push_layer(kind, values);
        self
    }

    pub fn push_layer<I, K, V>(&mut self, kind: LayerKind, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.layers.push(Layer {
            kind,
            values: values
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        });
    }

    /// Process environment as a layer.
    pub fn with_environment(self) -> Self {
        self.with_layer(LayerKind::Environment, std::env::vars())
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.values.get(key))
    }

    /// Layer that currently provides `key`.
    #[cfg(test)]
    pub fn source_of(&self, key: &str) -> Option<LayerKind> {
        self.layers
            .iter()
            .rev()
            .find(|layer| layer.values.contains_key(key))
            .map(|layer| layer.kind)
    }

    #[cfg(test)]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Replaces every `${name}` / `${name.field}` reference, quoting list
    /// literals the standard SQL way.
    pub fn substitute(&self, text: &str) -> Result<String> {
        self.substitute_with(text, LiteralStyle::Standard)
    }

    /// Like [`substitute`](Self::substitute) for a statement run against a
    /// database with the given literal quoting rules.
    pub fn substitute_with(&self, text: &str, style: LiteralStyle) -> Result<String> {
        if !text.contains("${") {
            return Ok(text.to_string());
        }

        let mut cursor = text;
        let mut rendered = String::with_capacity(text.len());
        loop {
            let Some(start) = cursor.find("${") else {
                rendered.push_str(cursor);
                break;
            };
            rendered.push_str(&cursor[..start]);
            let after_start = &cursor[start + 2..];
            let end = after_start.find('}').ok_or_else(|| {
                TransferError::Template(format!("Unclosed template placeholder in '{}'", text))
            })?;
            let name = after_start[..end].trim();
            if !VARIABLE_NAME.is_match(name) {
                return Err(TransferError::Template(format!(
                    "Invalid template variable '{}' in '{}'",
                    name, text
                )));
            }
            let value = self.get(name).ok_or_else(|| {
                TransferError::Template(format!("Template references unknown variable '{}'", name))
            })?;
            rendered.push_str(&value.render(style));
            cursor = &after_start[end + 1..];
        }

        Ok(rendered)
    }
}
