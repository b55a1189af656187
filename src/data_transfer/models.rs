use crate::error::{Result, TransferError};
use crate::template::ConfigValue;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_batch_size() -> usize {
    1000
}

fn default_delimiter() -> char {
    ','
}

fn default_variable_name() -> String {
    "id".to_string()
}

// --- Job File ---

/// Root of a job document: `{ "jobs": [ ... ] }`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct JobFile {
    pub jobs: Vec<JobDescriptor>,
}

impl JobFile {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| TransferError::Config(format!("Invalid job document: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!(
                "Failed to read job file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&text)
    }

    /// Jobs to run, in file order. An empty selection means every job.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&JobDescriptor>> {
        if ids.is_empty() {
            return Ok(self.jobs.iter().collect());
        }
        for id in ids {
            if !self.jobs.iter().any(|job| job.normalized_id() == id.trim()) {
                return Err(TransferError::Config(format!("Job '{}' not found", id.trim())));
            }
        }
        Ok(self
            .jobs
            .iter()
            .filter(|job| ids.iter().any(|id| id.trim() == job.normalized_id()))
            .collect())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(TransferError::Config(
                "Job document declares no jobs".to_string(),
            ));
        }
        for (index, job) in self.jobs.iter().enumerate() {
            job.validate().map_err(|e| match e {
                TransferError::Config(message) => {
                    TransferError::Config(format!("Job {}: {}", index + 1, message))
                }
                other => other,
            })?;
            if self.jobs[..index]
                .iter()
                .any(|other| other.normalized_id() == job.normalized_id())
            {
                return Err(TransferError::Config(format!(
                    "Job id '{}' is declared more than once",
                    job.normalized_id()
                )));
            }
        }
        Ok(())
    }
}

// --- Job Descriptor ---

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct JobDescriptor {
    pub id: String,
    #[serde(default = "default_one")]
    pub threads: usize,
    #[serde(default)]
    pub variable: Option<VariableSpec>,
    pub select: SelectSpec,
    #[serde(default)]
    pub insert: Option<InsertSpec>,
    #[serde(default)]
    pub export: Option<ExportSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SelectSpec {
    pub datasource: String,
    /// Fetcher burst size; the engine default applies when absent.
    #[serde(default)]
    pub fetch_size: Option<usize>,
    pub sql: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct InsertSpec {
    pub datasource: String,
    /// 0 executes every row on its own.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_one")]
    pub parallel: usize,
    pub sql: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Text,
    Columnar,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Text => "text",
            ExportKind::Columnar => "columnar",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }

    pub fn is_supported_by(&self, kind: ExportKind) -> bool {
        match kind {
            ExportKind::Text => matches!(
                self,
                Compression::None | Compression::Zstd | Compression::Lz4
            ),
            ExportKind::Columnar => true,
        }
    }

    /// Suffix appended to compressed text files.
    pub fn file_suffix(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Snappy => Some("snappy"),
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
            Compression::Lz4 => Some("lz4"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ExportSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ExportKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_one")]
    pub parallel: usize,
    /// Parquet data page size limit in bytes.
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Byte threshold after which a text export starts a new part file.
    #[serde(default)]
    pub rotate_size: Option<u64>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub move_to: Option<String>,
    #[serde(default)]
    pub format_file: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub header: bool,
}

impl ExportSpec {
    pub fn normalized_move_to(&self) -> Option<String> {
        self.move_to
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn normalized_format_file(&self) -> Option<String> {
        self.format_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

// --- Variable Declaration ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct VariableSpec {
    /// Prefix of the task bindings (`<name>.low`, `<name>.values`, ...).
    #[serde(default = "default_variable_name")]
    pub name: String,
    #[serde(flatten)]
    pub declaration: VariableDeclaration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VariableDeclaration {
    IntegerRange(IntegerRange),
    LiteralList(LiteralList),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct IntegerRange {
    pub low_value: i64,
    /// Exclusive.
    pub high_value: i64,
    pub block_size: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LiteralList {
    pub values: Vec<ConfigValue>,
    pub block_size: i64,
}

impl VariableDeclaration {
    pub fn block_size(&self) -> i64 {
        match self {
            VariableDeclaration::IntegerRange(range) => range.block_size,
            VariableDeclaration::LiteralList(list) => list.block_size,
        }
    }
}

impl JobDescriptor {
    pub fn normalized_id(&self) -> &str {
        self.id.trim()
    }

    /// Sink workers per task: with both sinks every worker feeds both, so
    /// the larger parallelism wins.
    pub fn sink_parallelism(&self) -> usize {
        let insert = self.insert.as_ref().map(|spec| spec.parallel).unwrap_or(0);
        let export = self.export.as_ref().map(|spec| spec.parallel).unwrap_or(0);
        insert.max(export).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let id = self.normalized_id();
        if id.is_empty() {
            return Err(TransferError::Config("id is required".to_string()));
        }
        if self.threads == 0 {
            return Err(TransferError::Config(format!(
                "Job '{}' must run on at least one thread",
                id
            )));
        }

        if self.select.datasource.trim().is_empty() {
            return Err(TransferError::Config(format!(
                "Job '{}' select has no datasource",
                id
            )));
        }
        if self.select.sql.trim().is_empty() {
            return Err(TransferError::Config(format!("Job '{}' select has no sql", id)));
        }
        if self.select.fetch_size == Some(0) {
            return Err(TransferError::Config(format!(
                "Job '{}' select fetch-size must be at least 1",
                id
            )));
        }

        if let Some(insert) = &self.insert {
            if insert.datasource.trim().is_empty() {
                return Err(TransferError::Config(format!(
                    "Job '{}' insert has no datasource",
                    id
                )));
            }
            if insert.sql.trim().is_empty() {
                return Err(TransferError::Config(format!("Job '{}' insert has no sql", id)));
            }
            if insert.parallel == 0 {
                return Err(TransferError::Config(format!(
                    "Job '{}' insert parallel must be at least 1",
                    id
                )));
            }
        }

        if let Some(export) = &self.export {
            if export.path.trim().is_empty() {
                return Err(TransferError::Config(format!("Job '{}' export has no path", id)));
            }
            if export.parallel == 0 {
                return Err(TransferError::Config(format!(
                    "Job '{}' export parallel must be at least 1",
                    id
                )));
            }
            if !export.compression.is_supported_by(export.kind) {
                return Err(TransferError::Config(format!(
                    "Job '{}' uses '{}' compression, which {} export does not support",
                    id,
                    export.compression.as_str(),
                    export.kind.as_str()
                )));
            }
            if export.page_size == Some(0) || export.rotate_size == Some(0) {
                return Err(TransferError::Config(format!(
                    "Job '{}' export page-size and rotate-size must be positive",
                    id
                )));
            }
            if !export.delimiter.is_ascii() || export.delimiter == '"' {
                return Err(TransferError::Config(format!(
                    "Job '{}' export delimiter '{}' must be a single ASCII character other than '\"'",
                    id, export.delimiter
                )));
            }
            if export.kind == ExportKind::Columnar && export.rotate_size.is_some() {
                return Err(TransferError::Config(format!(
                    "Job '{}' sets rotate-size, which only text export supports",
                    id
                )));
            }
        }

        if let Some(variable) = &self.variable {
            let name = variable.name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(TransferError::Config(format!(
                    "Job '{}' variable name '{}' is invalid",
                    id, variable.name
                )));
            }
            if variable.declaration.block_size() <= 0 {
                return Err(TransferError::Config(format!(
                    "Job '{}' variable block-size must be positive",
                    id
                )));
            }
            match &variable.declaration {
                VariableDeclaration::IntegerRange(range) if range.low_value >= range.high_value => {
                    return Err(TransferError::Config(format!(
                        "Job '{}' range [{}, {}) is empty",
                        id, range.low_value, range.high_value
                    )));
                }
                VariableDeclaration::LiteralList(list) if list.values.is_empty() => {
                    return Err(TransferError::Config(format!(
                        "Job '{}' literal list has no values",
                        id
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
