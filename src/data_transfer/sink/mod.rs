// =====================================================
// SINKS
// =====================================================
//
// A sink worker pulls rows from the task's channel and hands each row to
// every configured writer. Insert writers own a connection each; export
// writers buffer rows and flush them into one file sink shared by the task.

pub mod columnar;
pub mod insert;
pub mod text;

use crate::data_transfer::channel::DataTransferChannel;
use crate::data_transfer::mapper::ExportColumns;
use crate::data_transfer::models::{ExportKind, ExportSpec};
use crate::data_transfer::result::TaskResult;
use crate::error::{Result, TransferError};
use crate::metadata::RowMetadata;
use crate::value::Row;
use columnar::ColumnarExportSink;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use text::TextExportSink;

pub use insert::{InsertProjection, InsertWriter};

/// Per-worker row consumer.
pub trait RowWriter: Send {
    fn write(&mut self, row: &Row) -> Result<()>;

    /// Flushes what is buffered and releases worker-owned resources.
    fn finish(&mut self) -> Result<()>;
}

/// Consumes the channel until it is drained. Every writer is finished on
/// every exit path; the first error is returned.
pub fn run_sink_worker(
    channel: &DataTransferChannel,
    writers: &mut [Box<dyn RowWriter>],
) -> Result<()> {
    let mut outcome = consume(channel, writers);
    if outcome.is_err() {
        // siblings drain what is queued and stop
        channel.close();
    }

    for writer in writers.iter_mut() {
        if let Err(e) = writer.finish() {
            if outcome.is_ok() {
                outcome = Err(e);
            } else {
                log::warn!("Failed to finish sink writer after an earlier error: {}", e);
            }
        }
    }
    outcome
}

fn consume(channel: &DataTransferChannel, writers: &mut [Box<dyn RowWriter>]) -> Result<()> {
    while let Some(row) = channel.transfer()? {
        for writer in writers.iter_mut() {
            writer.write(&row)?;
        }
    }
    Ok(())
}

// --- Export Sink ---

/// Where and how one task exports.
#[derive(Debug, Clone)]
pub struct ExportTarget {
    pub spec: ExportSpec,
    pub path: PathBuf,
    pub move_to: Option<PathBuf>,
    pub format_file: Option<PathBuf>,
}

/// The task's export file, shared by all of its sink workers.
pub enum ExportSink {
    Text(TextExportSink),
    Columnar(ColumnarExportSink),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatDescription<'a> {
    path: String,
    #[serde(rename = "type")]
    kind: &'static str,
    compression: &'static str,
    columns: &'a [crate::data_transfer::mapper::ExportColumn],
}

impl ExportSink {
    /// Maps the result columns and prepares the sink. Nothing is written to
    /// the data file until the first flush.
    pub fn create(target: &ExportTarget, metadata: &RowMetadata) -> Result<Arc<Self>> {
        let columns = ExportColumns::new(metadata, target.spec.kind)?;

        if let Some(format_file) = &target.format_file {
            write_format_file(format_file, target, &columns)?;
        }

        let sink = match target.spec.kind {
            ExportKind::Text => ExportSink::Text(TextExportSink::new(target, columns)?),
            ExportKind::Columnar => {
                ExportSink::Columnar(ColumnarExportSink::new(target, columns)?)
            }
        };
        Ok(Arc::new(sink))
    }

    pub fn write_rows(&self, rows: &[Row]) -> Result<()> {
        match self {
            ExportSink::Text(sink) => sink.write_rows(rows),
            ExportSink::Columnar(sink) => sink.write_rows(rows),
        }
    }

    /// Closes the current file. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        match self {
            ExportSink::Text(sink) => sink.close(),
            ExportSink::Columnar(sink) => sink.close(),
        }
    }

    /// Data files completed so far, after any move.
    pub fn completed_files(&self) -> Vec<PathBuf> {
        match self {
            ExportSink::Text(sink) => sink.completed_files(),
            ExportSink::Columnar(sink) => sink.completed_files(),
        }
    }
}

fn write_format_file(path: &Path, target: &ExportTarget, columns: &ExportColumns) -> Result<()> {
    ensure_parent_dir(path)?;
    let description = FormatDescription {
        path: target.path.display().to_string(),
        kind: target.spec.kind.as_str(),
        compression: target.spec.compression.as_str(),
        columns: columns.columns(),
    };
    let json = serde_json::to_string_pretty(&description)?;
    fs::write(path, json).map_err(|e| {
        TransferError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to write format file '{}': {}", path.display(), e),
        ))
    })
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Moves a completed file into `dir`, returning its new location.
pub(crate) fn move_completed(path: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name = path.file_name().ok_or_else(|| {
        TransferError::Config(format!("Export path '{}' has no file name", path.display()))
    })?;
    let destination = dir.join(file_name);
    if fs::rename(path, &destination).is_err() {
        // rename does not cross filesystems
        fs::copy(path, &destination)?;
        fs::remove_file(path)?;
    }
    log::debug!(
        "Moved export file '{}' to '{}'",
        path.display(),
        destination.display()
    );
    Ok(destination)
}

/// Buffers converted rows of one worker and flushes them into the shared sink.
pub struct ExportWriter {
    sink: Arc<ExportSink>,
    buffer: Vec<Row>,
    batch_size: usize,
    result: Arc<TaskResult>,
}

impl ExportWriter {
    pub fn new(sink: Arc<ExportSink>, batch_size: usize, result: Arc<TaskResult>) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            buffer: Vec::with_capacity(batch_size.min(10_000)),
            batch_size,
            result,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        self.sink.write_rows(&rows)?;
        self.result.add_processed(rows.len() as u64);
        Ok(())
    }
}

impl RowWriter for ExportWriter {
    fn write(&mut self, row: &Row) -> Result<()> {
        self.buffer.push(row.clone());
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests;
