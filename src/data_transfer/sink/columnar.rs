// --- Columnar Export ---

use super::{ensure_parent_dir, move_completed, ExportTarget};
use crate::data_transfer::mapper::ExportColumns;
use crate::data_transfer::models::Compression;
use crate::error::{Result, TransferError};
use crate::value::Row;
use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io;
use std::path::PathBuf;

enum ColumnarState {
    Pending,
    Open(ArrowWriter<File>),
    Closed(Option<PathBuf>),
}

/// One Parquet file per task. Each flush becomes one record batch.
pub struct ColumnarExportSink {
    columns: ExportColumns,
    schema: SchemaRef,
    properties: WriterProperties,
    path: PathBuf,
    move_to: Option<PathBuf>,
    state: Mutex<ColumnarState>,
}

fn parquet_compression(compression: Compression) -> ParquetCompression {
    match compression {
        Compression::None => ParquetCompression::UNCOMPRESSED,
        Compression::Snappy => ParquetCompression::SNAPPY,
        Compression::Gzip => ParquetCompression::GZIP(GzipLevel::default()),
        Compression::Zstd => ParquetCompression::ZSTD(ZstdLevel::default()),
        Compression::Lz4 => ParquetCompression::LZ4_RAW,
    }
}

impl ColumnarExportSink {
    pub fn new(target: &ExportTarget, columns: ExportColumns) -> Result<Self> {
        let mut builder = WriterProperties::builder()
            .set_compression(parquet_compression(target.spec.compression));
        if let Some(page_size) = target.spec.page_size {
            builder = builder.set_data_page_size_limit(page_size);
        }
        let schema = columns.arrow_schema();
        Ok(Self {
            columns,
            schema,
            properties: builder.build(),
            path: target.path.clone(),
            move_to: target.move_to.clone(),
            state: Mutex::new(ColumnarState::Pending),
        })
    }

    pub fn write_rows(&self, rows: &[Row]) -> Result<()> {
        let batch = self.columns.record_batch(&self.schema, rows)?;

        let mut state = self.state.lock();
        if let ColumnarState::Pending = *state {
            *state = ColumnarState::Open(self.open_writer()?);
        }
        match &mut *state {
            ColumnarState::Open(writer) => {
                writer.write(&batch)?;
                Ok(())
            }
            _ => Err(TransferError::Execution(format!(
                "Columnar export '{}' is already closed",
                self.path.display()
            ))),
        }
    }

    fn open_writer(&self) -> Result<ArrowWriter<File>> {
        ensure_parent_dir(&self.path)?;
        let file = File::create(&self.path).map_err(|e| {
            TransferError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create export file '{}': {}", self.path.display(), e),
            ))
        })?;
        log::debug!("Opened columnar export file '{}'", self.path.display());
        Ok(ArrowWriter::try_new(
            file,
            self.schema.clone(),
            Some(self.properties.clone()),
        )?)
    }

    /// Writes the footer. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut *state, ColumnarState::Closed(None));
        let ColumnarState::Open(writer) = previous else {
            if let ColumnarState::Closed(completed) = previous {
                *state = ColumnarState::Closed(completed);
            }
            return Ok(());
        };

        let metadata = writer.close()?;
        log::info!(
            "Completed columnar export file '{}' ({} rows)",
            self.path.display(),
            metadata.num_rows
        );
        let completed = match &self.move_to {
            Some(dir) => move_completed(&self.path, dir)?,
            None => self.path.clone(),
        };
        *state = ColumnarState::Closed(Some(completed));
        Ok(())
    }

    pub fn completed_files(&self) -> Vec<PathBuf> {
        match &*self.state.lock() {
            ColumnarState::Closed(Some(path)) => vec![path.clone()],
            _ => Vec::new(),
        }
    }
}
