// --- Text Export ---
//
// Delimited text through the csv crate. One file at a time per task; a file
// is rotated once it has grown past `rotate-size` bytes (uncompressed),
// checked after every flushed batch.

use super::{ensure_parent_dir, move_completed, ExportTarget};
use crate::data_transfer::mapper::ExportColumns;
use crate::data_transfer::models::Compression;
use crate::data_transfer::planner::path_with_stem_suffix;
use crate::error::{Result, TransferError};
use crate::value::Row;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

enum TextOutput {
    Plain(BufWriter<File>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
    Lz4(lz4_flex::frame::FrameEncoder<BufWriter<File>>),
}

impl TextOutput {
    fn open(file: File, compression: Compression) -> io::Result<Self> {
        let buffered = BufWriter::new(file);
        Ok(match compression {
            Compression::Zstd => TextOutput::Zstd(zstd::Encoder::new(buffered, 0)?),
            Compression::Lz4 => TextOutput::Lz4(lz4_flex::frame::FrameEncoder::new(buffered)),
            _ => TextOutput::Plain(buffered),
        })
    }

    /// Writes the compression trailer and flushes to disk.
    fn finish(self) -> io::Result<()> {
        let mut buffered = match self {
            TextOutput::Plain(buffered) => buffered,
            TextOutput::Zstd(encoder) => encoder.finish()?,
            TextOutput::Lz4(encoder) => encoder.finish().map_err(io::Error::from)?,
        };
        buffered.flush()?;
        buffered.get_ref().sync_all()
    }
}

impl Write for TextOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TextOutput::Plain(writer) => writer.write(buf),
            TextOutput::Zstd(writer) => writer.write(buf),
            TextOutput::Lz4(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TextOutput::Plain(writer) => writer.flush(),
            TextOutput::Zstd(writer) => writer.flush(),
            TextOutput::Lz4(writer) => writer.flush(),
        }
    }
}

/// Counts bytes before compression.
struct CountingWriter {
    inner: TextOutput,
    written: u64,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct OpenTextFile {
    path: PathBuf,
    writer: csv::Writer<CountingWriter>,
}

#[derive(Default)]
struct TextState {
    current: Option<OpenTextFile>,
    parts: usize,
    completed: Vec<PathBuf>,
    closed: bool,
}

pub struct TextExportSink {
    columns: ExportColumns,
    path: PathBuf,
    move_to: Option<PathBuf>,
    delimiter: u8,
    header: bool,
    compression: Compression,
    rotate_size: Option<u64>,
    state: Mutex<TextState>,
}

impl TextExportSink {
    pub fn new(target: &ExportTarget, columns: ExportColumns) -> Result<Self> {
        let delimiter = u8::try_from(target.spec.delimiter).map_err(|_| {
            TransferError::Config(format!(
                "Export delimiter '{}' is not a single-byte character",
                target.spec.delimiter
            ))
        })?;
        Ok(Self {
            columns,
            path: target.path.clone(),
            move_to: target.move_to.clone(),
            delimiter,
            header: target.spec.header,
            compression: target.spec.compression,
            rotate_size: target.spec.rotate_size,
            state: Mutex::new(TextState::default()),
        })
    }

    pub fn write_rows(&self, rows: &[Row]) -> Result<()> {
        let records = rows
            .iter()
            .map(|row| self.columns.text_record(row))
            .collect::<Vec<_>>();

        let mut state = self.state.lock();
        if state.closed {
            return Err(TransferError::Execution(format!(
                "Text export '{}' is already closed",
                self.path.display()
            )));
        }

        let mut open = match state.current.take() {
            Some(open) => open,
            None => {
                state.parts += 1;
                self.open_file(state.parts)?
            }
        };

        let written = records
            .iter()
            .try_for_each(|record| open.writer.write_record(record))
            .map_err(TransferError::from)
            .and_then(|_| open.writer.flush().map_err(TransferError::from));
        if let Err(e) = written {
            // the file stays owned so close() can still finish it
            state.current = Some(open);
            return Err(e);
        }

        let rotate = self
            .rotate_size
            .is_some_and(|limit| open.writer.get_ref().written >= limit);
        if rotate {
            let completed = self.finish_file(open)?;
            state.completed.push(completed);
        } else {
            state.current = Some(open);
        }
        Ok(())
    }

    fn file_path(&self, part: usize) -> PathBuf {
        let path = match self.rotate_size {
            Some(_) => path_with_stem_suffix(&self.path, &format!("{:05}", part)),
            None => self.path.clone(),
        };
        match self.compression.file_suffix() {
            Some(suffix) => {
                let mut raw = path.into_os_string();
                raw.push(".");
                raw.push(suffix);
                PathBuf::from(raw)
            }
            None => path,
        }
    }

    fn open_file(&self, part: usize) -> Result<OpenTextFile> {
        let path = self.file_path(part);
        ensure_parent_dir(&path)?;
        let file = File::create(&path).map_err(|e| {
            TransferError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create export file '{}': {}", path.display(), e),
            ))
        })?;
        let output = TextOutput::open(file, self.compression)?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(CountingWriter {
                inner: output,
                written: 0,
            });
        if self.header {
            writer.write_record(self.columns.header())?;
        }
        log::debug!("Opened text export file '{}'", path.display());
        Ok(OpenTextFile { path, writer })
    }

    fn finish_file(&self, open: OpenTextFile) -> Result<PathBuf> {
        let OpenTextFile { path, writer } = open;
        let counting = writer
            .into_inner()
            .map_err(|e| TransferError::Io(e.into_error()))?;
        let bytes = counting.written;
        counting.inner.finish()?;
        log::info!("Completed text export file '{}' ({} bytes)", path.display(), bytes);

        match &self.move_to {
            Some(dir) => move_completed(&path, dir),
            None => Ok(path),
        }
    }

    /// Finishes the open file, if any.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(open) = state.current.take() {
            let completed = self.finish_file(open)?;
            state.completed.push(completed);
        }
        Ok(())
    }

    pub fn completed_files(&self) -> Vec<PathBuf> {
        self.state.lock().completed.clone()
    }
}
