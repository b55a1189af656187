use super::*;
use crate::data_transfer::channel::{DataTransferChannel, DEFAULT_PERMIT_WAIT};
use crate::datasource::NamedStatement;
use crate::db_types::PlaceholderStyle;
use crate::metadata::{ColumnMetadata, SqlType};
use crate::template::{LayerKind, LayeredConfig};
use crate::testing::{id_name_rows, int_column, text_column, ScriptedCursor, ScriptedDataSource};
use crate::value::{LargeObject, Parameter, Value};
use arrow::array::{AsArray, Array};
use arrow::datatypes::Int64Type;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::thread;

fn id_name_metadata() -> Arc<RowMetadata> {
    Arc::new(RowMetadata::new(vec![int_column("id", 1), text_column("name", 2)]).unwrap())
}

fn projection(sql: &str, config: &LayeredConfig) -> Result<Arc<InsertProjection>> {
    let statement = NamedStatement::compile(sql, PlaceholderStyle::QuestionMark)?;
    Ok(Arc::new(InsertProjection::new(
        statement,
        id_name_metadata(),
        config,
    )?))
}

fn insert_writer(
    sink: &ScriptedDataSource,
    batch_size: usize,
    result: &Arc<TaskResult>,
) -> InsertWriter {
    let projection = projection(
        "INSERT INTO target (id, name) VALUES (:id, :name)",
        &LayeredConfig::new(),
    )
    .unwrap();
    InsertWriter::open(sink, projection, batch_size, Arc::clone(result)).unwrap()
}

fn write_all(writer: &mut dyn RowWriter, rows: &[Row]) {
    for row in rows {
        writer.write(row).unwrap();
    }
    writer.finish().unwrap();
}

fn export_target(dir: &Path, file: &str, spec: serde_json::Value) -> ExportTarget {
    let spec: ExportSpec = serde_json::from_value(spec).unwrap();
    ExportTarget {
        path: dir.join(file),
        move_to: spec.normalized_move_to().map(|name| dir.join(name)),
        format_file: spec.normalized_format_file().map(|name| dir.join(name)),
        spec,
    }
}

// --- Insert ---

#[test]
fn test_partial_final_batch_is_flushed() {
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = insert_writer(&sink, 10, &result);

    write_all(&mut writer, &id_name_rows(25));

    assert_eq!(result.processed_rows(), 25);
    assert_eq!(sink.log.committed_rows(), 25);
    assert_eq!(sink.log.commits.load(Ordering::SeqCst), 3);
    assert_eq!(sink.log.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_batch_is_rolled_back_and_writer_continues() {
    let sink = ScriptedDataSource::sink("target");
    sink.log.failing_batches.lock().insert(2);
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = insert_writer(&sink, 10, &result);

    write_all(&mut writer, &id_name_rows(30));

    assert_eq!(result.processed_rows(), 20);
    assert_eq!(sink.log.committed_rows(), 20);
    assert_eq!(sink.log.rollbacks.load(Ordering::SeqCst), 1);
    assert!(!result.is_failed());

    let ids = sink
        .log
        .parameter_sets()
        .iter()
        .map(|params| params[0].value.clone())
        .collect::<Vec<_>>();
    assert!(ids.contains(&Value::Integer(25)));
    assert!(!ids.contains(&Value::Integer(15)));
}

#[test]
fn test_unbatched_rows_fail_individually() {
    let sink = ScriptedDataSource::sink("target");
    sink.log
        .failing_values
        .lock()
        .push(Value::Text("name-3".to_string()));
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = insert_writer(&sink, 0, &result);

    write_all(&mut writer, &id_name_rows(5));

    assert_eq!(result.processed_rows(), 4);
    assert_eq!(sink.log.batches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_parameters_bind_from_columns_then_configuration() {
    let config = LayeredConfig::new().with_layer(LayerKind::Task, [("batch.tag", "nightly")]);
    let projection = projection(
        "INSERT INTO target (name, tag, id) VALUES (:NAME, :batch.tag, :id)",
        &config,
    )
    .unwrap();
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = InsertWriter::open(&sink, projection, 5, Arc::clone(&result)).unwrap();

    write_all(&mut writer, &id_name_rows(1));

    let params = sink.log.parameter_sets().remove(0);
    assert_eq!(
        params,
        vec![
            Parameter::new(SqlType::VarChar, Value::Text("name-1".to_string())),
            Parameter::new(SqlType::VarChar, Value::Text("nightly".to_string())),
            Parameter::new(SqlType::Integer, Value::Integer(1)),
        ]
    );
}

#[test]
fn test_unknown_parameter_is_a_configuration_error() {
    let err = projection(
        "INSERT INTO target (id, missing) VALUES (:id, :missing)",
        &LayeredConfig::new(),
    )
    .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_unused_columns_are_skipped() {
    let projection = projection("INSERT INTO ids (id) VALUES (:id)", &LayeredConfig::new()).unwrap();
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = InsertWriter::open(&sink, projection, 2, Arc::clone(&result)).unwrap();
    write_all(&mut writer, &id_name_rows(3));
    assert!(sink.log.parameter_sets().iter().all(|params| params.len() == 1));
    assert_eq!(result.processed_rows(), 3);
}

#[test]
fn test_large_objects_are_copied_through_the_destination() {
    let metadata = Arc::new(
        RowMetadata::new(vec![
            int_column("id", 1),
            ColumnMetadata::new("body", 2, SqlType::Clob),
        ])
        .unwrap(),
    );
    let statement = NamedStatement::compile(
        "INSERT INTO docs (id, body) VALUES (:id, :body)",
        PlaceholderStyle::QuestionMark,
    )
    .unwrap();
    let projection =
        Arc::new(InsertProjection::new(statement, metadata, &LayeredConfig::new()).unwrap());
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = InsertWriter::open(&sink, projection, 10, Arc::clone(&result)).unwrap();

    let rows = vec![
        Row::new(vec![Value::Integer(1), Value::Lob(LargeObject::character("first"))]),
        Row::new(vec![Value::Integer(2), Value::Null]),
    ];
    write_all(&mut writer, &rows);

    assert_eq!(sink.log.large_objects.load(Ordering::SeqCst), 1);
    let params = sink.log.parameter_sets();
    assert_eq!(params[0][1].value, Value::Lob(LargeObject::character("first")));
    assert_eq!(params[1][1], Parameter::new(SqlType::Clob, Value::Null));
}

#[test]
fn test_connection_is_released_when_dropped_unfinished() {
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    {
        let mut writer = insert_writer(&sink, 10, &result);
        writer.write(&id_name_rows(1)[0]).unwrap();
    }
    assert_eq!(sink.log.closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.log.committed_rows(), 0);
}

#[test]
fn test_workers_share_one_channel() {
    let sink = Arc::new(ScriptedDataSource::sink("target"));
    let result = Arc::new(TaskResult::new("t"));
    let cursor = ScriptedCursor::new(
        vec![int_column("id", 1), text_column("name", 2)],
        id_name_rows(1_003),
    );
    let channel = Arc::new(
        DataTransferChannel::new(Box::new(cursor), 50, DEFAULT_PERMIT_WAIT, Arc::clone(&result))
            .unwrap(),
    );

    let workers = (0..4)
        .map(|_| {
            let channel = Arc::clone(&channel);
            let sink = Arc::clone(&sink);
            let result = Arc::clone(&result);
            thread::spawn(move || {
                let writer = insert_writer(&sink, 100, &result);
                let mut writers: Vec<Box<dyn RowWriter>> = vec![Box::new(writer)];
                run_sink_worker(&channel, &mut writers)
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert_eq!(result.retrieved_rows(), 1_003);
    assert_eq!(result.processed_rows(), 1_003);
    assert_eq!(sink.log.committed_rows(), 1_003);
    assert_eq!(sink.log.closes.load(Ordering::SeqCst), 4);
}

struct FailingWriter;

impl RowWriter for FailingWriter {
    fn write(&mut self, _row: &Row) -> Result<()> {
        Err(TransferError::Execution("disk full".to_string()))
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_worker_error_finishes_writers_and_closes_channel() {
    let sink = ScriptedDataSource::sink("target");
    let result = Arc::new(TaskResult::new("t"));
    let cursor = ScriptedCursor::new(
        vec![int_column("id", 1), text_column("name", 2)],
        id_name_rows(10),
    );
    let channel =
        DataTransferChannel::new(Box::new(cursor), 4, DEFAULT_PERMIT_WAIT, Arc::clone(&result))
            .unwrap();
    let mut writers: Vec<Box<dyn RowWriter>> = vec![
        Box::new(insert_writer(&sink, 100, &result)),
        Box::new(FailingWriter),
    ];

    let err = run_sink_worker(&channel, &mut writers).unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert!(channel.is_exhausted());
    assert_eq!(sink.log.closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.log.committed_rows(), 1);
}

// --- Text Export ---

#[test]
fn test_text_export_writes_header_once() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(
        dir.path(),
        "out.csv",
        json!({ "path": "out.csv", "type": "text", "batch-size": 4, "delimiter": ";" }),
    );
    let sink = ExportSink::create(&target, &id_name_metadata()).unwrap();
    let result = Arc::new(TaskResult::new("t"));
    let mut first = ExportWriter::new(Arc::clone(&sink), 4, Arc::clone(&result));
    let mut second = ExportWriter::new(Arc::clone(&sink), 4, Arc::clone(&result));

    let rows = id_name_rows(10);
    write_all(&mut first, &rows[..6]);
    write_all(&mut second, &rows[6..]);
    sink.close().unwrap();
    sink.close().unwrap();

    let content = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
    let lines = content.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "id;name");
    assert_eq!(lines.len(), 11);
    assert_eq!(lines.iter().filter(|line| **line == "id;name").count(), 1);
    assert!(lines.contains(&"7;name-7"));
    assert_eq!(result.processed_rows(), 10);
    assert_eq!(sink.completed_files(), vec![dir.path().join("out.csv")]);
}

#[test]
fn test_text_export_rotates_and_moves_parts() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(
        dir.path(),
        "parts.csv",
        json!({ "path": "parts.csv", "type": "text", "rotate-size": 30, "move-to": "done" }),
    );
    let sink = ExportSink::create(&target, &id_name_metadata()).unwrap();
    let result = Arc::new(TaskResult::new("t"));
    let mut writer = ExportWriter::new(Arc::clone(&sink), 3, Arc::clone(&result));

    write_all(&mut writer, &id_name_rows(9));
    sink.close().unwrap();

    let done = dir.path().join("done");
    let completed = sink.completed_files();
    assert_eq!(completed.len(), 3);
    assert_eq!(completed[0], done.join("parts-00001.csv"));
    assert_eq!(completed[2], done.join("parts-00003.csv"));
    assert!(!dir.path().join("parts-00001.csv").exists());

    let mut data_rows = 0;
    for part in &completed {
        let content = std::fs::read_to_string(part).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("id,name"));
        data_rows += lines.count();
    }
    assert_eq!(data_rows, 9);
}

#[test]
fn test_text_export_compression() {
    let dir = tempfile::tempdir().unwrap();
    for (compression, file) in [("zstd", "rows.csv.zst"), ("lz4", "rows.csv.lz4")] {
        let target = export_target(
            dir.path(),
            "rows.csv",
            json!({ "path": "rows.csv", "type": "text", "compression": compression }),
        );
        let sink = ExportSink::create(&target, &id_name_metadata()).unwrap();
        let result = Arc::new(TaskResult::new("t"));
        let mut writer = ExportWriter::new(Arc::clone(&sink), 100, result);
        write_all(&mut writer, &id_name_rows(3));
        sink.close().unwrap();

        let raw = std::fs::File::open(dir.path().join(file)).unwrap();
        let mut text = String::new();
        match compression {
            "zstd" => {
                zstd::Decoder::new(raw).unwrap().read_to_string(&mut text).unwrap();
            }
            _ => {
                lz4_flex::frame::FrameDecoder::new(raw)
                    .read_to_string(&mut text)
                    .unwrap();
            }
        }
        assert_eq!(text, "id,name\n1,name-1\n2,name-2\n3,name-3\n");
    }
}

#[test]
fn test_text_export_refuses_blob_columns() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(dir.path(), "b.csv", json!({ "path": "b.csv", "type": "text" }));
    let metadata = RowMetadata::new(vec![ColumnMetadata::new("data", 1, SqlType::Blob)]).unwrap();
    let err = ExportSink::create(&target, &metadata).err().unwrap();
    assert!(matches!(err, TransferError::UnsupportedType { sink: "text", .. }));
}

#[test]
fn test_nothing_written_without_rows() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(dir.path(), "none.csv", json!({ "path": "none.csv", "type": "text" }));
    let sink = ExportSink::create(&target, &id_name_metadata()).unwrap();
    sink.close().unwrap();
    assert!(!dir.path().join("none.csv").exists());
    assert!(sink.write_rows(&id_name_rows(1)).is_err());
}

// --- Columnar Export ---

#[test]
fn test_columnar_export_round_trips_row_count() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(
        dir.path(),
        "rows.parquet",
        json!({
            "path": "rows.parquet",
            "type": "columnar",
            "compression": "snappy",
            "page-size": 1024,
            "format-file": "rows.format.json",
            "move-to": "archive"
        }),
    );
    let sink = ExportSink::create(&target, &id_name_metadata()).unwrap();
    let result = Arc::new(TaskResult::new("t"));

    let rows = id_name_rows(250);
    for chunk in rows.chunks(100) {
        let mut writer = ExportWriter::new(Arc::clone(&sink), 30, Arc::clone(&result));
        write_all(&mut writer, chunk);
    }
    sink.close().unwrap();

    let moved = dir.path().join("archive").join("rows.parquet");
    assert_eq!(sink.completed_files(), vec![moved.clone()]);
    let reader = ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&moved).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let mut total = 0;
    let mut id_sum = 0;
    for batch in reader {
        let batch = batch.unwrap();
        total += batch.num_rows();
        let ids = batch.column(0).as_primitive::<Int64Type>();
        id_sum += ids.iter().flatten().sum::<i64>();
        assert!(!batch.column(1).is_empty());
    }
    assert_eq!(total, 250);
    assert_eq!(id_sum, (1..=250).sum::<i64>());
    assert_eq!(result.processed_rows(), 250);

    let format: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("rows.format.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(format["type"], "columnar");
    assert_eq!(format["columns"][0]["name"], "id");
    assert_eq!(format["columns"][0]["exportType"], "integer");
    assert_eq!(format["columns"][1]["category"], "text");
}

#[test]
fn test_columnar_export_accepts_blob_columns() {
    let dir = tempfile::tempdir().unwrap();
    let target = export_target(
        dir.path(),
        "blob.parquet",
        json!({ "path": "blob.parquet", "type": "columnar" }),
    );
    let metadata = RowMetadata::new(vec![ColumnMetadata::new("data", 1, SqlType::Blob)]).unwrap();
    let sink = ExportSink::create(&target, &metadata).unwrap();
    sink.write_rows(&[Row::new(vec![Value::Lob(LargeObject::binary(vec![7, 8]))])])
        .unwrap();
    sink.close().unwrap();
    assert!(dir.path().join("blob.parquet").exists());
}
