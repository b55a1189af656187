use super::*;
use crate::data_transfer::models::JobFile;
use crate::metrics::{InMemoryRegistry, MetricsSource};
use crate::testing::{id_name_rows, int_column, text_column, ScriptedDataSource};
use crate::value::Value;
use parking_lot::Mutex;
use std::fs;
use std::sync::atomic::Ordering;

const COPY_BY_RANGE: &str = r#"{ "jobs": [ {
    "id": "copy", "threads": 2,
    "variable": { "integer-range": { "low-value": 1, "high-value": 11, "block-size": 4 } },
    "select": { "datasource": "source",
                "sql": "SELECT id, name FROM t WHERE id >= :id.low AND id < :id.high" },
    "insert": { "datasource": "target", "batch-size": 2, "parallel": 3,
                "sql": "INSERT INTO copy (id, name) VALUES (:id, :name)" } } ] }"#;

fn source(rows: usize) -> Arc<ScriptedDataSource> {
    Arc::new(
        ScriptedDataSource::new(
            "source",
            vec![int_column("id", 1), text_column("name", 2)],
            id_name_rows(rows),
        )
        .filtered_by_bounds(),
    )
}

fn engine_over(sources: &[Arc<ScriptedDataSource>], metrics: Arc<dyn MetricsRegistry>) -> Engine {
    let mut registry = DataSourceRegistry::new();
    for source in sources {
        registry.register(source.clone());
    }
    Engine::with_options(
        registry,
        metrics,
        3,
        DEFAULT_PERMIT_WAIT,
        LayeredConfig::new(),
    )
}

fn run_single(engine: &Engine, json: &str) -> Arc<JobResult> {
    let jobs = JobFile::from_json(json).unwrap();
    let mut results = engine.run_jobs(&jobs, &[]).unwrap();
    assert_eq!(results.len(), 1);
    results.remove(0)
}

/// Registry that remembers every name it ever saw next to the live set.
#[derive(Default)]
struct RecordingRegistry {
    live: InMemoryRegistry,
    seen: Mutex<Vec<String>>,
}

impl MetricsRegistry for RecordingRegistry {
    fn register(&self, name: &str, source: Arc<dyn MetricsSource>) -> Result<()> {
        self.seen.lock().push(name.to_string());
        self.live.register(name, source)
    }

    fn unregister(&self, name: &str) {
        self.live.unregister(name);
    }
}

#[test]
fn test_range_job_copies_every_row_once() {
    let source = source(10);
    let target = Arc::new(ScriptedDataSource::sink("target"));
    let engine = engine_over(&[source.clone(), target.clone()], Arc::new(NoopRegistry));

    let result = run_single(&engine, COPY_BY_RANGE);

    assert!(result.is_success(), "{}", result.render_summary());
    assert_eq!(result.total_tasks(), 3);
    assert_eq!(result.retrieved_rows(), 10);
    assert_eq!(result.processed_rows(), 10);
    assert_eq!(target.log.committed_rows(), 10);
    // three sink workers per task, each with its own connection
    assert_eq!(target.log.closes.load(Ordering::SeqCst), 9);

    let mut bounds = source
        .opened
        .lock()
        .iter()
        .map(|(sql, params)| {
            assert_eq!(sql, "SELECT id, name FROM t WHERE id >= ? AND id < ?");
            (params[0].value.clone(), params[1].value.clone())
        })
        .collect::<Vec<_>>();
    bounds.sort_by_key(|(low, _)| match low {
        Value::Integer(v) => *v,
        _ => i64::MAX,
    });
    assert_eq!(
        bounds,
        vec![
            (Value::Integer(1), Value::Integer(5)),
            (Value::Integer(5), Value::Integer(9)),
            (Value::Integer(9), Value::Integer(11)),
        ]
    );

    let mut ids = target
        .log
        .parameter_sets()
        .into_iter()
        .map(|params| match params[0].value {
            Value::Integer(id) => id,
            _ => -1,
        })
        .collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_unopenable_cursor_fails_tasks_without_stopping_the_job() {
    let source = Arc::new(
        ScriptedDataSource::new("source", vec![int_column("id", 1)], Vec::new())
            .failing_open("relation does not exist"),
    );
    let target = Arc::new(ScriptedDataSource::sink("target"));
    let engine = engine_over(&[source, target.clone()], Arc::new(NoopRegistry));

    let result = run_single(&engine, COPY_BY_RANGE);

    assert!(!result.is_success());
    assert_eq!(result.failed_tasks(), 3);
    assert_eq!(result.finished_tasks(), 3);
    for task in result.tasks() {
        let error = task.error().unwrap_or_default();
        assert!(error.contains("relation does not exist"), "{}", error);
    }
    assert_eq!(target.log.closes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failing_export_fails_only_its_task() {
    let dir = tempfile::tempdir().unwrap();
    // the second task's export directory is blocked by a plain file
    fs::write(dir.path().join("1"), b"not a directory").unwrap();

    let json = format!(
        r#"{{ "jobs": [ {{
            "id": "dump", "threads": 2,
            "variable": {{ "integer-range": {{ "low-value": 1, "high-value": 7, "block-size": 3 }} }},
            "select": {{ "datasource": "source",
                        "sql": "SELECT id, name FROM t WHERE id >= :id.low AND id < :id.high" }},
            "export": {{ "type": "text", "batch-size": 2,
                        "path": "{}/${{task.index}}/rows.csv" }} }} ] }}"#,
        dir.path().display()
    );
    let engine = engine_over(&[source(6)], Arc::new(NoopRegistry));

    let result = run_single(&engine, &json);

    let tasks = result.tasks();
    assert_eq!(tasks.len(), 2);
    assert!(!tasks[0].is_failed(), "{:?}", tasks[0].error());
    assert!(tasks[1].is_failed());
    assert!(tasks.iter().all(|task| task.is_finished()));
    assert_eq!(result.failed_tasks(), 1);

    let exported = fs::read_to_string(dir.path().join("0").join("rows.csv")).unwrap();
    assert_eq!(exported, "id,name\n1,name-1\n2,name-2\n3,name-3\n");
}

#[test]
fn test_connect_failure_is_recorded_on_the_task() {
    let target = Arc::new(ScriptedDataSource::sink("target").failing_connect("too many clients"));
    let engine = engine_over(&[source(10), target], Arc::new(NoopRegistry));

    let result = run_single(&engine, COPY_BY_RANGE);

    assert_eq!(result.failed_tasks(), 3);
    assert_eq!(result.processed_rows(), 0);
    let error = result.tasks()[0].error().unwrap_or_default();
    assert!(error.contains("too many clients"), "{}", error);
}

#[test]
fn test_insert_and_export_receive_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let json = format!(
        r#"{{ "jobs": [ {{
            "id": "both",
            "select": {{ "datasource": "source", "sql": "SELECT id, name FROM t WHERE id >= 1 AND id < 100" }},
            "insert": {{ "datasource": "target", "batch-size": 4, "parallel": 2,
                        "sql": "INSERT INTO copy VALUES (:id, :name)" }},
            "export": {{ "type": "text", "batch-size": 3, "path": "{}/both.csv" }} }} ] }}"#,
        dir.path().display()
    );
    let source = Arc::new(ScriptedDataSource::new(
        "source",
        vec![int_column("id", 1), text_column("name", 2)],
        id_name_rows(10),
    ));
    let target = Arc::new(ScriptedDataSource::sink("target"));
    let engine = engine_over(&[source, target.clone()], Arc::new(NoopRegistry));

    let result = run_single(&engine, &json);

    assert!(result.is_success(), "{}", result.render_summary());
    assert_eq!(result.retrieved_rows(), 10);
    // each sink counts its own writes
    assert_eq!(result.processed_rows(), 20);
    assert_eq!(target.log.committed_rows(), 10);

    let exported = fs::read_to_string(dir.path().join("both.csv")).unwrap();
    let mut lines = exported.lines().collect::<Vec<_>>();
    assert_eq!(lines.remove(0), "id,name");
    lines.sort_unstable();
    let mut expected = (1..=10).map(|i| format!("{},name-{}", i, i)).collect::<Vec<_>>();
    expected.sort_unstable();
    assert_eq!(lines, expected);
}

#[test]
fn test_metrics_live_only_while_running() {
    let registry = Arc::new(RecordingRegistry::default());
    let target = Arc::new(ScriptedDataSource::sink("target"));
    let engine = engine_over(&[source(10), target], registry.clone());

    let result = run_single(&engine, COPY_BY_RANGE);

    assert!(result.is_success());
    assert!(registry.live.names().is_empty());
    let seen = registry.seen.lock().clone();
    for expected in [
        object_name("job", "copy"),
        object_name("pool", "copy"),
        object_name("task", "copy/copy[1,5)"),
        object_name("task", "copy/copy[9,11)"),
        object_name("pool", "copy-t2"),
    ] {
        assert!(seen.contains(&expected), "missing {} in {:?}", expected, seen);
    }
}

#[test]
fn test_configuration_errors_stop_before_any_row_moves() {
    let json = r#"{ "jobs": [
        { "id": "first", "select": { "datasource": "source", "sql": "SELECT id, name FROM t" } },
        { "id": "second", "select": { "datasource": "source", "sql": "SELECT * FROM ${missing}" } } ] }"#;
    let source = source(5);
    let engine = engine_over(&[source.clone()], Arc::new(NoopRegistry));

    let jobs = JobFile::from_json(json).unwrap();
    let err = engine.run_jobs(&jobs, &[]).unwrap_err();

    assert!(matches!(err, TransferError::Template(_)), "{:?}", err);
    assert!(source.opened.lock().is_empty());
}

#[test]
fn test_unknown_datasource_fails_planning() {
    let engine = engine_over(&[source(5)], Arc::new(NoopRegistry));
    let jobs = JobFile::from_json(
        r#"{ "jobs": [ { "id": "lost",
             "select": { "datasource": "source", "sql": "SELECT 1" },
             "insert": { "datasource": "nowhere", "sql": "INSERT INTO t VALUES (:id)" } } ] }"#,
    )
    .unwrap();

    let err = engine.run_jobs(&jobs, &[]).unwrap_err();
    assert!(err.to_string().contains("nowhere"), "{}", err);
}

#[test]
fn test_missing_select_parameter_fails_the_task() {
    let source = source(5);
    let engine = engine_over(&[source.clone()], Arc::new(NoopRegistry));

    let result = run_single(
        &engine,
        r#"{ "jobs": [ { "id": "p",
             "select": { "datasource": "source", "sql": "SELECT id FROM t WHERE region = :region" } } ] }"#,
    );

    assert_eq!(result.failed_tasks(), 1);
    assert!(result.tasks()[0]
        .error()
        .unwrap_or_default()
        .contains(":region"));
    assert!(source.opened.lock().is_empty());
}

#[test]
fn test_jobs_run_in_file_order() {
    let json = r#"{ "jobs": [
        { "id": "a", "select": { "datasource": "source", "sql": "SELECT 'a'" } },
        { "id": "b", "select": { "datasource": "source", "sql": "SELECT 'b'" } },
        { "id": "c", "select": { "datasource": "source", "sql": "SELECT 'c'" } } ] }"#;
    let source = source(0);
    let engine = engine_over(&[source.clone()], Arc::new(NoopRegistry));

    let jobs = JobFile::from_json(json).unwrap();
    let results = engine.run_jobs(&jobs, &["c".to_string(), "a".to_string()]).unwrap();

    let ids = results.iter().map(|r| r.job_id().to_string()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["a", "c"]);
    let opened = source
        .opened
        .lock()
        .iter()
        .map(|(sql, _)| sql.clone())
        .collect::<Vec<_>>();
    assert_eq!(opened, vec!["SELECT 'a'", "SELECT 'c'"]);
}
