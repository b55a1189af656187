// =====================================================
// TASK AND JOB RESULTS
// =====================================================

use crate::metrics::{MetricValue, MetricsSource};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn rate(rows: u64, elapsed_millis: i64) -> f64 {
    if elapsed_millis <= 0 {
        return 0.0;
    }
    rows as f64 / (elapsed_millis as f64 / 1000.0)
}

/// Live counters of one task. Frozen once `end` is called.
#[derive(Debug)]
pub struct TaskResult {
    name: String,
    retrieved_rows: AtomicU64,
    processed_rows: AtomicU64,
    /// Epoch millis; 0 until set.
    started_at: AtomicI64,
    ended_at: AtomicI64,
    error: Mutex<Option<String>>,
}

impl TaskResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retrieved_rows: AtomicU64::new(0),
            processed_rows: AtomicU64::new(0),
            started_at: AtomicI64::new(0),
            ended_at: AtomicI64::new(0),
            error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) {
        let _ = self
            .started_at
            .compare_exchange(0, now_millis().max(1), Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Stamps the end time; every later update is ignored.
    pub fn end(&self) {
        self.start();
        let _ = self
            .ended_at
            .compare_exchange(0, now_millis().max(1), Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started_at.load(Ordering::SeqCst) != 0
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.load(Ordering::SeqCst) != 0
    }

    pub fn is_active(&self) -> bool {
        self.is_started() && !self.is_finished()
    }

    pub fn add_retrieved(&self, rows: u64) {
        if !self.is_finished() {
            self.retrieved_rows.fetch_add(rows, Ordering::SeqCst);
        }
    }

    pub fn add_processed(&self, rows: u64) {
        if !self.is_finished() {
            self.processed_rows.fetch_add(rows, Ordering::SeqCst);
        }
    }

    /// Records the terminal error. The first one wins.
    pub fn fail(&self, message: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(message.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn retrieved_rows(&self) -> u64 {
        self.retrieved_rows.load(Ordering::SeqCst)
    }

    pub fn processed_rows(&self) -> u64 {
        self.processed_rows.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> i64 {
        self.started_at.load(Ordering::SeqCst)
    }

    pub fn ended_at(&self) -> i64 {
        self.ended_at.load(Ordering::SeqCst)
    }

    /// Wall-clock time since start; runs to "now" while the task is in flight.
    pub fn elapsed_millis(&self) -> i64 {
        let started = self.started_at();
        if started == 0 {
            return 0;
        }
        let ended = match self.ended_at() {
            0 => now_millis(),
            ended => ended,
        };
        (ended - started).max(0)
    }

    /// Rows read per second.
    pub fn retrieval_rate(&self) -> f64 {
        rate(self.retrieved_rows(), self.elapsed_millis())
    }

    /// Rows written per second.
    pub fn processing_rate(&self) -> f64 {
        rate(self.processed_rows(), self.elapsed_millis())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.clone(),
            retrieved_rows: self.retrieved_rows(),
            processed_rows: self.processed_rows(),
            started_at: self.started_at(),
            ended_at: self.ended_at(),
            elapsed_millis: self.elapsed_millis(),
            retrieval_rate: self.retrieval_rate(),
            processing_rate: self.processing_rate(),
            error: self.error(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub name: String,
    pub retrieved_rows: u64,
    pub processed_rows: u64,
    pub started_at: i64,
    pub ended_at: i64,
    pub elapsed_millis: i64,
    pub retrieval_rate: f64,
    pub processing_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricsSource for TaskResult {
    fn snapshot(&self) -> Vec<(String, MetricValue)> {
        vec![
            ("retrievedRows".to_string(), self.retrieved_rows().into()),
            ("processedRows".to_string(), self.processed_rows().into()),
            ("startedAt".to_string(), MetricValue::Integer(self.started_at())),
            ("endedAt".to_string(), MetricValue::Integer(self.ended_at())),
            ("retrievalRate".to_string(), self.retrieval_rate().into()),
            ("processingRate".to_string(), self.processing_rate().into()),
            (
                "error".to_string(),
                self.error().unwrap_or_default().into(),
            ),
        ]
    }
}

// --- Job Result ---

/// Tasks of one job. Every aggregate is recomputed from the current task
/// state on each call.
#[derive(Debug)]
pub struct JobResult {
    job_id: String,
    tasks: RwLock<Vec<Arc<TaskResult>>>,
}

impl JobResult {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn create_task(&self, name: impl Into<String>) -> Arc<TaskResult> {
        let task = Arc::new(TaskResult::new(name));
        self.tasks.write().push(Arc::clone(&task));
        task
    }

    pub fn tasks(&self) -> Vec<Arc<TaskResult>> {
        self.tasks.read().clone()
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn active_tasks(&self) -> usize {
        self.count(|task| task.is_active())
    }

    pub fn finished_tasks(&self) -> usize {
        self.count(|task| task.is_finished())
    }

    pub fn failed_tasks(&self) -> usize {
        self.count(|task| task.is_failed())
    }

    pub fn pending_tasks(&self) -> usize {
        self.count(|task| !task.is_started())
    }

    fn count(&self, predicate: impl Fn(&TaskResult) -> bool) -> usize {
        self.tasks
            .read()
            .iter()
            .filter(|task| predicate(task.as_ref()))
            .count()
    }

    pub fn retrieved_rows(&self) -> u64 {
        self.tasks.read().iter().map(|task| task.retrieved_rows()).sum()
    }

    pub fn processed_rows(&self) -> u64 {
        self.tasks.read().iter().map(|task| task.processed_rows()).sum()
    }

    pub fn retrieval_rate(&self) -> f64 {
        self.tasks.read().iter().map(|task| task.retrieval_rate()).sum()
    }

    pub fn processing_rate(&self) -> f64 {
        self.tasks.read().iter().map(|task| task.processing_rate()).sum()
    }

    /// Every task finished without an error.
    pub fn is_success(&self) -> bool {
        let tasks = self.tasks.read();
        tasks
            .iter()
            .all(|task| task.is_finished() && !task.is_failed())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            total_tasks: self.total_tasks(),
            active_tasks: self.active_tasks(),
            finished_tasks: self.finished_tasks(),
            failed_tasks: self.failed_tasks(),
            retrieved_rows: self.retrieved_rows(),
            processed_rows: self.processed_rows(),
            retrieval_rate: self.retrieval_rate(),
            processing_rate: self.processing_rate(),
            tasks: self.tasks().iter().map(|task| task.snapshot()).collect(),
        }
    }

    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Job '{}': {} task(s), {} finished, {} failed, {} active",
            self.job_id,
            self.total_tasks(),
            self.finished_tasks(),
            self.failed_tasks(),
            self.active_tasks()
        );
        let _ = writeln!(
            out,
            "  rows retrieved: {}, processed: {}",
            self.retrieved_rows(),
            self.processed_rows()
        );
        for task in self.tasks() {
            let _ = writeln!(
                out,
                "  - {}: {} ms, retrieved {} ({:.1} rows/s), processed {} ({:.1} rows/s)",
                task.name(),
                task.elapsed_millis(),
                task.retrieved_rows(),
                task.retrieval_rate(),
                task.processed_rows(),
                task.processing_rate()
            );
            if let Some(error) = task.error() {
                let _ = writeln!(out, "    error: {}", error);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub finished_tasks: usize,
    pub failed_tasks: usize,
    pub retrieved_rows: u64,
    pub processed_rows: u64,
    pub retrieval_rate: f64,
    pub processing_rate: f64,
    pub tasks: Vec<TaskSnapshot>,
}

impl MetricsSource for JobResult {
    fn snapshot(&self) -> Vec<(String, MetricValue)> {
        vec![
            ("totalTasks".to_string(), self.total_tasks().into()),
            ("activeTasks".to_string(), self.active_tasks().into()),
            ("finishedTasks".to_string(), self.finished_tasks().into()),
            ("failedTasks".to_string(), self.failed_tasks().into()),
            ("retrievedRows".to_string(), self.retrieved_rows().into()),
            ("processedRows".to_string(), self.processed_rows().into()),
            ("retrievalRate".to_string(), self.retrieval_rate().into()),
            ("processingRate".to_string(), self.processing_rate().into()),
        ]
    }
}
