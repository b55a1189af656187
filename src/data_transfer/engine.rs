// =====================================================
// TRANSFER ENGINE
// =====================================================
//
// Jobs run one after another. A job expands into tasks that run on the job's
// pool; each task streams its select through one channel into a pool of sink
// workers.

use crate::data_transfer::channel::{DataTransferChannel, DEFAULT_FETCH_SIZE, DEFAULT_PERMIT_WAIT};
use crate::data_transfer::connection_resolver::DataSourceRegistry;
use crate::data_transfer::models::{JobDescriptor, JobFile};
use crate::data_transfer::planner::{build_task_plans, StatementStyles, TaskPlan};
use crate::data_transfer::result::{JobResult, TaskResult};
use crate::data_transfer::sink::{
    run_sink_worker, ExportSink, ExportTarget, ExportWriter, InsertProjection, InsertWriter,
    RowWriter,
};
use crate::datasource::{DataSource, NamedStatement};
use crate::error::{Result, TransferError};
use crate::execution::ExecutionController;
use crate::metrics::{object_name, MetricsRegistry, NoopRegistry, Registration};
use crate::settings::Settings;
use crate::template::{LayerKind, LayeredConfig};
use crate::value::Parameter;
use std::sync::Arc;
use std::time::Duration;

/// Capabilities shared by every job and task of one engine.
struct EngineContext {
    datasources: DataSourceRegistry,
    metrics: Arc<dyn MetricsRegistry>,
    fetch_size: usize,
    permit_wait: Duration,
}

// --- Task Runner ---

/// Insert side of a task, shared by its sink workers.
#[derive(Clone)]
struct InsertPlan {
    target: Arc<dyn DataSource>,
    projection: Arc<InsertProjection>,
    batch_size: usize,
}

#[derive(Clone)]
struct ExportPlan {
    sink: Arc<ExportSink>,
    batch_size: usize,
}

/// Runs one task: cursor, channel, sink workers, results.
pub struct TaskRunner {
    context: Arc<EngineContext>,
    job: Arc<JobDescriptor>,
}

impl TaskRunner {
    /// Runs the task to completion. Failures are recorded on `result`, never
    /// returned, so sibling tasks are unaffected.
    pub fn run(&self, plan: &TaskPlan, result: Arc<TaskResult>) {
        let _metrics = Registration::try_new(
            &self.context.metrics,
            object_name("task", &format!("{}/{}", plan.job_id, plan.name)),
            result.clone(),
        );

        result.start();
        log::info!("Task '{}' started", plan.name);
        if let Err(e) = self.execute(plan, &result) {
            log::error!("Task '{}' failed: {}", plan.name, e);
            result.fail(e.to_string());
        }
        result.end();

        log::info!(
            "Task '{}' finished in {} ms: retrieved {} row(s), processed {} row(s){}",
            plan.name,
            result.elapsed_millis(),
            result.retrieved_rows(),
            result.processed_rows(),
            if result.is_failed() { " with errors" } else { "" }
        );
    }

    fn execute(&self, plan: &TaskPlan, result: &Arc<TaskResult>) -> Result<()> {
        let source = self.context.datasources.resolve(&self.job.select.datasource)?;
        let statement = NamedStatement::compile(&plan.select_sql, source.placeholder_style())?;
        let parameters = bind_configuration(&statement, &plan.config)?;
        let fetch_size = self.job.select.fetch_size.unwrap_or(self.context.fetch_size);

        let cursor = source.open_cursor(&statement.sql, parameters, fetch_size)?;
        let channel = Arc::new(DataTransferChannel::new(
            cursor,
            fetch_size,
            self.context.permit_wait,
            Arc::clone(result),
        )?);

        let outcome = self.run_sinks(plan, &channel, result);
        channel.close();
        outcome
    }

    fn run_sinks(
        &self,
        plan: &TaskPlan,
        channel: &Arc<DataTransferChannel>,
        result: &Arc<TaskResult>,
    ) -> Result<()> {
        let insert = self.insert_plan(plan, channel)?;
        let export = self.export_plan(plan, channel)?;

        let workers = self.job.sink_parallelism();
        let pool_name = format!("{}-t{}", plan.job_id, plan.index);
        let pool = Arc::new(ExecutionController::new(&pool_name, workers)?);
        let _pool_metrics = Registration::try_new(
            &self.context.metrics,
            object_name("pool", &pool_name),
            pool.clone(),
        );

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let channel = Arc::clone(channel);
            let insert = insert.clone();
            let export = export.clone();
            let result = Arc::clone(result);
            handles.push(pool.submit(move || {
                let outcome = open_writers(insert.as_ref(), export.as_ref(), &result)
                    .and_then(|mut writers| run_sink_worker(&channel, &mut writers));
                if outcome.is_err() {
                    channel.close();
                }
                outcome
            })?);
        }
        pool.shutdown();

        for handle in handles {
            if let Err(e) = handle.join().and_then(|outcome| outcome) {
                log::warn!("Sink worker of task '{}' failed: {}", plan.name, e);
                result.fail(e.to_string());
            }
        }
        pool.await_termination()?;

        // the file sink is closed once, after every worker finished
        if let Some(export) = export {
            export.sink.close()?;
            for file in export.sink.completed_files() {
                log::debug!("Task '{}' exported '{}'", plan.name, file.display());
            }
        }
        Ok(())
    }

    fn insert_plan(
        &self,
        plan: &TaskPlan,
        channel: &DataTransferChannel,
    ) -> Result<Option<InsertPlan>> {
        let (Some(spec), Some(sql)) = (&self.job.insert, &plan.insert_sql) else {
            return Ok(None);
        };
        let target = self.context.datasources.resolve(&spec.datasource)?;
        let statement = NamedStatement::compile(sql, target.placeholder_style())?;
        let projection = InsertProjection::new(statement, Arc::clone(channel.metadata()), &plan.config)?;
        Ok(Some(InsertPlan {
            target,
            projection: Arc::new(projection),
            batch_size: spec.batch_size,
        }))
    }

    fn export_plan(
        &self,
        plan: &TaskPlan,
        channel: &DataTransferChannel,
    ) -> Result<Option<ExportPlan>> {
        let (Some(spec), Some(path)) = (&self.job.export, &plan.export_path) else {
            return Ok(None);
        };
        let target = ExportTarget {
            spec: spec.clone(),
            path: path.clone(),
            move_to: plan.move_to.clone(),
            format_file: plan.format_file.clone(),
        };
        Ok(Some(ExportPlan {
            sink: ExportSink::create(&target, channel.metadata())?,
            batch_size: spec.batch_size,
        }))
    }
}

/// Binds `:name` parameters of a select from the task configuration.
fn bind_configuration(statement: &NamedStatement, config: &LayeredConfig) -> Result<Vec<Parameter>> {
    statement
        .parameters
        .iter()
        .map(|name| {
            config
                .get(name)
                .map(|value| Parameter::infer(value.to_value()))
                .ok_or_else(|| {
                    TransferError::Config(format!(
                        "Select parameter ':{}' has no configuration value",
                        name
                    ))
                })
        })
        .collect()
}

/// Writers of one sink worker; insert connections are opened here, on the
/// worker's own thread.
fn open_writers(
    insert: Option<&InsertPlan>,
    export: Option<&ExportPlan>,
    result: &Arc<TaskResult>,
) -> Result<Vec<Box<dyn RowWriter>>> {
    let mut writers: Vec<Box<dyn RowWriter>> = Vec::with_capacity(2);
    if let Some(insert) = insert {
        writers.push(Box::new(InsertWriter::open(
            insert.target.as_ref(),
            Arc::clone(&insert.projection),
            insert.batch_size,
            Arc::clone(result),
        )?));
    }
    if let Some(export) = export {
        writers.push(Box::new(ExportWriter::new(
            Arc::clone(&export.sink),
            export.batch_size,
            Arc::clone(result),
        )));
    }
    Ok(writers)
}

// --- Job Runner ---

/// Expands a job and runs its tasks on a pool of `threads` workers.
pub struct JobRunner {
    context: Arc<EngineContext>,
    base_config: LayeredConfig,
}

impl JobRunner {
    /// Validates the job, resolves its datasources and every template.
    pub fn plan(&self, job: &JobDescriptor) -> Result<Vec<TaskPlan>> {
        job.validate()?;
        let mut styles = StatementStyles {
            select: self.context.datasources.resolve(&job.select.datasource)?.literal_style(),
            ..StatementStyles::default()
        };
        if let Some(insert) = &job.insert {
            styles.insert = self.context.datasources.resolve(&insert.datasource)?.literal_style();
        }
        build_task_plans(job, &self.base_config, styles)
    }

    pub fn run(&self, job: &JobDescriptor) -> Result<Arc<JobResult>> {
        let plans = self.plan(job)?;
        self.execute(job, plans)
    }

    /// Submits every task and waits for all of them. A failing task never
    /// cancels its siblings.
    pub fn execute(&self, job: &JobDescriptor, plans: Vec<TaskPlan>) -> Result<Arc<JobResult>> {
        let job_id = job.normalized_id().to_string();
        let job_result = Arc::new(JobResult::new(job_id.clone()));
        let _job_metrics = Registration::try_new(
            &self.context.metrics,
            object_name("job", &job_id),
            job_result.clone(),
        );

        let pool = Arc::new(ExecutionController::new(&job_id, job.threads)?);
        let _pool_metrics = Registration::try_new(
            &self.context.metrics,
            object_name("pool", &job_id),
            pool.clone(),
        );

        log::info!(
            "Job '{}' starting {} task(s) on {} thread(s)",
            job_id,
            plans.len(),
            job.threads
        );

        let descriptor = Arc::new(job.clone());
        let mut handles = Vec::with_capacity(plans.len());
        for plan in plans {
            let task_result = job_result.create_task(plan.name.clone());
            let runner = TaskRunner {
                context: Arc::clone(&self.context),
                job: Arc::clone(&descriptor),
            };
            let submitted = Arc::clone(&task_result);
            let handle = pool.submit(move || runner.run(&plan, submitted))?;
            handles.push((task_result, handle));
        }
        pool.shutdown();

        for (task, handle) in handles {
            if let Err(e) = handle.join() {
                task.fail(e.to_string());
                task.end();
            }
        }
        pool.await_termination()?;

        log::info!(
            "Job '{}' finished: {} of {} task(s) failed, {} row(s) retrieved, {} row(s) processed",
            job_id,
            job_result.failed_tasks(),
            job_result.total_tasks(),
            job_result.retrieved_rows(),
            job_result.processed_rows()
        );
        Ok(job_result)
    }
}

// --- Engine ---

/// Runs jobs on its own worker threads and I/O runtime. Call it from a plain
/// thread; driver calls made from inside a tokio runtime fail with an
/// execution error.
pub struct Engine {
    runner: JobRunner,
}

impl Engine {
    /// Engine over the given datasources with default tuning and no
    /// external configuration.
    pub fn new(datasources: DataSourceRegistry, metrics: Arc<dyn MetricsRegistry>) -> Self {
        Self::with_options(
            datasources,
            metrics,
            DEFAULT_FETCH_SIZE,
            DEFAULT_PERMIT_WAIT,
            LayeredConfig::new(),
        )
    }

    /// Builds the datasources from settings. External properties and `-D`
    /// overrides form the lowest configuration layer, then the environment.
    pub fn from_settings(
        settings: &Settings,
        overrides: &[(String, String)],
        metrics: Arc<dyn MetricsRegistry>,
    ) -> Result<Self> {
        let datasources = DataSourceRegistry::from_settings(settings)?;
        let base_config = LayeredConfig::new()
            .with_layer(LayerKind::External, settings.external_properties(overrides))
            .with_environment();
        Ok(Self::with_options(
            datasources,
            metrics,
            settings.engine.fetch_size,
            settings.engine.permit_wait(),
            base_config,
        ))
    }

    pub fn with_options(
        datasources: DataSourceRegistry,
        metrics: Arc<dyn MetricsRegistry>,
        fetch_size: usize,
        permit_wait: Duration,
        base_config: LayeredConfig,
    ) -> Self {
        let context = Arc::new(EngineContext {
            datasources,
            metrics,
            fetch_size: fetch_size.max(1),
            permit_wait,
        });
        Self {
            runner: JobRunner {
                context,
                base_config,
            },
        }
    }

    pub fn run_job(&self, job: &JobDescriptor) -> Result<Arc<JobResult>> {
        self.runner.run(job)
    }

    /// Runs the selected jobs (all when `selection` is empty) in file order.
    /// Every job is planned before the first one starts, so configuration
    /// errors surface before any row moves.
    pub fn run_jobs(&self, jobs: &JobFile, selection: &[String]) -> Result<Vec<Arc<JobResult>>> {
        jobs.validate()?;
        let selected = jobs.select(selection)?;
        let planned = selected
            .into_iter()
            .map(|job| -> Result<_> { Ok((job, self.runner.plan(job)?)) })
            .collect::<Result<Vec<_>>>()?;

        planned
            .into_iter()
            .map(|(job, plans)| self.runner.execute(job, plans))
            .collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DataSourceRegistry::new(), Arc::new(NoopRegistry))
    }
}

#[cfg(test)]
mod tests;
