use crate::data_transfer::models::{JobDescriptor, VariableDeclaration};
use crate::error::Result;
use crate::template::{ConfigValue, LayerKind, LayeredConfig, LiteralStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One independently runnable unit of a job with every template resolved.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub job_id: String,
    /// 0-based position in the job.
    pub index: usize,
    pub name: String,
    pub config: LayeredConfig,
    pub select_sql: String,
    pub insert_sql: Option<String>,
    pub export_path: Option<PathBuf>,
    pub move_to: Option<PathBuf>,
    pub format_file: Option<PathBuf>,
}

/// Literal quoting used when rendering the select and insert statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementStyles {
    pub select: LiteralStyle,
    pub insert: LiteralStyle,
}

/// Task bindings before templates are resolved.
struct TaskBinding {
    name: String,
    values: Vec<(String, ConfigValue)>,
}

/// Expands a job into its tasks. `base` carries the external and
/// environment layers; the job and task layers are added on top.
pub fn build_task_plans(
    job: &JobDescriptor,
    base: &LayeredConfig,
    styles: StatementStyles,
) -> Result<Vec<TaskPlan>> {
    job.validate()?;

    let job_id = job.normalized_id().to_string();
    let job_config = base.clone().with_layer(
        LayerKind::Job,
        vec![
            ("job.id".to_string(), ConfigValue::from(job_id.as_str())),
            ("job.threads".to_string(), ConfigValue::from(job.threads as i64)),
        ],
    );

    let bindings = expand_bindings(job);
    let task_count = bindings.len();
    let mut plans = Vec::with_capacity(task_count);

    for (index, binding) in bindings.into_iter().enumerate() {
        let mut values = binding.values;
        values.push(("task.name".to_string(), ConfigValue::from(binding.name.as_str())));
        values.push(("task.index".to_string(), ConfigValue::from(index as i64)));
        let config = job_config.clone().with_layer(LayerKind::Task, values);

        let select_sql = config.substitute_with(&job.select.sql, styles.select)?;
        let insert_sql = job
            .insert
            .as_ref()
            .map(|spec| config.substitute_with(&spec.sql, styles.insert))
            .transpose()?;

        let (export_path, move_to, format_file) = match &job.export {
            Some(spec) => (
                Some(PathBuf::from(config.substitute(spec.path.trim())?)),
                spec.normalized_move_to()
                    .map(|dir| config.substitute(&dir).map(PathBuf::from))
                    .transpose()?,
                spec.normalized_format_file()
                    .map(|file| config.substitute(&file).map(PathBuf::from))
                    .transpose()?,
            ),
            None => (None, None, None),
        };

        plans.push(TaskPlan {
            job_id: job_id.clone(),
            index,
            name: binding.name,
            config,
            select_sql,
            insert_sql,
            export_path,
            move_to,
            format_file,
        });
    }

    disambiguate_paths(&mut plans);
    log::debug!("Job '{}' expanded into {} task(s)", job_id, plans.len());
    Ok(plans)
}

fn expand_bindings(job: &JobDescriptor) -> Vec<TaskBinding> {
    let job_id = job.normalized_id();
    let Some(variable) = &job.variable else {
        return vec![TaskBinding {
            name: job_id.to_string(),
            values: Vec::new(),
        }];
    };
    let var = variable.name.trim();

    match &variable.declaration {
        VariableDeclaration::IntegerRange(range) => {
            let mut bindings = Vec::new();
            let mut low = range.low_value;
            while low < range.high_value {
                let high = low
                    .checked_add(range.block_size)
                    .map(|end| end.min(range.high_value))
                    .unwrap_or(range.high_value);
                bindings.push(TaskBinding {
                    name: format!("{}[{},{})", job_id, low, high),
                    values: vec![
                        (format!("{}.low", var), ConfigValue::Integer(low)),
                        (format!("{}.high", var), ConfigValue::Integer(high)),
                    ],
                });
                low = high;
            }
            bindings
        }
        VariableDeclaration::LiteralList(list) => {
            let block = usize::try_from(list.block_size).unwrap_or(1).max(1);
            list.values
                .chunks(block)
                .map(|chunk| {
                    let first = chunk.first().map(ToString::to_string).unwrap_or_default();
                    let last = chunk.last().map(ToString::to_string).unwrap_or_default();
                    TaskBinding {
                        name: format!("{}[{}..{}]", job_id, first, last),
                        values: vec![(
                            format!("{}.values", var),
                            ConfigValue::List(chunk.to_vec()),
                        )],
                    }
                })
                .collect()
        }
    }
}

/// Tasks must never share an export file: when resolved paths collide the
/// task index is appended to every file stem.
fn disambiguate_paths(plans: &mut [TaskPlan]) {
    if plans.len() < 2 {
        return;
    }
    let mut seen = HashSet::new();
    let collides = plans
        .iter()
        .filter_map(|plan| plan.export_path.as_ref())
        .any(|path| !seen.insert(path.clone()));
    if !collides {
        return;
    }
    for plan in plans.iter_mut() {
        let suffix = plan.index.to_string();
        if let Some(path) = plan.export_path.take() {
            plan.export_path = Some(path_with_stem_suffix(&path, &suffix));
        }
        if let Some(path) = plan.format_file.take() {
            plan.format_file = Some(path_with_stem_suffix(&path, &suffix));
        }
    }
}

/// `dir/name.ext` with `suffix` → `dir/name-suffix.ext`.
pub fn path_with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}-{}", stem, suffix),
    };
    path.with_file_name(file_name)
}
