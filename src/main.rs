//! `rowferry` command line.
//!
//! ```bash
//! rowferry --config rowferry.toml --jobs jobs.json --job orders -D schema=sales
//! ```

use clap::Parser;
use rowferry::{Engine, JobFile, JobResult, NoopRegistry, Result, Settings, TransferError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rowferry", version, about = "Runs row transfer jobs")]
struct Cli {
    /// Settings file (TOML); ROWFERRY_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Job document (JSON)
    #[arg(long)]
    jobs: PathBuf,

    /// Runs only the given job ids, in file order
    #[arg(long = "job")]
    selected: Vec<String>,

    /// Template property override, highest precedence among external properties
    #[arg(short = 'D', value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Writes the job result snapshots as JSON
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

fn parse_property(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}

fn run(cli: &Cli) -> Result<Vec<Arc<JobResult>>> {
    let settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.logging.level);

    let jobs = JobFile::load(&cli.jobs)?;
    let engine = Engine::from_settings(&settings, &cli.properties, Arc::new(NoopRegistry))?;
    let results = engine.run_jobs(&jobs, &cli.selected)?;

    for result in &results {
        println!("{}", result.render_summary());
    }

    if let Some(path) = &cli.summary_json {
        let snapshots = results.iter().map(|result| result.snapshot()).collect::<Vec<_>>();
        let json = serde_json::to_string_pretty(&snapshots)?;
        std::fs::write(path, json).map_err(|e| {
            TransferError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write summary '{}': {}", path.display(), e),
            ))
        })?;
    }
    Ok(results)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(results) if results.iter().all(|result| result.is_success()) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            if e.is_configuration() {
                eprintln!("rowferry: {}", e);
            } else {
                eprintln!("rowferry: fatal: {}", e);
            }
            ExitCode::from(1)
        }
    }
}
