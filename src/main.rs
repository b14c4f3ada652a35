//! CLI entry point for sonaris.
//!
//! # Usage
//!
//! Run the engine until Ctrl-C:
//! ```bash
//! sonaris run --config config/sonaris.toml
//! ```
//!
//! Check a configuration file:
//! ```bash
//! sonaris check-config --config config/sonaris.toml
//! ```
//!
//! Inspect the task catalog and expand a task:
//! ```bash
//! sonaris tasks --device dg4202
//! sonaris submit-task "Toggle Output" --params '{"channel": 1, "output": "ON"}'
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sonaris::config::{SonarisConfig, DEFAULT_CONFIG_PATH};
use sonaris::engine::Engine;
use sonaris::logging;
use sonaris::scheduler::JobFilter;
use sonaris::tasks::{TaskCatalog, TaskParams, TaskStep};
use sonaris_core::JobState;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "sonaris")]
#[command(about = "Instrument task scheduling and orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and run the dispatch loop until Ctrl-C
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Print the effective configuration (file, defaults and environment) as TOML
        #[arg(long)]
        print: bool,
    },

    /// List the built-in device tasks
    Tasks {
        /// Only tasks for this instrument model
        #[arg(long)]
        device: Option<String>,
    },

    /// Validate a task against parameters and print its command sequence
    SubmitTask {
        /// Task key or display name
        task: String,

        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Also queue the task as a job on this endpoint
        #[arg(long)]
        endpoint: Option<String>,

        /// Configuration file (used with --endpoint)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// List persisted jobs
    Jobs {
        /// Only jobs in this state (pending, scheduled, running, succeeded, failed, cancelled)
        #[arg(long)]
        state: Option<String>,

        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { config, print } => check_config(config, print),
        Commands::Tasks { device } => list_tasks(device.as_deref()),
        Commands::SubmitTask {
            task,
            params,
            endpoint,
            config,
        } => submit_task(&task, &params, endpoint, config),
        Commands::Jobs { state, config } => list_jobs(state.as_deref(), config),
    }
}

fn load_config(path: &Path) -> Result<SonarisConfig> {
    SonarisConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let engine = Engine::builder(config)
        .build()
        .context("Failed to start engine")?;
    for endpoint in engine.endpoints() {
        if let Err(e) = engine.probe_endpoint(&endpoint.descriptor.id).await {
            tracing::warn!(endpoint = %endpoint.descriptor.id, error = %e, "Endpoint not responding");
        }
    }

    engine
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;
    Ok(())
}

fn check_config(config_path: PathBuf, print: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    if print {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{rendered}");
        return Ok(());
    }
    println!("Configuration OK: {}", config_path.display());
    println!("  application: {}", config.application.name);
    println!("  store: {:?} at {}", config.store.backend, config.store_dir().display());
    for endpoint in &config.endpoints {
        let enabled = if endpoint.enabled { "" } else { " (disabled)" };
        println!("  endpoint {}: {}{}", endpoint.id, endpoint.address, enabled);
    }
    Ok(())
}

fn list_tasks(device: Option<&str>) -> Result<()> {
    let catalog = TaskCatalog::global();
    for task in catalog.tasks() {
        if device.is_some_and(|d| !task.device.eq_ignore_ascii_case(d)) {
            continue;
        }
        println!("{} / {} [{}]", task.device, task.name, task.key);
        for param in &task.params {
            let unit = param.unit.map(|u| format!(" [{u}]")).unwrap_or_default();
            let default = param
                .default
                .as_ref()
                .map(|d| format!(" = {d}"))
                .unwrap_or_default();
            let constraint = param
                .constraint
                .as_ref()
                .map(|c| format!(" {}", serde_json::to_string(c).unwrap_or_default()))
                .unwrap_or_default();
            println!("    {}: {}{unit}{default}{constraint}", param.name, param.ty);
        }
    }
    Ok(())
}

fn submit_task(task: &str, params: &str, endpoint: Option<String>, config_path: PathBuf) -> Result<()> {
    let params: TaskParams =
        serde_json::from_str(params).context("--params must be a JSON object")?;
    let catalog = TaskCatalog::global();
    let commands = catalog.expand(task, &params)?;
    for command in &commands {
        println!("{command}");
    }

    let Some(endpoint) = endpoint else {
        return Ok(());
    };
    let config = load_config(&config_path)?;
    let engine = Engine::builder(config).build().context("Failed to open engine")?;
    let definition = catalog.build_job(task, endpoint, &[TaskStep {
        task: task.to_string(),
        params,
    }])?;
    let id = engine.submit_job(definition)?;
    println!("Queued job {id}");
    Ok(())
}

fn list_jobs(state: Option<&str>, config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let mut filter = JobFilter::all();
    if let Some(state) = state {
        let state: JobState = serde_json::from_value(serde_json::Value::String(state.to_lowercase()))
            .with_context(|| format!("Unknown job state '{state}'"))?;
        filter = filter.with_state(state);
    }
    let engine = Engine::builder(config).build().context("Failed to open engine")?;
    for job in engine.list_jobs(filter)? {
        let error = job
            .last_error
            .as_ref()
            .map(|e| format!("  {e}"))
            .unwrap_or_default();
        println!(
            "{}  {:<10} {:<24} {:<10} retries={}{}",
            job.id,
            job.state.to_string(),
            job.name(),
            job.endpoint_id(),
            job.retry_count,
            error
        );
    }
    Ok(())
}
