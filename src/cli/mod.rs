//! Command-line interface for deltaship.
//!
//! Provides commands for running the pipeline, checking status,
//! listing runs, and inspecting the service registry and configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::Adapters;
use crate::config::{self, ResolvedConfig};
use crate::core::orchestrator::{self, RunOutcome, RunRequest};
use crate::core::{Orchestrator, Pipeline};
use crate::domain::RunState;

/// deltaship - build and deploy only the services a commit touched
#[derive(Parser, Debug)]
#[command(name = "deltaship")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect changed services, then build, publish, deploy and verify them
    Run {
        /// Last processed revision (defaults to the last successful run)
        #[arg(long)]
        previous: Option<String>,

        /// Revision to process
        #[arg(long)]
        current: Option<String>,

        /// Pipeline definition
        #[arg(short, long, default_value = "deltaship.yaml")]
        pipeline: PathBuf,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the service registry and derived deployment targets
    Services {
        /// Pipeline definition
        #[arg(short, long, default_value = "deltaship.yaml")]
        pipeline: PathBuf,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                previous,
                current,
                pipeline,
            } => run_pipeline(&pipeline, RunRequest { previous, current }).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Services { pipeline } => show_services(&pipeline),
            Commands::Config => show_config(),
        }
    }
}

/// Load and validate a pipeline definition
fn load_pipeline(path: &Path) -> Result<Pipeline> {
    if !path.exists() {
        anyhow::bail!("Pipeline definition not found: {}", path.display());
    }

    let pipeline = Pipeline::from_file(path)?;
    pipeline.validate()?;
    Ok(pipeline)
}

/// Repository checkout the pipeline definition belongs to
fn repo_root(pipeline_path: &Path) -> Result<PathBuf> {
    match pipeline_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => std::env::current_dir().context("Failed to determine current directory"),
    }
}

/// Run the pipeline once
async fn run_pipeline(pipeline_path: &Path, request: RunRequest) -> Result<()> {
    let pipeline = load_pipeline(pipeline_path)?;
    let cfg = config::config()?.clone();
    let root = repo_root(pipeline_path)?;

    let adapters = Adapters::subprocess(&root, &pipeline.toolchain, &cfg)?;
    let orchestrator = Orchestrator::new(pipeline, cfg, adapters)?;
    let report = orchestrator.run(request).await?;

    if let Some(range) = &report.range {
        eprintln!("Range: {}..{}", range.previous, range.current);
    }

    match &report.outcome {
        RunOutcome::NothingChanged => {
            println!("Nothing changed; no service was built or deployed.");
        }
        RunOutcome::Finished(table) => {
            print!("{}", table.render());
        }
        RunOutcome::Aborted(error) => {
            eprintln!("Run aborted: {}", error);
        }
    }

    if report.is_success() {
        eprintln!("\n[Run {} completed successfully]", report.run_id);
    } else {
        eprintln!("\n[Run {} failed]", report.run_id);
        std::process::exit(report.exit_code());
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let runs_dir = config::config()?.runs_dir();
    let run = orchestrator::load_run(&runs_dir, run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {}", run.state.label());
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }
    if let Some(range) = &run.range {
        println!("Range: {}..{}", range.previous, range.current);
    }
    if let Some(build_id) = &run.build_id {
        println!("Build: {}", build_id);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    if !run.service_statuses.is_empty() {
        println!("\nStage statuses:");
        for (service, stages) in &run.service_statuses {
            let stages: Vec<String> = stages
                .iter()
                .map(|(stage, status)| format!("{}={:?}", stage, status))
                .collect();
            println!("  {}: {}", service, stages.join(" "));
        }
    }

    let store = crate::core::EventStore::open(&runs_dir, run_id).await?;
    if let Some(table) = store.load_report().await? {
        println!();
        print!("{}", table.render());
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs_dir = config::config()?.runs_dir();
    let runs = orchestrator::list_runs(&runs_dir, limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<15}", "RUN ID", "PIPELINE", "STATE", "SERVICES");
    println!("{}", "-".repeat(85));

    for run in runs {
        let services = if run.changed_services.is_empty() {
            "-".to_string()
        } else {
            run.changed_services.join(",")
        };
        println!(
            "{:<38} {:<20} {:<10} {:<15}",
            run.id,
            run.pipeline_name,
            run.state.label(),
            services
        );
    }

    Ok(())
}

/// Show the registry derived from the pipeline definition
fn show_services(pipeline_path: &Path) -> Result<()> {
    let pipeline = load_pipeline(pipeline_path)?;
    let cfg = config::config()?;
    let registry = pipeline.registry(cfg.registry()?, &cfg.release_prefix);

    println!(
        "{:<20} {:<15} {:<28} {:<30}",
        "SERVICE", "PATH", "RELEASE", "IMAGE"
    );
    println!("{}", "-".repeat(95));

    for service in registry.iter() {
        println!(
            "{:<20} {:<15} {:<28} {:<30}",
            service.id,
            format!("{}/", service.path_prefix),
            service.release_name,
            service.image_repository
        );
    }

    println!("\nNamespace: {}", cfg.namespace);
    Ok(())
}

/// Show resolved configuration (no credential material)
fn show_config() -> Result<()> {
    let cfg: &ResolvedConfig = config::config()?;

    println!("deltaship configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home: {}", cfg.home.display());
    println!("  Runs: {}", cfg.runs_dir().display());
    if let Some(kubeconfig) = &cfg.kubeconfig {
        println!("  Kubeconfig: {}", kubeconfig.display());
    }
    println!();
    println!("Deployment:");
    println!(
        "  Registry:        {}",
        cfg.registry.as_deref().unwrap_or("(not set)")
    );
    println!("  Credentials ref: {}", cfg.credentials_ref);
    println!("  Namespace:       {}", cfg.namespace);
    println!("  Release prefix:  {}", cfg.release_prefix);
    println!(
        "  Build id:        {}",
        cfg.build_id.as_deref().unwrap_or("(current revision)")
    );
    if let Some(previous) = &cfg.previous_revision {
        println!("  Previous rev:    {}", previous);
    }

    Ok(())
}
