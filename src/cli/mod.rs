//! Command-line interface for crucible.
//!
//! Provides commands for running workflows, validating definitions,
//! inspecting past runs, and listing checkpoints.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::components::EchoComponent;
use crate::config;
use crate::domain::{EventKind, WorkflowDefinition};
use crate::engine::{ValidationLevel, WorkflowValidator};
use crate::journal::RunJournal;
use crate::orchestrator::{OrchestratorConfig, WorkflowOrchestrator};

/// crucible - iterative improvement pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a workflow definition
    Run {
        /// Path to the workflow YAML file
        workflow: PathBuf,

        /// Override the definition's iteration count
        #[arg(short, long)]
        iterations: Option<u32>,
    },

    /// Validate a workflow definition without running it
    Validate {
        /// Path to the workflow YAML file
        workflow: PathBuf,

        /// Validation level
        #[arg(short, long, value_enum, default_value = "full")]
        level: Level,

        /// Treat the definition as partial (skip undefined-reference checks)
        #[arg(long)]
        partial: bool,
    },

    /// Show the journaled events of a run
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

    /// List checkpoints of a run
    Checkpoints {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Validation level for the CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Level {
    /// Structural shape only
    Schema,

    /// Schema plus circular-dependency detection
    Basic,

    /// Everything, including undefined-reference checks
    Full,
}

impl From<Level> for ValidationLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Schema => ValidationLevel::SchemaOnly,
            Level::Basic => ValidationLevel::Basic,
            Level::Full => ValidationLevel::Full,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                workflow,
                iterations,
            } => run_workflow(&workflow, iterations).await,
            Commands::Validate {
                workflow,
                level,
                partial,
            } => validate_workflow(&workflow, level.into(), partial),
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Checkpoints { run_id } => list_checkpoints(&run_id).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run a workflow with echo components bound to every referenced type.
///
/// Real deployments register their own components through the library API;
/// the CLI demo wires an echo component per component name so any
/// definition can be exercised end to end.
async fn run_workflow(path: &PathBuf, iterations: Option<u32>) -> Result<()> {
    let mut definition = WorkflowDefinition::from_file(path)?;
    if let Some(iterations) = iterations {
        definition.iterations = iterations;
    }

    let home = config::crucible_home()?;
    let mut orchestrator = WorkflowOrchestrator::new(OrchestratorConfig::new(home));

    let components: HashSet<String> = definition
        .steps
        .iter()
        .map(|s| s.component.clone())
        .collect();
    for name in components {
        orchestrator.register_component(name.clone(), Arc::new(EchoComponent::new(name)));
    }

    orchestrator.start_monitoring();
    orchestrator
        .initialize_workflow(definition)
        .await
        .context("Workflow failed validation")?;

    let result = orchestrator.execute_workflow().await?;
    orchestrator.shutdown();

    println!("Run:         {}", result.run_id);
    println!("Workflow:    {}", result.workflow);
    println!("Status:      {:?}", result.final_status);
    println!(
        "Iterations:  {} ({} ok, {} failed)",
        result.iterations_run, result.successful_iterations, result.failed_iterations
    );
    println!("Checkpoints: {}", result.checkpoints_created);
    println!("Duration:    {}ms", result.duration_ms);

    let resilience = orchestrator.get_resilience_status();
    if !resilience.is_empty() {
        println!("\nComponents:");
        for (name, status) in resilience {
            println!(
                "  {:<20} {:?} ({:.0}% ok, {} calls)",
                name,
                status.health,
                status.success_rate * 100.0,
                status.total_calls
            );
        }
    }

    Ok(())
}

fn validate_workflow(path: &PathBuf, level: ValidationLevel, partial: bool) -> Result<()> {
    let definition = WorkflowDefinition::from_file(path)?;
    let validator = WorkflowValidator::new();
    let result = validator.validate(&definition, level, partial);

    if result.is_valid {
        println!("OK: '{}' is valid", definition.name);
    } else {
        println!("INVALID: '{}'", definition.name);
        for issue in &result.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("{} issue(s) found", result.issues.len());
    }

    Ok(())
}

async fn show_status(run_id: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id).context("Invalid run ID")?;
    let journal = RunJournal::open(&config::runs_dir()?, run_id).await?;
    let events = journal.replay().await?;

    if events.is_empty() {
        anyhow::bail!("No events found for run {}", run_id);
    }

    println!("Run {} ({} events)", run_id, events.len());
    for event in &events {
        match &event.step {
            Some(step) => println!(
                "  {} {:<20} [{}] {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                format!("{:?}", event.kind),
                step,
                event.detail
            ),
            None => println!(
                "  {} {:<20} {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                format!("{:?}", event.kind),
                event.detail
            ),
        }
    }

    let terminal = events.iter().rev().find(|e| {
        matches!(
            e.kind,
            EventKind::WorkflowCompleted | EventKind::WorkflowFailed
        )
    });
    match terminal {
        Some(event) => println!("\nFinal: {:?}", event.kind),
        None => println!("\nFinal: still running or paused"),
    }

    Ok(())
}

async fn list_runs(limit: usize) -> Result<()> {
    let runs = RunJournal::list_runs(&config::runs_dir()?).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    for run_id in runs.into_iter().take(limit) {
        println!("{}", run_id);
    }
    Ok(())
}

async fn list_checkpoints(run_id: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id).context("Invalid run ID")?;
    let manager =
        crate::checkpoint::CheckpointManager::open(&config::checkpoints_dir()?, run_id)?;

    let checkpoints = manager.list_checkpoints().await?;
    if checkpoints.is_empty() {
        println!("No checkpoints for run {}", run_id);
        return Ok(());
    }

    for checkpoint in &checkpoints {
        println!(
            "{}  iter {:<4} {:<12} {}",
            checkpoint.id,
            checkpoint.iteration,
            format!("{:?}", checkpoint.kind),
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let stats = manager.statistics().await?;
    println!(
        "\n{} checkpoint(s), {} bytes on disk",
        stats.total, stats.total_bytes
    );
    Ok(())
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("home:        {}", config.home.display());
    match &config.config_file {
        Some(path) => println!("config file: {}", path.display()),
        None => println!("config file: (none found)"),
    }
    println!(
        "breaker:     {} failures open, {} successes close, {}ms recovery",
        config.resilience.breaker.failure_threshold,
        config.resilience.breaker.success_threshold,
        config.resilience.breaker.recovery_timeout_ms
    );
    println!(
        "monitor:     cpu {}/{}%, memory {}/{}%",
        config.monitor.cpu.warning,
        config.monitor.cpu.critical,
        config.monitor.memory.warning,
        config.monitor.memory.critical
    );

    Ok(())
}
