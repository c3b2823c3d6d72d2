use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use collab::logging::LogFormat;
use collab::pipeline::{PipelineMode, Stage};

mod cmd;

#[derive(Parser)]
#[command(name = "collab")]
#[command(version, about = "Drive a task through the architect/builder pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Return synthetic executor results instead of spawning executors
    #[arg(long, global = true)]
    pub simulate: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies one unit of work and where its results live.
#[derive(Args, Clone, Debug, Default)]
pub struct WorkArgs {
    /// Task JSON file
    #[arg(long)]
    pub task: Option<PathBuf>,

    /// Work id (defaults to a fingerprint of the task file)
    #[arg(long)]
    pub work_id: Option<String>,

    /// Directory for stage result files
    #[arg(long)]
    pub results_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the whole pipeline
    Run {
        #[command(flatten)]
        work: WorkArgs,
        #[arg(long, value_enum, default_value_t = PipelineMode::Full)]
        mode: PipelineMode,
        /// Skip stages that already have a completed result
        #[arg(long)]
        resume: bool,
        /// Always re-run this stage and everything after it
        #[arg(long, value_enum)]
        force_stage: Option<Stage>,
        /// JSON array or `;`-separated list of verify commands
        #[arg(long)]
        verify_commands: Option<String>,
    },
    /// Normalize and validate the task
    Validate {
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Ask the architect for a plan
    Plan {
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Write the dispatch manifest
    Split {
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Implement one subtask, or every chunk of the dispatch manifest
    Implement {
        #[command(flatten)]
        work: WorkArgs,
        #[arg(long)]
        subtask_id: Option<String>,
    },
    /// Merge per-chunk results
    Merge {
        #[command(flatten)]
        work: WorkArgs,
        #[arg(long, default_value = "implement")]
        kind: String,
        /// Glob or directory of result files
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Dispatch manifest listing the expected subtasks
        #[arg(long)]
        dispatch: Option<PathBuf>,
    },
    /// Run verify commands
    Verify {
        #[command(flatten)]
        work: WorkArgs,
        #[arg(long)]
        verify_commands: Option<String>,
    },
    /// Evaluate the go/no-go gate
    Review {
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Derive follow-up actions from the review
    Retrospect {
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Show the status of each stage result
    Status {
        #[arg(long)]
        work_id: String,
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },
    /// Probe the configured executors
    Health {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write a default collab.toml
    Init,
}

impl Commands {
    fn results_dir(&self) -> Option<PathBuf> {
        match self {
            Commands::Run { work, .. }
            | Commands::Validate { work }
            | Commands::Plan { work }
            | Commands::Split { work }
            | Commands::Implement { work, .. }
            | Commands::Merge { work, .. }
            | Commands::Verify { work, .. }
            | Commands::Review { work }
            | Commands::Retrospect { work } => work.results_dir.clone(),
            Commands::Status { results_dir, .. } => results_dir.clone(),
            Commands::Health { .. } | Commands::Config { .. } => None,
        }
    }

    fn verify_commands(&self) -> Option<String> {
        match self {
            Commands::Run {
                verify_commands, ..
            }
            | Commands::Verify {
                verify_commands, ..
            } => verify_commands.clone(),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    use collab::collab_config::CollabToml;
    use collab::config::{COLLAB_DIR, CliOverrides, Config};

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let configured_level = CollabToml::load_or_default(&project_dir.join(COLLAB_DIR))
        .ok()
        .and_then(|toml| toml.pipeline.log_level);
    collab::logging::init(cli.log_format, cli.verbose, configured_level.as_deref())?;

    let overrides = CliOverrides {
        verbose: cli.verbose,
        simulate: cli.simulate,
        results_dir: cli.command.results_dir(),
        verify_commands: cli.command.verify_commands(),
    };
    let config = Config::load(&project_dir, &overrides)?;

    match cli.command {
        Commands::Run {
            work,
            mode,
            resume,
            force_stage,
            ..
        } => cmd::cmd_run(&config, &work, mode, resume, force_stage).await,
        Commands::Validate { work } => cmd::cmd_stage(&config, &work, Stage::Validate).await,
        Commands::Plan { work } => cmd::cmd_stage(&config, &work, Stage::Plan).await,
        Commands::Split { work } => cmd::cmd_stage(&config, &work, Stage::Split).await,
        Commands::Implement { work, subtask_id } => {
            cmd::cmd_implement(&config, &work, subtask_id.as_deref()).await
        }
        Commands::Merge {
            work,
            kind,
            input,
            out,
            dispatch,
        } => cmd::cmd_merge(
            &config,
            &work,
            cmd::MergeArgs {
                kind,
                input,
                out,
                dispatch,
            },
        ),
        Commands::Verify { work, .. } => cmd::cmd_stage(&config, &work, Stage::Verify).await,
        Commands::Review { work } => cmd::cmd_stage(&config, &work, Stage::Review).await,
        Commands::Retrospect { work } => cmd::cmd_retrospect(&config, &work),
        Commands::Status { work_id, .. } => cmd::cmd_status(&config, &work_id),
        Commands::Health { out } => cmd::cmd_health(&config, out.as_deref()).await,
        Commands::Config { command } => cmd::cmd_config(&config, command),
    }
}
