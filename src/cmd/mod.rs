//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `run`     | `Run`                                                         |
//! | `stage`   | `Validate`, `Plan`, `Split`, `Implement`, `Merge`, `Verify`, `Review`, `Retrospect` |
//! | `status`  | `Status`                                                      |
//! | `health`  | `Health`                                                      |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod health;
pub mod run;
pub mod stage;
pub mod status;

pub use config::cmd_config;
pub use health::cmd_health;
pub use run::cmd_run;
pub use stage::{MergeArgs, cmd_implement, cmd_merge, cmd_retrospect, cmd_stage};
pub use status::cmd_status;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use collab::config::Config;
use collab::errors::PipelineError;
use collab::executor::ExecutorRunner;
use collab::pipeline::COMPLETED_STATUSES;
use collab::stages::{AcceptAll, StageContext, StagePaths};

use super::WorkArgs;

/// The task file, or a missing-input error.
pub fn require_task(work: &WorkArgs) -> Result<&Path> {
    work.task
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("Missing task file: pass --task"))
}

/// Explicit work id, else the fingerprint of the task file.
pub fn resolve_work_id(work: &WorkArgs) -> Result<String> {
    if let Some(id) = work.work_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    let Some(task) = work.task.as_deref() else {
        anyhow::bail!("Either --work-id or --task is required");
    };
    let bytes = std::fs::read(task).map_err(|_| PipelineError::MissingInput {
        what: "task file",
        path: task.to_path_buf(),
    })?;
    Ok(collab::util::derive_work_id(&bytes))
}

pub fn build_context(config: &Config, work: &WorkArgs) -> Result<StageContext> {
    let work_id = resolve_work_id(work)?;
    config.ensure_directories()?;
    let invoker = ExecutorRunner::new(config.executor.clone(), &config.project_dir);
    tracing::debug!(work_id = %work_id, results_dir = %config.results_dir.display(), "Stage context ready");
    Ok(StageContext {
        paths: StagePaths::new(config.results_dir.clone(), work_id.clone()),
        work_id,
        invoker: Arc::new(invoker),
        validator: Arc::new(AcceptAll),
        max_workers: config.max_workers,
        verify_commands: config.verify_commands.clone(),
        verify_timeout: config.executor.timeout(),
        platform: collab::util::platform_name().to_string(),
        working_dir: config.project_dir.clone(),
        event_tx: None,
    })
}

/// Print where a stage wrote its result and the status it recorded.
pub fn print_result_path(label: &str, path: &Path) {
    if !path.exists() {
        return;
    }
    let status = collab::report::read_status(path).unwrap_or_else(|| "unknown".to_string());
    let styled = if COMPLETED_STATUSES.contains(&status.as_str()) || status == "ready_for_merge" {
        console::style(status).green()
    } else {
        console::style(status).red()
    };
    println!("{} -> {} ({})", label, path.display(), styled);
}
