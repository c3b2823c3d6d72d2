//! Stage driver: canonical stage order, resume and force-stage logic.
//!
//! The driver walks the stages in order and stops at the first non-zero
//! stage exit. With resume enabled, the unbroken prefix of stages that
//! already have a completed result file is skipped. The retrospective is not
//! a stage of its own: in full mode it runs once review has passed, or was
//! skipped as already completed.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::report::{StageExit, read_status};
use crate::role::Role;
use crate::stages::{self, StageContext};

/// Statuses that mark a stage result as completed.
pub const COMPLETED_STATUSES: [&str; 4] = ["passed", "completed", "ready", "done"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validate,
    Plan,
    Split,
    Implement,
    Merge,
    Verify,
    Review,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Validate,
        Stage::Plan,
        Stage::Split,
        Stage::Implement,
        Stage::Merge,
        Stage::Verify,
        Stage::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Plan => "plan",
            Stage::Split => "split",
            Stage::Implement => "implement",
            Stage::Merge => "merge",
            Stage::Verify => "verify",
            Stage::Review => "review",
        }
    }

    /// Prefix of the result files this stage writes. Implement and merge
    /// share one.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Stage::Validate => "validation",
            Stage::Plan => "plan",
            Stage::Split => "dispatch",
            Stage::Implement | Stage::Merge => "implement",
            Stage::Verify => "verify",
            Stage::Review => "review",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Validate => "Validating task",
            Stage::Plan => "Planning (architect)",
            Stage::Split => "Splitting task",
            Stage::Implement => "Implementing chunks",
            Stage::Merge => "Merging results",
            Stage::Verify => "Verifying",
            Stage::Review => "Reviewing & retrospective",
        }
    }

    fn index(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| PipelineError::InvalidStage(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PipelineMode {
    #[default]
    Full,
    /// Stop after merge.
    ImplementOnly,
}

impl PipelineMode {
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            PipelineMode::Full => &Stage::ALL,
            PipelineMode::ImplementOnly => &Stage::ALL[..5],
        }
    }

    pub fn total_steps(&self) -> usize {
        self.stages().len()
    }
}

/// First result file for `stage` whose status marks it completed.
pub fn check_stage_completed(results_dir: &Path, stage: Stage, work_id: &str) -> Option<PathBuf> {
    let pattern = format!(
        "{}/{}_{}*.json",
        glob::Pattern::escape(&results_dir.to_string_lossy()),
        stage.file_prefix(),
        work_id
    );
    let mut candidates: Vec<PathBuf> = glob::glob(&pattern).ok()?.filter_map(|p| p.ok()).collect();
    candidates.sort();
    candidates.into_iter().find(|path| {
        read_status(path)
            .map(|status| COMPLETED_STATUSES.contains(&status.as_str()))
            .unwrap_or(false)
    })
}

/// Stages to skip on resume: the unbroken run of completed stages from the
/// start, never reaching `force_stage` or anything after it.
pub fn detect_resume_point(results_dir: &Path, work_id: &str, force_stage: Option<Stage>) -> Vec<Stage> {
    let limit = force_stage.map(|s| s.index()).unwrap_or(Stage::ALL.len());
    let mut skip = Vec::new();
    for stage in &Stage::ALL[..limit] {
        match check_stage_completed(results_dir, *stage, work_id) {
            Some(path) => {
                debug!(stage = %stage, path = %path.display(), "Stage already completed");
                skip.push(*stage);
            }
            None => break,
        }
    }
    skip
}

/// Progress notifications for the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageStarted {
        step: usize,
        total: usize,
        stage: Stage,
    },
    StageSkipped {
        step: usize,
        total: usize,
        stage: Stage,
    },
    StageFinished {
        stage: Stage,
        exit_code: i32,
    },
    ChunkStarted {
        chunk_id: String,
        role: Role,
    },
    ChunkFinished {
        chunk_id: String,
        exit_code: i32,
    },
    ChunkSkipped {
        chunk_id: String,
        reason: String,
    },
    RetrospectFinished {
        exit_code: i32,
    },
    RunFinished {
        exit_code: i32,
    },
}

/// How to run the pipeline.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub task_path: PathBuf,
    pub mode: PipelineMode,
    pub resume: bool,
    pub force_stage: Option<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub exit: StageExit,
    pub skipped: Vec<Stage>,
    /// The stage whose non-zero exit ended the run.
    pub failed_stage: Option<Stage>,
    pub retrospect_exit: Option<StageExit>,
}

pub struct PipelineDriver {
    ctx: StageContext,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineDriver {
    pub fn new(ctx: StageContext) -> Self {
        let event_tx = ctx.event_tx.clone();
        Self { ctx, event_tx }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.ctx.event_tx = Some(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    async fn run_stage(&self, stage: Stage, task_path: &Path) -> Result<StageExit> {
        match stage {
            Stage::Validate => stages::validate(&self.ctx, task_path),
            Stage::Plan => stages::plan(&self.ctx, task_path).await,
            Stage::Split => stages::split(&self.ctx, task_path),
            Stage::Implement => stages::implement_all(&self.ctx, task_path).await,
            Stage::Merge => stages::merge(&self.ctx, None),
            Stage::Verify => stages::verify(&self.ctx).await,
            Stage::Review => stages::review(&self.ctx),
        }
    }

    /// Run the pipeline. `Err` means a stage could not even describe its
    /// failure (exit 1 at the process level).
    pub async fn run(&self, options: &RunOptions) -> Result<PipelineOutcome> {
        let results_dir = &self.ctx.paths.results_dir;
        std::fs::create_dir_all(results_dir)?;

        let skip = if options.resume {
            detect_resume_point(results_dir, &self.ctx.work_id, options.force_stage)
        } else {
            Vec::new()
        };
        if !skip.is_empty() {
            info!(skipped = ?skip, "Resuming: skipping completed stages");
        }

        let total = options.mode.total_steps();
        let mut outcome = PipelineOutcome {
            exit: StageExit::Success,
            skipped: skip.clone(),
            failed_stage: None,
            retrospect_exit: None,
        };

        for (i, stage) in options.mode.stages().iter().copied().enumerate() {
            let step = i + 1;
            if skip.contains(&stage) {
                info!(step, total, stage = %stage, "Stage skipped (already completed)");
                self.emit(PipelineEvent::StageSkipped { step, total, stage }).await;
                continue;
            }

            info!(step, total, stage = %stage, "Stage starting");
            self.emit(PipelineEvent::StageStarted { step, total, stage }).await;
            let exit = match self.run_stage(stage, &options.task_path).await {
                Ok(exit) => exit,
                Err(e) => {
                    self.emit(PipelineEvent::StageFinished {
                        stage,
                        exit_code: StageExit::Fatal.code(),
                    })
                    .await;
                    self.emit(PipelineEvent::RunFinished {
                        exit_code: StageExit::Fatal.code(),
                    })
                    .await;
                    return Err(e.context(PipelineError::StageFailed {
                        stage: stage.to_string(),
                        code: StageExit::Fatal.code(),
                    }));
                }
            };
            self.emit(PipelineEvent::StageFinished {
                stage,
                exit_code: exit.code(),
            })
            .await;

            if !exit.is_success() {
                warn!(stage = %stage, exit_code = exit.code(), "Stage failed");
                outcome.exit = exit;
                outcome.failed_stage = Some(stage);
                self.emit(PipelineEvent::RunFinished {
                    exit_code: exit.code(),
                })
                .await;
                return Ok(outcome);
            }
        }

        if options.mode == PipelineMode::Full {
            let retro = stages::retrospect(&self.ctx)?;
            self.emit(PipelineEvent::RetrospectFinished {
                exit_code: retro.code(),
            })
            .await;
            outcome.retrospect_exit = Some(retro);
            outcome.exit = retro;
        }

        info!(exit_code = outcome.exit.code(), "Pipeline finished");
        self.emit(PipelineEvent::RunFinished {
            exit_code: outcome.exit.code(),
        })
        .await;
        Ok(outcome)
    }
}
