//! Typed error hierarchy for the collab pipeline.
//!
//! Three enums cover the three places where callers need to branch on the
//! failure kind rather than just report it:
//! - `ExecutorError`: invoking an external executor process
//! - `LockError`: the merge engine's advisory output lock
//! - `PipelineError`: stage driver and stage input failures

use std::path::PathBuf;
use thiserror::Error;

use crate::role::Role;

/// Errors from invoking an external executor.
///
/// Non-zero exits and timeouts are not errors: they come back as failed
/// envelopes and are retried. Only conditions that make retrying pointless
/// surface here.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(
        "{role} executor command not configured. Set {env_var} or enable SIMULATE_AGENTS=1."
    )]
    NotConfigured { role: Role, env_var: &'static str },

    #[error("Failed to spawn {role} executor `{command}`: {source}")]
    Spawn {
        role: Role,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize executor payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed waiting for {role} executor: {source}")]
    Wait {
        role: Role,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from acquiring the exclusive merge lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another merge holds the lock on {path}")]
    AlreadyLocked { path: PathBuf },

    #[error("Failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the stage driver and stage input handling.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Missing {what}: {path}")]
    MissingInput { what: &'static str, path: PathBuf },

    #[error("Invalid stage '{0}'. Valid values: validate, plan, split, implement, merge, verify, review")]
    InvalidStage(String),

    #[error("Stage {stage} failed with exit code {code}")]
    StageFailed { stage: String, code: i32 },
}
