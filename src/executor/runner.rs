//! Executor process runner.
//!
//! Each attempt spawns the configured command through `sh -c`, writes the
//! payload as JSON to stdin, and waits for it under a timeout. Non-zero exits
//! and timeouts become failed envelopes and are retried after a fixed sleep;
//! the first passing attempt is returned immediately.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, EnvelopeStatus};
use super::scheduler::Scheduler;
use super::ExecutorSettings;
use crate::errors::ExecutorError;
use crate::role::Role;
use crate::util::{command_trace, sha256_hex};

/// Anything that can run an executor role on a payload.
///
/// Stages take `&dyn Invoker` so tests can substitute canned envelopes.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, role: Role, payload: &Value) -> Result<Envelope, ExecutorError>;

    /// Whether invocations are simulated rather than spawned.
    fn simulating(&self) -> bool;
}

/// Spawns executor processes according to [`ExecutorSettings`].
pub struct ExecutorRunner {
    settings: ExecutorSettings,
    scheduler: Arc<Scheduler>,
    working_dir: PathBuf,
}

impl ExecutorRunner {
    pub fn new(settings: ExecutorSettings, working_dir: impl AsRef<Path>) -> Self {
        let scheduler = Arc::new(Scheduler::new(settings.rate_limit()));
        Self {
            settings,
            scheduler,
            working_dir: working_dir.as_ref().to_path_buf(),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run `command` for `role` with retries.
    ///
    /// Simulation short-circuits without spawning. With simulation off a
    /// missing command is a configuration error, never retried.
    pub async fn invoke_command(
        &self,
        role: Role,
        command: Option<&str>,
        payload: &Value,
    ) -> Result<Envelope, ExecutorError> {
        let payload_text = serde_json::to_string(payload)?;
        let payload_checksum = sha256_hex(payload_text.as_bytes());

        if self.settings.simulate {
            debug!(role = %role, "Simulating executor call");
            return Ok(Envelope {
                status: EnvelopeStatus::Simulated,
                command: String::new(),
                return_code: 0,
                stdout: format!("[{}] simulation mode", role.owner()),
                stderr: String::new(),
                attempt: 0,
                elapsed_ms: 0,
                payload_checksum,
            });
        }

        let command = command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(ExecutorError::NotConfigured {
                role,
                env_var: ExecutorSettings::env_var_for(role),
            })?;

        self.scheduler.admit().await;

        let max_attempts = self.settings.max_retries;
        let mut last: Option<Envelope> = None;
        for attempt in 1..=max_attempts {
            info!(
                role = %role,
                attempt,
                max_attempts,
                command = %command_trace(command),
                "Invoking executor"
            );
            let envelope = self
                .run_attempt(role, command, &payload_text, &payload_checksum, attempt)
                .await?;
            if envelope.status == EnvelopeStatus::Passed {
                return Ok(envelope);
            }
            warn!(
                role = %role,
                attempt,
                return_code = envelope.return_code,
                "Executor attempt failed"
            );
            last = Some(envelope);
            if attempt < max_attempts {
                tokio::time::sleep(self.settings.retry_sleep()).await;
            }
        }

        Ok(last.unwrap_or_else(|| Envelope {
            status: EnvelopeStatus::Failed,
            command: command.to_string(),
            return_code: 1,
            stdout: String::new(),
            stderr: "no attempt made".to_string(),
            attempt: 0,
            elapsed_ms: 0,
            payload_checksum,
        }))
    }

    async fn run_attempt(
        &self,
        role: Role,
        command: &str,
        payload_text: &str,
        payload_checksum: &str,
        attempt: u32,
    ) -> Result<Envelope, ExecutorError> {
        let start = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                role,
                command: command.to_string(),
                source,
            })?;

        // Write stdin concurrently so a child that fills its stdout pipe
        // before reading input cannot deadlock us.
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = payload_text.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    debug!(error = %e, "Failed to write executor stdin");
                }
            });
        }

        let timeout_duration = self.settings.timeout();
        let output = match timeout(timeout_duration, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ExecutorError::Wait { role, source })?,
            Err(_) => {
                return Ok(Envelope {
                    status: EnvelopeStatus::Failed,
                    command: command.to_string(),
                    return_code: -1,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {}s", timeout_duration.as_secs()),
                    attempt,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    payload_checksum: payload_checksum.to_string(),
                });
            }
        };

        let return_code = output.status.code().unwrap_or(-1);
        debug!(role = %role, attempt, return_code, "Executor exited");
        Ok(Envelope {
            status: if output.status.success() {
                EnvelopeStatus::Passed
            } else {
                EnvelopeStatus::Failed
            },
            command: command.to_string(),
            return_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            attempt,
            elapsed_ms: start.elapsed().as_millis() as u64,
            payload_checksum: payload_checksum.to_string(),
        })
    }
}

#[async_trait]
impl Invoker for ExecutorRunner {
    async fn invoke(&self, role: Role, payload: &Value) -> Result<Envelope, ExecutorError> {
        self.invoke_command(role, self.settings.command_for(role), payload)
            .await
    }

    fn simulating(&self) -> bool {
        self.settings.simulate
    }
}
