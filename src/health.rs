//! Executor health probe.
//!
//! Each configured executor is asked for `--version`, then `--help` if that
//! fails. Simulation mode skips the probe entirely.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::executor::ExecutorSettings;
use crate::role::Role;
use crate::util::{now_iso, truncate_chars};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    NotConfigured,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleHealth {
    pub role: Role,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: String,
    pub executors: Vec<RoleHealth>,
}

impl HealthReport {
    /// Process exit code: 0 when healthy or skipped.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Skipped => 0,
            _ => 1,
        }
    }
}

async fn probe(command: &str, flag: &str, working_dir: &Path) -> Result<String, String> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(format!("{} {}", command, flag))
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn failed: {}", e))?;
    match timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            Ok(truncate_chars(text.lines().next().unwrap_or("").trim(), 200))
        }
        Ok(Ok(output)) => Err(format!(
            "exit code {}: {}",
            output.status.code().unwrap_or(-1),
            truncate_chars(String::from_utf8_lossy(&output.stderr).trim(), 200)
        )),
        Ok(Err(e)) => Err(format!("wait failed: {}", e)),
        Err(_) => Err(format!("timed out after {}s", PROBE_TIMEOUT.as_secs())),
    }
}

async fn check_role(settings: &ExecutorSettings, role: Role, working_dir: &Path) -> RoleHealth {
    if settings.simulate {
        return RoleHealth {
            role,
            status: HealthStatus::Skipped,
            command: None,
            probe: None,
            detail: "simulation mode".to_string(),
        };
    }
    let Some(command) = settings.command_for(role).filter(|c| !c.trim().is_empty()) else {
        return RoleHealth {
            role,
            status: HealthStatus::NotConfigured,
            command: None,
            probe: None,
            detail: format!("{} is not set", ExecutorSettings::env_var_for(role)),
        };
    };

    let mut last_error = String::new();
    for flag in ["--version", "--help"] {
        match probe(command, flag, working_dir).await {
            Ok(detail) => {
                tracing::debug!(role = %role, flag, "Executor probe succeeded");
                return RoleHealth {
                    role,
                    status: HealthStatus::Healthy,
                    command: Some(command.to_string()),
                    probe: Some(flag.to_string()),
                    detail,
                };
            }
            Err(e) => {
                tracing::debug!(role = %role, flag, error = %e, "Executor probe failed");
                last_error = e;
            }
        }
    }
    RoleHealth {
        role,
        status: HealthStatus::Unhealthy,
        command: Some(command.to_string()),
        probe: None,
        detail: last_error,
    }
}

/// Probe both executor roles.
pub async fn check(settings: &ExecutorSettings, working_dir: &Path) -> HealthReport {
    let mut executors = Vec::new();
    for role in [Role::Architect, Role::Builder] {
        executors.push(check_role(settings, role, working_dir).await);
    }
    let status = if settings.simulate {
        HealthStatus::Skipped
    } else if executors.iter().all(|e| e.status == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    HealthReport {
        status,
        checked_at: now_iso(),
        executors,
    }
}
