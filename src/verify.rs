//! Verify stage: run the configured check commands and record a JUnit report.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::report::{StageExit, write_with_meta};
use crate::util::{ensure_parent, truncate_chars};

const STDOUT_LIMIT: usize = 6000;
const STDERR_LIMIT: usize = 3000;

/// Parse raw verify command text: a JSON array of commands, or a list
/// separated by `;` and newlines. Blank entries are dropped.
pub fn parse_verify_commands(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|cmd| !cmd.is_empty())
            .collect();
    }
    raw.replace(';', "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Outcome of one verify command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub status: String,
    pub return_code: i32,
    pub time_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.status == "passed"
    }
}

/// Run one command through the shell, bounded by `limit`.
pub async fn run_command(command: &str, limit: Duration, working_dir: &Path) -> CommandResult {
    let start = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let failed = |return_code: i32, stderr: String, start: Instant| CommandResult {
        command: command.to_string(),
        status: "failed".to_string(),
        return_code,
        time_ms: start.elapsed().as_millis() as u64,
        stdout: String::new(),
        stderr,
    };

    let child = match child {
        Ok(child) => child,
        Err(e) => return failed(127, format!("Failed to spawn command: {}", e), start),
    };

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let return_code = output.status.code().unwrap_or(-1);
            CommandResult {
                command: command.to_string(),
                status: if output.status.success() { "passed" } else { "failed" }.to_string(),
                return_code,
                time_ms: start.elapsed().as_millis() as u64,
                stdout: truncate_chars(&String::from_utf8_lossy(&output.stdout), STDOUT_LIMIT),
                stderr: truncate_chars(&String::from_utf8_lossy(&output.stderr), STDERR_LIMIT),
            }
        }
        Ok(Err(e)) => failed(-1, format!("Failed waiting for command: {}", e), start),
        Err(_) => failed(
            -1,
            format!("Command timed out after {}s", limit.as_secs()),
            start,
        ),
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render results as a single JUnit `<testsuite>`.
pub fn build_junit_xml(results: &[CommandResult], suite: &str, total: Duration) -> String {
    let failures = results.iter().filter(|r| !r.passed()).count();
    let mut lines = vec![format!(
        r#"<testsuite name="{}" tests="{}" failures="{}" time="{:.3}">"#,
        suite,
        results.len(),
        failures,
        total.as_secs_f64()
    )];
    for (i, result) in results.iter().enumerate() {
        lines.push(format!(
            r#"  <testcase classname="{}" name="{}_{}" time="{:.3}">"#,
            suite,
            suite,
            i + 1,
            result.time_ms as f64 / 1000.0
        ));
        if !result.passed() {
            lines.push(format!(
                r#"    <failure message="{}"/>"#,
                xml_escape(&result.command)
            ));
        }
        lines.push("  </testcase>".to_string());
    }
    lines.push("</testsuite>\n".to_string());
    lines.join("\n")
}

/// Parameters of one verify run.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub work_id: String,
    pub platform: String,
    pub commands: Vec<String>,
    pub out: PathBuf,
    pub timeout: Duration,
    pub working_dir: PathBuf,
}

impl VerifyRequest {
    /// `junit_<work_id>_<platform>.xml` beside the result file.
    pub fn junit_path(&self) -> PathBuf {
        let name = format!("junit_{}_{}.xml", self.work_id, self.platform);
        match self.out.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// Run every command and write `verify_<work_id>_<platform>.json`.
pub async fn verify(request: &VerifyRequest) -> Result<(Value, StageExit)> {
    if request.commands.is_empty() {
        warn!(work_id = %request.work_id, "No verify commands configured");
        let payload = json!({
            "platform": request.platform,
            "status": "failed",
            "commands": [],
            "failed_tests": [],
            "artifacts": [],
            "open_questions": [
                "VERIFY_COMMANDS not configured, so verification fails. Set VERIFY_COMMANDS or pass --verify-commands."
            ],
        });
        write_with_meta("verify", &request.work_id, &payload, &request.out)?;
        return Ok((payload, StageExit::Fatal));
    }

    let started = Instant::now();
    let mut results = Vec::with_capacity(request.commands.len());
    for command in &request.commands {
        info!(command = %command, "Running verify command");
        let result = run_command(command, request.timeout, &request.working_dir).await;
        if !result.passed() {
            warn!(command = %command, return_code = result.return_code, "Verify command failed");
        }
        results.push(result);
    }

    let junit_path = request.junit_path();
    ensure_parent(&junit_path)?;
    std::fs::write(
        &junit_path,
        build_junit_xml(&results, &format!("verify-{}", request.platform), started.elapsed()),
    )
    .with_context(|| format!("Failed to write {}", junit_path.display()))?;

    let failed: Vec<&CommandResult> = results.iter().filter(|r| !r.passed()).collect();
    let status = if failed.is_empty() { "passed" } else { "failed" };
    let payload = json!({
        "platform": request.platform,
        "status": status,
        "commands": results,
        "failed_tests": failed,
        "artifacts": [junit_path.display().to_string()],
        "open_questions": failed.iter().map(|r| r.command.clone()).collect::<Vec<_>>(),
    });
    write_with_meta("verify", &request.work_id, &payload, &request.out)?;
    info!(work_id = %request.work_id, status, failures = failed.len(), "Verify finished");

    Ok((payload, StageExit::gate(failed.is_empty())))
}
