//! One function per pipeline stage.
//!
//! Every stage reads its inputs from the results directory, writes exactly one
//! result file (the implement fan-out writes one per chunk) and returns the
//! [`StageExit`] contract. Stage failures always leave an inspectable result
//! file behind; `Err` is reserved for conditions the stage cannot describe in
//! its own output, such as an unconfigured executor or a held merge lock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dispatch::{ChunkRunner, Dispatcher};
use crate::executor::Invoker;
use crate::merge::{MergeInput, MergeRequest};
use crate::pipeline::PipelineEvent;
use crate::report::{StageExit, write_with_meta};
use crate::review::{ReviewInputs, evaluate};
use crate::role::Role;
use crate::splitter::{DispatchEntry, DispatchManifest, split_work};
use crate::task::{Task, normalize_task};
use crate::util::{as_payload, load_json, write_json};
use crate::verify::VerifyRequest;

const PLAN_REQUEST: &str = "Plan stage: split to 30-90 min implementation chunks and add machine-readable acceptance criteria. \
Return JSON with 'chunks' array where each chunk has: chunk_id, title, estimated_minutes (30-90), \
role (architect|builder), depends_on (array), scope, files_affected (array), and acceptance_criteria \
(array of {id, description, verify_command, verify_pattern, category}).";

const IMPLEMENT_REQUEST: &str =
    "Execute implementation for this subtask and include changed files/commands in response payload.";

/// Black-box "does this payload satisfy schema X" check.
///
/// Returns one message per violation; an empty list means valid.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &str, payload: &Value) -> Vec<String>;
}

/// Validator used when no schema documents are wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
    fn validate(&self, _schema: &str, _payload: &Value) -> Vec<String> {
        Vec::new()
    }
}

/// Canonical result file locations for one work id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    pub results_dir: PathBuf,
    pub work_id: String,
}

impl StagePaths {
    pub fn new(results_dir: impl Into<PathBuf>, work_id: impl Into<String>) -> Self {
        Self {
            results_dir: results_dir.into(),
            work_id: work_id.into(),
        }
    }

    fn file(&self, prefix: &str, suffix: &str) -> PathBuf {
        self.results_dir
            .join(format!("{}_{}{}.json", prefix, self.work_id, suffix))
    }

    pub fn validation(&self) -> PathBuf {
        self.file("validation", "")
    }

    pub fn plan(&self) -> PathBuf {
        self.file("plan", "")
    }

    pub fn dispatch(&self) -> PathBuf {
        self.file("dispatch", "")
    }

    pub fn matrix(&self) -> PathBuf {
        self.file("dispatch", ".matrix")
    }

    pub fn implement_chunk(&self, chunk_id: &str) -> PathBuf {
        self.file("implement", &format!("_{}", chunk_id))
    }

    pub fn implement(&self) -> PathBuf {
        self.file("implement", "")
    }

    pub fn verify(&self, platform: &str) -> PathBuf {
        self.file("verify", &format!("_{}", platform))
    }

    pub fn review(&self) -> PathBuf {
        self.file("review", "")
    }

    pub fn retrospect(&self) -> PathBuf {
        self.file("retrospect", "")
    }

    /// Every verify result present for this work id, sorted.
    pub fn verify_results(&self) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/verify_{}_*.json",
            glob::Pattern::escape(&self.results_dir.to_string_lossy()),
            self.work_id
        );
        let mut found: Vec<PathBuf> = glob::glob(&pattern)
            .map(|paths| paths.filter_map(|p| p.ok()).collect())
            .unwrap_or_default();
        found.sort();
        found
    }
}

/// Everything a stage needs besides its own inputs.
#[derive(Clone)]
pub struct StageContext {
    pub work_id: String,
    pub paths: StagePaths,
    pub invoker: Arc<dyn Invoker>,
    pub validator: Arc<dyn SchemaValidator>,
    pub max_workers: usize,
    pub verify_commands: Vec<String>,
    pub verify_timeout: Duration,
    pub platform: String,
    pub working_dir: PathBuf,
    pub event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl StageContext {
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// Load and normalize a task. A missing or unparsable file is an input error.
fn load_task(task_path: &Path) -> Result<(Task, Vec<String>)> {
    Task::load(task_path).with_context(|| format!("Failed to load task {}", task_path.display()))
}

fn questions(items: impl IntoIterator<Item = String>) -> Vec<Value> {
    items.into_iter().map(Value::String).collect()
}

fn stage_exit_for(status: &str) -> StageExit {
    StageExit::gate(status == "done")
}

/// Validate a task declaration and write `validation_<work_id>.json`.
pub fn validate(ctx: &StageContext, task_path: &Path) -> Result<StageExit> {
    let out = ctx.paths.validation();
    let raw = match load_json(task_path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %task_path.display(), error = %e, "Task file unreadable");
            let payload = json!({
                "work_id": ctx.work_id,
                "status": "blocked",
                "validation_errors": [format!("{:#}", e)],
                "task": Value::Null,
            });
            write_with_meta("validation", &ctx.work_id, &payload, &out)?;
            return Ok(StageExit::Fatal);
        }
    };

    let (task, mut errors) = normalize_task(&raw);
    let task_value = serde_json::to_value(&task)?;
    errors.extend(
        ctx.validator
            .validate("task", &task_value)
            .into_iter()
            .map(|v| format!("Schema violation: {}", v)),
    );
    for err in &errors {
        warn!(task_id = %task.task_id, "{}", err);
    }

    let payload = json!({
        "work_id": ctx.work_id,
        "status": if errors.is_empty() { "ready" } else { "blocked" },
        "validation_errors": errors,
        "task": task_value,
    });
    write_with_meta("validation", &ctx.work_id, &payload, &out)?;
    info!(task_id = %task.task_id, errors = errors.len(), "Task validated");
    Ok(StageExit::gate(errors.is_empty()))
}

/// Write a result for an invalid task so the failure is inspectable.
fn write_invalid_task(agent: &str, ctx: &StageContext, out: &Path, errors: &[String]) -> Result<StageExit> {
    warn!(errors = errors.len(), "Task is invalid. Run validate first.");
    let payload = json!({
        "status": "blocked",
        "validation_errors": errors,
        "open_questions": questions(errors.iter().cloned()),
    });
    write_with_meta(agent, &ctx.work_id, &payload, out)?;
    Ok(StageExit::Blocked)
}

/// Record a stage that could not start, with the reason as its only open question.
fn write_failed(agent: &str, ctx: &StageContext, out: &Path, question: String) -> Result<StageExit> {
    let payload = json!({
        "status": "failed",
        "open_questions": questions([question]),
    });
    write_with_meta(agent, &ctx.work_id, &payload, out)?;
    Ok(StageExit::Fatal)
}

/// Ask the architect for a plan and write `plan_<work_id>.json`.
pub async fn plan(ctx: &StageContext, task_path: &Path) -> Result<StageExit> {
    let out = ctx.paths.plan();
    let agent = Role::Architect.owner();
    let (task, errors) = load_task(task_path)?;
    if !errors.is_empty() {
        return write_invalid_task(agent, ctx, &out, &errors);
    }

    let request = json!({
        "work_id": ctx.work_id,
        "phase": "plan",
        "task": task,
        "request": PLAN_REQUEST,
    });
    let envelope = match ctx.invoker.invoke(Role::Architect, &request).await {
        Ok(envelope) => envelope,
        Err(e) => {
            let payload = json!({"status": "failed", "open_questions": [e.to_string()]});
            write_with_meta(agent, &ctx.work_id, &payload, &out)?;
            return Err(e.into());
        }
    };

    let plan_data = Value::Object(envelope.parse().result_object());
    let mut status = if envelope.status.is_success() { "done" } else { "blocked" };
    let split = split_work(&task, Some(&plan_data));

    let declared = plan_data
        .get("acceptance_criteria")
        .and_then(Value::as_array)
        .unwrap_or(&task.acceptance_criteria);
    let implementation_contract: Vec<Value> = declared
        .iter()
        .map(|c| match c {
            Value::Object(map) => map.get("description").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        })
        .collect();
    let test_plan = match plan_data.get("test_plan") {
        Some(Value::Array(items)) => items.clone(),
        _ => ctx
            .verify_commands
            .iter()
            .cloned()
            .map(Value::String)
            .collect(),
    };

    let mut open_questions = Vec::new();
    if status != "done" {
        open_questions.push(
            "Plan phase failed. Fix acceptance criteria or task context before implementation."
                .to_string(),
        );
    }
    if plan_data.as_object().is_some_and(Map::is_empty) && !envelope.is_simulated() {
        open_questions.push("CLI output could not be parsed as structured JSON.".to_string());
        status = "blocked";
    }
    if split.chunks.is_empty() {
        open_questions
            .push("No implementation chunks could be generated from the task subtasks.".to_string());
    }

    let mut result = json!({
        "status": status,
        "implementation_contract": implementation_contract,
        "test_plan": test_plan,
        "open_questions": [],
        "chunks": split.chunks,
        "machine_readable_criteria": split.criteria,
        "cli_output": envelope,
    });
    let violations = ctx.validator.validate("plan", &result);
    if !violations.is_empty() {
        status = "blocked";
        open_questions.extend(violations.into_iter().map(|v| format!("Schema violation: {}", v)));
    }
    result["status"] = json!(status);
    result["open_questions"] = json!(open_questions);

    write_with_meta(agent, &ctx.work_id, &result, &out)?;
    info!(
        work_id = %ctx.work_id,
        status,
        chunks = split.chunks.len(),
        "Plan written"
    );
    Ok(stage_exit_for(status))
}

/// Build the dispatch manifest and its routing matrix.
pub fn split(ctx: &StageContext, task_path: &Path) -> Result<StageExit> {
    let out = ctx.paths.dispatch();
    let (task, errors) = load_task(task_path)?;
    if !errors.is_empty() {
        return write_invalid_task("dispatch", ctx, &out, &errors);
    }

    let plan_path = ctx.paths.plan();
    let plan = if plan_path.exists() {
        Some(as_payload(&load_json(&plan_path)?).clone())
    } else {
        None
    };
    let split = split_work(&task, plan.as_ref());
    let manifest = DispatchManifest::build(&task, &ctx.work_id, &split.chunks, plan.as_ref());

    write_with_meta("dispatch", &ctx.work_id, &serde_json::to_value(&manifest)?, &out)?;
    write_json(&ctx.paths.matrix(), &serde_json::to_value(manifest.matrix())?)?;
    info!(work_id = %ctx.work_id, chunks = manifest.subtasks.len(), "Dispatch manifest written");
    Ok(StageExit::Success)
}

/// Run one chunk (or subtask) through its role's executor and write
/// `implement_<work_id>_<id>.json`.
pub async fn implement_subject(
    ctx: &StageContext,
    task: &Task,
    subtask_id: &str,
    subject: &Value,
    role: Role,
) -> Result<StageExit> {
    let out = ctx.paths.implement_chunk(subtask_id);
    let agent = role.owner();
    let request = json!({
        "work_id": ctx.work_id,
        "phase": "implement",
        "task_id": task.task_id,
        "subtask": subject,
        "full_task": task,
        "request": IMPLEMENT_REQUEST,
    });

    let envelope = match ctx.invoker.invoke(role, &request).await {
        Ok(envelope) => envelope,
        Err(e) => {
            let payload = json!({
                "status": "failed",
                "subtask": subject,
                "role": role,
                "open_questions": [e.to_string()],
            });
            write_with_meta(agent, &ctx.work_id, &payload, &out)?;
            return Err(e.into());
        }
    };

    let data = envelope.parse().result_object();
    let list = |key: &str| match data.get(key) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let mut status = if envelope.status.is_success() { "done" } else { "failed" };
    let mut open_questions = Vec::new();
    if data.is_empty() && !envelope.is_simulated() {
        open_questions
            .push("CLI result payload was not structured JSON (empty or unparsable).".to_string());
        status = "blocked";
    }
    if status == "failed" {
        open_questions.push(format!("{} returned status={}.", agent, envelope.status));
    }

    let payload = json!({
        "status": status,
        "subtask": subject,
        "role": role,
        "files_changed": list("files_changed"),
        "commands_executed": [{
            "status": envelope.status,
            "command": envelope.command,
            "return_code": envelope.return_code,
            "stdout": envelope.stdout,
            "stderr": envelope.stderr,
        }],
        "failed_tests": list("failed_tests"),
        "artifacts": list("artifacts"),
        "cli_output": envelope,
        "open_questions": open_questions,
    });
    write_with_meta(agent, &ctx.work_id, &payload, &out)?;
    info!(work_id = %ctx.work_id, subtask_id, role = %role, status, "Implementation result written");
    Ok(stage_exit_for(status))
}

/// Implement a single chunk by id, looked up in the dispatch manifest first
/// and then in the task's own subtasks.
pub async fn implement_one(ctx: &StageContext, task_path: &Path, subtask_id: &str) -> Result<StageExit> {
    let (task, errors) = load_task(task_path)?;
    if !errors.is_empty() {
        return write_invalid_task("implement", ctx, &ctx.paths.implement_chunk(subtask_id), &errors);
    }

    let manifest = match DispatchManifest::load(&ctx.paths.dispatch()) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(error = %e, "Dispatch manifest unavailable; using task subtasks");
            None
        }
    };

    if let Some(entry) = manifest.as_ref().and_then(|m| m.find(subtask_id)) {
        let subject = serde_json::to_value(entry)?;
        return implement_subject(ctx, &task, subtask_id, &subject, entry.role).await;
    }
    if let Some(subtask) = task.find_subtask(subtask_id) {
        if manifest.is_some() {
            warn!(subtask_id, "Dispatch does not contain subtask; falling back to task definition");
        }
        let subject = serde_json::to_value(subtask)?;
        return implement_subject(ctx, &task, subtask_id, &subject, subtask.role).await;
    }

    let available = match &manifest {
        Some(m) if !m.subtasks.is_empty() => m.subtask_ids(),
        _ => task.subtask_ids(),
    };
    error!(subtask_id, ?available, "Unknown subtask id");
    let question = format!(
        "Unknown subtask id '{}'. Available: {}",
        subtask_id,
        if available.is_empty() { "none".to_string() } else { available.join(", ") }
    );
    write_failed("implement", ctx, &ctx.paths.implement_chunk(subtask_id), question)
}

/// Runs dispatched chunks through [`implement_subject`].
struct ImplementRunner {
    ctx: StageContext,
    task: Arc<Task>,
}

#[async_trait]
impl ChunkRunner for ImplementRunner {
    async fn run_chunk(&self, entry: &DispatchEntry) -> Result<StageExit> {
        let subject = serde_json::to_value(entry)?;
        implement_subject(&self.ctx, &self.task, &entry.subtask_id, &subject, entry.role).await
    }
}

/// Fan every manifest chunk out through the bounded dispatcher.
pub async fn implement_all(ctx: &StageContext, task_path: &Path) -> Result<StageExit> {
    let (task, errors) = load_task(task_path)?;
    if !errors.is_empty() {
        return write_invalid_task("implement", ctx, &ctx.paths.implement(), &errors);
    }
    let dispatch = ctx.paths.dispatch();
    let manifest = match DispatchManifest::load(&dispatch) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Cannot dispatch without a manifest");
            let question = format!(
                "Dispatch manifest {} could not be loaded. Run split first.",
                dispatch.display()
            );
            return write_failed("implement", ctx, &ctx.paths.implement(), question);
        }
    };

    let mut dispatcher = Dispatcher::new(ctx.max_workers);
    if let Some(tx) = &ctx.event_tx {
        dispatcher = dispatcher.with_event_channel(tx.clone());
    }
    let runner = Arc::new(ImplementRunner {
        ctx: ctx.clone(),
        task: Arc::new(task),
    });
    let summary = dispatcher.dispatch(&manifest.subtasks, runner).await?;
    if summary.failure_count() > 0 {
        error!("{} implementation job(s) failed.", summary.failure_count());
    }
    Ok(summary.exit())
}

/// Merge per-chunk results into `implement_<work_id>.json`.
pub fn merge(ctx: &StageContext, input: Option<MergeInput>) -> Result<StageExit> {
    let dispatch = ctx.paths.dispatch();
    let request = MergeRequest {
        work_id: ctx.work_id.clone(),
        kind: "implement".to_string(),
        input: input.unwrap_or_else(|| MergeInput::Directory(ctx.paths.results_dir.clone())),
        out: ctx.paths.implement(),
        dispatch: Some(dispatch),
    };
    Ok(crate::merge::merge(&request)?.exit)
}

/// Run verify commands for this platform.
pub async fn verify(ctx: &StageContext) -> Result<StageExit> {
    let request = VerifyRequest {
        work_id: ctx.work_id.clone(),
        platform: ctx.platform.clone(),
        commands: ctx.verify_commands.clone(),
        out: ctx.paths.verify(&ctx.platform),
        timeout: ctx.verify_timeout,
        working_dir: ctx.working_dir.clone(),
    };
    let (_, exit) = crate::verify::verify(&request).await?;
    Ok(exit)
}

/// Evaluate the review gate and write `review_<work_id>.json`.
pub fn review(ctx: &StageContext) -> Result<StageExit> {
    let inputs = ReviewInputs::load(
        &ctx.paths.plan(),
        &ctx.paths.implement(),
        &ctx.paths.verify_results(),
    )?;
    let report = evaluate(&ctx.work_id, &inputs);
    write_with_meta("review", &ctx.work_id, &serde_json::to_value(&report)?, &ctx.paths.review())?;
    Ok(report.exit())
}

/// Derive the retrospective from the review result.
pub fn retrospect(ctx: &StageContext) -> Result<StageExit> {
    let review_path = ctx.paths.review();
    let out = ctx.paths.retrospect();
    let review = if review_path.exists() {
        as_payload(&load_json(&review_path)?).clone()
    } else {
        Value::Null
    };
    if review.as_object().is_none_or(Map::is_empty) {
        error!(path = %review_path.display(), "Review result missing or empty");
        let payload = json!({
            "work_id": ctx.work_id,
            "status": "blocked",
            "open_questions": [format!("Review result not found: {}", review_path.display())],
        });
        write_with_meta("retrospect", &ctx.work_id, &payload, &out)?;
        return Ok(StageExit::Fatal);
    }

    let retro = crate::retrospect::derive(
        &ctx.work_id,
        &review,
        &review_path.display().to_string(),
    );
    write_with_meta("retrospect", &ctx.work_id, &serde_json::to_value(&retro)?, &out)?;
    info!(work_id = %ctx.work_id, actions = retro.next_plan.len(), "Retrospective written");
    Ok(StageExit::Success)
}
