//! Merge engine: reconcile per-chunk results into one aggregate result.
//!
//! The merge holds an exclusive lock on its output for the whole
//! read-aggregate-write cycle. Results are checked against the dispatch
//! manifest so that a chunk which never reported is a failure rather than
//! a silent omission.

mod lock;

pub use lock::MergeLock;

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::report::{StageExit, write_with_meta};
use crate::util::{array_field, as_payload, load_json};

/// Where the per-chunk result files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeInput {
    /// An explicit glob pattern.
    Glob(String),
    /// A results directory; `<kind>_<work_id>_*.json` is matched inside it.
    Directory(PathBuf),
}

impl MergeInput {
    /// Interpret a CLI argument: existing directories are scanned, anything
    /// else is used as a glob pattern (a plain path matches itself).
    pub fn from_arg(arg: &str) -> Self {
        let path = Path::new(arg);
        if path.is_dir() {
            MergeInput::Directory(path.to_path_buf())
        } else {
            MergeInput::Glob(arg.to_string())
        }
    }

    fn pattern(&self, kind: &str, work_id: &str) -> String {
        match self {
            MergeInput::Glob(pattern) => pattern.clone(),
            MergeInput::Directory(dir) => {
                let base = glob::Pattern::escape(&dir.to_string_lossy());
                format!("{}/{}_{}_*.json", base, kind, work_id)
            }
        }
    }
}

/// Parameters of one merge.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub work_id: String,
    pub kind: String,
    pub input: MergeInput,
    pub out: PathBuf,
    pub dispatch: Option<PathBuf>,
}

/// The merged payload plus the stage exit it implies.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub payload: Value,
    pub exit: StageExit,
}

impl MergeOutcome {
    pub fn status(&self) -> &str {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("failed")
    }
}

/// Aggregate status by strict precedence over the collected statuses.
pub fn build_status<S: AsRef<str>>(values: &[S]) -> &'static str {
    let has = |wanted: &str| values.iter().any(|v| v.as_ref() == wanted);
    if has("failed") || has("skipped") {
        "failed"
    } else if has("blocked") {
        "blocked"
    } else if has("simulated") || has("passed") {
        "done"
    } else if has("ready") {
        "ready"
    } else {
        "done"
    }
}

/// Run a merge. Fails only when the lock cannot be taken or the output
/// cannot be written; every reconciliation problem is reported in the result.
pub fn merge(request: &MergeRequest) -> Result<MergeOutcome> {
    let _lock = MergeLock::try_acquire_exclusive(&request.out)?;

    let files = discover(request)?;
    if files.is_empty() {
        warn!(work_id = %request.work_id, kind = %request.kind, "No result files to merge");
        let payload = json!({
            "status": "blocked",
            "count": 0,
            "subtask_results": [],
            "files_changed": [],
            "commands_executed": [],
            "failed_tests": [],
            "artifacts": [],
            "open_questions": ["No implementation artifacts were produced."],
        });
        write_with_meta("merge", &request.work_id, &payload, &request.out)?;
        return Ok(MergeOutcome {
            payload,
            exit: StageExit::Blocked,
        });
    }

    let mut results = Vec::new();
    let mut open_questions: Vec<Value> = Vec::new();
    let mut unreadable = false;
    for file in &files {
        match load_json(file) {
            Ok(value) => results.push(value),
            Err(e) => {
                error!(path = %file.display(), error = %e, "Unreadable result file");
                open_questions.push(Value::String(format!(
                    "Result file '{}' could not be read: {:#}",
                    file.display(),
                    e
                )));
                unreadable = true;
            }
        }
    }

    let statuses: Vec<String> = results
        .iter()
        .map(|r| {
            as_payload(r)
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("failed")
                .to_string()
        })
        .collect();
    let mut status = build_status(&statuses);
    if unreadable {
        status = "failed";
    }

    let (expected, dispatch_failed) = match &request.dispatch {
        Some(path) => match expected_subtasks(path) {
            Ok(ids) => (ids, false),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load dispatch file");
                (Vec::new(), true)
            }
        },
        None => (Vec::new(), false),
    };

    let mut found: HashSet<String> = HashSet::new();
    let mut subtask_results = Vec::new();
    let mut files_changed: BTreeSet<String> = BTreeSet::new();
    let mut commands_executed = Vec::new();
    let mut failed_tests = Vec::new();
    let mut artifacts = Vec::new();
    for result in &results {
        let payload = as_payload(result);
        subtask_results.push(payload.clone());
        for file in array_field(payload, "files_changed") {
            files_changed.insert(match file {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        commands_executed.extend(array_field(payload, "commands_executed"));
        failed_tests.extend(array_field(payload, "failed_tests"));
        artifacts.extend(array_field(payload, "artifacts"));
        open_questions.extend(array_field(payload, "open_questions"));
        if let Some(id) = payload
            .get("subtask")
            .and_then(|s| s.get("subtask_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        {
            found.insert(id.to_string());
        }
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !found.contains(*id))
        .cloned()
        .collect();
    for id in &missing {
        open_questions.push(Value::String(format!(
            "Missing implementation result for subtask '{}'.",
            id
        )));
    }

    if dispatch_failed {
        status = "failed";
        let path = request
            .dispatch
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        open_questions.push(Value::String(format!(
            "Merge requires dispatch file but it could not be loaded: '{}'.",
            path
        )));
    } else if !missing.is_empty() && status != "failed" && status != "blocked" {
        status = "failed";
    }

    let payload = json!({
        "status": status,
        "count": results.len(),
        "subtask_results": subtask_results,
        "files_changed": files_changed,
        "commands_executed": commands_executed,
        "failed_tests": failed_tests,
        "artifacts": artifacts,
        "open_questions": open_questions,
        "expected_subtasks": expected,
        "missing_subtasks": missing,
    });
    write_with_meta(&request.kind, &request.work_id, &payload, &request.out)?;
    info!(
        work_id = %request.work_id,
        status,
        count = results.len(),
        missing = missing.len(),
        "Merged results"
    );

    Ok(MergeOutcome {
        payload,
        exit: StageExit::gate(status != "failed" && status != "blocked"),
    })
}

/// Matching result files, sorted, excluding the merge's own output.
fn discover(request: &MergeRequest) -> Result<Vec<PathBuf>> {
    let pattern = request.input.pattern(&request.kind, &request.work_id);
    let own_name = format!("{}_{}.json", request.kind, request.work_id);
    let out_name = request.out.file_name().map(|n| n.to_os_string());

    let mut files: Vec<PathBuf> = glob::glob(&pattern)?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter(|path| {
            let name = path.file_name();
            name.map(|n| n != own_name.as_str()).unwrap_or(true)
                && name.map(|n| Some(n.to_os_string()) != out_name).unwrap_or(true)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn expected_subtasks(path: &Path) -> Result<Vec<String>> {
    let raw = load_json(path)?;
    Ok(array_field(as_payload(&raw), "subtasks")
        .iter()
        .filter_map(|item| item.get("subtask_id"))
        .filter_map(|id| match id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}
