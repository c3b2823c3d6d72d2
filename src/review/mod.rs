//! Review gate: decide go/no-go from the plan, merged implement and verify results.
//!
//! A set `go_no_go` flag means "do not merge". It is raised by any stage
//! that did not reach its expected status, and by any unresolved open
//! question anywhere upstream. Gate outcomes are ordinary results, not
//! errors: the report is always written and the caller branches on
//! [`ReviewReport::exit`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::report::StageExit;
use crate::util::{array_field, as_payload, load_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    ReadyForMerge,
    Blocked,
}

/// One role's verdict inside the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleReview {
    pub status: String,
    #[serde(default)]
    pub notes: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReferences {
    pub plan: String,
    pub implement: String,
    /// Platforms of the verify results that were read.
    pub verify: Vec<String>,
}

/// Payload of `review_<work_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub work_id: String,
    pub status: ReviewStatus,
    #[serde(rename = "claude_review")]
    pub architect_review: RoleReview,
    #[serde(rename = "codex_review")]
    pub builder_review: RoleReview,
    pub action_required: Vec<String>,
    pub open_questions: Vec<Value>,
    pub go_no_go: bool,
    pub references: ReviewReferences,
}

impl ReviewReport {
    pub fn exit(&self) -> StageExit {
        StageExit::gate(!self.go_no_go)
    }
}

/// Upstream results the gate reads. Absent files are `Value::Null`.
#[derive(Debug, Clone, Default)]
pub struct ReviewInputs {
    pub plan: Value,
    pub implement: Value,
    pub verifies: Vec<Value>,
    pub plan_path: PathBuf,
    pub implement_path: PathBuf,
}

impl ReviewInputs {
    /// Read the stage files. Missing files are tolerated (the gate then
    /// blocks); files that exist but cannot be parsed are an error.
    pub fn load(plan: &Path, implement: &Path, verifies: &[PathBuf]) -> Result<Self> {
        let read = |path: &Path| -> Result<Value> {
            if path.exists() {
                Ok(as_payload(&load_json(path)?).clone())
            } else {
                Ok(Value::Null)
            }
        };
        let mut verify_payloads = Vec::new();
        for path in verifies {
            if path.exists() {
                verify_payloads.push(as_payload(&load_json(path)?).clone());
            } else {
                tracing::debug!(path = %path.display(), "Verify result not found, skipping");
            }
        }
        Ok(Self {
            plan: read(plan)?,
            implement: read(implement)?,
            verifies: verify_payloads,
            plan_path: plan.to_path_buf(),
            implement_path: implement.to_path_buf(),
        })
    }
}

fn status_of(payload: &Value) -> Option<&str> {
    payload.get("status").and_then(Value::as_str)
}

/// Apply the gate rules.
pub fn evaluate(work_id: &str, inputs: &ReviewInputs) -> ReviewReport {
    let mut action_required = Vec::new();
    let mut verify_questions = Vec::new();
    let mut go_no_go = false;

    let plan_status = status_of(&inputs.plan);
    if plan_status != Some("done") {
        go_no_go = true;
        action_required.push(format!(
            "Plan phase status is '{}', expected 'done'.",
            plan_status.unwrap_or("missing")
        ));
    }

    let implement_status = status_of(&inputs.implement)
        .filter(|s| !s.is_empty())
        .unwrap_or("blocked");
    if implement_status != "done" {
        go_no_go = true;
        action_required.push(format!("Implementation status is '{}'.", implement_status));
    }

    let mut platforms = Vec::new();
    for verify in &inputs.verifies {
        let platform = verify
            .get("platform")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        platforms.push(platform.to_string());
        let status = status_of(verify);
        if status != Some("passed") {
            go_no_go = true;
            action_required.push(format!(
                "Verify status is '{}' on {} (expected 'passed').",
                status.unwrap_or("missing"),
                platform
            ));
        }
        verify_questions.extend(array_field(verify, "open_questions"));
    }

    let implement_questions = array_field(&inputs.implement, "open_questions");
    let mut open_questions = verify_questions;
    open_questions.extend(action_required.iter().cloned().map(Value::String));
    open_questions.extend(array_field(&inputs.plan, "open_questions"));
    open_questions.extend(implement_questions.iter().cloned());

    if !open_questions.is_empty() && !go_no_go {
        go_no_go = true;
        action_required.push(format!(
            "Unresolved open questions: {} item(s).",
            open_questions.len()
        ));
    }

    tracing::info!(
        work_id,
        go_no_go,
        actions = action_required.len(),
        questions = open_questions.len(),
        "Review gate evaluated"
    );

    ReviewReport {
        work_id: work_id.to_string(),
        status: if go_no_go {
            ReviewStatus::Blocked
        } else {
            ReviewStatus::ReadyForMerge
        },
        architect_review: RoleReview {
            status: if go_no_go { "changes_required" } else { "approved" }.to_string(),
            notes: if action_required.is_empty() {
                Vec::new()
            } else {
                vec![Value::String(
                    "Check action_required list in this report.".to_string(),
                )]
            },
        },
        builder_review: RoleReview {
            status: if implement_status == "done" {
                "implemented"
            } else {
                "needs_revision"
            }
            .to_string(),
            notes: implement_questions,
        },
        action_required,
        open_questions,
        go_no_go,
        references: ReviewReferences {
            plan: inputs.plan_path.display().to_string(),
            implement: inputs.implement_path.display().to_string(),
            verify: platforms,
        },
    }
}
