//! Retrospective: turn a review report into a short, prioritized next plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::array_field;

/// At most this many rework actions are carried into the next plan.
pub const MAX_REWORK_ACTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub owner: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetroSummary {
    pub go_no_go: bool,
    pub issues_count: usize,
    pub next_action_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetroEvidence {
    pub review_reference: String,
    pub questions: Vec<Value>,
}

/// Payload of `retrospect_<work_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrospective {
    pub work_id: String,
    pub status: String,
    pub summary: RetroSummary,
    pub next_plan: Vec<NextAction>,
    pub evidence: RetroEvidence,
}

/// Owner for a rework item: implementation problems go to the builder's owner.
fn rework_owner(item: &str) -> &'static str {
    if item.to_lowercase().contains("implementation") {
        "codex"
    } else {
        "claude"
    }
}

/// Derive the retrospective from a review payload.
pub fn derive(work_id: &str, review: &Value, review_reference: &str) -> Retrospective {
    let questions = array_field(review, "open_questions");
    let mut next_plan: Vec<NextAction> = array_field(review, "action_required")
        .iter()
        .take(MAX_REWORK_ACTIONS)
        .enumerate()
        .map(|(i, item)| {
            let title = match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            NextAction {
                index: i + 1,
                kind: "rework".to_string(),
                owner: rework_owner(&title).to_string(),
                title,
                priority: "high".to_string(),
            }
        })
        .collect();

    if next_plan.is_empty() && questions.is_empty() {
        next_plan.push(NextAction {
            index: 1,
            kind: "observe".to_string(),
            title: "No critical issues; run routine quality tuning on next cycle.".to_string(),
            owner: "both".to_string(),
            priority: "medium".to_string(),
        });
    }

    Retrospective {
        work_id: work_id.to_string(),
        status: "ready".to_string(),
        summary: RetroSummary {
            go_no_go: review
                .get("go_no_go")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            issues_count: questions.len(),
            next_action_count: next_plan.len(),
        },
        next_plan,
        evidence: RetroEvidence {
            review_reference: review_reference.to_string(),
            questions,
        },
    }
}
