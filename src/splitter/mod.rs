//! Work splitting: subtasks to time-boxed chunks, chunks to a dispatch manifest.
//!
//! A chunk is 30 to 90 minutes of work for one executor role. Subtasks longer
//! than 90 minutes are split into a strict sequential chain of parts, with
//! their acceptance criteria handed out contiguously. When an upstream plan
//! already supplies chunks those are taken as-is.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::role::Role;
use crate::task::{AcceptanceCriterion, Subtask, Task, id_list, minutes, normalize_acceptance_criteria, text};
use crate::util::{as_payload, load_json};

pub const MIN_CHUNK_MINUTES: u32 = 30;
pub const MAX_CHUNK_MINUTES: u32 = 90;
/// Estimate assumed for subtasks and plan chunks that declare none.
pub const DEFAULT_ESTIMATE_MINUTES: u32 = 60;

/// A dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub title: String,
    pub estimated_minutes: u32,
    pub role: Role,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_subtask_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Value>,
}

impl Chunk {
    /// Read a chunk produced by an upstream plan, tolerating missing fields.
    ///
    /// Returns `None` for entries that are not objects. `index` is the
    /// 1-based position, used only to name chunks that arrive without an id.
    pub fn from_plan_value(value: &Value, task: &Task, index: usize) -> Option<Chunk> {
        let obj = value.as_object()?;
        let chunk_id = obj
            .get("chunk_id")
            .or_else(|| obj.get("subtask_id"))
            .map(text)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| chunk_name(&task.task_id, index));
        let criteria = obj
            .get("acceptance_criteria")
            .and_then(Value::as_array)
            .map(|items| plan_criteria(items, &chunk_id))
            .unwrap_or_default();
        Some(Chunk {
            title: obj
                .get("title")
                .map(text)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "untitled".to_string()),
            estimated_minutes: obj
                .get("estimated_minutes")
                .and_then(minutes)
                .unwrap_or(DEFAULT_ESTIMATE_MINUTES),
            role: Role::resolve(
                obj.get("role").and_then(Value::as_str),
                obj.get("owner").and_then(Value::as_str),
            ),
            depends_on: id_list(obj.get("depends_on")),
            scope: obj
                .get("scope")
                .map(text)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| task.scope.clone()),
            files_affected: id_list(obj.get("files_affected")),
            acceptance_criteria: criteria,
            source_subtask_id: obj
                .get("source_subtask_id")
                .map(text)
                .filter(|s| !s.is_empty()),
            notes: obj
                .get("notes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            chunk_id,
        })
    }
}

/// Criteria from a plan chunk: structured objects are kept, text is promoted.
fn plan_criteria(items: &[Value], chunk_id: &str) -> Vec<AcceptanceCriterion> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match item {
            Value::Object(_) => serde_json::from_value(item.clone()).ok(),
            Value::String(description) => {
                Some(AcceptanceCriterion::from_text(description, chunk_id, i + 1))
            }
            _ => None,
        })
        .collect()
}

fn chunk_name(task_id: &str, index: usize) -> String {
    format!("{}-C{:02}", task_id, index)
}

/// Chunks for a task: the plan's own chunks when it has any, otherwise
/// chunks derived from the task's subtasks.
pub fn build_chunks(task: &Task, plan: Option<&Value>) -> Vec<Chunk> {
    let plan_chunks = plan
        .and_then(|p| p.get("chunks"))
        .and_then(Value::as_array)
        .filter(|chunks| !chunks.is_empty());
    if let Some(items) = plan_chunks {
        tracing::debug!(count = items.len(), "Using chunks supplied by plan");
        return items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| Chunk::from_plan_value(item, task, i + 1))
            .collect();
    }

    let mut chunks = Vec::new();
    let mut index = 0usize;
    for subtask in &task.subtasks {
        split_subtask(task, subtask, &mut index, &mut chunks);
    }
    chunks
}

fn split_subtask(task: &Task, subtask: &Subtask, index: &mut usize, out: &mut Vec<Chunk>) {
    let estimate = subtask
        .estimated_minutes
        .unwrap_or(DEFAULT_ESTIMATE_MINUTES)
        .max(MIN_CHUNK_MINUTES);
    let criteria = normalize_acceptance_criteria(&subtask.acceptance_criteria, &subtask.subtask_id);

    if estimate <= MAX_CHUNK_MINUTES {
        *index += 1;
        out.push(Chunk {
            chunk_id: chunk_name(&task.task_id, *index),
            title: subtask.title.clone(),
            estimated_minutes: estimate,
            role: subtask.role,
            depends_on: subtask.depends_on.clone(),
            scope: subtask.scope.clone(),
            files_affected: subtask.files_affected.clone(),
            acceptance_criteria: criteria,
            source_subtask_id: Some(subtask.subtask_id.clone()),
            notes: subtask.notes.clone(),
        });
        return;
    }

    let splits = estimate.div_ceil(MAX_CHUNK_MINUTES) as usize;
    let per_chunk = (estimate / splits as u32).clamp(MIN_CHUNK_MINUTES, MAX_CHUNK_MINUTES);
    let criteria_per = (criteria.len() / splits).max(1);
    tracing::debug!(
        subtask_id = %subtask.subtask_id,
        estimate,
        splits,
        "Splitting long subtask"
    );

    for part in 0..splits {
        *index += 1;
        let start = (part * criteria_per).min(criteria.len());
        let end = if part + 1 < splits {
            (start + criteria_per).min(criteria.len())
        } else {
            criteria.len()
        };
        let end = end.max(start);
        let mut part_criteria = criteria[start..end].to_vec();
        if part_criteria.is_empty() {
            part_criteria = criteria.iter().take(1).cloned().collect();
        }
        let depends_on = if part == 0 {
            subtask.depends_on.clone()
        } else {
            vec![chunk_name(&task.task_id, *index - 1)]
        };
        out.push(Chunk {
            chunk_id: chunk_name(&task.task_id, *index),
            title: format!("{} (part {}/{})", subtask.title, part + 1, splits),
            estimated_minutes: per_chunk,
            role: subtask.role,
            depends_on,
            scope: subtask.scope.clone(),
            files_affected: subtask.files_affected.clone(),
            acceptance_criteria: part_criteria,
            source_subtask_id: Some(subtask.subtask_id.clone()),
            notes: subtask.notes.clone(),
        });
    }
}

/// Task-level machine-readable criteria: the plan's list when it has one,
/// otherwise the task's own.
pub fn machine_readable_criteria(task: &Task, plan: Option<&Value>) -> Vec<AcceptanceCriterion> {
    let raw = plan
        .and_then(|p| p.get("acceptance_criteria"))
        .and_then(Value::as_array)
        .unwrap_or(&task.acceptance_criteria);
    normalize_acceptance_criteria(raw, &task.task_id)
}

/// Output of [`split_work`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkSplit {
    pub chunks: Vec<Chunk>,
    pub criteria: Vec<AcceptanceCriterion>,
}

/// Split a task into chunks plus its flattened acceptance criteria.
pub fn split_work(task: &Task, plan: Option<&Value>) -> WorkSplit {
    WorkSplit {
        chunks: build_chunks(task, plan),
        criteria: machine_readable_criteria(task, plan),
    }
}

/// One chunk as recorded in the dispatch manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEntry {
    pub subtask_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_estimate")]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub notes: Vec<Value>,
    #[serde(default)]
    pub work_id: String,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub source_subtask_id: Option<String>,
}

fn default_estimate() -> u32 {
    DEFAULT_ESTIMATE_MINUTES
}

impl DispatchEntry {
    fn from_chunk(chunk: &Chunk, task: &Task, work_id: &str) -> Self {
        Self {
            subtask_id: chunk.chunk_id.clone(),
            title: chunk.title.clone(),
            role: chunk.role,
            owner: chunk.role.owner().to_string(),
            scope: chunk.scope.clone(),
            estimated_minutes: chunk.estimated_minutes,
            depends_on: chunk.depends_on.clone(),
            files_affected: chunk.files_affected.clone(),
            acceptance_criteria: chunk.acceptance_criteria.clone(),
            notes: chunk.notes.clone(),
            work_id: work_id.to_string(),
            risk_level: task.risk_level.clone(),
            source_subtask_id: chunk.source_subtask_id.clone(),
        }
    }
}

/// Plan context carried alongside the manifest for implementers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchFromPlan {
    #[serde(default)]
    pub implementation_contract: Vec<Value>,
    #[serde(default)]
    pub test_plan: Vec<Value>,
}

/// The canonical set of chunks expected to produce implement results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchManifest {
    #[serde(default)]
    pub work_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub plan_version: String,
    #[serde(default)]
    pub subtasks: Vec<DispatchEntry>,
    #[serde(default)]
    pub dispatch_from_plan: DispatchFromPlan,
}

impl DispatchManifest {
    pub fn build(task: &Task, work_id: &str, chunks: &[Chunk], plan: Option<&Value>) -> Self {
        let plan_list = |key: &str| {
            plan.and_then(|p| p.get(key))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        Self {
            work_id: work_id.to_string(),
            status: "done".to_string(),
            plan_version: task.plan_version.clone().unwrap_or_else(|| "v1".to_string()),
            subtasks: chunks
                .iter()
                .map(|chunk| DispatchEntry::from_chunk(chunk, task, work_id))
                .collect(),
            dispatch_from_plan: DispatchFromPlan {
                implementation_contract: plan_list("implementation_contract"),
                test_plan: plan_list("test_plan"),
            },
        }
    }

    /// Load a manifest written by the split stage.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = load_json(path)?;
        serde_json::from_value(as_payload(&raw).clone())
            .with_context(|| format!("Invalid dispatch manifest {}", path.display()))
    }

    pub fn subtask_ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.subtask_id.clone()).collect()
    }

    pub fn find(&self, subtask_id: &str) -> Option<&DispatchEntry> {
        self.subtasks.iter().find(|s| s.subtask_id == subtask_id)
    }

    pub fn matrix(&self) -> Vec<MatrixEntry> {
        self.subtasks
            .iter()
            .map(|entry| MatrixEntry {
                subtask_id: entry.subtask_id.clone(),
                role: entry.role,
                owner: entry.role.owner().to_string(),
                estimated_minutes: entry.estimated_minutes,
                depends_on: entry.depends_on.clone(),
            })
            .collect()
    }
}

/// Compact routing view written beside the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub subtask_id: String,
    pub role: Role,
    pub owner: String,
    pub estimated_minutes: u32,
    pub depends_on: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::normalize_task;
    use serde_json::json;

    fn task_with(subtasks: Value) -> Task {
        let (task, errors) = normalize_task(&json!({
            "task_id": "T1",
            "title": "Feature",
            "scope": "app",
            "risk_level": "low",
            "priority": "p1",
            "acceptance_criteria": ["works"],
            "subtasks": subtasks,
        }));
        assert!(errors.is_empty(), "{:?}", errors);
        task
    }

    #[test]
    fn test_180_minute_subtask_splits_into_sequential_pair() {
        let task = task_with(json!([{
            "subtask_id": "S01",
            "title": "Big",
            "estimated_minutes": 180,
            "depends_on": ["S00"],
            "acceptance_criteria": ["a", "b", "c", "d"]
        }]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert!((MIN_CHUNK_MINUTES..=MAX_CHUNK_MINUTES).contains(&chunk.estimated_minutes));
            assert_eq!(chunk.acceptance_criteria.len(), 2);
            assert_eq!(chunk.source_subtask_id.as_deref(), Some("S01"));
        }
        assert_eq!(chunks[0].chunk_id, "T1-C01");
        assert_eq!(chunks[0].depends_on, vec!["S00"]);
        assert_eq!(chunks[1].depends_on, vec!["T1-C01"]);
        assert_eq!(chunks[0].acceptance_criteria[0].id, "AC-S01-1");
        assert_eq!(chunks[1].acceptance_criteria[0].id, "AC-S01-3");
        assert_eq!(chunks[1].title, "Big (part 2/2)");
    }

    #[test]
    fn test_short_estimate_is_clamped_up() {
        let task = task_with(json!([{"subtask_id": "S01", "estimated_minutes": 10}]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].estimated_minutes, 30);
    }

    #[test]
    fn test_exactly_90_is_not_split() {
        let task = task_with(json!([{"subtask_id": "S01", "estimated_minutes": 90}]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].estimated_minutes, 90);
    }

    #[test]
    fn test_missing_estimate_uses_default() {
        let task = task_with(json!([{"subtask_id": "S01"}]));
        assert_eq!(build_chunks(&task, None)[0].estimated_minutes, 60);
    }

    #[test]
    fn test_remainder_criteria_go_to_last_part() {
        let task = task_with(json!([{
            "subtask_id": "S01",
            "estimated_minutes": 200,
            "acceptance_criteria": ["a", "b", "c", "d", "e"]
        }]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 3);
        let counts: Vec<usize> = chunks.iter().map(|c| c.acceptance_criteria.len()).collect();
        assert_eq!(counts, vec![1, 1, 3]);
        assert!(chunks.iter().all(|c| c.estimated_minutes == 66));
    }

    #[test]
    fn test_more_parts_than_criteria_reuses_first() {
        let task = task_with(json!([{
            "subtask_id": "S01",
            "estimated_minutes": 270,
            "acceptance_criteria": ["only"]
        }]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.acceptance_criteria.len(), 1);
            assert_eq!(chunk.acceptance_criteria[0].id, "AC-S01-1");
        }
    }

    #[test]
    fn test_no_criteria_still_yields_chunks() {
        let task = task_with(json!([{
            "subtask_id": "S01",
            "estimated_minutes": 120,
            "acceptance_criteria": []
        }]));
        let chunks = build_chunks(&task, None);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.acceptance_criteria.is_empty()));
    }

    #[test]
    fn test_chunk_ids_are_global_across_subtasks() {
        let task = task_with(json!([
            {"subtask_id": "S01", "estimated_minutes": 100},
            {"subtask_id": "S02", "estimated_minutes": 45, "owner": "claude"}
        ]));
        let chunks = build_chunks(&task, None);
        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["T1-C01", "T1-C02", "T1-C03"]);
        assert_eq!(chunks[2].role, Role::Architect);
    }

    #[test]
    fn test_plan_chunks_are_used_verbatim() {
        let task = task_with(json!([{"subtask_id": "S01", "estimated_minutes": 300}]));
        let plan = json!({"chunks": [
            {"chunk_id": "P-1", "title": "From plan", "estimated_minutes": 45, "role": "architect",
             "acceptance_criteria": [{"id": "AC-P", "verify_command": "true"}, "text criterion"]},
            {"subtask_id": "P-2", "owner": "codex", "depends_on": ["P-1"]},
            "ignored"
        ]});
        let chunks = build_chunks(&task, Some(&plan));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "P-1");
        assert_eq!(chunks[0].role, Role::Architect);
        assert_eq!(chunks[0].acceptance_criteria.len(), 2);
        assert_eq!(chunks[0].acceptance_criteria[1].id, "AC-P-1-2");
        assert_eq!(chunks[1].chunk_id, "P-2");
        assert_eq!(chunks[1].role, Role::Builder);
        assert_eq!(chunks[1].estimated_minutes, 60);
        assert_eq!(chunks[1].scope, "app");
    }

    #[test]
    fn test_empty_plan_chunks_fall_back_to_subtasks() {
        let task = task_with(json!([{"subtask_id": "S01"}]));
        let chunks = build_chunks(&task, Some(&json!({"chunks": []})));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "T1-C01");
    }

    #[test]
    fn test_split_work_criteria_prefers_plan() {
        let task = task_with(json!([{"subtask_id": "S01"}]));
        let split = split_work(&task, None);
        assert_eq!(split.criteria.len(), 1);
        assert_eq!(split.criteria[0].id, "AC-T1-1");

        let plan = json!({"acceptance_criteria": ["x", "y"]});
        assert_eq!(split_work(&task, Some(&plan)).criteria.len(), 2);
    }

    #[test]
    fn test_manifest_and_matrix() {
        let task = task_with(json!([
            {"subtask_id": "S01", "owner": "claude"},
            {"subtask_id": "S02", "depends_on": ["S01"]}
        ]));
        let chunks = build_chunks(&task, None);
        let plan = json!({"test_plan": ["cargo test"]});
        let manifest = DispatchManifest::build(&task, "w1", &chunks, Some(&plan));
        assert_eq!(manifest.status, "done");
        assert_eq!(manifest.plan_version, "v1");
        assert_eq!(manifest.subtask_ids(), vec!["T1-C01", "T1-C02"]);
        assert_eq!(manifest.subtasks[0].owner, "claude");
        assert_eq!(manifest.subtasks[1].risk_level, "low");
        assert_eq!(manifest.dispatch_from_plan.test_plan, vec![json!("cargo test")]);

        let matrix = manifest.matrix();
        assert_eq!(matrix[1].owner, "codex");
        assert_eq!(matrix[1].depends_on, vec!["S01"]);
    }

    #[test]
    fn test_manifest_load_accepts_meta_and_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        crate::util::write_json(
            &path,
            &json!({
                "agent": "dispatch",
                "checksum": "x",
                "work_id": "w",
                "status": "done",
                "subtasks": [{"subtask_id": "A", "role": "claude"}]
            }),
        )
        .unwrap();
        let manifest = DispatchManifest::load(&path).unwrap();
        assert_eq!(manifest.find("A").unwrap().role, Role::Architect);
        assert!(manifest.find("B").is_none());
    }
}
