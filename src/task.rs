//! Task model and normalization of external task declarations.
//!
//! A task arrives as loosely-shaped JSON written by a person or an upstream
//! tool. [`normalize_task`] turns it into a [`Task`] with every field filled
//! in, collecting a human-readable error for each defect it had to paper
//! over. The validate stage reports those errors; later stages refuse to run
//! on a task that produced any.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::role::Role;
use crate::util::load_json;

const VALID_PLATFORMS: [&str; 3] = ["mac", "windows", "both"];

/// A machine-checkable acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub verify_command: String,
    #[serde(default)]
    pub verify_pattern: String,
    #[serde(default = "default_category")]
    pub category: String,
}

impl AcceptanceCriterion {
    /// Promote free text to a criterion with id `AC-<subtask_id>-<index>`.
    pub fn from_text(description: &str, subtask_id: &str, index: usize) -> Self {
        Self {
            id: format!("AC-{}-{}", subtask_id, index),
            description: description.to_string(),
            verify_command: format!("echo 'TODO: implement verification for: {}'", description),
            verify_pattern: String::new(),
            category: default_category(),
        }
    }
}

fn default_category() -> String {
    "functional".to_string()
}

/// Promote mixed string/object criteria to [`AcceptanceCriterion`] values.
///
/// Objects need an `id` and a `verification` (or `verify_command`) entry;
/// strings get a synthesized `AC-<subtask_id>-<n>` id and a placeholder
/// verify command. Anything else is dropped.
pub fn normalize_acceptance_criteria(raw: &[Value], subtask_id: &str) -> Vec<AcceptanceCriterion> {
    let mut result = Vec::new();
    for (index, item) in raw.iter().enumerate() {
        match item {
            Value::Object(map) if map.contains_key("id") => {
                let verify = map.get("verification").or_else(|| map.get("verify_command"));
                let Some(verify) = verify else {
                    continue;
                };
                let category = map
                    .get("category")
                    .or_else(|| map.get("type"))
                    .map(text)
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(default_category);
                let verify_command = Some(text(verify))
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| "echo 'manual check required'".to_string());
                result.push(AcceptanceCriterion {
                    id: text(&map["id"]),
                    description: map.get("description").map(text).unwrap_or_default(),
                    verify_command,
                    verify_pattern: map.get("verify_pattern").map(text).unwrap_or_default(),
                    category,
                });
            }
            Value::String(description) => {
                result.push(AcceptanceCriterion::from_text(description, subtask_id, index + 1))
            }
            _ => {}
        }
    }
    result
}

/// One unit of work inside a task, before chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub subtask_id: String,
    pub title: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub platform: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files_affected: Vec<String>,
    /// Raw criteria as declared: strings or objects.
    #[serde(default)]
    pub acceptance_criteria: Vec<Value>,
    #[serde(default)]
    pub notes: Vec<Value>,
}

/// A normalized task. Immutable for the rest of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub scope: String,
    pub risk_level: String,
    pub priority: String,
    pub platform: Vec<String>,
    pub acceptance_criteria: Vec<Value>,
    /// Never empty after normalization.
    pub subtasks: Vec<Subtask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_version: Option<String>,
}

impl Task {
    /// Load and normalize a task file. I/O and JSON syntax errors are returned
    /// as `Err`; declaration defects come back in the error list.
    pub fn load(path: &Path) -> Result<(Task, Vec<String>)> {
        let raw = load_json(path)?;
        Ok(normalize_task(&raw))
    }

    pub fn find_subtask(&self, subtask_id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.subtask_id == subtask_id)
    }

    pub fn subtask_ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.subtask_id.clone()).collect()
    }
}

/// Normalize a raw task declaration, returning the task and any validation errors.
pub fn normalize_task(raw: &Value) -> (Task, Vec<String>) {
    let mut errors = Vec::new();
    let empty = serde_json::Map::new();
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => {
            errors.push("task must be a JSON object".to_string());
            &empty
        }
    };

    let task_id = obj.get("task_id").map(text).unwrap_or_default();
    let task_id = if task_id.is_empty() {
        errors.push("missing task_id".to_string());
        "task-unknown".to_string()
    } else {
        task_id
    };

    let mut required = |key: &str| {
        let value = obj.get(key).map(text).unwrap_or_default();
        if value.is_empty() {
            errors.push(format!("missing {}", key));
            "unknown".to_string()
        } else {
            value
        }
    };
    let title = required("title");
    let scope = required("scope");
    let risk_level = required("risk_level");
    let priority = required("priority");

    let acceptance_criteria = match obj.get("acceptance_criteria") {
        Some(Value::Array(items)) => {
            if items.is_empty() {
                errors.push("acceptance_criteria must be a non-empty array".to_string());
            }
            items.clone()
        }
        _ => {
            errors.push("acceptance_criteria must be a non-empty array".to_string());
            Vec::new()
        }
    };

    let platform: Vec<String> = normalize_platform(obj.get("platform"))
        .into_iter()
        .filter(|p| VALID_PLATFORMS.contains(&p.as_str()))
        .collect();
    let platform = if platform.is_empty() {
        vec!["both".to_string()]
    } else {
        platform
    };

    let mut task = Task {
        task_id,
        title,
        scope,
        risk_level,
        priority,
        platform,
        acceptance_criteria,
        subtasks: Vec::new(),
        plan_version: obj.get("plan_version").map(text).filter(|v| !v.is_empty()),
    };

    let raw_subtasks: Vec<Value> = match obj.get("subtasks") {
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => {
            errors.push("subtasks should be an array".to_string());
            vec![single.clone()]
        }
        _ => Vec::new(),
    };

    let mut subtasks = Vec::new();
    for (i, raw_subtask) in raw_subtasks.iter().enumerate() {
        let index = i + 1;
        match raw_subtask {
            Value::String(title) => subtasks.push(Subtask {
                subtask_id: default_subtask_id(&task.task_id, index),
                title: title.clone(),
                role: Role::default(),
                scope: task.scope.clone(),
                platform: task.platform.clone(),
                estimated_minutes: None,
                depends_on: Vec::new(),
                files_affected: Vec::new(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                notes: Vec::new(),
            }),
            Value::Object(_) => subtasks.push(normalize_subtask(raw_subtask, index, &task)),
            _ => errors.push(format!("subtask index={} must be object or string", index)),
        }
    }

    if subtasks.is_empty() {
        subtasks.push(Subtask {
            subtask_id: default_subtask_id(&task.task_id, 1),
            title: task.title.clone(),
            role: Role::default(),
            scope: task.scope.clone(),
            platform: task.platform.clone(),
            estimated_minutes: None,
            depends_on: Vec::new(),
            files_affected: Vec::new(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            notes: Vec::new(),
        });
    }

    task.subtasks = subtasks;
    (task, errors)
}

fn normalize_subtask(raw: &Value, index: usize, task: &Task) -> Subtask {
    let subtask_id = raw
        .get("subtask_id")
        .map(text)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| default_subtask_id(&task.task_id, index));

    let title = raw
        .get("title")
        .map(text)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| task.title.clone());
    let title = if title.is_empty() {
        "untitled".to_string()
    } else {
        title
    };

    let scope = raw
        .get("scope")
        .map(text)
        .unwrap_or_else(|| task.scope.clone());
    let scope = if scope.is_empty() {
        "implementation".to_string()
    } else {
        scope
    };

    let platform = match raw.get("platform") {
        Some(value) => normalize_platform(Some(value)),
        None => task.platform.clone(),
    };

    let acceptance_criteria = match raw.get("acceptance_criteria") {
        Some(Value::Array(items)) => items.clone(),
        _ => task.acceptance_criteria.clone(),
    };

    Subtask {
        subtask_id,
        title,
        role: Role::resolve(
            raw.get("role").and_then(Value::as_str),
            raw.get("owner").and_then(Value::as_str),
        ),
        scope,
        platform,
        estimated_minutes: raw.get("estimated_minutes").and_then(minutes),
        depends_on: id_list(raw.get("depends_on")),
        files_affected: id_list(raw.get("files_affected")),
        acceptance_criteria,
        notes: raw
            .get("notes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

fn default_subtask_id(task_id: &str, index: usize) -> String {
    format!("{}-S{:02}", task_id, index)
}

/// Platform declarations: comma separated string, list, or absent (`both`).
pub fn normalize_platform(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => vec!["both".to_string()],
        Some(Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|p| text(p).to_lowercase())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(_) => vec!["both".to_string()],
    }
}

/// Trimmed textual form of a scalar JSON value.
pub(crate) fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Minutes as declared, accepting integers and floats; negatives become 0.
pub(crate) fn minutes(value: &Value) -> Option<u32> {
    if let Some(n) = value.as_u64() {
        return Some(n.min(u32::MAX as u64) as u32);
    }
    if let Some(n) = value.as_i64() {
        return Some(if n < 0 { 0 } else { n as u32 });
    }
    value.as_f64().map(|f| f.max(0.0).round() as u32)
}

pub(crate) fn id_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(text)
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Value {
        json!({
            "task_id": "T-100",
            "title": "Add export",
            "scope": "backend",
            "risk_level": "medium",
            "priority": "high",
            "acceptance_criteria": ["exports csv"],
            "subtasks": [
                {"subtask_id": "S01", "title": "schema", "owner": "claude", "estimated_minutes": 45},
                {"subtask_id": "S02", "title": "writer", "role": "builder", "depends_on": ["S01"]}
            ]
        })
    }

    #[test]
    fn test_valid_task_has_no_errors() {
        let (task, errors) = normalize_task(&sample_task());
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(task.task_id, "T-100");
        assert_eq!(task.subtasks.len(), 2);
        assert_eq!(task.subtasks[0].role, Role::Architect);
        assert_eq!(task.subtasks[0].estimated_minutes, Some(45));
        assert_eq!(task.subtasks[1].role, Role::Builder);
        assert_eq!(task.subtasks[1].depends_on, vec!["S01"]);
        assert_eq!(task.platform, vec!["both"]);
    }

    #[test]
    fn test_missing_fields_are_reported_and_filled() {
        let (task, errors) = normalize_task(&json!({}));
        assert!(errors.contains(&"missing task_id".to_string()));
        assert!(errors.contains(&"missing title".to_string()));
        assert!(errors.contains(&"missing scope".to_string()));
        assert!(errors.contains(&"missing risk_level".to_string()));
        assert!(errors.contains(&"missing priority".to_string()));
        assert!(errors.contains(&"acceptance_criteria must be a non-empty array".to_string()));
        assert_eq!(task.task_id, "task-unknown");
        assert_eq!(task.title, "unknown");
    }

    #[test]
    fn test_empty_subtasks_synthesizes_default() {
        let mut raw = sample_task();
        raw["subtasks"] = json!([]);
        let (task, errors) = normalize_task(&raw);
        assert!(errors.is_empty());
        assert_eq!(task.subtasks.len(), 1);
        assert_eq!(task.subtasks[0].subtask_id, "T-100-S01");
        assert_eq!(task.subtasks[0].title, "Add export");
        assert_eq!(task.subtasks[0].acceptance_criteria, vec![json!("exports csv")]);
    }

    #[test]
    fn test_string_subtasks_get_generated_ids() {
        let mut raw = sample_task();
        raw["subtasks"] = json!(["first", "second"]);
        let (task, _) = normalize_task(&raw);
        assert_eq!(task.subtask_ids(), vec!["T-100-S01", "T-100-S02"]);
        assert_eq!(task.subtasks[1].title, "second");
        assert_eq!(task.subtasks[1].scope, "backend");
    }

    #[test]
    fn test_single_object_subtask_is_accepted_with_error() {
        let mut raw = sample_task();
        raw["subtasks"] = json!({"subtask_id": "ONLY", "title": "solo"});
        let (task, errors) = normalize_task(&raw);
        assert!(errors.contains(&"subtasks should be an array".to_string()));
        assert_eq!(task.subtask_ids(), vec!["ONLY"]);
    }

    #[test]
    fn test_invalid_subtask_entries_are_skipped() {
        let mut raw = sample_task();
        raw["subtasks"] = json!([42, {"title": "real"}]);
        let (task, errors) = normalize_task(&raw);
        assert!(errors.iter().any(|e| e.contains("index=1")));
        assert_eq!(task.subtasks.len(), 1);
        assert_eq!(task.subtasks[0].subtask_id, "T-100-S02");
    }

    #[test]
    fn test_subtask_inherits_task_criteria_when_not_a_list() {
        let mut raw = sample_task();
        raw["subtasks"] = json!([{"subtask_id": "S1", "acceptance_criteria": "nope"}]);
        let (task, _) = normalize_task(&raw);
        assert_eq!(task.subtasks[0].acceptance_criteria, vec![json!("exports csv")]);
        assert_eq!(task.subtasks[0].title, "Add export");
    }

    #[test]
    fn test_platform_normalization() {
        let mut raw = sample_task();
        raw["platform"] = json!("Mac, linux , windows");
        let (task, _) = normalize_task(&raw);
        assert_eq!(task.platform, vec!["mac", "windows"]);

        raw["platform"] = json!(["linux"]);
        let (task, _) = normalize_task(&raw);
        assert_eq!(task.platform, vec!["both"]);

        assert_eq!(normalize_platform(Some(&json!(7))), vec!["both"]);
        assert!(normalize_platform(Some(&json!(""))).is_empty());
    }

    #[test]
    fn test_normalize_criteria_strings_and_objects() {
        let raw = vec![
            json!("loads fast"),
            json!({"id": "AC-X", "description": "d", "verification": "cargo test", "type": "perf"}),
            json!({"id": "AC-Y", "verify_command": "make check"}),
            json!({"description": "no id"}),
            json!(17),
        ];
        let criteria = normalize_acceptance_criteria(&raw, "S01");
        assert_eq!(criteria.len(), 3);
        assert_eq!(criteria[0].id, "AC-S01-1");
        assert!(criteria[0].verify_command.contains("loads fast"));
        assert_eq!(criteria[1].verify_command, "cargo test");
        assert_eq!(criteria[1].category, "perf");
        assert_eq!(criteria[2].verify_command, "make check");
        assert_eq!(criteria[2].category, "functional");
    }

    #[test]
    fn test_normalized_criteria_survive_renormalizing() {
        let first = normalize_acceptance_criteria(&[json!("loads fast")], "S01");
        let written: Vec<Value> = first.iter().map(|c| serde_json::to_value(c).unwrap()).collect();
        assert!(written[0].get("verification").is_none());

        let second = normalize_acceptance_criteria(&written, "S01");
        assert_eq!(second, first);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.json");
        std::fs::write(&path, sample_task().to_string()).unwrap();
        let (task, errors) = Task::load(&path).unwrap();
        assert!(errors.is_empty());
        assert!(task.find_subtask("S02").is_some());
        assert!(task.find_subtask("S99").is_none());
    }
}
