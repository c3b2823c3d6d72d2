//! Stage result files and the stage exit-code contract.

use anyhow::Result;
use serde_json::{Map, Value};
use std::path::Path;

use crate::util::{canonical_checksum, now_iso, write_json};

/// Exit outcome of one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Exit 0.
    Success,
    /// Exit 1: usage, missing input or fatal configuration error.
    Fatal,
    /// Exit 2: validation failure, blocked or failed gate.
    Blocked,
}

impl StageExit {
    pub fn code(&self) -> i32 {
        match self {
            StageExit::Success => 0,
            StageExit::Fatal => 1,
            StageExit::Blocked => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageExit::Success)
    }

    /// `Success` when `ok`, otherwise `Blocked`.
    pub fn gate(ok: bool) -> Self {
        if ok {
            StageExit::Success
        } else {
            StageExit::Blocked
        }
    }
}

/// Wrap `payload` with `{agent, work_id, generated_at, checksum}` and write it.
///
/// The checksum covers the payload only, so rewriting identical content
/// produces an identical checksum even though `generated_at` moves.
/// Payload keys override the meta keys on collision. Returns the written report.
pub fn write_with_meta(agent: &str, work_id: &str, payload: &Value, path: &Path) -> Result<Value> {
    let mut report = Map::new();
    report.insert("agent".into(), Value::String(agent.to_string()));
    report.insert("work_id".into(), Value::String(work_id.to_string()));
    report.insert("generated_at".into(), Value::String(now_iso()));
    report.insert("checksum".into(), Value::String(canonical_checksum(payload)?));
    if let Value::Object(fields) = payload {
        for (key, value) in fields {
            report.insert(key.clone(), value.clone());
        }
    }
    let report = Value::Object(report);
    write_json(path, &report)?;
    tracing::debug!(agent, work_id, path = %path.display(), "Wrote stage result");
    Ok(report)
}

/// Read the `status` field of a stage result file, unwrapping `payload` wrappers.
pub fn read_status(path: &Path) -> Option<String> {
    let value = crate::util::load_json(path).ok()?;
    crate::util::as_payload(&value)
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string)
}
