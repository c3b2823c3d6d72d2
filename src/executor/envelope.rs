//! Executor output envelopes and their parsing.
//!
//! Executors are frequently themselves JSON-over-subprocess wrappers, so the
//! useful result can sit one level deeper than expected. Parsing is an ordered
//! list of named strategies; the first that recognises the shape wins and
//! anything unrecognised is an explicit failure with an empty result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Passed,
    Failed,
    Simulated,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Passed => "passed",
            EnvelopeStatus::Failed => "failed",
            EnvelopeStatus::Simulated => "simulated",
        }
    }

    /// Passed or simulated: the stage may treat the call as done.
    pub fn is_success(&self) -> bool {
        !matches!(self, EnvelopeStatus::Failed)
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized record of one invocation, written into stage results as `cli_output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub command: String,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub payload_checksum: String,
}

impl Envelope {
    pub fn is_simulated(&self) -> bool {
        self.status == EnvelopeStatus::Simulated
    }

    /// Parse this envelope's stdout.
    pub fn parse(&self) -> ParsedEnvelope {
        parse_cli_envelope(&self.stdout)
    }
}

/// Result of parsing executor stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEnvelope {
    /// A wrapper object (`status` + `stdout`) around the real executor output.
    Wrapped { envelope: Value, result: Value },
    /// A plain JSON object.
    Object { envelope: Value, result: Value },
    /// Empty, non-JSON or non-object output.
    Failed,
}

impl ParsedEnvelope {
    pub fn is_failed(&self) -> bool {
        matches!(self, ParsedEnvelope::Failed)
    }

    pub fn result(&self) -> &Value {
        static EMPTY: Value = Value::Null;
        match self {
            ParsedEnvelope::Wrapped { result, .. } | ParsedEnvelope::Object { result, .. } => result,
            ParsedEnvelope::Failed => &EMPTY,
        }
    }

    /// The result as an object; anything else is treated as empty.
    pub fn result_object(&self) -> Map<String, Value> {
        match self.result() {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Envelope status string: the parsed `status` field, or `failed`.
    pub fn status(&self) -> &str {
        match self {
            ParsedEnvelope::Wrapped { envelope, .. } | ParsedEnvelope::Object { envelope, .. } => {
                envelope
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("")
            }
            ParsedEnvelope::Failed => "failed",
        }
    }
}

type Strategy = fn(&Value) -> Option<ParsedEnvelope>;

/// Parse strategies in priority order.
const STRATEGIES: &[(&str, Strategy)] = &[("wrapper", parse_wrapper), ("object", parse_object)];

/// Parse executor stdout into a [`ParsedEnvelope`].
pub fn parse_cli_envelope(stdout: &str) -> ParsedEnvelope {
    if stdout.is_empty() {
        return ParsedEnvelope::Failed;
    }
    let Ok(value) = serde_json::from_str::<Value>(stdout) else {
        return ParsedEnvelope::Failed;
    };
    for (name, strategy) in STRATEGIES {
        if let Some(parsed) = strategy(&value) {
            tracing::trace!(strategy = name, "Parsed executor output");
            return parsed;
        }
    }
    ParsedEnvelope::Failed
}

fn parse_wrapper(value: &Value) -> Option<ParsedEnvelope> {
    let outer = value.as_object()?;
    if !(outer.contains_key("status") && outer.contains_key("stdout")) {
        return None;
    }
    let inner = outer
        .get("stdout")
        .and_then(Value::as_str)
        .and_then(|text| serde_json::from_str::<Value>(text).ok());
    let result = match inner {
        Some(Value::Object(inner)) => match inner.get("result") {
            Some(result) => result.clone(),
            None => Value::Object(inner),
        },
        Some(_) => Value::Object(Map::new()),
        None => outer
            .get("result")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    };
    Some(ParsedEnvelope::Wrapped {
        envelope: value.clone(),
        result,
    })
}

fn parse_object(value: &Value) -> Option<ParsedEnvelope> {
    let object = value.as_object()?;
    let result = object.get("result").cloned().unwrap_or_else(|| value.clone());
    Some(ParsedEnvelope::Object {
        envelope: value.clone(),
        result,
    })
}
