//! Shared utility functions for the collab crate.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

/// Timestamp format used in every stage result file (UTC, second precision).
pub const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Current UTC time formatted with [`TIMESTAMP_FMT`].
pub fn now_iso() -> String {
    chrono::Utc::now().format(TIMESTAMP_FMT).to_string()
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Derive the short work id for a task file: the first 12 hex chars of its SHA-256.
pub fn derive_work_id(task_bytes: &[u8]) -> String {
    sha256_hex(task_bytes)[..12].to_string()
}

/// Rebuild a JSON value with every object's keys in lexicographic order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// JSON layout shared with other tools that hash stage payloads: `", "` and
/// `": "` separators, non-ASCII escaped as `\uXXXX` (UTF-16 units).
struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() && c != '\x7f' {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Sorted-key JSON text of `value` in the checksum layout.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
    sort_keys(value)
        .serialize(&mut serializer)
        .context("Failed to encode canonical JSON")?;
    Ok(String::from_utf8(out)?)
}

/// SHA-256 over [`canonical_json`] of `value`.
pub fn canonical_checksum(value: &Value) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_json(path: &Path, value: &Value) -> Result<()> {
    ensure_parent(path)?;
    let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Unwrap a `{"payload": {...}}` wrapper when present.
pub fn as_payload(node: &Value) -> &Value {
    match node.get("payload") {
        Some(inner @ Value::Object(_)) => inner,
        _ => node,
    }
}

/// Read an array field as a list of values, treating anything else as empty.
pub fn array_field(value: &Value, key: &str) -> Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Shorten a command line for log output.
pub fn command_trace(cmd: &str) -> String {
    if cmd.chars().count() > 180 {
        let head: String = cmd.chars().take(180).collect();
        format!("{}...", head)
    } else {
        cmd.to_string()
    }
}

/// Truncate text to at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Short platform identifier used in verify result file names.
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}
