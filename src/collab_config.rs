//! Layered configuration for collab.
//!
//! Settings come from four layers, lowest first:
//! 1. Built-in defaults
//! 2. `.collab/collab.toml`
//! 3. Environment variables
//! 4. CLI flags (applied by [`crate::config::Config`])
//!
//! # Configuration File Format
//!
//! ```toml
//! [executor]
//! architect_cmd = "claude-wrapper"
//! builder_cmd = "codex-wrapper"
//! max_retries = 2
//! retry_sleep_secs = 20
//! timeout_secs = 300
//! rate_limit_secs = 2
//! simulate = false
//!
//! [pipeline]
//! results_dir = ".collab/results"
//! max_workers = 4
//! log_level = "info"
//! default_verify_commands = ["cargo test"]
//! ```
//!
//! Environment resolution takes a lookup closure instead of reading the
//! process environment directly, so every layer can be tested without
//! touching global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::executor::ExecutorSettings;
use crate::role::Role;

pub const CONFIG_FILE: &str = "collab.toml";

/// Values accepted as "on" for `SIMULATE_AGENTS`.
const TRUTHY: [&str; 4] = ["1", "true", "TRUE", "True"];

/// `[executor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub architect_cmd: Option<String>,
    #[serde(default)]
    pub builder_cmd: Option<String>,
    /// Attempts per invocation (not retries after the first).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_sleep_secs")]
    pub retry_sleep_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay before every invocation after the first one.
    #[serde(default)]
    pub rate_limit_secs: u64,
    #[serde(default)]
    pub simulate: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_sleep_secs() -> u64 {
    20
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            architect_cmd: None,
            builder_cmd: None,
            max_retries: default_max_retries(),
            retry_sleep_secs: default_retry_sleep_secs(),
            timeout_secs: default_timeout_secs(),
            rate_limit_secs: 0,
            simulate: false,
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Stage result directory, relative to the project directory.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    /// Upper bound on concurrent implement chunks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub default_verify_commands: Vec<String>,
}

fn default_results_dir() -> String {
    ".collab/results".to_string()
}

fn default_max_workers() -> usize {
    4
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            max_workers: default_max_workers(),
            log_level: None,
            default_verify_commands: Vec::new(),
        }
    }
}

/// The complete collab.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollabToml {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl CollabToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse collab.toml")
    }

    /// Load `<collab_dir>/collab.toml`, or defaults when it does not exist.
    pub fn load_or_default(collab_dir: &Path) -> Result<Self> {
        let config_path = collab_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize collab.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve executor settings from this file and an environment lookup.
    ///
    /// Returns the settings plus a warning for each environment value that
    /// could not be parsed (the file value is kept in that case).
    pub fn resolve_executor<F>(&self, lookup: F) -> (ExecutorSettings, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let file = &self.executor;

        let architect_cmd = env_command(&lookup, &["ARCHITECT_CMD", "CLAUDE_CODE_CMD"])
            .or_else(|| non_empty(file.architect_cmd.as_deref()));
        let builder_cmd = env_command(&lookup, &["BUILDER_CMD", "CODEX_CLI_CMD"])
            .or_else(|| non_empty(file.builder_cmd.as_deref()));

        let simulate = match lookup("SIMULATE_AGENTS") {
            Some(raw) => TRUTHY.contains(&raw.trim()),
            None => file.simulate,
        };

        let settings = ExecutorSettings {
            architect_cmd,
            builder_cmd,
            max_retries: env_number(&lookup, "AGENT_MAX_RETRIES", file.max_retries, &mut warnings),
            retry_sleep_secs: env_number(
                &lookup,
                "AGENT_RETRY_SLEEP",
                file.retry_sleep_secs,
                &mut warnings,
            ),
            timeout_secs: env_number(&lookup, "CLI_TIMEOUT_SECONDS", file.timeout_secs, &mut warnings),
            rate_limit_secs: env_number(
                &lookup,
                "AGENT_RATE_LIMIT",
                file.rate_limit_secs,
                &mut warnings,
            ),
            simulate,
        };
        (settings, warnings)
    }

    /// Results directory: `COLLAB_RESULTS_DIR`, else the file value.
    pub fn resolve_results_dir<F>(&self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup("COLLAB_RESULTS_DIR").as_deref())
            .unwrap_or_else(|| self.pipeline.results_dir.clone())
    }

    /// Raw verify command text from `VERIFY_COMMANDS`, if set and non-blank.
    pub fn resolve_verify_commands<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup("VERIFY_COMMANDS").as_deref())
    }

    /// Validate the file on its own and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.executor.max_retries == 0 {
            warnings.push(
                "executor.max_retries is 0: every invocation fails without running".to_string(),
            );
        }
        if self.executor.timeout_secs == 0 {
            warnings.push("executor.timeout_secs is 0: every invocation times out".to_string());
        }
        if self.pipeline.max_workers == 0 {
            warnings.push("pipeline.max_workers is 0: treated as 1".to_string());
        }
        if let Some(level) = &self.pipeline.log_level
            && tracing_subscriber::EnvFilter::try_new(level).is_err()
        {
            warnings.push(format!("Invalid pipeline.log_level '{}'", level));
        }
        warnings
    }
}

/// Warnings about a resolved executor configuration.
pub fn validate_executor(settings: &ExecutorSettings) -> Vec<String> {
    let mut warnings = Vec::new();
    if settings.simulate {
        return warnings;
    }
    for role in [Role::Architect, Role::Builder] {
        if settings.command_for(role).is_none() {
            warnings.push(format!(
                "No {} command configured and simulation is off; set {} or SIMULATE_AGENTS=1",
                role,
                ExecutorSettings::env_var_for(role)
            ));
        }
    }
    warnings
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_command<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| non_empty(lookup(key).as_deref()))
}

fn env_number<F, T>(lookup: &F, key: &str, fallback: T, warnings: &mut Vec<String>) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warnings.push(format!("Ignoring invalid {}='{}'", key, raw));
                fallback
            }
        },
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let toml = CollabToml::default();
        assert_eq!(toml.executor.max_retries, 2);
        assert_eq!(toml.executor.retry_sleep_secs, 20);
        assert_eq!(toml.executor.timeout_secs, 300);
        assert_eq!(toml.executor.rate_limit_secs, 0);
        assert!(!toml.executor.simulate);
        assert_eq!(toml.pipeline.results_dir, ".collab/results");
        assert_eq!(toml.pipeline.max_workers, 4);
    }

    #[test]
    fn test_parse_partial_file_fills_defaults() {
        let toml = CollabToml::parse(
            r#"
            [executor]
            builder_cmd = "codex-wrap"
            timeout_secs = 60

            [pipeline]
            default_verify_commands = ["cargo test", "cargo clippy"]
            "#,
        )
        .unwrap();
        assert_eq!(toml.executor.builder_cmd.as_deref(), Some("codex-wrap"));
        assert_eq!(toml.executor.timeout_secs, 60);
        assert_eq!(toml.executor.max_retries, 2);
        assert_eq!(toml.pipeline.default_verify_commands.len(), 2);
        assert_eq!(toml.pipeline.max_workers, 4);
    }

    #[test]
    fn test_parse_invalid_toml_errors() {
        assert!(CollabToml::parse("[executor\nmax_retries = ").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = CollabToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.executor.max_retries, 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut toml = CollabToml::default();
        toml.executor.architect_cmd = Some("arch".into());
        toml.pipeline.max_workers = 2;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();
        let loaded = CollabToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.executor.architect_cmd.as_deref(), Some("arch"));
        assert_eq!(loaded.pipeline.max_workers, 2);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = CollabToml::default();
        toml.executor.builder_cmd = Some("from-file".into());
        toml.executor.max_retries = 5;
        let (settings, warnings) = toml.resolve_executor(env(&[
            ("BUILDER_CMD", "from-env"),
            ("AGENT_MAX_RETRIES", "3"),
            ("AGENT_RETRY_SLEEP", "0"),
            ("CLI_TIMEOUT_SECONDS", "15"),
            ("AGENT_RATE_LIMIT", "1"),
        ]));
        assert!(warnings.is_empty());
        assert_eq!(settings.builder_cmd.as_deref(), Some("from-env"));
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_sleep_secs, 0);
        assert_eq!(settings.timeout_secs, 15);
        assert_eq!(settings.rate_limit_secs, 1);
    }

    #[test]
    fn test_legacy_command_aliases() {
        let toml = CollabToml::default();
        let (settings, _) = toml.resolve_executor(env(&[
            ("CLAUDE_CODE_CMD", "claude -p"),
            ("CODEX_CLI_CMD", "codex exec"),
        ]));
        assert_eq!(settings.architect_cmd.as_deref(), Some("claude -p"));
        assert_eq!(settings.builder_cmd.as_deref(), Some("codex exec"));

        let (settings, _) = toml.resolve_executor(env(&[
            ("ARCHITECT_CMD", "new"),
            ("CLAUDE_CODE_CMD", "old"),
        ]));
        assert_eq!(settings.architect_cmd.as_deref(), Some("new"));
    }

    #[test]
    fn test_blank_env_command_falls_back_to_file() {
        let mut toml = CollabToml::default();
        toml.executor.architect_cmd = Some("file-arch".into());
        let (settings, _) = toml.resolve_executor(env(&[("ARCHITECT_CMD", "   ")]));
        assert_eq!(settings.architect_cmd.as_deref(), Some("file-arch"));
    }

    #[test]
    fn test_invalid_number_warns_and_keeps_file_value() {
        let toml = CollabToml::default();
        let (settings, warnings) = toml.resolve_executor(env(&[("AGENT_MAX_RETRIES", "lots")]));
        assert_eq!(settings.max_retries, 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("AGENT_MAX_RETRIES"));
    }

    #[test]
    fn test_simulate_truthy_values() {
        let toml = CollabToml::default();
        for value in ["1", "true", "TRUE", "True", " 1 "] {
            let (settings, _) = toml.resolve_executor(env(&[("SIMULATE_AGENTS", value)]));
            assert!(settings.simulate, "{} should enable simulation", value);
        }
        for value in ["0", "yes", "false"] {
            let (settings, _) = toml.resolve_executor(env(&[("SIMULATE_AGENTS", value)]));
            assert!(!settings.simulate, "{} should not enable simulation", value);
        }
    }

    #[test]
    fn test_simulate_env_overrides_file() {
        let mut toml = CollabToml::default();
        toml.executor.simulate = true;
        let (settings, _) = toml.resolve_executor(env(&[]));
        assert!(settings.simulate);
        let (settings, _) = toml.resolve_executor(env(&[("SIMULATE_AGENTS", "0")]));
        assert!(!settings.simulate);
    }

    #[test]
    fn test_results_dir_and_verify_commands_from_env() {
        let toml = CollabToml::default();
        assert_eq!(toml.resolve_results_dir(env(&[])), ".collab/results");
        assert_eq!(
            toml.resolve_results_dir(env(&[("COLLAB_RESULTS_DIR", "out")])),
            "out"
        );
        assert_eq!(toml.resolve_verify_commands(env(&[])), None);
        assert_eq!(
            toml.resolve_verify_commands(env(&[("VERIFY_COMMANDS", "make test")])),
            Some("make test".to_string())
        );
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut toml = CollabToml::default();
        assert!(toml.validate().is_empty());
        toml.executor.max_retries = 0;
        toml.pipeline.max_workers = 0;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_validate_executor_requires_commands_unless_simulating() {
        let (settings, _) = CollabToml::default().resolve_executor(env(&[]));
        let warnings = validate_executor(&settings);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("ARCHITECT_CMD"));

        let (settings, _) =
            CollabToml::default().resolve_executor(env(&[("SIMULATE_AGENTS", "1")]));
        assert!(validate_executor(&settings).is_empty());
    }
}
