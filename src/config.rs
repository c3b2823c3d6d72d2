use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::collab_config::{CollabToml, validate_executor};
use crate::executor::ExecutorSettings;
use crate::verify::parse_verify_commands;

/// Name of the per-project state directory.
pub const COLLAB_DIR: &str = ".collab";

/// Flags from the command line that override every other layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: bool,
    pub simulate: bool,
    pub results_dir: Option<PathBuf>,
    pub verify_commands: Option<String>,
}

/// Runtime configuration for collab.
///
/// Bridges the `collab.toml` file, the environment and CLI flags into the
/// values the pipeline actually uses.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub collab_dir: PathBuf,
    pub results_dir: PathBuf,
    pub executor: ExecutorSettings,
    pub max_workers: usize,
    pub log_level: Option<String>,
    pub verify_commands: Vec<String>,
    pub verbose: bool,
    toml: CollabToml,
}

impl Config {
    /// Resolve every layer against an explicit environment lookup.
    ///
    /// Returns the config and the warnings collected along the way.
    pub fn resolve<F>(
        project_dir: &Path,
        toml: CollabToml,
        lookup: F,
        cli: &CliOverrides,
    ) -> (Self, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut executor, mut warnings) = toml.resolve_executor(&lookup);
        if cli.simulate {
            executor.simulate = true;
        }
        warnings.extend(toml.validate());

        let results_dir = match &cli.results_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(toml.resolve_results_dir(&lookup)),
        };
        let results_dir = if results_dir.is_absolute() {
            results_dir
        } else {
            project_dir.join(results_dir)
        };

        let verify_commands = cli
            .verify_commands
            .clone()
            .or_else(|| toml.resolve_verify_commands(&lookup))
            .map(|raw| parse_verify_commands(&raw))
            .filter(|cmds| !cmds.is_empty())
            .unwrap_or_else(|| {
                toml.pipeline
                    .default_verify_commands
                    .iter()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            });

        let config = Self {
            project_dir: project_dir.to_path_buf(),
            collab_dir: project_dir.join(COLLAB_DIR),
            results_dir,
            max_workers: toml.pipeline.max_workers.max(1),
            log_level: toml.pipeline.log_level.clone(),
            verify_commands,
            verbose: cli.verbose,
            executor,
            toml,
        };
        (config, warnings)
    }

    /// Load from the process environment and `<project>/.collab/collab.toml`.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let toml = CollabToml::load_or_default(&project_dir.join(COLLAB_DIR))?;
        let (config, warnings) =
            Self::resolve(&project_dir, toml, |key| std::env::var(key).ok(), cli);
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(config)
    }

    pub fn toml(&self) -> &CollabToml {
        &self.toml
    }

    pub fn config_path(&self) -> PathBuf {
        self.collab_dir.join(crate::collab_config::CONFIG_FILE)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.results_dir).with_context(|| {
            format!("Failed to create results directory {}", self.results_dir.display())
        })
    }

    /// Every warning about the effective configuration.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        warnings.extend(validate_executor(&self.executor));
        if self.verify_commands.is_empty() {
            warnings.push(
                "No verify commands configured; the verify stage will fail. Set VERIFY_COMMANDS or [pipeline].default_verify_commands".to_string(),
            );
        }
        warnings
    }
}
