//! Configuration view and validation commands: `collab config`.

use anyhow::Result;

use collab::collab_config::CollabToml;
use collab::config::Config;

use super::super::ConfigCommands;

fn show_optional(value: &Option<String>) -> String {
    match value {
        Some(v) => format!("\"{}\"", v),
        None => "(not set)".to_string(),
    }
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<i32> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Collab Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No collab.toml found at {} (using defaults)", config_path.display());
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            let executor = &config.executor;
            println!("[executor]");
            println!("  architect_cmd = {}", show_optional(&executor.architect_cmd));
            println!("  builder_cmd = {}", show_optional(&executor.builder_cmd));
            println!("  max_retries = {}", executor.max_retries);
            println!("  retry_sleep_secs = {}", executor.retry_sleep_secs);
            println!("  timeout_secs = {}", executor.timeout_secs);
            println!("  rate_limit_secs = {}", executor.rate_limit_secs);
            println!("  simulate = {}", executor.simulate);
            println!();
            println!("[pipeline]");
            println!("  results_dir = \"{}\"", config.results_dir.display());
            println!("  max_workers = {}", config.max_workers);
            println!("  log_level = {}", show_optional(&config.log_level));
            println!("  verify_commands = {:?}", config.verify_commands);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.warnings();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("collab.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }
            std::fs::create_dir_all(&config.collab_dir)?;
            CollabToml::default().save(&config_path)?;

            println!("Created collab.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [executor] architect_cmd, builder_cmd, retries and timeouts");
            println!("  - [pipeline] results_dir, max_workers, default_verify_commands");
            println!();
        }
    }

    Ok(0)
}
