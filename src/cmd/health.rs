//! Executor health probe: `collab health`.

use anyhow::Result;
use std::path::Path;

use collab::config::Config;
use collab::util::write_json;

pub async fn cmd_health(config: &Config, out: Option<&Path>) -> Result<i32> {
    let report = collab::health::check(&config.executor, &config.project_dir).await;
    let value = serde_json::to_value(&report)?;
    match out {
        Some(path) => {
            write_json(path, &value)?;
            println!("Health report written to {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(report.exit_code())
}
