//! Stage result overview: `collab status`.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use collab::config::Config;
use collab::pipeline::COMPLETED_STATUSES;
use collab::stages::StagePaths;
use collab::util::{load_json, platform_name};

/// Status of one stage file: its `status` field, `missing`, or `parse error`.
pub fn file_status(path: &Path) -> String {
    if !path.exists() {
        return "missing".to_string();
    }
    match load_json(path) {
        Ok(value) => value
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string(),
        Err(_) => "parse error".to_string(),
    }
}

/// Every stage file of a work id, in pipeline order.
pub fn stage_files(paths: &StagePaths, platform: &str) -> Vec<(&'static str, PathBuf)> {
    vec![
        ("validation", paths.validation()),
        ("plan", paths.plan()),
        ("dispatch", paths.dispatch()),
        ("implement", paths.implement()),
        ("verify", paths.verify(platform)),
        ("review", paths.review()),
        ("retrospect", paths.retrospect()),
    ]
}

pub fn cmd_status(config: &Config, work_id: &str) -> Result<i32> {
    let paths = StagePaths::new(config.results_dir.clone(), work_id);

    println!();
    println!("Work {} in {}", style(work_id).bold(), config.results_dir.display());
    println!();
    for (name, path) in stage_files(&paths, platform_name()) {
        let status = file_status(&path);
        let completed = COMPLETED_STATUSES.contains(&status.as_str()) || status == "ready_for_merge";
        let styled = if completed {
            style(status).green()
        } else if status == "missing" {
            style(status).dim()
        } else {
            style(status).red()
        };
        println!("  {:<12} {}", name, styled);
    }
    println!();
    Ok(0)
}
