//! Integration tests for collab
//!
//! These tests drive the `collab` binary end to end, mostly in simulation
//! mode, and inspect the stage result files it leaves behind.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ENV_KNOBS: [&str; 13] = [
    "ARCHITECT_CMD",
    "BUILDER_CMD",
    "CLAUDE_CODE_CMD",
    "CODEX_CLI_CMD",
    "SIMULATE_AGENTS",
    "VERIFY_COMMANDS",
    "COLLAB_RESULTS_DIR",
    "AGENT_MAX_RETRIES",
    "AGENT_RETRY_SLEEP",
    "CLI_TIMEOUT_SECONDS",
    "AGENT_RATE_LIMIT",
    "RUST_LOG",
    "NO_COLOR",
];

/// Helper to create a collab Command rooted in `dir` with a clean environment
fn collab(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("collab");
    cmd.current_dir(dir.path());
    for key in ENV_KNOBS {
        cmd.env_remove(key);
    }
    cmd
}

fn write_task(dir: &TempDir, value: Value) -> PathBuf {
    let path = dir.path().join("task.json");
    fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

fn sample_task(dir: &TempDir) -> PathBuf {
    write_task(
        dir,
        serde_json::json!({
            "task_id": "T1",
            "title": "Add login",
            "scope": "auth",
            "risk_level": "low",
            "priority": "high",
            "acceptance_criteria": ["login works"],
            "subtasks": [
                {"subtask_id": "S01", "title": "backend", "estimated_minutes": 90},
                {"subtask_id": "S02", "title": "docs", "owner": "claude", "depends_on": ["S01"]}
            ]
        }),
    )
}

fn results_dir(dir: &TempDir) -> PathBuf {
    dir.path().join(".collab/results")
}

fn read(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn status_of(path: &Path) -> String {
    read(path)["status"].as_str().unwrap_or_default().to_string()
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    format!("sh {}", path.display())
}

fn simulated_run(dir: &TempDir, extra: &[&str]) -> assert_cmd::assert::Assert {
    sample_task(dir);
    collab(dir)
        .args(["--simulate", "run", "--task", "task.json", "--work-id", "w1"])
        .args(["--verify-commands", "true"])
        .args(extra)
        .assert()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_collab_help() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("health"));
    }

    #[test]
    fn test_collab_version() {
        let dir = TempDir::new().unwrap();
        collab(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_invalid_force_stage_is_rejected() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["run", "--task", "task.json", "--force-stage", "deploy"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Pipeline Tests
// =============================================================================

mod pipeline {
    use super::*;

    #[test]
    fn test_simulated_full_run() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &[])
            .success()
            .stdout(predicate::str::contains("[1/7] Validating task"))
            .stdout(predicate::str::contains("[7/7] Reviewing & retrospective"))
            .stdout(predicate::str::contains("Pipeline complete"));

        let results = results_dir(&dir);
        assert_eq!(status_of(&results.join("validation_w1.json")), "ready");
        assert_eq!(status_of(&results.join("plan_w1.json")), "done");
        assert_eq!(status_of(&results.join("dispatch_w1.json")), "done");
        assert!(results.join("dispatch_w1.matrix.json").exists());
        assert_eq!(status_of(&results.join("implement_w1.json")), "done");
        assert_eq!(status_of(&results.join("review_w1.json")), "ready_for_merge");
        assert_eq!(status_of(&results.join("retrospect_w1.json")), "ready");

        let merged = read(&results.join("implement_w1.json"));
        assert_eq!(merged["missing_subtasks"], serde_json::json!([]));
        let verify_files: Vec<_> = fs::read_dir(&results)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("verify_w1_") && name.ends_with(".json"))
            .collect();
        assert_eq!(verify_files.len(), 1);
    }

    #[test]
    fn test_stage_results_carry_metadata() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &[]).success();
        let plan = read(&results_dir(&dir).join("plan_w1.json"));
        assert_eq!(plan["work_id"], "w1");
        assert_eq!(plan["checksum"].as_str().unwrap().len(), 64);
        assert!(plan["generated_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_work_id_derived_from_task() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["--simulate", "run", "--task", "task.json", "--verify-commands", "true"])
            .assert()
            .success();
        let derived: Vec<_> = fs::read_dir(results_dir(&dir))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("validation_"))
            .collect();
        assert_eq!(derived.len(), 1);
        // validation_ + 12 hex chars + .json
        assert_eq!(derived[0].len(), "validation_".len() + 12 + ".json".len());
    }

    #[test]
    fn test_implement_only_stops_after_merge() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &["--mode", "implement-only"])
            .success()
            .stdout(predicate::str::contains("[5/5] Merging results"));
        let results = results_dir(&dir);
        assert!(results.join("implement_w1.json").exists());
        assert!(!results.join("review_w1.json").exists());
        assert!(!results.join("retrospect_w1.json").exists());
    }

    #[test]
    fn test_resume_skips_completed_stages() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &[]).success();
        simulated_run(&dir, &["--resume"])
            .success()
            .stdout(predicate::str::contains("skipped, already completed"));
    }

    #[test]
    fn test_force_stage_reruns_from_stage() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &[]).success();
        simulated_run(&dir, &["--resume", "--force-stage", "verify"])
            .success()
            .stdout(predicate::str::contains("[6/7] Verifying..."));
    }

    #[test]
    fn test_missing_verify_commands_fails() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["--simulate", "run", "--task", "task.json", "--work-id", "w1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Pipeline stopped at verify"));
        let verify = fs::read_dir(results_dir(&dir))
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("verify_w1_"))
            .unwrap();
        assert_eq!(status_of(&verify.path()), "failed");
    }

    #[test]
    fn test_failing_verify_command_blocks() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["--simulate", "run", "--task", "task.json", "--work-id", "w1"])
            .args(["--verify-commands", "false"])
            .assert()
            .code(2);
        assert!(!results_dir(&dir).join("review_w1.json").exists());
    }

    #[test]
    fn test_invalid_task_exits_2() {
        let dir = TempDir::new().unwrap();
        write_task(&dir, serde_json::json!({"title": "no id"}));
        collab(&dir)
            .args(["--simulate", "run", "--task", "task.json", "--work-id", "w1"])
            .args(["--verify-commands", "true"])
            .assert()
            .code(2);
        let validation = read(&results_dir(&dir).join("validation_w1.json"));
        assert_eq!(validation["status"], "blocked");
        assert!(!validation["validation_errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_missing_executor_is_fatal() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["run", "--task", "task.json", "--work-id", "w1"])
            .args(["--verify-commands", "true"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("ARCHITECT_CMD"));
        // The failure is still recorded before the process exits.
        assert_eq!(status_of(&results_dir(&dir).join("plan_w1.json")), "failed");
    }

    #[test]
    fn test_run_with_script_executors() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        let executor = write_script(
            &dir,
            "executor.sh",
            r#"cat >/dev/null
echo '{"status": "passed", "result": {"files_changed": ["src/lib.rs"], "summary": "ok"}}'"#,
        );
        collab(&dir)
            .env("ARCHITECT_CMD", &executor)
            .env("BUILDER_CMD", &executor)
            .args(["run", "--task", "task.json", "--work-id", "w1"])
            .args(["--verify-commands", "true"])
            .assert()
            .success();

        let merged = read(&results_dir(&dir).join("implement_w1.json"));
        assert_eq!(merged["files_changed"], serde_json::json!(["src/lib.rs"]));
        assert_eq!(status_of(&results_dir(&dir).join("review_w1.json")), "ready_for_merge");
    }
}

// =============================================================================
// Single Stage Tests
// =============================================================================

mod stages {
    use super::*;

    #[test]
    fn test_validate_requires_task() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["validate", "--work-id", "w1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("--task"));
    }

    #[test]
    fn test_implement_single_subtask() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["--simulate", "implement", "--task", "task.json", "--work-id", "w1"])
            .args(["--subtask-id", "S02"])
            .assert()
            .success();
        let result = read(&results_dir(&dir).join("implement_w1_S02.json"));
        assert_eq!(result["status"], "done");
        assert_eq!(result["agent"], "claude");
    }

    #[test]
    fn test_implement_unknown_subtask() {
        let dir = TempDir::new().unwrap();
        sample_task(&dir);
        collab(&dir)
            .args(["--simulate", "implement", "--task", "task.json", "--work-id", "w1"])
            .args(["--subtask-id", "S99"])
            .assert()
            .code(1);
    }

    #[test]
    fn test_merge_reports_missing_subtasks() {
        let dir = TempDir::new().unwrap();
        let results = results_dir(&dir);
        fs::create_dir_all(&results).unwrap();
        fs::write(
            results.join("dispatch_w1.json"),
            r#"{"status": "done", "subtasks": [{"subtask_id": "S01"}, {"subtask_id": "S02"}]}"#,
        )
        .unwrap();
        fs::write(
            results.join("implement_w1_S01.json"),
            r#"{"status": "done", "subtask": {"subtask_id": "S01"}, "files_changed": ["b", "a"]}"#,
        )
        .unwrap();

        collab(&dir)
            .args(["merge", "--work-id", "w1"])
            .assert()
            .code(2);
        let merged = read(&results.join("implement_w1.json"));
        assert_eq!(merged["status"], "failed");
        assert_eq!(merged["missing_subtasks"], serde_json::json!(["S02"]));
        assert_eq!(merged["files_changed"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_merge_without_results_is_blocked() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["merge", "--work-id", "w1"])
            .assert()
            .code(2);
        assert_eq!(status_of(&results_dir(&dir).join("implement_w1.json")), "blocked");
    }

    #[test]
    fn test_retrospect_without_review() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["retrospect", "--work-id", "w1"])
            .assert()
            .code(1);
        assert_eq!(status_of(&results_dir(&dir).join("retrospect_w1.json")), "blocked");
    }
}

// =============================================================================
// Status, Health and Config Tests
// =============================================================================

mod commands {
    use super::*;

    #[test]
    fn test_status_after_run() {
        let dir = TempDir::new().unwrap();
        simulated_run(&dir, &[]).success();
        collab(&dir)
            .args(["status", "--work-id", "w1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ready_for_merge"))
            .stdout(predicate::str::contains("retrospect"));
    }

    #[test]
    fn test_status_unknown_work() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["status", "--work-id", "nope"])
            .assert()
            .success()
            .stdout(predicate::str::contains("missing"));
    }

    #[test]
    fn test_health_simulated() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["--simulate", "health"])
            .assert()
            .success()
            .stdout(predicate::str::contains("skipped"));
    }

    #[test]
    fn test_health_unconfigured() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["health", "--out", "health.json"])
            .assert()
            .code(1);
        let report = read(&dir.path().join("health.json"));
        assert_eq!(report["executors"][0]["status"], "not_configured");
    }

    #[test]
    fn test_config_show_and_validate() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("architect_cmd = (not set)"))
            .stdout(predicate::str::contains("max_workers = 4"));
        collab(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ARCHITECT_CMD"));
    }

    #[test]
    fn test_config_init_and_file_values() {
        let dir = TempDir::new().unwrap();
        collab(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created collab.toml"));
        assert!(dir.path().join(".collab/collab.toml").exists());

        fs::write(
            dir.path().join(".collab/collab.toml"),
            "[executor]\narchitect_cmd = \"arch-tool\"\n\n[pipeline]\nmax_workers = 2\n",
        )
        .unwrap();
        collab(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("architect_cmd = \"arch-tool\""))
            .stdout(predicate::str::contains("max_workers = 2"));
    }
}
