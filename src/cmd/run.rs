//! Full pipeline orchestration: `collab run`.

use anyhow::Result;
use console::style;
use tokio::sync::mpsc;

use collab::config::Config;
use collab::pipeline::{PipelineDriver, PipelineEvent, PipelineMode, RunOptions, Stage};

use super::super::WorkArgs;
use super::{build_context, require_task};

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { step, total, stage } => {
            println!(
                "{} {}...",
                style(format!("[{}/{}]", step, total)).cyan().bold(),
                stage.label()
            );
        }
        PipelineEvent::StageSkipped { step, total, stage } => {
            println!(
                "{} {} {}",
                style(format!("[{}/{}]", step, total)).dim(),
                stage.label(),
                style("(skipped, already completed)").dim()
            );
        }
        PipelineEvent::StageFinished { stage, exit_code } if *exit_code != 0 => {
            println!(
                "    {} {} exited with code {}",
                style("✗").red().bold(),
                stage,
                exit_code
            );
        }
        PipelineEvent::StageFinished { .. } => {}
        PipelineEvent::ChunkStarted { chunk_id, role } => {
            println!("    {} {} ({})", style("→").dim(), chunk_id, role);
        }
        PipelineEvent::ChunkFinished { chunk_id, exit_code } => {
            if *exit_code == 0 {
                println!("    {} {}", style("✓").green(), chunk_id);
            } else {
                println!(
                    "    {} {} (exit {})",
                    style("✗").red(),
                    chunk_id,
                    exit_code
                );
            }
        }
        PipelineEvent::ChunkSkipped { chunk_id, reason } => {
            println!("    {} {}: {}", style("⊘").yellow(), chunk_id, reason);
        }
        PipelineEvent::RetrospectFinished { exit_code } => {
            if *exit_code != 0 {
                println!("    {} retrospective exited with code {}", style("✗").red(), exit_code);
            }
        }
        PipelineEvent::RunFinished { .. } => {}
    }
}

pub async fn cmd_run(
    config: &Config,
    work: &WorkArgs,
    mode: PipelineMode,
    resume: bool,
    force_stage: Option<Stage>,
) -> Result<i32> {
    let task_path = require_task(work)?.to_path_buf();
    let ctx = build_context(config, work)?;
    let work_id = ctx.work_id.clone();
    let review_path = ctx.paths.review();
    let implement_path = ctx.paths.implement();

    println!();
    println!(
        "{} work_id={} mode={:?}{}",
        style("collab").bold(),
        work_id,
        mode,
        if ctx.invoker.simulating() { " (simulated)" } else { "" }
    );
    println!();

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let driver = PipelineDriver::new(ctx).with_event_channel(tx);
    let options = RunOptions {
        task_path,
        mode,
        resume,
        force_stage,
    };
    let result = driver.run(&options).await;
    drop(driver);
    printer.await.ok();
    let outcome = result?;

    println!();
    if outcome.exit.is_success() {
        println!("{} Pipeline complete", style("✓").green().bold());
    } else {
        let stage = outcome
            .failed_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "retrospect".to_string());
        println!(
            "{} Pipeline stopped at {} (exit {})",
            style("✗").red().bold(),
            stage,
            outcome.exit.code()
        );
    }
    match mode {
        PipelineMode::Full => super::print_result_path("review", &review_path),
        PipelineMode::ImplementOnly => super::print_result_path("implement", &implement_path),
    }
    Ok(outcome.exit.code())
}
