//! Single-stage commands: `collab validate|plan|split|implement|merge|verify|review|retrospect`.

use anyhow::Result;
use std::path::PathBuf;

use collab::config::Config;
use collab::merge::{MergeInput, MergeRequest};
use collab::pipeline::Stage;
use collab::report::StageExit;
use collab::stages;

use super::super::WorkArgs;
use super::{build_context, print_result_path, require_task};

/// Options of `collab merge`.
pub struct MergeArgs {
    pub kind: String,
    pub input: Option<String>,
    pub out: Option<PathBuf>,
    pub dispatch: Option<PathBuf>,
}

pub async fn cmd_stage(config: &Config, work: &WorkArgs, stage: Stage) -> Result<i32> {
    let ctx = build_context(config, work)?;
    let (exit, path) = match stage {
        Stage::Validate => (stages::validate(&ctx, require_task(work)?)?, ctx.paths.validation()),
        Stage::Plan => (stages::plan(&ctx, require_task(work)?).await?, ctx.paths.plan()),
        Stage::Split => (stages::split(&ctx, require_task(work)?)?, ctx.paths.dispatch()),
        Stage::Implement => (
            stages::implement_all(&ctx, require_task(work)?).await?,
            ctx.paths.implement(),
        ),
        Stage::Merge => (stages::merge(&ctx, None)?, ctx.paths.implement()),
        Stage::Verify => (stages::verify(&ctx).await?, ctx.paths.verify(&ctx.platform)),
        Stage::Review => (stages::review(&ctx)?, ctx.paths.review()),
    };
    print_result_path(stage.as_str(), &path);
    Ok(exit.code())
}

pub async fn cmd_implement(config: &Config, work: &WorkArgs, subtask_id: Option<&str>) -> Result<i32> {
    let Some(subtask_id) = subtask_id else {
        return cmd_stage(config, work, Stage::Implement).await;
    };
    let ctx = build_context(config, work)?;
    let exit = stages::implement_one(&ctx, require_task(work)?, subtask_id).await?;
    print_result_path(subtask_id, &ctx.paths.implement_chunk(subtask_id));
    Ok(exit.code())
}

pub fn cmd_merge(config: &Config, work: &WorkArgs, args: MergeArgs) -> Result<i32> {
    let ctx = build_context(config, work)?;
    let input = args
        .input
        .as_deref()
        .map(MergeInput::from_arg)
        .unwrap_or_else(|| MergeInput::Directory(ctx.paths.results_dir.clone()));
    let out = args.out.unwrap_or_else(|| {
        ctx.paths
            .results_dir
            .join(format!("{}_{}.json", args.kind, ctx.work_id))
    });
    // The stage's own manifest is only implied for implement merges that have one.
    let dispatch = args.dispatch.or_else(|| {
        let default = ctx.paths.dispatch();
        (args.kind == "implement" && default.exists()).then_some(default)
    });

    let request = MergeRequest {
        work_id: ctx.work_id.clone(),
        kind: args.kind,
        input,
        out,
        dispatch,
    };
    let outcome = collab::merge::merge(&request)?;
    print_result_path("merge", &request.out);
    Ok(outcome.exit.code())
}

pub fn cmd_retrospect(config: &Config, work: &WorkArgs) -> Result<i32> {
    let ctx = build_context(config, work)?;
    let exit: StageExit = stages::retrospect(&ctx)?;
    print_result_path("retrospect", &ctx.paths.retrospect());
    Ok(exit.code())
}
