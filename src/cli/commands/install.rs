//! Install command implementation
//!
//! Implements `formulate install` to build a formula and everything it
//! depends on.

use anyhow::Result;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Context;
use crate::core::builder::{BuildOptions, Builder, FormulaOutcome, ProgressEvent, RunReport, VerifyMode};
use crate::core::resolver::{BuildPlan, PlanMode, Resolver};
use crate::error::{FormulateError, InstallError};

/// Install options
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Variant label for the root formula
    pub variant: Option<String>,
    /// Rebuild dependencies even if already installed
    pub force: bool,
    /// Run test steps after installing
    pub verify: bool,
}

/// Execute the install command
pub async fn execute(ctx: &Context, name: &str, options: InstallOptions) -> Result<i32> {
    let mode = if options.verify {
        PlanMode::Test
    } else {
        PlanMode::Install
    };
    let plan = Resolver::new(&ctx.registry, &ctx.platform)
        .resolve(name, options.variant.as_deref(), mode)
        .map_err(FormulateError::from)?;

    let build = BuildOptions {
        workers: ctx.workers,
        force: options.force,
        reinstall_root: true,
        verify: if options.verify {
            VerifyMode::Full
        } else {
            VerifyMode::LinkageOnly
        },
    };
    let report = build_plan(ctx, &plan, build).await;
    print_report(ctx, &report);
    Ok(report.exit_code())
}

/// Run `plan` with a progress bar, stopping early on Ctrl-C
pub(super) async fn build_plan(ctx: &Context, plan: &BuildPlan, options: BuildOptions) -> RunReport {
    ctx.output.info(&format!("Building {} ({} formulas)", plan.root(), plan.len()));

    let bar = ctx.output.build_bar(plan.len());
    let progress = bar.clone();
    let builder = Builder::new(
        &ctx.registry,
        &ctx.sources,
        &ctx.runner,
        &ctx.layout,
        &ctx.platform,
        &ctx.settings,
    )
    .with_options(options)
    .with_progress(Box::new(move |event: ProgressEvent<'_>| match event {
        ProgressEvent::Started(name) => progress.set_message(name.to_string()),
        ProgressEvent::Installed(_)
        | ProgressEvent::Reused(_)
        | ProgressEvent::Failed(_)
        | ProgressEvent::Skipped(_) => progress.inc(1),
    }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling build");
            trigger.cancel();
        }
    });

    let report = builder.run(plan, &cancel).await;
    interrupt.abort();
    bar.finish_and_clear();
    report
}

/// Print the outcome of a run, as text or as one JSON document
pub(super) fn print_report(ctx: &Context, report: &RunReport) {
    let out = &ctx.output;
    if out.is_json() {
        out.json(&report_json(report));
        return;
    }

    for (name, outcome) in &report.outcomes {
        match outcome {
            FormulaOutcome::Installed(a) => out.success(&format!("{name} {} installed in {}", a.version, a.root.display())),
            FormulaOutcome::Reused(a) => out.info(&format!("{name} {} already installed", a.version)),
            FormulaOutcome::Failed(e) if e.is_skip() => out.skipped(&e.to_string()),
            FormulaOutcome::Failed(InstallError::Cancelled { .. }) => out.skipped(&format!("{name} cancelled")),
            FormulaOutcome::Failed(e) => out.failure(&e.to_string()),
        }
    }

    for verification in &report.verification {
        for error in verification.errors() {
            out.warning(&format!("{}: {error}", verification.formula));
        }
        if !verification.steps.is_empty() && verification.passed() {
            out.success(&format!("{}: {} test steps passed", verification.formula, verification.steps.len()));
        }
    }
}

fn report_json(report: &RunReport) -> Value {
    let outcomes: Vec<Value> = report
        .outcomes
        .iter()
        .map(|(name, outcome)| match outcome {
            FormulaOutcome::Installed(a) | FormulaOutcome::Reused(a) => json!({
                "name": name,
                "status": if matches!(outcome, FormulaOutcome::Installed(_)) { "installed" } else { "reused" },
                "version": a.version,
                "variant": a.variant,
                "keg": a.root,
            }),
            FormulaOutcome::Failed(e) => json!({
                "name": name,
                "status": match e {
                    InstallError::SkippedDueToDependencyFailure { .. } => "skipped",
                    InstallError::Cancelled { .. } => "cancelled",
                    _ => "failed",
                },
                "error": e.to_string(),
            }),
        })
        .collect();

    let verification: Vec<Value> = report
        .verification
        .iter()
        .map(|v| {
            json!({
                "formula": v.formula,
                "passed": v.passed(),
                "steps": v.steps.iter().map(|s| json!({
                    "index": s.index,
                    "command": s.description,
                    "passed": s.passed(),
                })).collect::<Vec<_>>(),
                "errors": v.errors().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "root": report.plan.root(),
        "order": report.plan.order(),
        "outcomes": outcomes,
        "verification": verification,
        "exit_code": report.exit_code(),
    })
}
