//! Resolve command implementation
//!
//! Implements `formulate resolve`: prints the build order without building.

use anyhow::Result;
use serde_json::json;

use super::Context;
use crate::core::resolver::{PlanMode, Resolver};
use crate::error::{exit_code, FormulateError};

/// Execute the resolve command
pub fn execute(ctx: &Context, name: &str, include_tests: bool) -> Result<i32> {
    let mode = if include_tests {
        PlanMode::Test
    } else {
        PlanMode::Install
    };
    let plan = Resolver::new(&ctx.registry, &ctx.platform)
        .resolve(name, None, mode)
        .map_err(FormulateError::from)?;

    if ctx.output.is_json() {
        ctx.output.json(&json!({
            "root": plan.root(),
            "mode": plan.mode(),
            "platform": ctx.platform.to_string(),
            "order": plan.order(),
        }));
    } else {
        // The order is the command's output, so it is printed even with --quiet
        for formula in plan.order() {
            println!("{formula}");
        }
    }
    Ok(exit_code::SUCCESS)
}
