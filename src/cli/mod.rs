//! Command-line interface module
//!
//! This module handles argument parsing and output formatting.
//! It contains no business logic - that belongs in the [`crate::core`] module.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::core::platform::{Arch, Os};
use crate::infra::dirs::{ENV_REGISTRY, ENV_ROOT};
use commands::{Commands, Context};

/// formulate - build and install formulas with their dependencies
///
/// Resolves a formula's dependency graph, builds every formula in a
/// reproducible environment and installs each into its own keg.
#[derive(Parser, Debug)]
#[command(name = "formulate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory of formula documents
    #[arg(long, global = true, env = ENV_REGISTRY)]
    pub registry: Option<PathBuf>,

    /// Install root holding Cellar/ and opt/
    #[arg(long, global = true, env = ENV_ROOT)]
    pub root: Option<PathBuf>,

    /// Maximum number of formulas built at once
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Target operating system (defaults to the host)
    #[arg(long, global = true)]
    pub os: Option<Os>,

    /// Target architecture (defaults to the host)
    #[arg(long, global = true)]
    pub arch: Option<Arch>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub async fn run(self) -> Result<i32> {
        let ctx = Context::load(&self)?;
        self.command.run(&ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install_with_globals() {
        let cli = Cli::try_parse_from([
            "formulate", "-vv", "--json", "--arch", "aarch64", "install", "julia", "--head", "--verify",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        assert_eq!(cli.arch, Some(Arch::Aarch64));
        assert!(matches!(
            cli.command,
            Commands::Install { ref name, head: true, verify: true, force: false, .. } if name == "julia"
        ));
    }

    #[test]
    fn test_head_conflicts_with_variant() {
        let result = Cli::try_parse_from(["formulate", "install", "julia", "--head", "--variant", "lts"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_os_is_rejected() {
        assert!(Cli::try_parse_from(["formulate", "--os", "plan9", "resolve", "x"]).is_err());
    }
}
