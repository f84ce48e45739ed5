//! formulate CLI - dependency-aware formula build orchestrator
//!
//! Entry point for the formulate command-line application.

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use formulate::cli::output::display_error;
use formulate::cli::Cli;
use formulate::error::exit_code_for;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::WARN,
        (false, 1) => LevelFilter::INFO,
        (false, _) => LevelFilter::DEBUG,
    };

    // Logs go to stderr so --json output stays clean; RUST_LOG still applies
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let code = match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            display_error(&e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
