//! Output formatting and progress indicators
//!
//! Human-readable status lines go to stdout, errors to stderr. In JSON mode
//! stdout carries a single JSON document and nothing else.

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

/// Create a progress bar for formula installs
pub fn create_build_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} formulas ({msg})")
            .expect("Invalid progress bar template")
            .progress_chars("█▓▒░"),
    );
    pb
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";

    /// Warning prefix (yellow triangle)
    pub const WARNING: &str = "⚠";

    /// Info prefix (blue circle)
    pub const INFO: &str = "ℹ";

    /// Skipped or cancelled
    pub const SKIPPED: &str = "⊘";
}

/// Output settings from the global flags
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    quiet: bool,
    json: bool,
}

impl Output {
    pub fn new(quiet: bool, json: bool) -> Self {
        Self { quiet, json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    fn human(&self) -> bool {
        !self.quiet && !self.json
    }

    pub fn line(&self, message: &str) {
        if self.human() {
            println!("{message}");
        }
    }

    pub fn success(&self, message: &str) {
        self.line(&format!("{} {message}", status::SUCCESS));
    }

    pub fn info(&self, message: &str) {
        self.line(&format!("{} {message}", status::INFO));
    }

    pub fn skipped(&self, message: &str) {
        self.line(&format!("{} {message}", status::SKIPPED));
    }

    /// Warnings survive `--quiet` but not `--json`
    pub fn warning(&self, message: &str) {
        if !self.json {
            eprintln!("{} {message}", status::WARNING);
        }
    }

    pub fn failure(&self, message: &str) {
        if !self.json {
            eprintln!("{} {message}", status::ERROR);
        }
    }

    /// Print `value` as the command's JSON document
    pub fn json(&self, value: &Value) {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
        }
    }

    /// Install progress bar; hidden in quiet and JSON mode
    pub fn build_bar(&self, total: usize) -> ProgressBar {
        if self.human() {
            create_build_bar(total as u64)
        } else {
            ProgressBar::hidden()
        }
    }
}

/// Print an error and its causes to stderr
pub fn display_error(error: &anyhow::Error) {
    eprintln!("{} Error: {error}", status::ERROR);
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
}
