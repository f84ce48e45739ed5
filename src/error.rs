//! Error types for formulate
//!
//! Domain-specific error types using thiserror.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Formula parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    /// Required field absent or invalid
    #[error("Malformed formula '{name}': {reason}")]
    MalformedFormula { name: String, reason: String },

    /// Document could not be parsed at all
    #[error("Failed to parse formula '{path}': {error}")]
    ParseError { path: String, error: String },

    /// No variant matches the requested label on this platform
    #[error("Formula '{name}' has no usable variant '{label}' on this platform")]
    NoSuchVariant { name: String, label: String },

    /// Two formula documents declare the same name
    #[error("Formula '{name}' is defined twice ({first} and {second})")]
    DuplicateFormula {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// IO error while reading a formula document
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },
}

/// Dependency resolution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolverError {
    /// Named formula is not in the registry
    #[error("{}", unresolved_message(.name, .required_by.as_deref()))]
    UnresolvedDependency {
        name: String,
        required_by: Option<String>,
    },

    /// Circular dependency detected
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// Formula cannot be built on the target platform
    #[error("Formula '{name}' is not supported on this platform: {reason}")]
    UnsupportedPlatform { name: String, reason: String },

    /// Formula-level problem surfaced during resolution
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

fn unresolved_message(name: &str, required_by: Option<&str>) -> String {
    match required_by {
        Some(parent) => format!("Unresolved dependency: '{name}' required by '{parent}'"),
        None => format!("Unresolved dependency: no formula named '{name}'"),
    }
}

/// Install executor errors, scoped to a single formula
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstallError {
    /// Fetched source does not match the declared digest
    #[error("Checksum mismatch for '{name}' ({source_url}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        source_url: String,
        expected: String,
        actual: String,
    },

    /// Patch did not apply cleanly
    #[error("Patch #{index} failed to apply for '{name}': {detail}")]
    PatchApplyFailed {
        name: String,
        index: usize,
        detail: String,
    },

    /// An install step command exited non-zero
    #[error("Build step #{step} of '{name}' failed: `{command}` exited with {}", ExitCodeDisplay(.exit_code))]
    BuildStepFailed {
        name: String,
        step: usize,
        command: String,
        exit_code: Option<i32>,
    },

    /// A text patch matched nothing
    #[error("Text patch in step #{step} of '{name}' did not match '{pattern}' in {file}")]
    TextPatchFailed {
        name: String,
        step: usize,
        file: String,
        pattern: String,
    },

    /// Install steps finished without producing any files
    #[error("Installation of '{name}' produced an empty keg at {}", keg.display())]
    EmptyInstallation { name: String, keg: PathBuf },

    /// A dependency failed earlier in the run
    #[error("Skipped '{name}': dependency '{dependency}' failed")]
    SkippedDueToDependencyFailure { name: String, dependency: String },

    /// Run was cancelled before or during this install
    #[error("Install of '{name}' was cancelled")]
    Cancelled { name: String },

    /// Environment could not be built
    #[error("Environment for '{name}' could not be built: {error}")]
    Environment { name: String, error: String },

    /// Source fetch failed
    #[error("Failed to fetch source for '{name}': {error}")]
    Fetch { name: String, error: String },

    /// Filesystem failure during install
    #[error("Filesystem error while installing '{name}': {error}")]
    Filesystem { name: String, error: String },

    /// Command could not be spawned at all
    #[error("Failed to run step #{step} of '{name}': {error}")]
    Process {
        name: String,
        step: usize,
        error: String,
    },
}

impl InstallError {
    /// Formula this error belongs to
    pub fn formula(&self) -> &str {
        match self {
            Self::ChecksumMismatch { name, .. }
            | Self::PatchApplyFailed { name, .. }
            | Self::BuildStepFailed { name, .. }
            | Self::TextPatchFailed { name, .. }
            | Self::EmptyInstallation { name, .. }
            | Self::SkippedDueToDependencyFailure { name, .. }
            | Self::Cancelled { name }
            | Self::Environment { name, .. }
            | Self::Fetch { name, .. }
            | Self::Filesystem { name, .. }
            | Self::Process { name, .. } => name,
        }
    }

    /// Whether this formula never started because of an upstream failure
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::SkippedDueToDependencyFailure { .. })
    }
}

/// Verification failures; never undo an install
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Recorded symlink points nowhere
    #[error("Broken linkage: {} does not resolve", path.display())]
    BrokenLinkage { path: PathBuf },

    /// Test command exited non-zero
    #[error("Test step #{step} failed: `{command}` exited with {}", ExitCodeDisplay(.exit_code))]
    TestStepFailed {
        step: usize,
        command: String,
        exit_code: Option<i32>,
    },

    /// Test command printed something else
    #[error("Test step #{step}: expected output {expected:?}, got {actual:?}")]
    UnexpectedOutput {
        step: usize,
        expected: String,
        actual: String,
    },

    /// Asserted path is missing
    #[error("Test step #{step}: {} does not exist", path.display())]
    MissingPath { step: usize, path: PathBuf },

    /// Test could not be executed
    #[error("Test step #{step} could not run: {error}")]
    Execution { step: usize, error: String },
}

/// Download errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Network error
    #[error("Network error downloading '{url}': {error}")]
    NetworkError { url: String, error: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// Max retries exceeded
    #[error("Download failed after {retries} retries: {url}")]
    MaxRetriesExceeded { url: String, retries: u32 },

    /// Git checkout failed
    #[error("Git checkout of '{url}' failed: {error}")]
    GitError { url: String, error: String },
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to create a symlink
    #[error("Failed to link '{link}' -> '{target}': {error}")]
    Symlink {
        link: PathBuf,
        target: PathBuf,
        error: String,
    },

    /// Failed to unpack an archive
    #[error("Failed to extract '{archive}': {error}")]
    Extract { archive: PathBuf, error: String },

    /// Invalid glob pattern
    #[error("Invalid glob pattern '{pattern}': {error}")]
    Glob { pattern: String, error: String },
}

/// Top-level formulate error type
#[derive(Error, Debug)]
pub enum FormulateError {
    /// Formula error
    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// Resolver error
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// Install error
    #[error(transparent)]
    Install(#[from] InstallError),

    /// Verification error
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Process exit codes of the CLI
pub mod exit_code {
    /// Everything succeeded
    pub const SUCCESS: i32 = 0;
    /// Resolution (or configuration) failure; nothing was built
    pub const RESOLUTION_FAILURE: i32 = 1;
    /// At least one formula failed, was skipped, or was cancelled
    pub const BUILD_FAILURE: i32 = 2;
    /// Installs succeeded but verification failed
    pub const VERIFICATION_FAILURE: i32 = 3;
}

impl FormulateError {
    /// Exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Formula(_) | Self::Resolver(_) | Self::Config(_) => exit_code::RESOLUTION_FAILURE,
            Self::Install(_) => exit_code::BUILD_FAILURE,
            Self::Verify(_) => exit_code::VERIFICATION_FAILURE,
        }
    }
}

/// Map any error surfaced by the CLI to an exit code
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<FormulateError>() {
            return e.exit_code();
        }
        if cause.is::<FormulaError>() || cause.is::<ResolverError>() {
            return exit_code::RESOLUTION_FAILURE;
        }
        if cause.is::<InstallError>() {
            return exit_code::BUILD_FAILURE;
        }
        if cause.is::<VerifyError>() {
            return exit_code::VERIFICATION_FAILURE;
        }
    }
    exit_code::RESOLUTION_FAILURE
}

struct ExitCodeDisplay<'a>(&'a Option<i32>);

impl fmt::Display for ExitCodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "status {code}"),
            None => write!(f, "a signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_node() {
        let err = ResolverError::DependencyCycle {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_unresolved_message_mentions_parent() {
        let err = ResolverError::UnresolvedDependency {
            name: "zlib".to_string(),
            required_by: Some("curl".to_string()),
        };
        assert!(err.to_string().contains("'zlib' required by 'curl'"));
    }

    #[test]
    fn test_build_step_failed_shows_exit_code() {
        let err = InstallError::BuildStepFailed {
            name: "julia".to_string(),
            step: 3,
            command: "make install".to_string(),
            exit_code: Some(2),
        };
        assert!(err.to_string().contains("exited with status 2"));

        let killed = InstallError::BuildStepFailed {
            name: "julia".to_string(),
            step: 3,
            command: "make".to_string(),
            exit_code: None,
        };
        assert!(killed.to_string().contains("a signal"));
    }

    #[test]
    fn test_exit_codes_by_category() {
        let resolution: anyhow::Error = ResolverError::DependencyCycle { path: vec![] }.into();
        assert_eq!(exit_code_for(&resolution), exit_code::RESOLUTION_FAILURE);

        let build: anyhow::Error = InstallError::Cancelled {
            name: "x".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&build), exit_code::BUILD_FAILURE);

        let verify: anyhow::Error = VerifyError::BrokenLinkage {
            path: PathBuf::from("/x"),
        }
        .into();
        assert_eq!(exit_code_for(&verify), exit_code::VERIFICATION_FAILURE);

        let wrapped = anyhow::Error::from(FormulateError::Install(InstallError::Cancelled {
            name: "x".to_string(),
        }))
        .context("while installing");
        assert_eq!(exit_code_for(&wrapped), exit_code::BUILD_FAILURE);
    }
}
