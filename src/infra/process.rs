//! External command execution
//!
//! Install steps, patches, and test steps all run through a [`CommandRunner`].
//! The default [`SystemRunner`] starts every child with a cleared environment
//! so nothing from the invoking shell leaks into a build.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::core::action::render_command;

/// A fully specified command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment of the child; nothing else is inherited
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: cwd.into(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Command line for logs and error messages
    pub fn display(&self) -> String {
        render_command(&self.program, &self.args)
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the child was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands
///
/// Returning `Err` means the command could not be started at all; a
/// command that ran and failed is an `Ok` with a non-zero exit code.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = io::Result<CommandOutput>> + Send;
}

/// Runs commands as child processes of this one
///
/// Children are killed when the future running them is dropped, so a
/// cancelled install never leaves a stray compiler behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning process");

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            if !result.stderr.is_empty() {
                debug!(stderr = %result.stderr, "command stderr");
            }
            if !result.stdout.is_empty() {
                debug!(stdout = %result.stdout, "command stdout");
            }
        }

        Ok(result)
    }
}
