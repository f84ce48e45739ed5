//! Install and test actions
//!
//! Actions are parsed once with their formula and never mutated; the
//! install executor and the verifier consume them in declared order.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::core::platform::Predicate;

/// How a `set_env` action combines with an existing value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    /// Replace the value
    #[default]
    Set,
    /// Append, separated by a space (compiler/linker flags)
    Append,
    /// Prepend, separated by `:` (search paths)
    PrependPath,
}

/// A single install step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BuildAction {
    /// Modify an environment variable for the remaining steps
    SetEnv {
        name: String,
        value: String,
        #[serde(default)]
        mode: EnvMode,
    },

    /// Run a command; a non-zero exit aborts the install
    Run {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Working directory relative to the build directory
        #[serde(default)]
        cwd: Option<String>,
    },

    /// Create a symlink, replacing whatever is at `link`
    Symlink {
        target: String,
        link: String,
        /// Store the target relative to the link's directory
        #[serde(default)]
        relative: bool,
    },

    /// In-place text substitution in one or more files
    PatchText {
        /// File path or glob, relative to the build directory
        file: String,
        pattern: String,
        replacement: String,
        /// Treat `pattern` as a regular expression
        #[serde(default)]
        regex: bool,
    },

    /// Rewrite `NAME = value` assignments in a makefile
    ChangeMakeVar {
        file: String,
        name: String,
        value: String,
    },

    /// Create a directory and its parents
    Mkdir { path: String },

    /// Actions that only run when `when` holds
    Conditional {
        when: Predicate,
        actions: Vec<BuildAction>,
    },
}

impl BuildAction {
    /// Short human-readable label for logs
    pub fn describe(&self) -> String {
        match self {
            Self::SetEnv { name, .. } => format!("set {name}"),
            Self::Run { command, args, .. } => render_command(command, args),
            Self::Symlink { target, link, .. } => format!("ln -sf {target} {link}"),
            Self::PatchText { file, .. } => format!("patch text in {file}"),
            Self::ChangeMakeVar { file, name, .. } => format!("change {name} in {file}"),
            Self::Mkdir { path } => format!("mkdir -p {path}"),
            Self::Conditional { actions, .. } => format!("conditional ({} actions)", actions.len()),
        }
    }
}

/// A single post-install check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VerifyAction {
    /// Run a command; optionally compare its trimmed stdout
    Run {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        expect_stdout: Option<String>,
    },

    /// Path must exist
    AssertExists { path: String },

    /// Every symlink below `path` must resolve
    NoBrokenLinks { path: String },
}

/// Join a command and its arguments for display
pub fn render_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([a-z_]+)(?::([A-Za-z0-9@._+-]+))?\}").expect("valid placeholder regex")
    })
}

/// Values substituted into `${...}` placeholders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
    opt: BTreeMap<String, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `${key}`
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Bind `${opt:<formula>}`
    #[must_use]
    pub fn with_opt(mut self, formula: &str, root: impl Into<String>) -> Self {
        self.opt.insert(formula.to_string(), root.into());
        self
    }

    /// Substitute known placeholders; unknown ones are left untouched
    pub fn expand(&self, input: &str) -> String {
        placeholder_regex()
            .replace_all(input, |caps: &Captures<'_>| {
                let key = &caps[1];
                let value = match caps.get(2) {
                    Some(arg) if key == "opt" => self.opt.get(arg.as_str()),
                    Some(_) => None,
                    None => self.values.get(key),
                };
                value.cloned().unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn expand_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.expand(s)).collect()
    }
}
