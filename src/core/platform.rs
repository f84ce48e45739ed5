//! Platform descriptors and predicates
//!
//! Every platform-conditional decision (dependency edges, variants,
//! conditional install steps) is evaluated against an explicit
//! [`EvalContext`] rather than the host the process happens to run on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Macos,
    Linux,
}

impl Os {
    /// The operating system this binary was compiled for
    pub fn host() -> Option<Self> {
        match std::env::consts::OS {
            "macos" => Some(Self::Macos),
            "linux" => Some(Self::Linux),
            _ => None,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Macos => write!(f, "macos"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

impl FromStr for Os {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "macos" | "darwin" | "mac" => Ok(Self::Macos),
            "linux" => Ok(Self::Linux),
            other => Err(format!("unknown operating system '{other}'")),
        }
    }
}

/// CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64", alias = "arm64")]
    Aarch64,
    #[serde(rename = "arm")]
    Arm,
    #[serde(rename = "riscv64")]
    Riscv64,
}

impl Arch {
    /// The architecture this binary was compiled for
    pub fn host() -> Option<Self> {
        std::env::consts::ARCH.parse().ok()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Arm => "arm",
            Self::Riscv64 => "riscv64",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            "arm" => Ok(Self::Arm),
            "riscv64" => Ok(Self::Riscv64),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}

/// Compiler family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    Gcc,
    Clang,
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcc => write!(f, "gcc"),
            Self::Clang => write!(f, "clang"),
        }
    }
}

/// A host compiler, optionally with its major version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compiler {
    pub kind: CompilerKind,
    #[serde(default)]
    pub major: Option<u32>,
}

impl Compiler {
    pub fn new(kind: CompilerKind, major: Option<u32>) -> Self {
        Self { kind, major }
    }

    /// C compiler command
    pub fn cc(&self) -> &'static str {
        match self.kind {
            CompilerKind::Gcc => "gcc",
            CompilerKind::Clang => "clang",
        }
    }

    /// C++ compiler command
    pub fn cxx(&self) -> &'static str {
        match self.kind {
            CompilerKind::Gcc => "g++",
            CompilerKind::Clang => "clang++",
        }
    }
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.major {
            Some(major) => write!(f, "{}-{major}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for Compiler {
    type Err = String;

    /// Parses `gcc`, `clang`, `gcc-11` or `gcc@11`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, major) = match s.split_once(['-', '@']) {
            Some((kind, major)) => {
                let major = major
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid compiler version in '{s}'"))?;
                (kind, Some(major))
            }
            None => (s, None),
        };
        let kind = match kind {
            "gcc" => CompilerKind::Gcc,
            "clang" => CompilerKind::Clang,
            other => return Err(format!("unknown compiler '{other}'")),
        };
        Ok(Self { kind, major })
    }
}

/// Target platform descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    /// Host compilers in order of preference
    pub compilers: Vec<Compiler>,
}

impl Platform {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch,
            compilers: default_compilers(os),
        }
    }

    /// Replace the compiler preference list
    #[must_use]
    pub fn with_compilers(mut self, compilers: Vec<Compiler>) -> Self {
        self.compilers = compilers;
        self
    }

    /// Platform of the running host, if it is one we can build on
    pub fn host() -> Option<Self> {
        Some(Self::new(Os::host()?, Arch::host()?))
    }

    /// Compiler used when nothing excludes it
    pub fn preferred_compiler(&self) -> Option<&Compiler> {
        self.compilers.first()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

fn default_compilers(os: Os) -> Vec<Compiler> {
    match os {
        Os::Macos => vec![Compiler::new(CompilerKind::Clang, None)],
        Os::Linux => vec![
            Compiler::new(CompilerKind::Gcc, None),
            Compiler::new(CompilerKind::Clang, None),
        ],
    }
}

/// Everything a predicate may look at
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub platform: &'a Platform,
    /// Label of the variant being built (`stable`, `head`, ...)
    pub variant: &'a str,
}

impl<'a> EvalContext<'a> {
    pub fn new(platform: &'a Platform, variant: &'a str) -> Self {
        Self { platform, variant }
    }
}

/// Boolean condition over the evaluation context
///
/// Externally tagged, so documents write `{ os = "linux" }`,
/// `{ not = { os = "macos" } }` or `{ all = [{ os = "macos" }, { variant = "head" }] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Os(Os),
    Arch(Arch),
    Variant(String),
    Compiler(CompilerKind),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::Os(os) => ctx.platform.os == *os,
            Self::Arch(arch) => ctx.platform.arch == *arch,
            Self::Variant(label) => ctx.variant == label,
            Self::Compiler(kind) => ctx
                .platform
                .preferred_compiler()
                .is_some_and(|c| c.kind == *kind),
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::All(all) => all.iter().all(|p| p.evaluate(ctx)),
            Self::Any(any) => any.iter().any(|p| p.evaluate(ctx)),
        }
    }
}

/// Evaluate an optional predicate; absent means always
pub fn holds(predicate: Option<&Predicate>, ctx: &EvalContext<'_>) -> bool {
    predicate.map_or(true, |p| p.evaluate(ctx))
}
