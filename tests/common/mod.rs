//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test project context
///
/// A temporary registry, install root and source directory, plus isolated
/// config and cache directories so the user's setup never leaks in.
pub struct TestProject {
    /// Temporary directory for the test project
    pub dir: TempDir,
}

impl TestProject {
    /// Create a new test project in a temporary directory
    pub fn new() -> Self {
        let project = Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        };
        for sub in ["registry", "root", "sources", "config", "cache"] {
            std::fs::create_dir_all(project.path().join(sub)).expect("Failed to create directory");
        }
        project
    }

    /// Get the path to the test project directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn root(&self) -> PathBuf {
        self.path().join("root")
    }

    pub fn keg(&self, name: &str, version: &str) -> PathBuf {
        self.root().join("Cellar").join(name).join(version)
    }

    /// Write `registry/<name>.toml`
    pub fn write_formula(&self, name: &str, content: &str) {
        std::fs::write(self.path().join("registry").join(format!("{name}.toml")), content)
            .expect("Failed to write formula");
    }

    /// Create a source directory `sources/<name>` holding `files`
    pub fn source_dir(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.path().join("sources").join(name);
        for (file, content) in files {
            let path = dir.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("Failed to create parent directories");
            }
            std::fs::write(path, content).expect("Failed to write file");
        }
        std::fs::create_dir_all(&dir).expect("Failed to create directory");
        dir
    }

    /// Create `sources/<stem>.tar.gz` with `files` under `<stem>/`
    ///
    /// Returns the archive path and its sha256.
    pub fn tarball(&self, stem: &str, files: &[(&str, &str)]) -> (PathBuf, String) {
        use sha2::{Digest, Sha256};

        let path = self.path().join("sources").join(format!("{stem}.tar.gz"));
        let file = std::fs::File::create(&path).expect("Failed to create archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{stem}/{name}"), content.as_bytes())
                .expect("Failed to append file");
        }
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .expect("Failed to finish archive");

        let digest = Sha256::digest(std::fs::read(&path).expect("Failed to read archive"));
        (path, hex::encode(digest))
    }

    /// Run formulate against this project
    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_formulate"))
            .current_dir(self.path())
            .env("FORMULATE_REGISTRY", self.path().join("registry"))
            .env("FORMULATE_ROOT", self.root())
            .env("FORMULATE_CONFIG_DIR", self.path().join("config"))
            .env("FORMULATE_CACHE_DIR", self.path().join("cache"))
            .env_remove("RUST_LOG")
            .args(args)
            .output()
            .expect("Failed to execute formulate")
    }

    /// Run with `--json` and parse stdout
    pub fn run_json(&self, args: &[&str]) -> (i32, serde_json::Value) {
        let mut full = vec!["--json"];
        full.extend_from_slice(args);
        let output = self.run(&full);
        let value = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}): {}\nstderr: {}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (exit_code(&output), value)
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

pub fn exit_code(output: &Output) -> i32 {
    output.status.code().expect("formulate was killed by a signal")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Minimal formula whose source is the directory `source`
///
/// `deps` is a list of `(name, kind)`; `steps` is appended verbatim.
pub fn formula(name: &str, source: &Path, deps: &[(&str, &str)], steps: &str) -> String {
    let mut doc = format!(
        "name = \"{name}\"\n\n[[variants]]\nlabel = \"stable\"\nversion = \"1.0\"\nurl = \"{}\"\n",
        source.display()
    );
    for (dep, kind) in deps {
        doc.push_str(&format!("\n[[dependencies]]\nname = \"{dep}\"\nkind = \"{kind}\"\n"));
    }
    doc.push_str(steps);
    doc
}

/// Install step writing `bin/<name>`
pub const WRITE_BIN: &str = r#"
[[install_steps]]
action = "run"
command = "/bin/sh"
args = ["-c", "mkdir -p ${bin} && echo ${name} > ${bin}/${name}"]
"#;
