//! Test utilities
//!
//! Formula builders, fake collaborators and proptest generators shared by
//! the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::action::BuildAction;
use crate::core::formula::{Checksum, DependencyEdge, DependencyKind, Formula, SourceRef, Variant};
use crate::error::DownloadError;
use crate::infra::download::{FetchedSource, SourceProvider};
use crate::infra::process::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// A valid formula with a local stable source at version 1.0
///
/// Its single install step writes `bin/<name>` into the keg through a
/// command line containing `build-<name>`. `deps` pairs a dependency name
/// with its kind (`build`, `runtime` or `test`).
pub fn formula_with_deps(name: &str, deps: &[(&str, &str)]) -> Formula {
    let dependencies = deps
        .iter()
        .map(|(dep, kind)| DependencyEdge {
            name: (*dep).to_string(),
            kind: match *kind {
                "build" => DependencyKind::Build,
                "test" => DependencyKind::Test,
                _ => DependencyKind::Runtime,
            },
            platform: None,
        })
        .collect();

    Formula {
        name: name.to_string(),
        desc: None,
        homepage: None,
        license: Vec::new(),
        revision: 0,
        keg_only: false,
        variants: vec![Variant {
            label: "stable".to_string(),
            version: Some("1.0".to_string()),
            url: SourceRef::Local {
                path: PathBuf::from(format!("/sources/{name}-1.0")),
            },
            sha256: None,
            patches: Vec::new(),
            when: None,
        }],
        dependencies,
        requirements: Default::default(),
        fails_with: Vec::new(),
        install_steps: vec![BuildAction::Run {
            command: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "mkdir -p ${bin} && echo build-${name} > ${bin}/${name}".to_string(),
            ],
            cwd: None,
        }],
        test_steps: Vec::new(),
    }
}

/// Write `<stem>.tar.gz` into `dir` holding `files` under a `<stem>/` directory
///
/// Returns the archive path and its sha256.
pub fn tarball(dir: &Path, stem: &str, files: &[(&str, &str)]) -> (PathBuf, String) {
    let path = dir.join(format!("{stem}.tar.gz"));
    let file = std::fs::File::create(&path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{stem}/{name}"), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    let sha = crate::infra::download::compute_checksum(&std::fs::read(&path).unwrap());
    (path, sha)
}

/// Serves every source as a freshly created directory with a README
#[derive(Debug, Default)]
pub struct FakeSources {
    fetched: Mutex<Vec<String>>,
}

impl FakeSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl SourceProvider for FakeSources {
    async fn fetch(
        &self,
        source: &SourceRef,
        _expected: Option<&Checksum>,
        dest_dir: &Path,
    ) -> Result<FetchedSource, DownloadError> {
        self.fetched.lock().unwrap().push(source.to_string());
        let dir = dest_dir.join(source.file_name());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README"), source.to_string()).unwrap();
        Ok(FetchedSource {
            path: dir,
            sha256: None,
            size: 0,
        })
    }
}

/// Runs commands for real, but records them, can fail on demand and
/// tracks how many ran at once
#[derive(Debug, Default)]
pub struct FakeRunner {
    fail_on: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit 1 without running for any command line containing `needle`
    pub fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
            ..Self::default()
        }
    }

    /// Hold every command for `delay` before running it
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of commands observed running at the same time
    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().unwrap().push(line.clone());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.fail_on {
            Some(needle) if line.contains(needle.as_str()) => Ok(CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("{needle}: simulated failure"),
            }),
            _ => SystemRunner::new().run(spec).await,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub mod generators {
    use proptest::prelude::*;

    /// Generate a valid formula name
    pub fn formula_name() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9@._+-]{0,30}"
    }

    /// Generate a valid SHA256 hash (64 hex characters)
    pub fn sha256_hash() -> impl Strategy<Value = String> {
        "[0-9a-f]{64}"
    }

    /// Generate a version string
    pub fn version() -> impl Strategy<Value = String> {
        (0u32..20, 0u32..20, 0u32..20).prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
    }

    /// Generate an acyclic dependency graph of up to `max` nodes
    ///
    /// Node `i` depends only on nodes with a lower index, so any node can be
    /// used as a root. The last node depends on every node without
    /// dependents, so the whole graph is reachable from it.
    pub fn dag_edges(max: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1..=max.max(1))
            .prop_flat_map(|n| {
                (0..n)
                    .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
                    .collect::<Vec<_>>()
            })
            .prop_map(|mut edges| {
                let n = edges.len();
                let depended_on: std::collections::HashSet<usize> = edges.iter().flatten().copied().collect();
                let mut tops: Vec<usize> = (0..n - 1).filter(|i| !depended_on.contains(i)).collect();
                let root = &mut edges[n - 1];
                tops.retain(|i| !root.contains(i));
                root.extend(tops);
                root.sort_unstable();
                edges
            })
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_formula_name_generator(name in formula_name()) {
            let formula = super::formula_with_deps(&name, &[]);
            prop_assert!(formula.validate().is_ok());
        }

        #[test]
        fn test_version_generator(version in version()) {
            let parts: Vec<&str> = version.split('.').collect();
            prop_assert_eq!(parts.len(), 3);
            for part in parts {
                prop_assert!(part.parse::<u32>().is_ok());
            }
        }

        #[test]
        fn test_sha256_hash_generator(hash in sha256_hash()) {
            prop_assert!(crate::core::formula::Checksum::parse(hash).is_ok());
        }

        #[test]
        fn test_dag_edges_only_point_backwards(edges in dag_edges(10)) {
            for (i, deps) in edges.iter().enumerate() {
                prop_assert!(deps.iter().all(|d| *d < i));
            }
            // Everything but the last node is depended on by something
            let n = edges.len();
            for node in 0..n - 1 {
                prop_assert!(edges.iter().any(|deps| deps.contains(&node)));
            }
        }
    }
}
