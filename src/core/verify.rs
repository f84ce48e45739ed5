//! Post-install verification
//!
//! Runs a formula's declared test steps against its installed keg and checks
//! that every recorded symlink still resolves. Verification never modifies or
//! removes what it checks.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::core::action::{Placeholders, VerifyAction};
use crate::core::artifact::{InstalledArtifact, Layout};
use crate::core::formula::Formula;
use crate::core::install::keg_placeholders;
use crate::core::resolver::BuildPlan;
use crate::error::VerifyError;
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// Result of one test step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// 1-based position in `test_steps`
    pub index: usize,
    pub description: String,
    pub error: Option<VerifyError>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything verification found out about one formula
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub formula: String,
    /// Test steps, in order; empty when tests were not requested
    pub steps: Vec<StepResult>,
    /// Dangling symlinks found in the keg
    pub linkage: Vec<VerifyError>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.linkage.is_empty() && self.steps.iter().all(StepResult::passed)
    }

    /// Every failure, linkage first
    pub fn errors(&self) -> impl Iterator<Item = &VerifyError> {
        self.linkage
            .iter()
            .chain(self.steps.iter().filter_map(|s| s.error.as_ref()))
    }
}

/// Every recorded symlink of `artifact` that does not resolve
pub fn check_linkage(artifact: &InstalledArtifact) -> Vec<VerifyError> {
    artifact
        .symlinks
        .iter()
        .filter(|link| std::fs::metadata(link).is_err())
        .map(|link| {
            warn!(formula = %artifact.name, link = %link.display(), "broken symlink");
            VerifyError::BrokenLinkage { path: link.clone() }
        })
        .collect()
}

/// Runs test steps through a [`CommandRunner`]
#[derive(Debug)]
pub struct Verifier<'a, R> {
    runner: &'a R,
    layout: &'a Layout,
    base_path: &'a [String],
}

impl<'a, R: CommandRunner> Verifier<'a, R> {
    pub fn new(runner: &'a R, layout: &'a Layout, base_path: &'a [String]) -> Self {
        Self {
            runner,
            layout,
            base_path,
        }
    }

    /// Linkage check only
    pub fn check(&self, artifact: &InstalledArtifact) -> VerificationReport {
        VerificationReport {
            formula: artifact.name.clone(),
            steps: Vec::new(),
            linkage: check_linkage(artifact),
        }
    }

    /// Linkage check plus every declared test step
    ///
    /// `dependencies` are installed artifacts whose `bin` directories are
    /// put on `PATH` after the keg's own.
    pub async fn verify(
        &self,
        formula: &Formula,
        artifact: &InstalledArtifact,
        plan: &BuildPlan,
        dependencies: &[&InstalledArtifact],
    ) -> VerificationReport {
        let mut report = self.check(artifact);

        let scratch = match filesystem::scoped_workdir(&self.layout.tmp(), &format!("{}-test-", formula.name)) {
            Ok(dir) => dir,
            Err(e) => {
                report.steps.push(StepResult {
                    index: 0,
                    description: "prepare test directory".to_string(),
                    error: Some(VerifyError::Execution {
                        step: 0,
                        error: e.to_string(),
                    }),
                });
                return report;
            }
        };

        let placeholders = keg_placeholders(self.layout, formula, plan, &artifact.version, &artifact.root, 1)
            .with("testpath", scratch.path().display().to_string());
        let env = self.test_env(artifact, dependencies, scratch.path());

        for (i, step) in formula.test_steps.iter().enumerate() {
            let index = i + 1;
            let (description, error) = self
                .run_step(index, step, &placeholders, &env, scratch.path())
                .await;
            debug!(formula = %formula.name, step = index, passed = error.is_none(), "test step");
            report.steps.push(StepResult {
                index,
                description,
                error,
            });
        }

        report
    }

    fn test_env(
        &self,
        artifact: &InstalledArtifact,
        dependencies: &[&InstalledArtifact],
        scratch: &Path,
    ) -> BTreeMap<String, String> {
        let path = std::iter::once(artifact.bin())
            .chain(dependencies.iter().map(|d| d.bin()))
            .map(|p| p.display().to_string())
            .chain(self.base_path.iter().cloned())
            .collect::<Vec<_>>()
            .join(":");

        BTreeMap::from([
            ("PATH".to_string(), path),
            ("HOME".to_string(), scratch.display().to_string()),
            ("TMPDIR".to_string(), scratch.display().to_string()),
        ])
    }

    async fn run_step(
        &self,
        step: usize,
        action: &VerifyAction,
        p: &Placeholders,
        env: &BTreeMap<String, String>,
        scratch: &Path,
    ) -> (String, Option<VerifyError>) {
        match action {
            VerifyAction::Run {
                command,
                args,
                expect_stdout,
            } => {
                let spec = CommandSpec::new(p.expand(command), scratch)
                    .args(p.expand_all(args))
                    .envs(env);
                let description = spec.display();
                let error = match self.runner.run(&spec).await {
                    Err(e) => Some(VerifyError::Execution {
                        step,
                        error: format!("{description}: {e}"),
                    }),
                    Ok(output) if !output.success() => Some(VerifyError::TestStepFailed {
                        step,
                        command: description.clone(),
                        exit_code: output.exit_code,
                    }),
                    Ok(output) => expect_stdout.as_ref().and_then(|expected| {
                        let expected = p.expand(expected);
                        let actual = output.stdout.trim();
                        (actual != expected.trim()).then(|| VerifyError::UnexpectedOutput {
                            step,
                            expected,
                            actual: actual.to_string(),
                        })
                    }),
                };
                (description, error)
            }
            VerifyAction::AssertExists { path } => {
                let path = p.expand(path);
                let exists = std::fs::symlink_metadata(&path).is_ok();
                (
                    format!("test -e {path}"),
                    (!exists).then(|| VerifyError::MissingPath {
                        step,
                        path: path.into(),
                    }),
                )
            }
            VerifyAction::NoBrokenLinks { path } => {
                let path = p.expand(path);
                let listing = filesystem::walk_entries(Path::new(&path));
                let broken = listing
                    .symlinks
                    .into_iter()
                    .find(|link| std::fs::metadata(link).is_err());
                (
                    format!("no broken links in {path}"),
                    broken.map(|path| VerifyError::BrokenLinkage { path }),
                )
            }
        }
    }
}
