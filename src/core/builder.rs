//! Build orchestration logic
//!
//! Walks a [`BuildPlan`] and installs its formulas, running independent ones
//! concurrently up to a worker limit. A formula starts only once every
//! dependency is installed; when one fails, everything downstream of it is
//! skipped while unrelated parts of the plan carry on.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults;
use crate::core::artifact::{InstalledArtifact, Layout};
use crate::core::build_env::EnvSettings;
use crate::core::formula::{Formula, DEFAULT_VARIANT};
use crate::core::install::Installer;
use crate::core::platform::Platform;
use crate::core::registry::Registry;
use crate::core::resolver::BuildPlan;
use crate::core::verify::{VerificationReport, Verifier};
use crate::error::{exit_code, InstallError};
use crate::infra::download::SourceProvider;
use crate::infra::process::CommandRunner;

/// How much checking follows a successful build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyMode {
    /// Symlink integrity of every freshly installed keg
    #[default]
    LinkageOnly,
    /// Linkage plus the root formula's test steps
    Full,
}

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Maximum number of concurrent installs
    pub workers: usize,
    /// Rebuild dependencies even when a matching keg exists
    pub force: bool,
    /// Rebuild the root even when a matching keg exists
    pub reinstall_root: bool,
    pub verify: VerifyMode,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            workers: defaults::DEFAULT_WORKERS,
            force: false,
            reinstall_root: true,
            verify: VerifyMode::default(),
        }
    }
}

/// What happened to one formula of the plan
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaOutcome {
    Installed(InstalledArtifact),
    /// An existing keg with the planned version was kept
    Reused(InstalledArtifact),
    Failed(InstallError),
}

impl FormulaOutcome {
    pub fn artifact(&self) -> Option<&InstalledArtifact> {
        match self {
            Self::Installed(a) | Self::Reused(a) => Some(a),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&InstallError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Scheduling events, for progress display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent<'a> {
    Started(&'a str),
    Installed(&'a str),
    Reused(&'a str),
    Failed(&'a str),
    Skipped(&'a str),
}

pub type ProgressCallback = Box<dyn Fn(ProgressEvent<'_>) + Send + Sync>;

/// Result of one orchestrated run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub plan: BuildPlan,
    /// One entry per plan node, in plan order
    pub outcomes: Vec<(String, FormulaOutcome)>,
    pub verification: Vec<VerificationReport>,
}

impl RunReport {
    /// Longest prefix of the plan that completed
    pub fn succeeded_prefix(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .take_while(|(_, o)| o.artifact().is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Failures, skips and cancellations in plan order
    pub fn failures(&self) -> impl Iterator<Item = &InstallError> {
        self.outcomes.iter().filter_map(|(_, o)| o.error())
    }

    pub fn outcome(&self, name: &str) -> Option<&FormulaOutcome> {
        self.outcomes.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn artifact(&self, name: &str) -> Option<&InstalledArtifact> {
        self.outcome(name).and_then(FormulaOutcome::artifact)
    }

    pub fn verification_passed(&self) -> bool {
        self.verification.iter().all(VerificationReport::passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.failures().next().is_some() {
            exit_code::BUILD_FAILURE
        } else if !self.verification_passed() {
            exit_code::VERIFICATION_FAILURE
        } else {
            exit_code::SUCCESS
        }
    }
}

/// Build orchestrator
pub struct Builder<'a, S, R> {
    registry: &'a Registry,
    sources: &'a S,
    runner: &'a R,
    layout: &'a Layout,
    platform: &'a Platform,
    settings: &'a EnvSettings,
    options: BuildOptions,
    progress: Option<ProgressCallback>,
}

impl<'a, S: SourceProvider, R: CommandRunner> Builder<'a, S, R> {
    pub fn new(
        registry: &'a Registry,
        sources: &'a S,
        runner: &'a R,
        layout: &'a Layout,
        platform: &'a Platform,
        settings: &'a EnvSettings,
    ) -> Self {
        Self {
            registry,
            sources,
            runner,
            layout,
            platform,
            settings,
            options: BuildOptions::default(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn emit(&self, event: ProgressEvent<'_>) {
        if let Some(callback) = &self.progress {
            callback(event);
        }
    }

    /// Install every formula of `plan`, then verify
    ///
    /// Once `cancel` fires nothing new is started, in-flight installs are
    /// dropped and every unfinished formula is reported as cancelled.
    pub async fn run(&self, plan: &BuildPlan, cancel: &CancellationToken) -> RunReport {
        let workers = self.options.workers.max(1);
        info!(root = plan.root(), formulas = plan.len(), workers, "starting build");

        let mut outcomes: BTreeMap<String, FormulaOutcome> = BTreeMap::new();
        let mut artifacts: BTreeMap<String, InstalledArtifact> = BTreeMap::new();
        let mut pending: Vec<&str> = plan.order().iter().map(String::as_str).collect();
        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut i = 0;
            while i < pending.len() {
                let name = pending[i];
                let deps = plan.dependencies(name);

                if let Some(dependency) = deps.iter().find_map(|d| failed_root_cause(&outcomes, d)) {
                    warn!(formula = name, dependency = %dependency, "skipping");
                    self.emit(ProgressEvent::Skipped(name));
                    outcomes.insert(
                        name.to_string(),
                        FormulaOutcome::Failed(InstallError::SkippedDueToDependencyFailure {
                            name: name.to_string(),
                            dependency,
                        }),
                    );
                    pending.remove(i);
                    continue;
                }

                let ready = deps.iter().all(|d| artifacts.contains_key(d));
                let Some(formula) = self.registry.get(name) else {
                    // Plans are resolved against this registry
                    pending.remove(i);
                    continue;
                };

                if ready {
                    if let Some(artifact) = self.reusable(formula, plan) {
                        debug!(formula = name, keg = %artifact.root.display(), "reusing installed keg");
                        self.emit(ProgressEvent::Reused(name));
                        artifacts.insert(name.to_string(), artifact.clone());
                        outcomes.insert(name.to_string(), FormulaOutcome::Reused(artifact));
                        pending.remove(i);
                        continue;
                    }
                    if in_flight.len() < workers {
                        let snapshot: BTreeMap<String, InstalledArtifact> = plan
                            .transitive_dependencies(name)
                            .into_iter()
                            .filter_map(|d| artifacts.get(d).map(|a| (d.to_string(), a.clone())))
                            .collect();
                        self.emit(ProgressEvent::Started(name));
                        running.insert(name.to_string());
                        in_flight.push(self.install_one(formula, plan, snapshot));
                        pending.remove(i);
                        continue;
                    }
                }
                i += 1;
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some((name, result)) = in_flight.next() => {
                    running.remove(&name);
                    self.record(name, result, &mut outcomes, &mut artifacts);
                }
            }
        }

        // Installs that finished but were not collected before cancellation
        while let Some(Some((name, result))) = in_flight.next().now_or_never() {
            running.remove(&name);
            self.record(name, result, &mut outcomes, &mut artifacts);
        }

        // Dropping in-flight installs kills their children and removes
        // their scratch directories and partial kegs
        drop(in_flight);

        if cancel.is_cancelled() {
            warn!(running = running.len(), pending = pending.len(), "build cancelled");
            for name in running.iter().map(String::as_str).chain(pending.iter().copied()) {
                outcomes.insert(
                    name.to_string(),
                    FormulaOutcome::Failed(InstallError::Cancelled {
                        name: name.to_string(),
                    }),
                );
            }
        }

        let verification = if cancel.is_cancelled() {
            Vec::new()
        } else {
            self.verify(plan, &outcomes, &artifacts).await
        };

        let outcomes = plan
            .order()
            .iter()
            .filter_map(|name| outcomes.remove(name).map(|o| (name.clone(), o)))
            .collect();

        RunReport {
            plan: plan.clone(),
            outcomes,
            verification,
        }
    }

    fn record(
        &self,
        name: String,
        result: Result<InstalledArtifact, InstallError>,
        outcomes: &mut BTreeMap<String, FormulaOutcome>,
        artifacts: &mut BTreeMap<String, InstalledArtifact>,
    ) {
        match result {
            Ok(artifact) => {
                self.emit(ProgressEvent::Installed(&name));
                artifacts.insert(name.clone(), artifact.clone());
                outcomes.insert(name, FormulaOutcome::Installed(artifact));
            }
            Err(error) => {
                warn!(formula = %name, error = %error, "install failed");
                self.emit(ProgressEvent::Failed(&name));
                outcomes.insert(name, FormulaOutcome::Failed(error));
            }
        }
    }

    async fn install_one(
        &self,
        formula: &'a Formula,
        plan: &BuildPlan,
        dependencies: BTreeMap<String, InstalledArtifact>,
    ) -> (String, Result<InstalledArtifact, InstallError>) {
        let installer = Installer::new(self.sources, self.runner, self.layout, self.platform, self.settings);
        let result = installer.install(formula, plan, &dependencies).await;
        (formula.name.clone(), result)
    }

    /// An existing keg that satisfies the plan, if reuse is allowed
    fn reusable(&self, formula: &Formula, plan: &BuildPlan) -> Option<InstalledArtifact> {
        let is_root = formula.name == plan.root();
        if (is_root && self.options.reinstall_root) || (!is_root && self.options.force) {
            return None;
        }

        let label = plan.variant(&formula.name).unwrap_or(DEFAULT_VARIANT);
        let variant = formula.variants.iter().find(|v| v.label == label)?;
        let keg = self.layout.keg(&formula.name, &formula.pkg_version(variant));
        InstalledArtifact::load(&keg)
            .ok()
            .filter(|artifact| artifact.variant == label && !artifact.is_empty())
    }

    async fn verify(
        &self,
        plan: &BuildPlan,
        outcomes: &BTreeMap<String, FormulaOutcome>,
        artifacts: &BTreeMap<String, InstalledArtifact>,
    ) -> Vec<VerificationReport> {
        let verifier = Verifier::new(self.runner, self.layout, &self.settings.base_path);
        let mut reports = Vec::new();

        for name in plan.order() {
            let Some(outcome) = outcomes.get(name) else {
                continue;
            };
            let full = name == plan.root() && self.options.verify == VerifyMode::Full;

            match outcome {
                FormulaOutcome::Installed(artifact) if !full => reports.push(verifier.check(artifact)),
                FormulaOutcome::Installed(artifact) | FormulaOutcome::Reused(artifact) if full => {
                    let Some(formula) = self.registry.get(name) else {
                        continue;
                    };
                    let dependencies: Vec<&InstalledArtifact> = plan
                        .transitive_dependencies(name)
                        .into_iter()
                        .filter_map(|d| artifacts.get(d))
                        .collect();
                    info!(formula = %name, steps = formula.test_steps.len(), "running tests");
                    reports.push(verifier.verify(formula, artifact, plan, &dependencies).await);
                }
                _ => {}
            }
        }

        for report in reports.iter().filter(|r| !r.passed()) {
            warn!(formula = %report.formula, failures = report.errors().count(), "verification failed");
        }
        reports
    }
}

/// Name of the formula whose failure makes `dependency` unusable
fn failed_root_cause(outcomes: &BTreeMap<String, FormulaOutcome>, dependency: &str) -> Option<String> {
    match outcomes.get(dependency)? {
        FormulaOutcome::Failed(InstallError::SkippedDueToDependencyFailure { dependency, .. }) => {
            Some(dependency.clone())
        }
        FormulaOutcome::Failed(_) => Some(dependency.to_string()),
        _ => None,
    }
}
