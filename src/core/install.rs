//! Install executor
//!
//! Takes one formula of a [`BuildPlan`] from source to installed keg: fetch
//! and checksum, extraction, patches, install steps, receipt and `opt` link.
//!
//! All scratch work happens in a temporary directory that is removed on
//! every exit path. A partially populated keg is removed too unless the
//! install finished, so dropping the install future (cancellation) leaves
//! nothing behind but completed kegs of other formulas.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::core::action::{BuildAction, Placeholders};
use crate::core::artifact::{InstalledArtifact, Layout};
use crate::core::build_env::{EnvSettings, Environment};
use crate::core::formula::{Formula, Variant, DEFAULT_VARIANT};
use crate::core::platform::{self, EvalContext, Platform};
use crate::core::resolver::BuildPlan;
use crate::error::{FilesystemError, InstallError};
use crate::infra::download::SourceProvider;
use crate::infra::filesystem;
use crate::infra::process::{CommandRunner, CommandSpec};

/// Everything an install needs besides the formula itself
#[derive(Debug)]
pub struct Installer<'a, S, R> {
    sources: &'a S,
    runner: &'a R,
    layout: &'a Layout,
    platform: &'a Platform,
    settings: &'a EnvSettings,
}

/// Digest reported for sources that cannot be hashed (checkouts, directories)
const UNVERIFIABLE: &str = "unverifiable";

/// Owns a keg while it is being populated
///
/// An existing keg at the same path is moved aside first. Unless the install
/// completes, the partial keg is removed on drop and the previous one is put
/// back; on completion the previous keg is discarded.
struct KegGuard {
    path: PathBuf,
    previous: Option<PathBuf>,
    armed: bool,
}

impl KegGuard {
    fn prepare(path: PathBuf) -> Result<Self, FilesystemError> {
        let aside = previous_keg_path(&path);
        filesystem::remove_dir_all(&aside)?;
        let previous = if path.exists() {
            std::fs::rename(&path, &aside).map_err(|e| FilesystemError::WriteFile {
                path: aside.clone(),
                error: e.to_string(),
            })?;
            debug!(keg = %path.display(), "moved existing keg aside");
            Some(aside)
        } else {
            None
        };
        filesystem::create_dir_all(&path)?;
        Ok(Self {
            path,
            previous,
            armed: true,
        })
    }

    fn disarm(mut self) {
        self.armed = false;
        if let Some(previous) = self.previous.take() {
            if let Err(e) = filesystem::remove_dir_all(&previous) {
                warn!(keg = %previous.display(), error = %e, "failed to remove replaced keg");
            }
        }
    }
}

impl Drop for KegGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(keg = %self.path.display(), "removing partial keg");
        let _ = std::fs::remove_dir_all(&self.path);
        if let Some(previous) = self.previous.take() {
            match std::fs::rename(&previous, &self.path) {
                Ok(()) => debug!(keg = %self.path.display(), "restored previous keg"),
                Err(e) => warn!(keg = %self.path.display(), error = %e, "failed to restore previous keg"),
            }
        }
    }
}

/// Sibling of `keg` holding the install being replaced
fn previous_keg_path(keg: &Path) -> PathBuf {
    let version = keg.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    keg.with_file_name(format!(".{version}.previous"))
}

fn fs_error_for(name: &str) -> impl FnOnce(FilesystemError) -> InstallError + Send + 'static {
    let name = name.to_string();
    move |e| InstallError::Filesystem {
        name,
        error: e.to_string(),
    }
}

/// Run synchronous filesystem work off the async worker threads
async fn blocking<T, F>(name: &str, work: F) -> Result<T, InstallError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| InstallError::Filesystem {
            name: name.to_string(),
            error: e.to_string(),
        })?
}

/// Per-install state threaded through the steps
struct StepContext<'p> {
    name: &'p str,
    scratch: Arc<TempDir>,
    buildpath: PathBuf,
    home: PathBuf,
    tmp: PathBuf,
    placeholders: Placeholders,
}

impl StepContext<'_> {
    /// Expand placeholders and anchor relative paths at the build directory
    fn path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(self.placeholders.expand(raw));
        if expanded.is_absolute() {
            expanded
        } else {
            self.buildpath.join(expanded)
        }
    }

    fn env_map(&self, env: &Environment) -> BTreeMap<String, String> {
        env.to_env_map(&[
            ("HOME", self.home.display().to_string()),
            ("TMPDIR", self.tmp.display().to_string()),
        ])
    }

    /// Run `work` on the blocking pool, keeping the scratch directory alive until it returns
    async fn blocking<T, F>(&self, work: F) -> Result<T, InstallError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, InstallError> + Send + 'static,
    {
        let scratch = Arc::clone(&self.scratch);
        blocking(self.name, move || {
            let _scratch = scratch;
            work()
        })
        .await
    }

    fn fs_error(&self) -> impl Fn(FilesystemError) -> InstallError + '_ {
        move |e| InstallError::Filesystem {
            name: self.name.to_string(),
            error: e.to_string(),
        }
    }
}

impl<'a, S: SourceProvider, R: CommandRunner> Installer<'a, S, R> {
    pub fn new(
        sources: &'a S,
        runner: &'a R,
        layout: &'a Layout,
        platform: &'a Platform,
        settings: &'a EnvSettings,
    ) -> Self {
        Self {
            sources,
            runner,
            layout,
            platform,
            settings,
        }
    }

    /// Build and install `formula` as selected in `plan`
    ///
    /// `artifacts` must contain every dependency of `formula` in the plan.
    pub async fn install(
        &self,
        formula: &Formula,
        plan: &BuildPlan,
        artifacts: &BTreeMap<String, InstalledArtifact>,
    ) -> Result<InstalledArtifact, InstallError> {
        let name = formula.name.as_str();
        let variant = self.variant(formula, plan)?;
        let version = formula.pkg_version(variant);
        let keg = self.layout.keg(name, &version);

        info!(formula = name, version = %version, variant = %variant.label, "installing");

        let env = Environment::build(formula, plan, artifacts, self.platform, self.settings, &keg)
            .map_err(|e| InstallError::Environment {
                name: name.to_string(),
                error: e.to_string(),
            })?;

        let scratch = filesystem::scoped_workdir(&self.layout.tmp(), &format!("{name}-"))
            .map(Arc::new)
            .map_err(fs_error_for(name))?;
        let work = scratch.path();

        let buildpath = self.stage_source(formula, variant, &scratch).await?;

        let ctx = StepContext {
            name,
            scratch: Arc::clone(&scratch),
            home: work.join("home"),
            tmp: work.join("tmp"),
            placeholders: keg_placeholders(self.layout, formula, plan, &version, &keg, self.settings.jobs)
                .with("buildpath", buildpath.display().to_string()),
            buildpath,
        };
        for dir in [&ctx.home, &ctx.tmp] {
            filesystem::create_dir_all(dir).map_err(ctx.fs_error())?;
        }

        self.apply_patches(variant, &ctx, &env, work).await?;

        let guard = KegGuard::prepare(keg.clone()).map_err(ctx.fs_error())?;

        let eval = EvalContext::new(self.platform, &variant.label);
        let steps = flatten_steps(&formula.install_steps, &eval);
        self.run_steps(&steps, &ctx, env).await?;

        let artifact = InstalledArtifact::scan(name, &version, &variant.label, &keg, formula.keg_only);
        if artifact.is_empty() {
            return Err(InstallError::EmptyInstallation {
                name: name.to_string(),
                keg,
            });
        }

        artifact
            .receipt(&variant.url.to_string(), plan.dependencies(name))
            .write(&keg)
            .map_err(ctx.fs_error())?;
        filesystem::create_symlink(&keg, &self.layout.opt(name), true).map_err(ctx.fs_error())?;

        guard.disarm();
        info!(
            formula = name,
            files = artifact.files.len(),
            symlinks = artifact.symlinks.len(),
            keg = %keg.display(),
            "installed"
        );
        Ok(artifact)
    }

    fn variant<'f>(&self, formula: &'f Formula, plan: &BuildPlan) -> Result<&'f Variant, InstallError> {
        let label = plan.variant(&formula.name).unwrap_or(DEFAULT_VARIANT);
        formula
            .variants
            .iter()
            .find(|v| v.label == label)
            .ok_or_else(|| InstallError::Environment {
                name: formula.name.clone(),
                error: format!("variant '{label}' is not declared"),
            })
    }

    /// Fetch, verify and unpack the variant's source; returns the build directory
    async fn stage_source(
        &self,
        formula: &Formula,
        variant: &Variant,
        scratch: &Arc<TempDir>,
    ) -> Result<PathBuf, InstallError> {
        let name = formula.name.as_str();
        let work = scratch.path();
        let fs_error = fs_error_for(name);

        let fetched = self
            .sources
            .fetch(&variant.url, variant.sha256.as_ref(), &work.join("download"))
            .await
            .map_err(|e| InstallError::Fetch {
                name: name.to_string(),
                error: e.to_string(),
            })?;

        // A declared digest must be checked against the bytes we build from
        if let Some(expected) = &variant.sha256 {
            let actual = fetched.sha256.as_deref().unwrap_or(UNVERIFIABLE);
            if !expected.matches(actual) {
                return Err(InstallError::ChecksumMismatch {
                    name: name.to_string(),
                    source_url: variant.url.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        debug!(formula = name, path = %fetched.path.display(), size = fetched.size, "source fetched");

        let src = work.join("src");
        if fetched.path.is_dir() {
            return Ok(fetched.path);
        }
        let scratch = Arc::clone(scratch);
        blocking(name, move || {
            let _scratch = scratch;
            let staged = if filesystem::is_archive(&fetched.path) {
                filesystem::extract_archive(&fetched.path, &src)
            } else {
                let file_name = fetched.path.file_name().unwrap_or_default();
                filesystem::copy_file(&fetched.path, &src.join(file_name)).map(|()| src)
            };
            staged.map_err(fs_error)
        })
        .await
    }

    async fn apply_patches(
        &self,
        variant: &Variant,
        ctx: &StepContext<'_>,
        env: &Environment,
        work: &Path,
    ) -> Result<(), InstallError> {
        for (i, patch) in variant.patches.iter().enumerate() {
            let index = i + 1;
            let failed = |detail: String| InstallError::PatchApplyFailed {
                name: ctx.name.to_string(),
                index,
                detail,
            };

            let fetched = self
                .sources
                .fetch(&patch.url, Some(&patch.sha256), &work.join("patches").join(index.to_string()))
                .await
                .map_err(|e| failed(e.to_string()))?;

            match &fetched.sha256 {
                Some(actual) if patch.sha256.matches(actual) => {}
                Some(actual) => {
                    return Err(InstallError::ChecksumMismatch {
                        name: ctx.name.to_string(),
                        source_url: patch.url.to_string(),
                        expected: patch.sha256.to_string(),
                        actual: actual.clone(),
                    })
                }
                None => return Err(failed("patch is not a file".to_string())),
            }

            let spec = CommandSpec::new("patch", &ctx.buildpath)
                .args([
                    format!("-p{}", patch.strip),
                    "--batch".to_string(),
                    "-i".to_string(),
                    fetched.path.display().to_string(),
                ])
                .envs(&ctx.env_map(env));

            debug!(formula = ctx.name, index, patch = %patch.url, "applying patch");
            let output = self
                .runner
                .run(&spec)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !output.success() {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                return Err(failed(detail));
            }
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        steps: &[(usize, &BuildAction)],
        ctx: &StepContext<'_>,
        mut env: Environment,
    ) -> Result<(), InstallError> {
        let p = &ctx.placeholders;

        for (step, action) in steps.iter().copied() {
            debug!(formula = ctx.name, step, action = %action.describe(), "install step");

            match action {
                BuildAction::SetEnv { name, value, mode } => {
                    env = env.overlay(name, &p.expand(value), *mode);
                }
                BuildAction::Run { command, args, cwd } => {
                    let cwd = cwd
                        .as_deref()
                        .map_or_else(|| ctx.buildpath.clone(), |c| ctx.path(c));
                    let spec = CommandSpec::new(p.expand(command), cwd)
                        .args(p.expand_all(args))
                        .envs(&ctx.env_map(&env));
                    let output = self.runner.run(&spec).await.map_err(|e| InstallError::Process {
                        name: ctx.name.to_string(),
                        step,
                        error: format!("{}: {e}", spec.display()),
                    })?;
                    if !output.success() {
                        return Err(InstallError::BuildStepFailed {
                            name: ctx.name.to_string(),
                            step,
                            command: spec.display(),
                            exit_code: output.exit_code,
                        });
                    }
                }
                BuildAction::Symlink {
                    target,
                    link,
                    relative,
                } => {
                    filesystem::create_symlink(&ctx.path(target), &ctx.path(link), *relative)
                        .map_err(ctx.fs_error())?;
                }
                BuildAction::PatchText {
                    file,
                    pattern,
                    replacement,
                    regex,
                } => {
                    let edit = TextPatch {
                        name: ctx.name.to_string(),
                        step,
                        buildpath: ctx.buildpath.clone(),
                        file: file.clone(),
                        files: p.expand(file),
                        pattern: pattern.clone(),
                        replacement: p.expand(replacement),
                        regex: *regex,
                    };
                    let patched = ctx.blocking(move || edit.apply()).await?;
                    for (path, count) in &patched {
                        info!(
                            formula = ctx.name,
                            step,
                            file = %path.display(),
                            replacements = *count,
                            "patched text"
                        );
                    }
                }
                BuildAction::ChangeMakeVar { file, name, value } => {
                    let edit = MakeVarEdit {
                        name: ctx.name.to_string(),
                        step,
                        path: ctx.path(file),
                        file: file.clone(),
                        var: name.clone(),
                        value: p.expand(value),
                    };
                    ctx.blocking(move || edit.apply()).await?;
                }
                BuildAction::Mkdir { path } => {
                    filesystem::create_dir_all(&ctx.path(path)).map_err(ctx.fs_error())?;
                }
                // Already expanded by `flatten_steps`
                BuildAction::Conditional { .. } => {}
            }
        }
        Ok(())
    }
}

/// Placeholder values describing a keg and its dependencies
pub(crate) fn keg_placeholders(
    layout: &Layout,
    formula: &Formula,
    plan: &BuildPlan,
    version: &str,
    keg: &Path,
    jobs: usize,
) -> Placeholders {
    let dir = |sub: &str| keg.join(sub).display().to_string();
    let mut placeholders = Placeholders::new()
        .with("name", formula.name.as_str())
        .with("version", version)
        .with("prefix", keg.display().to_string())
        .with("bin", dir("bin"))
        .with("lib", dir("lib"))
        .with("include", dir("include"))
        .with("share", dir("share"))
        .with("pkgshare", keg.join("share").join(&formula.name).display().to_string())
        .with("etc", dir("etc"))
        .with("jobs", jobs.to_string())
        .with("root", layout.root().display().to_string());
    for dep in plan.transitive_dependencies(&formula.name) {
        placeholders = placeholders.with_opt(dep, layout.opt(dep).display().to_string());
    }
    placeholders
}

/// Expand conditionals into the steps that actually run
///
/// Each entry carries the 1-based index of the top-level step it came from.
fn flatten_steps<'s>(steps: &'s [BuildAction], ctx: &EvalContext<'_>) -> Vec<(usize, &'s BuildAction)> {
    fn walk<'s>(step: usize, action: &'s BuildAction, ctx: &EvalContext<'_>, out: &mut Vec<(usize, &'s BuildAction)>) {
        match action {
            BuildAction::Conditional { when, actions } => {
                if platform::holds(Some(when), ctx) {
                    for nested in actions {
                        walk(step, nested, ctx, out);
                    }
                }
            }
            other => out.push((step, other)),
        }
    }

    let mut out = Vec::new();
    for (i, action) in steps.iter().enumerate() {
        walk(i + 1, action, ctx, &mut out);
    }
    out
}

/// In-place text substitution over the build files matching a glob
struct TextPatch {
    name: String,
    step: usize,
    buildpath: PathBuf,
    /// Pattern as written, for error reports
    file: String,
    /// Pattern with placeholders expanded
    files: String,
    pattern: String,
    replacement: String,
    regex: bool,
}

impl TextPatch {
    fn failed(&self) -> InstallError {
        InstallError::TextPatchFailed {
            name: self.name.clone(),
            step: self.step,
            file: self.file.clone(),
            pattern: self.pattern.clone(),
        }
    }

    fn fs_error(&self, e: FilesystemError) -> InstallError {
        InstallError::Filesystem {
            name: self.name.clone(),
            error: e.to_string(),
        }
    }

    /// Rewrite every matching file; returns each changed file with its replacement count
    fn apply(&self) -> Result<Vec<(PathBuf, usize)>, InstallError> {
        let regex = if self.regex {
            Some(
                RegexBuilder::new(&self.pattern)
                    .multi_line(true)
                    .build()
                    .map_err(|_| self.failed())?,
            )
        } else {
            None
        };

        let files = filesystem::glob(&self.buildpath, &self.files).map_err(|e| self.fs_error(e))?;

        let mut patched = Vec::new();
        for path in files {
            let content = filesystem::read_file(&path).map_err(|e| self.fs_error(e))?;
            let (count, updated) = match &regex {
                Some(re) => (
                    re.find_iter(&content).count(),
                    re.replace_all(&content, self.replacement.as_str()).into_owned(),
                ),
                None => (
                    content.matches(self.pattern.as_str()).count(),
                    content.replace(&self.pattern, &self.replacement),
                ),
            };
            if count > 0 {
                filesystem::write_file(&path, &updated).map_err(|e| self.fs_error(e))?;
                patched.push((path, count));
            }
        }

        if patched.is_empty() {
            Err(self.failed())
        } else {
            Ok(patched)
        }
    }
}

/// Replace the value of a Makefile variable assignment
struct MakeVarEdit {
    name: String,
    step: usize,
    path: PathBuf,
    file: String,
    var: String,
    value: String,
}

impl MakeVarEdit {
    fn apply(&self) -> Result<(), InstallError> {
        let failed = || InstallError::TextPatchFailed {
            name: self.name.clone(),
            step: self.step,
            file: self.file.clone(),
            pattern: format!("{} =", self.var),
        };
        let fs_error = |e: FilesystemError| InstallError::Filesystem {
            name: self.name.clone(),
            error: e.to_string(),
        };

        let re = Regex::new(&format!(r"(?m)^([ \t]*{}[ \t]*[:?+]?=)[^\n]*$", regex::escape(&self.var)))
            .map_err(|_| failed())?;
        let content = filesystem::read_file(&self.path).map_err(fs_error)?;
        if !re.is_match(&content) {
            return Err(failed());
        }

        let updated = re.replace_all(&content, |caps: &regex::Captures<'_>| {
            format!("{} {}", &caps[1], self.value)
        });
        filesystem::write_file(&self.path, &updated).map_err(fs_error)
    }
}
