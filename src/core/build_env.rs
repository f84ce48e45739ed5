//! Build environment setup
//!
//! Computes the environment a formula is built in from its resolved plan and
//! the artifacts of its dependencies. Nothing here reads the caller's
//! environment: identical inputs always yield an identical [`Environment`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::defaults;
use crate::core::action::EnvMode;
use crate::core::artifact::InstalledArtifact;
use crate::core::formula::Formula;
use crate::core::platform::Platform;
use crate::core::resolver::BuildPlan;

/// Environment construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildEnvError {
    /// A plan dependency has not been installed
    #[error("Dependency '{dependency}' of '{formula}' has no installed artifact")]
    MissingArtifact { formula: String, dependency: String },

    /// Every host compiler is excluded by `fails_with`
    #[error("No usable compiler for '{formula}'")]
    NoCompiler { formula: String },
}

/// Settings shared by every build of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSettings {
    /// `PATH` entries after dependency `bin` directories
    pub base_path: Vec<String>,
    /// Library directories searched after every dependency
    pub system_lib_paths: Vec<PathBuf>,
    /// Parallel jobs per build
    pub jobs: usize,
}

impl EnvSettings {
    pub fn new(root: &Path) -> Self {
        Self {
            base_path: defaults::BASE_PATH.iter().map(|s| (*s).to_string()).collect(),
            system_lib_paths: std::iter::once(root.join("lib"))
                .chain(defaults::SYSTEM_LIB_PATHS.iter().map(PathBuf::from))
                .collect(),
            jobs: num_cpus::get(),
        }
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, base_path: Vec<String>) -> Self {
        self.base_path = base_path;
        self
    }

    #[must_use]
    pub fn with_system_lib_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_lib_paths = paths;
        self
    }
}

/// Immutable build environment of one formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Library search order: keg-only dependencies, regular dependencies,
    /// then system paths
    pub search_paths: Vec<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

impl Environment {
    /// Compute the environment for building `formula` into `keg`
    ///
    /// `artifacts` must hold every formula `formula` transitively depends on
    /// in `plan`.
    pub fn build(
        formula: &Formula,
        plan: &BuildPlan,
        artifacts: &BTreeMap<String, InstalledArtifact>,
        platform: &Platform,
        settings: &EnvSettings,
        keg: &Path,
    ) -> Result<Self, BuildEnvError> {
        let deps = plan
            .transitive_dependencies(&formula.name)
            .into_iter()
            .map(|dep| {
                artifacts
                    .get(dep)
                    .ok_or_else(|| BuildEnvError::MissingArtifact {
                        formula: formula.name.clone(),
                        dependency: dep.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let compiler = formula
            .select_compiler(platform)
            .ok_or_else(|| BuildEnvError::NoCompiler {
                formula: formula.name.clone(),
            })?;

        // Keg-only first, stable within each group
        let ordered: Vec<&InstalledArtifact> = deps
            .iter()
            .filter(|a| a.keg_only)
            .chain(deps.iter().filter(|a| !a.keg_only))
            .copied()
            .collect();

        let search_paths: Vec<PathBuf> = ordered
            .iter()
            .map(|a| a.lib())
            .chain(settings.system_lib_paths.iter().cloned())
            .collect();

        let path = deps
            .iter()
            .map(|a| a.bin().display().to_string())
            .chain(settings.base_path.iter().cloned())
            .collect::<Vec<_>>()
            .join(":");

        let ldflags = search_paths
            .iter()
            .map(|p| format!("-L{0} -Wl,-rpath,{0}", p.display()))
            .collect::<Vec<_>>()
            .join(" ");

        let cppflags = ordered
            .iter()
            .map(|a| format!("-I{}", a.include().display()))
            .collect::<Vec<_>>()
            .join(" ");

        let pkg_config_path = ordered
            .iter()
            .map(|a| a.lib().join("pkgconfig").display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        let mut vars = BTreeMap::new();
        vars.insert("PATH".to_string(), path);
        vars.insert("CC".to_string(), compiler.cc().to_string());
        vars.insert("CXX".to_string(), compiler.cxx().to_string());
        vars.insert("PREFIX".to_string(), keg.display().to_string());
        vars.insert("JOBS".to_string(), settings.jobs.to_string());
        vars.insert("MAKEFLAGS".to_string(), format!("-j{}", settings.jobs));
        vars.insert(
            "SOURCE_DATE_EPOCH".to_string(),
            defaults::SOURCE_DATE_EPOCH.to_string(),
        );
        if !ldflags.is_empty() {
            vars.insert("LDFLAGS".to_string(), ldflags);
        }
        if !cppflags.is_empty() {
            vars.insert("CPPFLAGS".to_string(), cppflags);
        }
        if !pkg_config_path.is_empty() {
            vars.insert("PKG_CONFIG_PATH".to_string(), pkg_config_path);
        }

        Ok(Self { search_paths, vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// A copy with one variable changed the way a `set_env` step asks
    #[must_use]
    pub fn overlay(&self, name: &str, value: &str, mode: EnvMode) -> Self {
        let mut next = self.clone();
        let combined = match (mode, self.vars.get(name)) {
            (EnvMode::Append, Some(old)) if !old.is_empty() => format!("{old} {value}"),
            (EnvMode::PrependPath, Some(old)) if !old.is_empty() => format!("{value}:{old}"),
            _ => value.to_string(),
        };
        next.vars.insert(name.to_string(), combined);
        next
    }

    /// Variables for process execution, plus `extra`
    pub fn to_env_map(&self, extra: &[(&str, String)]) -> BTreeMap<String, String> {
        let mut env = self.vars.clone();
        for (key, value) in extra {
            env.insert((*key).to_string(), value.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::platform::{Arch, CompilerKind, Os};
    use crate::core::registry::Registry;
    use crate::core::resolver::{PlanMode, Resolver};
    use crate::test_utils::formula_with_deps;
    use proptest::prelude::*;

    fn artifact(name: &str, keg_only: bool) -> InstalledArtifact {
        InstalledArtifact {
            name: name.to_string(),
            version: "1.0".to_string(),
            variant: "stable".to_string(),
            root: PathBuf::from(format!("/r/Cellar/{name}/1.0")),
            keg_only,
            files: Vec::new(),
            symlinks: Vec::new(),
        }
    }

    fn setup(keg_only: &[&str]) -> (Registry, BuildPlan, BTreeMap<String, InstalledArtifact>) {
        let registry = Registry::from_formulas(vec![
            formula_with_deps("openblas", &[]),
            formula_with_deps("gcc", &[]),
            formula_with_deps("llvm", &[]),
            formula_with_deps("julia", &[("openblas", "runtime"), ("gcc", "build"), ("llvm", "runtime")]),
        ])
        .unwrap();
        let platform = Platform::new(Os::Linux, Arch::X86_64);
        let plan = Resolver::new(&registry, &platform)
            .resolve("julia", None, PlanMode::Install)
            .unwrap();
        let artifacts = ["openblas", "gcc", "llvm"]
            .iter()
            .map(|n| (n.to_string(), artifact(n, keg_only.contains(n))))
            .collect();
        (registry, plan, artifacts)
    }

    fn settings() -> EnvSettings {
        EnvSettings::new(Path::new("/r")).with_jobs(4)
    }

    #[test]
    fn test_keg_only_paths_come_first() {
        let (registry, plan, artifacts) = setup(&["llvm"]);
        let platform = Platform::new(Os::Linux, Arch::X86_64);
        let env = Environment::build(
            registry.get("julia").unwrap(),
            &plan,
            &artifacts,
            &platform,
            &settings(),
            Path::new("/r/Cellar/julia/1.0"),
        )
        .unwrap();

        assert_eq!(
            env.search_paths,
            [
                PathBuf::from("/r/Cellar/llvm/1.0/lib"),
                PathBuf::from("/r/Cellar/openblas/1.0/lib"),
                PathBuf::from("/r/Cellar/gcc/1.0/lib"),
                PathBuf::from("/r/lib"),
                PathBuf::from("/usr/lib"),
            ]
        );
        assert!(env
            .get("LDFLAGS")
            .unwrap()
            .starts_with("-L/r/Cellar/llvm/1.0/lib -Wl,-rpath,/r/Cellar/llvm/1.0/lib"));
    }

    #[test]
    fn test_variables() {
        let (registry, plan, artifacts) = setup(&[]);
        let platform = Platform::new(Os::Linux, Arch::X86_64);
        let env = Environment::build(
            registry.get("julia").unwrap(),
            &plan,
            &artifacts,
            &platform,
            &settings(),
            Path::new("/r/Cellar/julia/1.0"),
        )
        .unwrap();

        assert_eq!(
            env.get("PATH"),
            Some("/r/Cellar/openblas/1.0/bin:/r/Cellar/gcc/1.0/bin:/r/Cellar/llvm/1.0/bin:/usr/bin:/bin:/usr/sbin:/sbin")
        );
        assert_eq!(env.get("CC"), Some("gcc"));
        assert_eq!(env.get("CXX"), Some("g++"));
        assert_eq!(env.get("PREFIX"), Some("/r/Cellar/julia/1.0"));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j4"));
        assert_eq!(env.get("SOURCE_DATE_EPOCH"), Some("315532800"));
        assert!(env.get("CPPFLAGS").unwrap().contains("-I/r/Cellar/gcc/1.0/include"));
    }

    #[test]
    fn test_fails_with_selects_next_compiler() {
        let (registry, plan, artifacts) = setup(&[]);
        let mut julia = registry.get("julia").unwrap().clone();
        julia.fails_with = vec![crate::core::formula::CompilerFailure {
            compiler: CompilerKind::Gcc,
            version: None,
        }];
        let platform = Platform::new(Os::Linux, Arch::X86_64);
        let env = Environment::build(&julia, &plan, &artifacts, &platform, &settings(), Path::new("/k"))
            .unwrap();
        assert_eq!(env.get("CC"), Some("clang"));
    }

    #[test]
    fn test_missing_artifact() {
        let (registry, plan, mut artifacts) = setup(&[]);
        artifacts.remove("gcc");
        let platform = Platform::new(Os::Linux, Arch::X86_64);
        let err = Environment::build(
            registry.get("julia").unwrap(),
            &plan,
            &artifacts,
            &platform,
            &settings(),
            Path::new("/k"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            BuildEnvError::MissingArtifact {
                formula: "julia".to_string(),
                dependency: "gcc".to_string()
            }
        );
    }

    #[test]
    fn test_overlay_modes() {
        let env = Environment {
            search_paths: Vec::new(),
            vars: BTreeMap::from([
                ("LDFLAGS".to_string(), "-L/a".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ]),
        };

        let env2 = env
            .overlay("LDFLAGS", "-Wl,-rpath,/k/lib", EnvMode::Append)
            .overlay("PATH", "/k/bin", EnvMode::PrependPath)
            .overlay("USE_BINARYBUILDER", "0", EnvMode::Set);

        assert_eq!(env2.get("LDFLAGS"), Some("-L/a -Wl,-rpath,/k/lib"));
        assert_eq!(env2.get("PATH"), Some("/k/bin:/usr/bin"));
        assert_eq!(env2.get("USE_BINARYBUILDER"), Some("0"));
        // The original is untouched
        assert_eq!(env.get("LDFLAGS"), Some("-L/a"));
        assert_eq!(env.overlay("NEW", "x", EnvMode::Append).get("NEW"), Some("x"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Building twice from the same inputs gives the same environment,
        /// and keg-only library paths always precede regular ones.
        #[test]
        fn prop_environment_is_pure(mask in proptest::collection::vec(any::<bool>(), 3), jobs in 1usize..64) {
            let names = ["openblas", "gcc", "llvm"];
            let keg_only: Vec<&str> = names
                .iter()
                .zip(&mask)
                .filter(|(_, k)| **k)
                .map(|(n, _)| *n)
                .collect();
            let (registry, plan, artifacts) = setup(&keg_only);
            let platform = Platform::new(Os::Linux, Arch::X86_64);
            let settings = EnvSettings::new(Path::new("/r")).with_jobs(jobs);
            let julia = registry.get("julia").unwrap();

            let a = Environment::build(julia, &plan, &artifacts, &platform, &settings, Path::new("/k")).unwrap();
            let b = Environment::build(julia, &plan, &artifacts, &platform, &settings, Path::new("/k")).unwrap();
            prop_assert_eq!(&a, &b);

            let dep_paths = &a.search_paths[..names.len()];
            let first_regular = dep_paths
                .iter()
                .position(|p| !keg_only.iter().any(|k| p.starts_with(format!("/r/Cellar/{k}"))))
                .unwrap_or(dep_paths.len());
            for p in &dep_paths[first_regular..] {
                let is_keg_only = keg_only.iter().any(|k| p.starts_with(format!("/r/Cellar/{k}")));
                prop_assert!(!is_keg_only);
            }
        }
    }
}
