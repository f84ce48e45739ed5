//! Formula definition handling
//!
//! Parses formula documents (TOML or JSON) into [`Formula`] values and
//! answers the read-only questions the resolver and executor ask of them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::action::{BuildAction, VerifyAction};
use crate::core::platform::{self, Arch, Compiler, CompilerKind, EvalContext, Os, Platform, Predicate};
use crate::error::FormulaError;

/// Label selected when the caller does not ask for a specific variant
pub const DEFAULT_VARIANT: &str = "stable";

/// Label of the development variant (`--head`)
pub const HEAD_VARIANT: &str = "head";

/// Hex SHA-256 digest as declared in a formula
///
/// Documents deserialize into any string; [`Formula::validate`] rejects
/// digests that are not well formed. Use [`Checksum::parse`] elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Parse a 64-character hex digest
    pub fn parse(value: impl Into<String>) -> Result<Self, String> {
        let checksum = Self::from(value.into());
        if checksum.is_well_formed() {
            Ok(checksum)
        } else {
            Err(format!("'{}' is not a 64-character hex sha256 digest", checksum.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Compare against a digest computed elsewhere, ignoring case
    pub fn matches(&self, actual: &str) -> bool {
        self.0.eq_ignore_ascii_case(actual)
    }
}

impl From<String> for Checksum {
    fn from(value: String) -> Self {
        Self(value.to_ascii_lowercase())
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a source or patch comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceRef {
    /// `http(s)://` archive or file
    Remote { url: String },
    /// Git checkout, optionally at a branch/tag
    Git {
        url: String,
        reference: Option<String>,
    },
    /// File on the local filesystem
    Local { path: PathBuf },
}

impl SourceRef {
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("git+") {
            let (url, reference) = match rest.split_once('#') {
                Some((url, r)) => (url.to_string(), Some(r.to_string())),
                None => (rest.to_string(), None),
            };
            return Self::Git { url, reference };
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            if raw.ends_with(".git") {
                return Self::Git {
                    url: raw.to_string(),
                    reference: None,
                };
            }
            return Self::Remote {
                url: raw.to_string(),
            };
        }
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        Self::Local {
            path: PathBuf::from(path),
        }
    }

    /// Whether fetching this source leaves the machine
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::Git { .. })
    }

    /// File name the fetched artifact should get
    pub fn file_name(&self) -> String {
        let last = match self {
            Self::Remote { url } => url
                .split(['?', '#'])
                .next()
                .unwrap_or(url)
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            Self::Git { url, .. } => url
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .trim_end_matches(".git")
                .to_string(),
            Self::Local { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        if last.is_empty() {
            "source".to_string()
        } else {
            last
        }
    }
}

impl From<String> for SourceRef {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<SourceRef> for String {
    fn from(value: SourceRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { url } => f.write_str(url),
            Self::Git {
                url,
                reference: Some(r),
            } => write!(f, "git+{url}#{r}"),
            Self::Git { url, reference: None } => write!(f, "git+{url}"),
            Self::Local { path } => write!(f, "file://{}", path.display()),
        }
    }
}

/// Patch applied to the source tree before the install steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub url: SourceRef,
    pub sha256: Checksum,
    /// Leading path components to strip (`patch -p<strip>`)
    #[serde(default = "default_strip")]
    pub strip: u32,
}

fn default_strip() -> u32 {
    1
}

/// One selectable source/version of a formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub label: String,
    #[serde(default)]
    pub version: Option<String>,
    pub url: SourceRef,
    #[serde(default)]
    pub sha256: Option<Checksum>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Platforms on which this variant may be selected
    #[serde(default)]
    pub when: Option<Predicate>,
}

/// Classification of a dependency edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    #[default]
    Runtime,
    Test,
}

/// Which edges a caller is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyScope {
    /// Only build-time edges
    BuildOnly,
    /// Build and runtime edges
    Install,
    /// Build, runtime and test edges
    Test,
}

impl DependencyScope {
    fn includes(self, kind: DependencyKind) -> bool {
        match self {
            Self::BuildOnly => kind == DependencyKind::Build,
            Self::Install => kind != DependencyKind::Test,
            Self::Test => true,
        }
    }
}

/// Reference to another formula by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub name: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default)]
    pub platform: Option<Predicate>,
}

/// Host allow-lists; empty means any
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub os: Vec<Os>,
    #[serde(default)]
    pub arch: Vec<Arch>,
}

/// Compiler the formula is known not to build with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerFailure {
    pub compiler: CompilerKind,
    /// Major version; absent means every version
    #[serde(default)]
    pub version: Option<String>,
}

impl CompilerFailure {
    pub fn excludes(&self, compiler: &Compiler) -> bool {
        if self.compiler != compiler.kind {
            return false;
        }
        match (&self.version, compiler.major) {
            (None, _) => true,
            (Some(version), Some(major)) => version
                .split('.')
                .next()
                .and_then(|v| v.parse::<u32>().ok())
                .is_some_and(|v| v == major),
            // Unknown host version: cannot rule it out
            (Some(_), None) => false,
        }
    }
}

/// A package build/install descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub desc: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub license: Vec<String>,

    /// Bumped when the formula changes without a version change
    #[serde(default)]
    pub revision: u32,

    /// Not exposed on default search paths
    #[serde(default)]
    pub keg_only: bool,

    #[serde(default)]
    pub variants: Vec<Variant>,

    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,

    #[serde(default)]
    pub requirements: Requirements,

    #[serde(default)]
    pub fails_with: Vec<CompilerFailure>,

    #[serde(default)]
    pub install_steps: Vec<BuildAction>,

    #[serde(default)]
    pub test_steps: Vec<VerifyAction>,
}

impl Formula {
    /// Parse and validate a TOML formula document
    pub fn from_toml(content: &str) -> Result<Self, FormulaError> {
        let formula: Self = toml::from_str(content).map_err(|e| FormulaError::ParseError {
            path: "<toml>".to_string(),
            error: e.to_string(),
        })?;
        formula.validate()?;
        Ok(formula)
    }

    /// Parse and validate a JSON formula document
    pub fn from_json(content: &str) -> Result<Self, FormulaError> {
        let formula: Self = serde_json::from_str(content).map_err(|e| FormulaError::ParseError {
            path: "<json>".to_string(),
            error: e.to_string(),
        })?;
        formula.validate()?;
        Ok(formula)
    }

    /// Load a formula document, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self, FormulaError> {
        let content = std::fs::read_to_string(path).map_err(|e| FormulaError::IoError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let parsed = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        };
        parsed.map_err(|e| match e {
            FormulaError::ParseError { error, .. } => FormulaError::ParseError {
                path: path.display().to_string(),
                error,
            },
            other => other,
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> FormulaError {
        FormulaError::MalformedFormula {
            name: if self.name.is_empty() {
                "<unnamed>".to_string()
            } else {
                self.name.clone()
            },
            reason: reason.into(),
        }
    }

    /// Check the invariants a loaded formula must satisfy
    pub fn validate(&self) -> Result<(), FormulaError> {
        if self.name.is_empty() {
            return Err(self.malformed("missing required field 'name'"));
        }
        if !is_valid_name(&self.name) {
            return Err(self.malformed(format!("invalid name '{}'", self.name)));
        }
        if self.variants.is_empty() {
            return Err(self.malformed("at least one variant is required"));
        }

        let mut labels = HashSet::new();
        for variant in &self.variants {
            if variant.label.is_empty() {
                return Err(self.malformed("variant with empty label"));
            }
            if !labels.insert(variant.label.as_str()) {
                return Err(self.malformed(format!("duplicate variant '{}'", variant.label)));
            }
            let mut digests = variant.sha256.iter().chain(variant.patches.iter().map(|p| &p.sha256));
            if let Some(bad) = digests.find(|c| !c.is_well_formed()) {
                return Err(self.malformed(format!(
                    "variant '{}': sha256 '{bad}' is not a 64-character hex digest",
                    variant.label
                )));
            }
            if matches!(variant.url, SourceRef::Remote { .. }) && variant.sha256.is_none() {
                return Err(self.malformed(format!(
                    "variant '{}' has a remote source without sha256",
                    variant.label
                )));
            }
        }

        for dep in &self.dependencies {
            if dep.name.is_empty() {
                return Err(self.malformed("dependency with empty name"));
            }
        }
        Ok(())
    }

    /// Select the variant to build
    ///
    /// `requested` defaults to `stable`, falling back to the first declared
    /// variant when no `stable` exists.
    pub fn active_variant(
        &self,
        platform: &Platform,
        requested: Option<&str>,
    ) -> Result<&Variant, FormulaError> {
        let usable = |v: &&Variant| platform::holds(v.when.as_ref(), &EvalContext::new(platform, &v.label));

        let found = match requested {
            Some(label) => self.variants.iter().filter(usable).find(|v| v.label == label),
            None => self
                .variants
                .iter()
                .filter(usable)
                .find(|v| v.label == DEFAULT_VARIANT)
                .or_else(|| self.variants.iter().find(usable)),
        };

        found.ok_or_else(|| FormulaError::NoSuchVariant {
            name: self.name.clone(),
            label: requested.unwrap_or(DEFAULT_VARIANT).to_string(),
        })
    }

    /// Dependency edges active in `ctx`, in declared order
    pub fn active_dependencies<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
        scope: DependencyScope,
    ) -> impl Iterator<Item = &'a DependencyEdge> + 'a {
        self.dependencies
            .iter()
            .filter(move |dep| scope.includes(dep.kind))
            .filter(move |dep| platform::holds(dep.platform.as_ref(), ctx))
    }

    /// Whether the formula's allow-lists admit this platform
    pub fn check_platform(&self, platform: &Platform) -> Result<(), String> {
        if !self.requirements.os.is_empty() && !self.requirements.os.contains(&platform.os) {
            return Err(format!("requires os {}", join(&self.requirements.os)));
        }
        if !self.requirements.arch.is_empty() && !self.requirements.arch.contains(&platform.arch) {
            return Err(format!("requires arch {}", join(&self.requirements.arch)));
        }
        Ok(())
    }

    /// First host compiler that no `fails_with` entry excludes
    pub fn select_compiler<'a>(&self, platform: &'a Platform) -> Option<&'a Compiler> {
        platform
            .compilers
            .iter()
            .find(|c| !self.fails_with.iter().any(|f| f.excludes(c)))
    }

    /// Version string used for the keg directory (`1.6.1`, `1.6.1_1`, `HEAD`)
    pub fn pkg_version(&self, variant: &Variant) -> String {
        let base = match (&variant.version, &variant.url) {
            (Some(v), _) => v.clone(),
            (None, SourceRef::Git { .. }) => "HEAD".to_string(),
            (None, _) => variant.label.clone(),
        };
        if self.revision > 0 {
            format!("{base}_{}", self.revision)
        } else {
            base
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '@' | '.' | '_' | '+' | '-')
        })
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    const JULIA: &str = r#"
name = "julia"
desc = "Fast, Dynamic Programming Language"
homepage = "https://julialang.org/"
license = ["MIT", "BSD-3-Clause", "Apache-2.0", "BSL-1.0"]
revision = 1

[requirements]
arch = ["x86_64"]

[[fails_with]]
compiler = "gcc"
version = "5"

[[variants]]
label = "stable"
version = "1.6.1"
url = "https://github.com/JuliaLang/julia/releases/download/v1.6.1/julia-1.6.1.tar.gz"
sha256 = "366b8090bd9b2f7817ce132170d569dfa3435d590a1fa5c3e2a75786bd5cdfd5"

[[variants.patches]]
url = "https://github.com/JuliaLang/julia/commit/ba653ecb1c81f1465505c2cea38b4f8149dd20b3.patch?full_index=1"
sha256 = "e626ee968e2ce8207c816f39ef9967ab0b5f50cad08a46b1df15d7bf230093cb"

[[variants]]
label = "head"
url = "https://github.com/JuliaLang/julia.git"

[[dependencies]]
name = "python@3.9"
kind = "build"

[[dependencies]]
name = "gmp"

[[dependencies]]
name = "zlib"
platform = { not = { os = "macos" } }

[[dependencies]]
name = "patchelf"
kind = "build"
platform = { os = "linux" }

[[dependencies]]
name = "libunwind"
platform = { os = "linux" }
"#;

    fn linux() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64)
    }

    fn macos() -> Platform {
        Platform::new(Os::Macos, Arch::X86_64)
    }

    #[test]
    fn test_parse_julia_like_formula() {
        let formula = Formula::from_toml(JULIA).unwrap();
        assert_eq!(formula.name, "julia");
        assert_eq!(formula.variants.len(), 2);
        assert_eq!(formula.variants[0].patches.len(), 1);
        assert_eq!(formula.variants[0].patches[0].strip, 1);
        assert!(matches!(formula.variants[1].url, SourceRef::Git { .. }));
    }

    #[test]
    fn test_active_variant_defaults_to_stable() {
        let formula = Formula::from_toml(JULIA).unwrap();
        let platform = linux();
        assert_eq!(formula.active_variant(&platform, None).unwrap().label, "stable");
        assert_eq!(
            formula.active_variant(&platform, Some("head")).unwrap().label,
            "head"
        );
        assert!(matches!(
            formula.active_variant(&platform, Some("devel")),
            Err(FormulaError::NoSuchVariant { .. })
        ));
    }

    #[test]
    fn test_active_dependencies_follow_platform() {
        let formula = Formula::from_toml(JULIA).unwrap();

        let linux = linux();
        let ctx = EvalContext::new(&linux, "stable");
        let names: Vec<_> = formula
            .active_dependencies(&ctx, DependencyScope::Install)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, ["python@3.9", "gmp", "zlib", "patchelf", "libunwind"]);

        let build_only: Vec<_> = formula
            .active_dependencies(&ctx, DependencyScope::BuildOnly)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(build_only, ["python@3.9", "patchelf"]);

        let mac = macos();
        let ctx = EvalContext::new(&mac, "stable");
        let names: Vec<_> = formula
            .active_dependencies(&ctx, DependencyScope::Install)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, ["python@3.9", "gmp"]);
    }

    #[test]
    fn test_platform_requirements_and_compiler() {
        let formula = Formula::from_toml(JULIA).unwrap();
        assert!(formula.check_platform(&linux()).is_ok());
        assert!(formula
            .check_platform(&Platform::new(Os::Linux, Arch::Aarch64))
            .is_err());

        let old_gcc = linux().with_compilers(vec![Compiler::new(CompilerKind::Gcc, Some(5))]);
        assert!(formula.select_compiler(&old_gcc).is_none());

        let mixed = linux().with_compilers(vec![
            Compiler::new(CompilerKind::Gcc, Some(5)),
            Compiler::new(CompilerKind::Gcc, Some(11)),
        ]);
        assert_eq!(formula.select_compiler(&mixed).unwrap().major, Some(11));
    }

    #[test]
    fn test_pkg_version_includes_revision() {
        let formula = Formula::from_toml(JULIA).unwrap();
        assert_eq!(formula.pkg_version(&formula.variants[0]), "1.6.1_1");
        assert_eq!(formula.pkg_version(&formula.variants[1]), "HEAD_1");
    }

    #[test]
    fn test_remote_source_requires_checksum() {
        let doc = r#"
name = "curl"
[[variants]]
label = "stable"
url = "https://curl.se/download/curl-7.77.0.tar.gz"
"#;
        let err = Formula::from_toml(doc).unwrap_err();
        assert!(matches!(err, FormulaError::MalformedFormula { ref name, .. } if name == "curl"));
    }

    #[test]
    fn test_local_source_checksum_optional() {
        let doc = r#"
name = "local-tool"
[[variants]]
label = "stable"
url = "file:///tmp/local-tool.tar.gz"
"#;
        let formula = Formula::from_toml(doc).unwrap();
        assert_eq!(
            formula.variants[0].url,
            SourceRef::Local {
                path: PathBuf::from("/tmp/local-tool.tar.gz")
            }
        );
    }

    #[test]
    fn test_missing_variants_is_malformed() {
        let err = Formula::from_toml(r#"name = "empty""#).unwrap_err();
        assert!(matches!(err, FormulaError::MalformedFormula { .. }));
    }

    #[test]
    fn test_missing_name_is_malformed() {
        let doc = r#"
name = ""
[[variants]]
label = "stable"
url = "/tmp/x.tar.gz"
"#;
        let err = Formula::from_toml(doc).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_bad_checksum_is_rejected() {
        let doc = r#"
name = "bad"
[[variants]]
label = "stable"
url = "https://example.com/bad.tar.gz"
sha256 = "not-a-digest"
"#;
        match Formula::from_toml(doc) {
            Err(FormulaError::MalformedFormula { name, reason }) => {
                assert_eq!(name, "bad");
                assert!(reason.contains("not-a-digest"), "{reason}");
            }
            other => panic!("expected MalformedFormula, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_variant_labels_rejected() {
        let doc = r#"
name = "dup"
[[variants]]
label = "stable"
url = "/tmp/a.tar.gz"
[[variants]]
label = "stable"
url = "/tmp/b.tar.gz"
"#;
        let err = Formula::from_toml(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate variant"));
    }

    #[test]
    fn test_from_json_schema() {
        let doc = r#"{
            "name": "gmp",
            "variants": [{"label": "stable", "version": "6.2.1", "url": "https://gmplib.org/download/gmp/gmp-6.2.1.tar.xz",
                          "sha256": "fd4829912cddd12f84181c3451cc752be224643e87fac497b69edddadc49b4f2"}],
            "dependencies": [{"name": "m4", "kind": "build"}],
            "install_steps": [{"action": "run", "command": "make", "args": ["install"]}],
            "test_steps": []
        }"#;
        let formula = Formula::from_json(doc).unwrap();
        assert_eq!(formula.dependencies[0].kind, DependencyKind::Build);
        assert_eq!(formula.install_steps.len(), 1);
    }

    #[test]
    fn test_source_ref_parsing() {
        assert_eq!(
            SourceRef::parse("git+https://example.com/repo#main"),
            SourceRef::Git {
                url: "https://example.com/repo".to_string(),
                reference: Some("main".to_string())
            }
        );
        assert_eq!(
            SourceRef::parse("https://example.com/x-1.0.tar.gz?raw=1").file_name(),
            "x-1.0.tar.gz"
        );
        assert_eq!(
            SourceRef::parse("https://github.com/JuliaLang/julia.git").file_name(),
            "julia"
        );
    }

    #[test]
    fn test_variant_when_restricts_selection() {
        let doc = r#"
name = "tool"
[[variants]]
label = "stable"
url = "/tmp/tool-mac.tar.gz"
when = { os = "macos" }
[[variants]]
label = "linux"
url = "/tmp/tool-linux.tar.gz"
"#;
        let formula = Formula::from_toml(doc).unwrap();
        assert_eq!(formula.active_variant(&macos(), None).unwrap().label, "stable");
        assert_eq!(formula.active_variant(&linux(), None).unwrap().label, "linux");
    }
}
