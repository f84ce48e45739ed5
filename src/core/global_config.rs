//! Global configuration management
//!
//! Reads settings from `config.toml` in the config directory and merges them
//! with command-line flags, environment overrides and compiled-in defaults.
//! Precedence: flag > environment variable > config file > default.

use crate::config::defaults;
use crate::core::platform::{Compiler, Platform};
use crate::infra::dirs::FormulateDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Global configuration error types
#[derive(Error, Debug)]
pub enum GlobalConfigError {
    /// Failed to read config file
    #[error("Failed to read config file '{path}': {error}")]
    ReadError { path: String, error: String },

    /// Failed to parse config file
    #[error("Failed to parse config file '{path}': {error}")]
    ParseError { path: String, error: String },

    /// A value in the config file is not usable
    #[error("Invalid value in config file '{path}': {error}")]
    InvalidValue { path: String, error: String },
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub toolchain: ToolchainConfig,

    #[serde(default)]
    pub download: DownloadConfig,
}

/// `[install]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install root holding `Cellar/` and `opt/`
    pub root: Option<PathBuf>,

    /// Directory of formula documents
    pub registry: Option<PathBuf>,

    /// Formulas installed concurrently
    pub workers: Option<usize>,

    /// Parallel jobs passed to each build (`MAKEFLAGS`, `${jobs}`)
    pub jobs: Option<usize>,
}

/// `[environment]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// `PATH` entries after dependency `bin` directories
    pub base_path: Option<Vec<String>>,

    /// Library directories searched after every dependency
    pub system_lib_paths: Option<Vec<PathBuf>>,
}

/// `[toolchain]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Host compilers in order of preference (`gcc-11`, `clang`)
    pub compilers: Option<Vec<String>>,
}

/// `[download]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Attempts per source
    pub retries: Option<u32>,

    /// Keep fetched archives in the download cache
    pub cache: Option<bool>,
}

impl GlobalConfig {
    /// Load `config.toml` from the config directory
    ///
    /// A missing file yields the default configuration.
    pub fn load(dirs: &FormulateDirs) -> Result<Self, GlobalConfigError> {
        Self::load_from_path(&dirs.global_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, GlobalConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| GlobalConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| GlobalConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        config.parse_compilers().map_err(|error| GlobalConfigError::InvalidValue {
            path: path.display().to_string(),
            error,
        })?;

        Ok(config)
    }

    /// Install root: `FORMULATE_ROOT`, then the config file, else the
    /// platform data directory
    #[must_use]
    pub fn root(&self, dirs: &FormulateDirs) -> PathBuf {
        dirs.root_override()
            .or_else(|| self.install.root.clone())
            .unwrap_or_else(|| dirs.default_root())
    }

    /// Registry directory, with `FORMULATE_REGISTRY` taking precedence
    #[must_use]
    pub fn registry(&self, dirs: &FormulateDirs) -> PathBuf {
        dirs.registry_override()
            .or_else(|| self.install.registry.clone())
            .unwrap_or_else(|| dirs.default_registry())
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.install
            .workers
            .filter(|w| *w > 0)
            .unwrap_or(defaults::DEFAULT_WORKERS)
    }

    /// Build jobs; defaults to the number of CPUs
    #[must_use]
    pub fn jobs(&self) -> usize {
        self.install
            .jobs
            .filter(|j| *j > 0)
            .unwrap_or_else(num_cpus::get)
    }

    #[must_use]
    pub fn base_path(&self) -> Vec<String> {
        self.environment.base_path.clone().unwrap_or_else(|| {
            defaults::BASE_PATH.iter().map(|s| (*s).to_string()).collect()
        })
    }

    /// System library directories; `root` is the install root whose `lib`
    /// is searched first
    #[must_use]
    pub fn system_lib_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.environment.system_lib_paths.clone().unwrap_or_else(|| {
            std::iter::once(root.join("lib"))
                .chain(defaults::SYSTEM_LIB_PATHS.iter().map(PathBuf::from))
                .collect()
        })
    }

    #[must_use]
    pub fn download_retries(&self) -> u32 {
        self.download
            .retries
            .filter(|r| *r > 0)
            .unwrap_or(defaults::MAX_DOWNLOAD_RETRIES)
    }

    #[must_use]
    pub fn download_cache(&self) -> bool {
        self.download.cache.unwrap_or(true)
    }

    /// Apply the configured compiler list to a target platform
    pub fn apply_toolchain(&self, platform: Platform) -> Result<Platform, String> {
        match self.parse_compilers()? {
            Some(compilers) => Ok(platform.with_compilers(compilers)),
            None => Ok(platform),
        }
    }

    fn parse_compilers(&self) -> Result<Option<Vec<Compiler>>, String> {
        self.toolchain
            .compilers
            .as_ref()
            .map(|list| list.iter().map(|c| c.parse()).collect::<Result<Vec<Compiler>, String>>())
            .transpose()
    }
}
