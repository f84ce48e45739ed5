//! Platform-specific directory management
//!
//! Provides the config, cache, install-root and registry locations.
//! Follows the XDG Base Directory layout on Linux and standard locations on macOS.
//!
//! Environment variables override the defaults:
//! - `FORMULATE_CONFIG_DIR` - config directory (holds `config.toml`)
//! - `FORMULATE_CACHE_DIR` - cache directory (download cache)
//! - `FORMULATE_ROOT` - install root (`Cellar/`, `opt/`)
//! - `FORMULATE_REGISTRY` - directory of formula documents

use std::env;
use std::path::PathBuf;

/// Environment variable names for directory overrides
pub const ENV_CONFIG_DIR: &str = "FORMULATE_CONFIG_DIR";
pub const ENV_CACHE_DIR: &str = "FORMULATE_CACHE_DIR";
pub const ENV_ROOT: &str = "FORMULATE_ROOT";
pub const ENV_REGISTRY: &str = "FORMULATE_REGISTRY";

/// Application name used in directory paths
const APP_NAME: &str = "formulate";

const DOWNLOADS_SUBDIR: &str = "downloads";
const FORMULA_SUBDIR: &str = "formula";

/// Directory provider for formulate
#[derive(Debug, Clone)]
pub struct FormulateDirs {
    config_dir: PathBuf,
    cache_dir: PathBuf,
    data_dir: PathBuf,
    root_override: Option<PathBuf>,
    registry_override: Option<PathBuf>,
}

impl FormulateDirs {
    /// Create a new instance from the environment and platform defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_dir: env_path(ENV_CONFIG_DIR).unwrap_or_else(platform_config_dir),
            cache_dir: env_path(ENV_CACHE_DIR).unwrap_or_else(platform_cache_dir),
            data_dir: platform_data_dir(),
            root_override: env_path(ENV_ROOT),
            registry_override: env_path(ENV_REGISTRY),
        }
    }

    /// Config directory
    /// - Linux: `$XDG_CONFIG_HOME/formulate` or `~/.config/formulate`
    /// - macOS: `~/Library/Application Support/formulate`
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Cache directory
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Shared source archive cache, keyed by URL
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join(DOWNLOADS_SUBDIR)
    }

    /// `config.toml` in the config directory
    #[must_use]
    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Install root from `FORMULATE_ROOT`, if set
    #[must_use]
    pub fn root_override(&self) -> Option<PathBuf> {
        self.root_override.clone()
    }

    /// Registry directory from `FORMULATE_REGISTRY`, if set
    #[must_use]
    pub fn registry_override(&self) -> Option<PathBuf> {
        self.registry_override.clone()
    }

    /// Install root used when nothing overrides it
    #[must_use]
    pub fn default_root(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// Registry directory used when nothing overrides it
    #[must_use]
    pub fn default_registry(&self) -> PathBuf {
        self.data_dir.join(FORMULA_SUBDIR)
    }
}

impl Default for FormulateDirs {
    fn default() -> Self {
        Self::new()
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn platform_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| home_fallback(&[".config"]))
}

fn platform_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| home_fallback(&[".cache"]))
}

fn platform_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| home_fallback(&[".local", "share"]))
}

fn home_fallback(parts: &[&str]) -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.extend(parts);
    path.join(APP_NAME)
}
