//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod install;
pub mod resolve;

use anyhow::{anyhow, Context as _, Result};
use clap::Subcommand;

use super::output::Output;
use super::Cli;
use crate::config::defaults;
use crate::core::artifact::Layout;
use crate::core::build_env::EnvSettings;
use crate::core::global_config::GlobalConfig;
use crate::core::platform::Platform;
use crate::core::registry::Registry;
use crate::error::FormulateError;
use crate::infra::dirs::FormulateDirs;
use crate::infra::download::DownloadManager;
use crate::infra::process::SystemRunner;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build and install a formula and its dependencies
    Install {
        /// Formula name
        name: String,

        /// Build the development (head) variant
        #[arg(long, conflicts_with = "variant")]
        head: bool,

        /// Build a specific variant
        #[arg(long)]
        variant: Option<String>,

        /// Rebuild dependencies even if already installed
        #[arg(short, long)]
        force: bool,

        /// Run the formula's test steps after installing
        #[arg(long)]
        verify: bool,
    },

    /// Run a formula's test steps, installing it first if needed
    Test {
        /// Formula name
        name: String,
    },

    /// Print the build order for a formula
    Resolve {
        /// Formula name
        name: String,

        /// Only print the plan (resolve never builds)
        #[arg(long)]
        dry_run: bool,

        /// Include test dependencies of the root
        #[arg(long)]
        test: bool,
    },
}

impl Commands {
    /// Execute the command, returning the process exit code
    pub async fn run(self, ctx: &Context) -> Result<i32> {
        match self {
            Self::Install {
                name,
                head,
                variant,
                force,
                verify,
            } => {
                let options = install::InstallOptions {
                    variant: if head {
                        Some(crate::core::formula::HEAD_VARIANT.to_string())
                    } else {
                        variant
                    },
                    force,
                    verify,
                };
                install::execute(ctx, &name, options).await
            }
            Self::Test { name } => test::execute(ctx, &name).await,
            Self::Resolve { name, dry_run, test } => {
                tracing::debug!(dry_run, "resolving");
                resolve::execute(ctx, &name, test)
            }
        }
    }
}

/// Everything a command needs, assembled from flags, environment and
/// `config.toml` in that order of precedence
#[derive(Debug)]
pub struct Context {
    pub registry: Registry,
    pub platform: Platform,
    pub layout: Layout,
    pub settings: EnvSettings,
    pub sources: DownloadManager,
    pub runner: SystemRunner,
    pub workers: usize,
    pub output: Output,
}

impl Context {
    pub fn load(cli: &Cli) -> Result<Self> {
        let dirs = FormulateDirs::new();
        let config = GlobalConfig::load(&dirs).map_err(|e| FormulateError::Config(e.to_string()))?;

        let root = cli.root.clone().unwrap_or_else(|| config.root(&dirs));
        let registry_dir = cli.registry.clone().unwrap_or_else(|| config.registry(&dirs));
        let registry = Registry::load_dir(&registry_dir)
            .map_err(FormulateError::from)
            .with_context(|| format!("Failed to load formulas from {}", registry_dir.display()))?;
        tracing::info!(formulas = registry.len(), registry = %registry_dir.display(), "registry loaded");

        let host = Platform::host();
        let os = cli
            .os
            .or(host.as_ref().map(|p| p.os))
            .ok_or_else(|| anyhow!(FormulateError::Config("unsupported host OS; pass --os".to_string())))?;
        let arch = cli
            .arch
            .or(host.as_ref().map(|p| p.arch))
            .ok_or_else(|| anyhow!(FormulateError::Config("unsupported host architecture; pass --arch".to_string())))?;
        let platform = config
            .apply_toolchain(Platform::new(os, arch))
            .map_err(FormulateError::Config)?;

        let settings = EnvSettings::new(&root)
            .with_jobs(config.jobs())
            .with_base_path(config.base_path())
            .with_system_lib_paths(config.system_lib_paths(&root));

        let mut sources = DownloadManager::with_config(config.download_retries(), defaults::DOWNLOAD_BACKOFF_MS);
        if config.download_cache() {
            sources = sources.with_cache(dirs.downloads_dir());
        }

        Ok(Self {
            registry,
            platform,
            layout: Layout::new(root),
            settings,
            sources,
            runner: SystemRunner::new(),
            workers: cli.workers.filter(|w| *w > 0).unwrap_or_else(|| config.workers()),
            output: Output::new(cli.quiet, cli.json),
        })
    }
}
