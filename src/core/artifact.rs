//! Installed artifacts and the install root layout
//!
//! A keg lives at `<root>/Cellar/<name>/<version>` and carries an
//! `INSTALL_RECEIPT.json`; `<root>/opt/<name>` points at the current keg.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::defaults;
use crate::error::FilesystemError;
use crate::infra::filesystem;

/// Paths under an install root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar(&self) -> PathBuf {
        self.root.join(defaults::CELLAR_DIR)
    }

    /// `<root>/Cellar/<name>/<version>`
    pub fn keg(&self, name: &str, version: &str) -> PathBuf {
        self.cellar().join(name).join(version)
    }

    /// `<root>/opt/<name>`
    pub fn opt(&self, name: &str) -> PathBuf {
        self.root.join(defaults::OPT_DIR).join(name)
    }

    /// Parent of per-install scratch directories
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

/// A completed installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    pub variant: String,
    /// Keg directory
    pub root: PathBuf,
    pub keg_only: bool,
    /// Regular files, absolute, sorted
    pub files: Vec<PathBuf>,
    /// Symlinks, absolute, sorted
    pub symlinks: Vec<PathBuf>,
}

impl InstalledArtifact {
    pub fn bin(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn include(&self) -> PathBuf {
        self.root.join("include")
    }

    /// Scan `keg` and describe what is installed there
    ///
    /// The receipt itself is not counted as an installed file.
    pub fn scan(name: &str, version: &str, variant: &str, keg: &Path, keg_only: bool) -> Self {
        let listing = filesystem::walk_entries(keg);
        let receipt = keg.join(defaults::RECEIPT_FILE);
        Self {
            name: name.to_string(),
            version: version.to_string(),
            variant: variant.to_string(),
            root: keg.to_path_buf(),
            keg_only,
            files: listing.files.into_iter().filter(|f| *f != receipt).collect(),
            symlinks: listing.symlinks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.symlinks.is_empty()
    }

    /// Build the receipt persisted inside the keg
    pub fn receipt(&self, source: &str, dependencies: &[String]) -> Receipt {
        let relative = |paths: &[PathBuf]| {
            paths
                .iter()
                .filter_map(|p| p.strip_prefix(&self.root).ok().map(Path::to_path_buf))
                .collect()
        };
        Receipt {
            name: self.name.clone(),
            version: self.version.clone(),
            variant: self.variant.clone(),
            source: source.to_string(),
            dependencies: dependencies.to_vec(),
            keg_only: self.keg_only,
            installed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            files: relative(&self.files),
            symlinks: relative(&self.symlinks),
        }
    }

    /// Rebuild an artifact from the receipt in `keg`
    pub fn load(keg: &Path) -> Result<Self, FilesystemError> {
        let receipt = Receipt::read(keg)?;
        Ok(Self {
            root: keg.to_path_buf(),
            files: receipt.files.iter().map(|f| keg.join(f)).collect(),
            symlinks: receipt.symlinks.iter().map(|s| keg.join(s)).collect(),
            name: receipt.name,
            version: receipt.version,
            variant: receipt.variant,
            keg_only: receipt.keg_only,
        })
    }
}

/// Contents of `INSTALL_RECEIPT.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub name: String,
    pub version: String,
    pub variant: String,
    pub source: String,
    /// Direct dependencies active when the keg was built
    pub dependencies: Vec<String>,
    pub keg_only: bool,
    /// Seconds since the Unix epoch
    pub installed_at: u64,
    /// Paths relative to the keg
    pub files: Vec<PathBuf>,
    pub symlinks: Vec<PathBuf>,
}

impl Receipt {
    pub fn path(keg: &Path) -> PathBuf {
        keg.join(defaults::RECEIPT_FILE)
    }

    pub fn write(&self, keg: &Path) -> Result<(), FilesystemError> {
        let path = Self::path(keg);
        let content = serde_json::to_string_pretty(self).map_err(|e| FilesystemError::WriteFile {
            path: path.clone(),
            error: e.to_string(),
        })?;
        filesystem::write_file(&path, &content)
    }

    pub fn read(keg: &Path) -> Result<Self, FilesystemError> {
        let path = Self::path(keg);
        let content = filesystem::read_file(&path)?;
        serde_json::from_str(&content).map_err(|e| FilesystemError::ReadFile {
            path,
            error: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/opt/root");
        assert_eq!(
            layout.keg("julia", "1.6.1_1"),
            PathBuf::from("/opt/root/Cellar/julia/1.6.1_1")
        );
        assert_eq!(layout.opt("gcc"), PathBuf::from("/opt/root/opt/gcc"));
    }

    #[test]
    fn test_scan_excludes_receipt_and_round_trips() {
        let temp = TempDir::new().unwrap();
        let keg = temp.path().join("Cellar/hello/1.0");
        filesystem::write_file(&keg.join("bin/hello"), "#!/bin/sh").unwrap();

        let artifact = InstalledArtifact::scan("hello", "1.0", "stable", &keg, false);
        artifact
            .receipt("https://example.com/hello-1.0.tar.gz", &["libfoo".to_string()])
            .write(&keg)
            .unwrap();

        let rescanned = InstalledArtifact::scan("hello", "1.0", "stable", &keg, false);
        assert_eq!(rescanned.files, [keg.join("bin/hello")]);

        let loaded = InstalledArtifact::load(&keg).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(Receipt::read(&keg).unwrap().dependencies, ["libfoo"]);
    }

    #[test]
    fn test_load_without_receipt_fails() {
        let temp = TempDir::new().unwrap();
        assert!(InstalledArtifact::load(temp.path()).is_err());
    }
}
