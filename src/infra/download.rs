//! Source fetching
//!
//! [`SourceProvider`] is the seam the install executor fetches sources and
//! patches through. [`DownloadManager`] implements it for HTTP archives (with
//! retry, exponential backoff and an optional URL-keyed cache), local files
//! and directories, and shallow git checkouts.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::defaults;
use crate::core::formula::{Checksum, SourceRef};
use crate::error::DownloadError;

/// A source placed on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    /// File or directory holding the source
    pub path: PathBuf,
    /// SHA-256 of the file; `None` for checkouts and directories
    pub sha256: Option<String>,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

/// Places sources into a working directory
pub trait SourceProvider: Send + Sync {
    /// Fetch `source` into `dest_dir`
    ///
    /// `expected` is advisory: providers may use it to skip stale cache
    /// entries, but the caller still compares the returned digest.
    fn fetch(
        &self,
        source: &SourceRef,
        expected: Option<&Checksum>,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<FetchedSource, DownloadError>> + Send;
}

/// Fetches sources over HTTP, from local paths and from git
#[derive(Debug, Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    base_delay_ms: u64,
    cache_dir: Option<PathBuf>,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::with_config(defaults::MAX_DOWNLOAD_RETRIES, defaults::DOWNLOAD_BACKOFF_MS)
    }

    /// Create a download manager with custom retry settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(30))
                .user_agent(concat!("formulate/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries: max_retries.max(1),
            base_delay_ms,
            cache_dir: None,
        }
    }

    /// Keep downloaded archives in `dir`, keyed by URL
    #[must_use]
    pub fn with_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Download `url` to `dest`, retrying with exponential backoff
    ///
    /// Returns the digest of the downloaded bytes. A partial file is removed
    /// when every attempt fails.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<FetchedSource, DownloadError> {
        let mut attempts = 0;
        let mut last_error = None;
        let mut delay_ms = self.base_delay_ms;

        while attempts < self.max_retries {
            attempts += 1;

            match self.download_once(url, dest).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(url, attempt = attempts, error = %e, "download attempt failed");
                    last_error = Some(e);

                    if attempts < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = (delay_ms * 2).min(defaults::MAX_DOWNLOAD_BACKOFF_MS);
                    }
                }
            }
        }

        let _ = tokio::fs::remove_file(dest).await;

        Err(last_error.unwrap_or_else(|| DownloadError::MaxRetriesExceeded {
            url: url.to_string(),
            retries: self.max_retries,
        }))
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<FetchedSource, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DownloadError::NetworkError {
                url: url.to_string(),
                error: format!("HTTP {}", response.status()),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let mut file = File::create(dest).await.map_err(|e| io_error(dest, e))?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::NetworkError {
                url: url.to_string(),
                error: e.to_string(),
            })?;
            file.write_all(&chunk).await.map_err(|e| io_error(dest, e))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| io_error(dest, e))?;

        Ok(FetchedSource {
            path: dest.to_path_buf(),
            sha256: Some(hex::encode(hasher.finalize())),
            size,
        })
    }

    async fn fetch_remote(
        &self,
        url: &str,
        file_name: &str,
        expected: Option<&Checksum>,
        dest_dir: &Path,
    ) -> Result<FetchedSource, DownloadError> {
        let dest = dest_dir.join(file_name);
        let cached = self.cache_dir.as_ref().map(|dir| {
            let key = compute_checksum(url.as_bytes());
            dir.join(format!("{}--{file_name}", &key[..16]))
        });

        if let Some(cached) = cached.as_ref().filter(|p| p.is_file()) {
            let digest = file_checksum(cached).await?;
            if expected.map_or(true, |e| e.matches(&digest)) {
                debug!(url, cache = %cached.display(), "using cached download");
                let size = tokio::fs::copy(cached, &dest)
                    .await
                    .map_err(|e| io_error(&dest, e))?;
                return Ok(FetchedSource {
                    path: dest,
                    sha256: Some(digest),
                    size,
                });
            }
            debug!(url, "cached download is stale");
        }

        let fetched = self.download(url, &dest).await?;

        let verified = match (expected, &fetched.sha256) {
            (Some(e), Some(actual)) => e.matches(actual),
            _ => true,
        };
        if let Some(cached) = cached.filter(|_| verified) {
            if let Err(e) = store_in_cache(&dest, &cached).await {
                warn!(url, error = %e, "failed to populate download cache");
            }
        }

        Ok(fetched)
    }

    async fn fetch_git(
        &self,
        url: &str,
        reference: Option<&str>,
        dest_dir: &Path,
        dir_name: &str,
    ) -> Result<FetchedSource, DownloadError> {
        let git = which::which("git").map_err(|e| DownloadError::GitError {
            url: url.to_string(),
            error: format!("git not found: {e}"),
        })?;
        let checkout = dest_dir.join(dir_name);

        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(reference) = reference {
            args.push("--branch".to_string());
            args.push(reference.to_string());
        }
        args.push(url.to_string());
        args.push(checkout.display().to_string());

        debug!(url, reference, "cloning");
        let output = tokio::process::Command::new(git)
            .args(&args)
            .current_dir(dest_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DownloadError::GitError {
                url: url.to_string(),
                error: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DownloadError::GitError {
                url: url.to_string(),
                error: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(FetchedSource {
            path: checkout,
            sha256: None,
            size: 0,
        })
    }

    async fn fetch_local(&self, path: &Path, dest_dir: &Path) -> Result<FetchedSource, DownloadError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "source".into());
        let dest = dest_dir.join(name);

        if metadata.is_dir() {
            let (from, to) = (path.to_path_buf(), dest.clone());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| io_error(path, std::io::Error::other(e)))??;
            return Ok(FetchedSource {
                path: dest,
                sha256: None,
                size: 0,
            });
        }

        let size = tokio::fs::copy(path, &dest)
            .await
            .map_err(|e| io_error(&dest, e))?;
        Ok(FetchedSource {
            sha256: Some(file_checksum(&dest).await?),
            path: dest,
            size,
        })
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceProvider for DownloadManager {
    async fn fetch(
        &self,
        source: &SourceRef,
        expected: Option<&Checksum>,
        dest_dir: &Path,
    ) -> Result<FetchedSource, DownloadError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| io_error(dest_dir, e))?;

        match source {
            SourceRef::Remote { url } => {
                self.fetch_remote(url, &source.file_name(), expected, dest_dir)
                    .await
            }
            SourceRef::Git { url, reference } => {
                self.fetch_git(url, reference.as_deref(), dest_dir, &source.file_name())
                    .await
            }
            SourceRef::Local { path } => self.fetch_local(path, dest_dir).await,
        }
    }
}

fn io_error(path: &Path, error: std::io::Error) -> DownloadError {
    DownloadError::IoError {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}

async fn store_in_cache(file: &Path, cached: &Path) -> std::io::Result<()> {
    if let Some(parent) = cached.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Copy then rename so readers never see a partial entry
    let partial = cached.with_extension("partial");
    tokio::fs::copy(file, &partial).await?;
    tokio::fs::rename(&partial, cached).await
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), DownloadError> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| DownloadError::IoError {
            path: from.to_path_buf(),
            error: e.to_string(),
        })?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| io_error(&target, e))?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path()).map_err(|e| io_error(entry.path(), e))?;
                std::os::unix::fs::symlink(link, &target).map_err(|e| io_error(&target, e))?;
            }
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| io_error(&target, e))?;
        }
    }
    Ok(())
}

/// SHA-256 of a file's contents, streamed
pub async fn file_checksum(path: &Path) -> Result<String, DownloadError> {
    use tokio::io::AsyncReadExt;

    let mut file = File::open(path).await.map_err(|e| io_error(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
