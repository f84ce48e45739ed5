//! Filesystem operations
//!
//! Handles file and directory operations: scoped work directories, archive
//! extraction, symlinks, glob matching and tree listing.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use globset::GlobBuilder;
use tar::Archive;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Remove a directory and all its contents
pub fn remove_dir_all(path: &Path) -> Result<(), FilesystemError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| FilesystemError::RemoveDir {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    Ok(())
}

/// Write content to a file
pub fn write_file(path: &Path, content: &str) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Copy a single file, creating the destination's parent
pub fn copy_file(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    if let Some(parent) = to.parent() {
        create_dir_all(parent)?;
    }
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| FilesystemError::WriteFile {
            path: to.to_path_buf(),
            error: e.to_string(),
        })
}

/// Create a temporary directory under `parent`
///
/// The directory and everything in it is removed when the returned guard is
/// dropped, whichever way the owning scope exits.
pub fn scoped_workdir(parent: &Path, prefix: &str) -> Result<TempDir, FilesystemError> {
    create_dir_all(parent)?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .map_err(|e| FilesystemError::CreateDir {
            path: parent.to_path_buf(),
            error: e.to_string(),
        })
}

/// Whether `path` names an archive [`extract_archive`] understands
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".tar")
}

/// Unpack a `.tar.gz`, `.tgz` or `.tar` archive into `dest`
///
/// Returns the directory the sources live in: the single top-level
/// directory of the archive if there is exactly one, else `dest` itself.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<PathBuf, FilesystemError> {
    let extract_err = |e: std::io::Error| FilesystemError::Extract {
        archive: archive.to_path_buf(),
        error: e.to_string(),
    };

    create_dir_all(dest)?;
    let file = File::open(archive).map_err(extract_err)?;
    let name = archive.to_string_lossy().to_ascii_lowercase();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Archive::new(GzDecoder::new(BufReader::new(file)))
            .unpack(dest)
            .map_err(extract_err)?;
    } else if name.ends_with(".tar") {
        Archive::new(BufReader::new(file))
            .unpack(dest)
            .map_err(extract_err)?;
    } else {
        return Err(FilesystemError::Extract {
            archive: archive.to_path_buf(),
            error: "unsupported archive format".to_string(),
        });
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(dest)
        .map_err(extract_err)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}

/// Create (or replace) a symlink at `link` pointing to `target`
///
/// With `relative`, the stored target is computed relative to the link's
/// parent directory.
pub fn create_symlink(target: &Path, link: &Path, relative: bool) -> Result<(), FilesystemError> {
    let symlink_err = |e: std::io::Error| FilesystemError::Symlink {
        link: link.to_path_buf(),
        target: target.to_path_buf(),
        error: e.to_string(),
    };

    if let Some(parent) = link.parent() {
        create_dir_all(parent)?;
    }

    if let Ok(meta) = std::fs::symlink_metadata(link) {
        if meta.is_dir() {
            std::fs::remove_dir_all(link).map_err(symlink_err)?;
        } else {
            std::fs::remove_file(link).map_err(symlink_err)?;
        }
    }

    let stored = match (relative, link.parent()) {
        (true, Some(base)) => relative_path(target, base),
        _ => target.to_path_buf(),
    };

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&stored, link).map_err(symlink_err)
    }
    #[cfg(not(unix))]
    {
        let _ = stored;
        Err(symlink_err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks are only supported on unix",
        )))
    }
}

/// Path of `target` relative to directory `base`
///
/// Both paths are taken lexically; neither needs to exist.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component<'_>> = target.components().collect();
    let base: Vec<Component<'_>> = base.components().collect();

    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Files below `base` matching a glob pattern relative to it
///
/// `*`, `?` and `[...]` stay within one path component, `**` crosses
/// components and `{a,b}` picks alternatives. A pattern without glob syntax
/// matches the path itself if it exists. Results are sorted.
pub fn glob(base: &Path, pattern: &str) -> Result<Vec<PathBuf>, FilesystemError> {
    if !pattern.contains(['*', '?', '[', '{']) {
        let path = base.join(pattern);
        return Ok(if path.exists() { vec![path] } else { Vec::new() });
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| FilesystemError::Glob {
            pattern: pattern.to_string(),
            error: e.to_string(),
        })?
        .compile_matcher();

    let mut matches: Vec<PathBuf> = WalkDir::new(base)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(base)
                .is_ok_and(|rel| matcher.is_match(rel))
        })
        .map(walkdir::DirEntry::into_path)
        .collect();
    matches.sort();
    Ok(matches)
}

/// Entries found below a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeListing {
    /// Regular files, sorted
    pub files: Vec<PathBuf>,
    /// Symlinks, sorted
    pub symlinks: Vec<PathBuf>,
}

/// List every regular file and symlink below `root` without following links
pub fn walk_entries(root: &Path) -> TreeListing {
    let mut listing = TreeListing::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            listing.symlinks.push(entry.into_path());
        } else if file_type.is_file() {
            listing.files.push(entry.into_path());
        }
    }
    listing.files.sort();
    listing.symlinks.sort();
    listing
}
