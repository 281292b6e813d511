use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::markers;

const ACCESS_PROBE_FILE: &str = ".workshopd_access_probe";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("package root does not exist: {0}")]
    RootMissing(PathBuf),
    #[error("package root is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("package root is not readable: {path}: {source}")]
    NotReadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("package root is not writable: {path}: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scan task failed: {0}")]
    Task(String),
}

/// One installed package directory carrying a remote id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPackage {
    pub remote_id: String,
    pub folder_name: String,
    pub path: PathBuf,
    pub last_synced_at: Option<i64>,
    pub ignored_at: Option<i64>,
}

impl LocalPackage {
    /// Time the remote version is compared against. A skipped version
    /// replaces the sync marker so only a newer upload re-surfaces.
    pub fn baseline(&self) -> Option<i64> {
        self.ignored_at.or(self.last_synced_at)
    }
}

/// Lists every catalog package under `root`, sorted by folder name.
/// Directories without an id marker are skipped.
pub fn scan_packages(root: &Path) -> Result<Vec<LocalPackage>, ScanError> {
    let mut packages: Vec<LocalPackage> = package_dirs(root)?
        .into_iter()
        .filter_map(|path| {
            let remote_id = markers::read_remote_id(&path)?;
            let folder_name = path.file_name()?.to_string_lossy().into_owned();
            let ignored_at = markers::read_ignore_marker(&path).unwrap_or_else(|err| {
                tracing::debug!(path = %path.display(), error = %err, "unreadable ignore marker");
                None
            });
            Some(LocalPackage {
                remote_id,
                folder_name,
                last_synced_at: markers::last_synced_at(&path),
                ignored_at,
                path,
            })
        })
        .collect();
    packages.sort_by(|left, right| left.folder_name.cmp(&right.folder_name));
    Ok(packages)
}

pub async fn scan_packages_in_background(root: PathBuf) -> Result<Vec<LocalPackage>, ScanError> {
    tokio::task::spawn_blocking(move || scan_packages(&root))
        .await
        .map_err(|err| ScanError::Task(err.to_string()))?
}

/// Every folder under `root` whose id marker equals `remote_id`.
pub fn find_folders_with_id(root: &Path, remote_id: &str) -> Result<Vec<PathBuf>, ScanError> {
    let mut folders: Vec<PathBuf> = package_dirs(root)?
        .into_iter()
        .filter(|path| markers::read_remote_id(path).as_deref() == Some(remote_id))
        .collect();
    folders.sort();
    Ok(folders)
}

/// Checks that `root` exists, is a directory, and can be listed and written.
pub fn verify_root_access(root: &Path) -> Result<(), ScanError> {
    ensure_root(root)?;
    fs::read_dir(root).map_err(|source| ScanError::NotReadable {
        path: root.to_path_buf(),
        source,
    })?;
    let probe = root.join(ACCESS_PROBE_FILE);
    fs::write(&probe, b"probe").map_err(|source| ScanError::NotWritable {
        path: root.to_path_buf(),
        source,
    })?;
    if let Err(err) = fs::remove_file(&probe) {
        tracing::warn!(path = %probe.display(), error = %err, "failed to remove access probe");
    }
    Ok(())
}

fn ensure_root(root: &Path) -> Result<(), ScanError> {
    if !root.exists() {
        return Err(ScanError::RootMissing(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    Ok(())
}

fn package_dirs(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    ensure_root(root)?;
    let entries = fs::read_dir(root).map_err(|source| ScanError::NotReadable {
        path: root.to_path_buf(),
        source,
    })?;
    Ok(entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect())
}
