use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::installer::{self, InstallError};
use super::markers;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup path equals package path: {0}")]
    SamePath(PathBuf),
    #[error("package path {mod_path} and backup root {backup_root} must not be nested")]
    NestedPaths {
        mod_path: PathBuf,
        backup_root: PathBuf,
    },
    #[error("package path has no folder name: {0}")]
    InvalidPath(PathBuf),
    #[error("backup not found at {0}")]
    NotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Install(#[from] InstallError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub has_backup: bool,
    pub backup_path: Option<PathBuf>,
    /// Modification time of the backup folder in Unix seconds.
    pub backup_date: Option<i64>,
}

impl BackupInfo {
    fn none(backup_path: Option<PathBuf>) -> Self {
        Self {
            has_backup: false,
            backup_path,
            backup_date: None,
        }
    }
}

pub fn backup_path_for(mod_path: &Path, backup_root: &Path) -> Result<PathBuf, BackupError> {
    let folder_name = mod_path
        .file_name()
        .ok_or_else(|| BackupError::InvalidPath(mod_path.to_path_buf()))?;
    Ok(backup_root.join(folder_name))
}

pub fn backup_info(mod_path: &Path, backup_root: Option<&Path>) -> Result<BackupInfo, BackupError> {
    let Some(backup_root) = backup_root else {
        return Ok(BackupInfo::none(None));
    };
    let backup_path = backup_path_for(mod_path, backup_root)?;
    if !backup_path.is_dir() {
        return Ok(BackupInfo::none(Some(backup_path)));
    }
    Ok(BackupInfo {
        has_backup: true,
        backup_date: markers::modified_secs(&backup_path),
        backup_path: Some(backup_path),
    })
}

/// Rejects layouts where a restore could delete the backup it reads from.
pub fn check_separation(mod_path: &Path, backup_root: &Path) -> Result<PathBuf, BackupError> {
    let mod_path = std::path::absolute(mod_path)?;
    let backup_root = std::path::absolute(backup_root)?;
    let backup_path = backup_path_for(&mod_path, &backup_root)?;
    if backup_path == mod_path {
        return Err(BackupError::SamePath(mod_path));
    }
    if mod_path.starts_with(&backup_root) || backup_root.starts_with(&mod_path) {
        return Err(BackupError::NestedPaths {
            mod_path,
            backup_root,
        });
    }
    Ok(backup_path)
}

/// Replaces the package at `mod_path` with its backup, then deletes the backup.
pub async fn restore_backup(mod_path: &Path, backup_root: &Path) -> Result<PathBuf, BackupError> {
    let backup_path = check_separation(mod_path, backup_root)?;
    if !backup_path.is_dir() {
        return Err(BackupError::NotFound(backup_path));
    }

    if mod_path.exists() {
        installer::remove_dir_in_background(mod_path.to_path_buf()).await?;
    }
    installer::copy_dir_in_background(backup_path.clone(), mod_path.to_path_buf()).await?;

    if backup_path.exists() {
        installer::remove_dir_in_background(backup_path).await?;
    } else {
        tracing::warn!(
            backup = %backup_path.display(),
            "backup vanished while restoring; package was restored anyway"
        );
    }
    tracing::info!(path = %mod_path.display(), "package restored from backup");
    Ok(mod_path.to_path_buf())
}
