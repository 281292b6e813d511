//! Plain-text markers stored in a package's metadata folder.
//!
//! - `PublishedFileId.txt` holds the remote id.
//! - `.lastupdated` holds the Unix seconds of the remote version last installed.
//! - `.ignoredupdate` holds the Unix seconds of a remote version the user chose to skip.
//!
//! Timestamp markers that are empty, non-numeric or not positive are treated
//! as absent and removed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use workshop_integrations::ids::{
    IGNORE_MARKER_FILE, METADATA_DIR, REMOTE_ID_FILE, SYNC_MARKER_FILE,
};

pub fn metadata_dir(package: &Path) -> PathBuf {
    package.join(METADATA_DIR)
}

pub fn remote_id_path(package: &Path) -> PathBuf {
    metadata_dir(package).join(REMOTE_ID_FILE)
}

pub fn sync_marker_path(package: &Path) -> PathBuf {
    metadata_dir(package).join(SYNC_MARKER_FILE)
}

pub fn ignore_marker_path(package: &Path) -> PathBuf {
    metadata_dir(package).join(IGNORE_MARKER_FILE)
}

pub fn read_remote_id(package: &Path) -> Option<String> {
    let content = fs::read_to_string(remote_id_path(package)).ok()?;
    let id = content.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn write_remote_id(package: &Path, remote_id: &str) -> io::Result<()> {
    fs::create_dir_all(metadata_dir(package))?;
    fs::write(remote_id_path(package), remote_id)
}

pub fn read_sync_marker(package: &Path) -> io::Result<Option<i64>> {
    read_timestamp_marker(&sync_marker_path(package))
}

pub fn read_ignore_marker(package: &Path) -> io::Result<Option<i64>> {
    read_timestamp_marker(&ignore_marker_path(package))
}

pub fn write_sync_marker(package: &Path, timestamp: i64) -> io::Result<()> {
    write_timestamp_marker(&sync_marker_path(package), timestamp)
}

pub fn write_ignore_marker(package: &Path, timestamp: i64) -> io::Result<()> {
    write_timestamp_marker(&ignore_marker_path(package), timestamp)
}

/// Returns whether a marker was actually removed.
pub fn remove_ignore_marker(package: &Path) -> io::Result<bool> {
    match fs::remove_file(ignore_marker_path(package)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Last synchronized time: the sync marker, else the modification time of the
/// id file, else the folder's own modification time.
pub fn last_synced_at(package: &Path) -> Option<i64> {
    match read_sync_marker(package) {
        Ok(Some(timestamp)) => return Some(timestamp),
        Ok(None) => {}
        Err(err) => tracing::debug!(
            path = %package.display(),
            error = %err,
            "unreadable sync marker; falling back to file times"
        ),
    }
    modified_secs(&remote_id_path(package)).or_else(|| modified_secs(package))
}

pub fn modified_secs(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

fn read_timestamp_marker(path: &Path) -> io::Result<Option<i64>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match content.trim().parse::<i64>() {
        Ok(timestamp) if timestamp > 0 => Ok(Some(timestamp)),
        _ => {
            tracing::debug!(path = %path.display(), "removing invalid timestamp marker");
            if let Err(err) = fs::remove_file(path)
                && err.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove invalid marker");
            }
            Ok(None)
        }
    }
}

fn write_timestamp_marker(path: &Path, timestamp: i64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn package_with_id(root: &Path, name: &str, id: &str) -> PathBuf {
        let package = root.join(name);
        fs::create_dir_all(metadata_dir(&package)).unwrap();
        fs::write(remote_id_path(&package), id).unwrap();
        package
    }

    #[test]
    fn reads_trimmed_remote_id() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", " 123\n");
        assert_eq!(read_remote_id(&package).as_deref(), Some("123"));
    }

    #[test]
    fn blank_remote_id_is_absent() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", "  \n");
        assert_eq!(read_remote_id(&package), None);
        assert_eq!(read_remote_id(&dir.path().join("missing")), None);
    }

    #[test]
    fn sync_marker_round_trip() {
        let dir = tempdir().unwrap();
        let package = dir.path().join("Fresh");
        write_sync_marker(&package, 1_700_000_000).unwrap();
        assert_eq!(read_sync_marker(&package).unwrap(), Some(1_700_000_000));
        assert_eq!(last_synced_at(&package), Some(1_700_000_000));
    }

    #[test]
    fn invalid_sync_marker_is_deleted() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", "1");
        fs::write(sync_marker_path(&package), "not-a-number").unwrap();

        assert_eq!(read_sync_marker(&package).unwrap(), None);
        assert!(!sync_marker_path(&package).exists());
    }

    #[test]
    fn empty_and_zero_markers_are_deleted() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", "1");
        fs::write(sync_marker_path(&package), "").unwrap();
        assert_eq!(read_sync_marker(&package).unwrap(), None);
        assert!(!sync_marker_path(&package).exists());

        fs::write(ignore_marker_path(&package), "0").unwrap();
        assert_eq!(read_ignore_marker(&package).unwrap(), None);
        assert!(!ignore_marker_path(&package).exists());
    }

    #[test]
    fn last_synced_falls_back_to_id_file_time() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", "1");
        let expected = modified_secs(&remote_id_path(&package));
        assert!(expected.is_some());
        assert_eq!(last_synced_at(&package), expected);
    }

    #[test]
    fn removing_missing_ignore_marker_is_not_an_error() {
        let dir = tempdir().unwrap();
        let package = package_with_id(dir.path(), "A", "1");
        assert!(!remove_ignore_marker(&package).unwrap());
        write_ignore_marker(&package, 5).unwrap();
        assert!(remove_ignore_marker(&package).unwrap());
    }
}
