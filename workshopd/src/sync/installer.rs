use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::markers;
use super::scanner::{self, ScanError};

const MAX_FOLDER_NAME_CHARS: usize = 200;
const FALLBACK_FOLDER_NAME: &str = "Mod";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("staged content not found at {0}")]
    SourceNotFound(PathBuf),
    #[error("folder {folder_name:?} exists but carries no package id")]
    CorruptedConflict { folder_name: String },
    #[error("{0:?} is not a single folder name")]
    InvalidFolderName(String),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("copy task failed: {0}")]
    Task(String),
}

impl InstallError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> InstallError + '_ {
        move |source| InstallError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Decision for a destination folder that exists without an id marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Delete the corrupted folder and install in its place.
    Overwrite,
    /// Install under a disambiguated name and leave the folder alone.
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPlan {
    pub folder_name: String,
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub remote_id: String,
    pub staged_path: PathBuf,
    pub title: Option<String>,
    pub existing_folder: Option<String>,
    pub remote_updated_at: i64,
    pub backup: bool,
    pub resolution: Option<ConflictResolution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFolder {
    pub folder_name: String,
    pub path: PathBuf,
    /// Every folder whose sync marker was written, including `path`.
    pub marked: Vec<PathBuf>,
}

pub fn sanitize_folder_name(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '\u{0}'..='\u{1f}'
            )
        })
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = trim_dots_and_spaces(&collapsed);
    if trimmed.is_empty() {
        return FALLBACK_FOLDER_NAME.to_string();
    }
    let capped: String = trimmed.chars().take(MAX_FOLDER_NAME_CHARS).collect();
    trim_dots_and_spaces(&capped).to_string()
}

fn trim_dots_and_spaces(value: &str) -> &str {
    value.trim_matches(|c: char| c == '.' || c.is_whitespace())
}

pub fn disambiguated_name(folder_name: &str, remote_id: &str) -> String {
    format!("{folder_name} ({remote_id})")
}

/// Accepts only names that stay directly under the package root.
fn validate_folder_name(name: &str) -> Result<&str, InstallError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(InstallError::InvalidFolderName(name.to_string())),
    }
}

pub struct Installer {
    mods_root: PathBuf,
    backup_root: Option<PathBuf>,
}

impl Installer {
    pub fn new(mods_root: PathBuf) -> Self {
        Self {
            mods_root,
            backup_root: None,
        }
    }

    pub fn with_backup_root(mut self, backup_root: Option<PathBuf>) -> Self {
        self.backup_root = backup_root;
        self
    }

    pub fn mods_root(&self) -> &Path {
        &self.mods_root
    }

    pub fn backup_root(&self) -> Option<&Path> {
        self.backup_root.as_deref()
    }

    /// Destination folder priority: the caller's folder, then a folder that
    /// already carries the id, then the sanitized title.
    pub fn plan_folder(
        &self,
        remote_id: &str,
        existing_folder: Option<&str>,
        title: Option<&str>,
    ) -> Result<FolderPlan, InstallError> {
        if let Some(existing) = existing_folder.filter(|name| !name.trim().is_empty()) {
            return Ok(FolderPlan {
                folder_name: validate_folder_name(existing)?.to_string(),
                corrupted: false,
            });
        }
        if self.mods_root.is_dir()
            && let Some(found) = scanner::find_folders_with_id(&self.mods_root, remote_id)?
                .into_iter()
                .next()
            && let Some(name) = found.file_name()
        {
            return Ok(FolderPlan {
                folder_name: name.to_string_lossy().into_owned(),
                corrupted: false,
            });
        }

        let base = sanitize_folder_name(title.unwrap_or(remote_id));
        let proposed = self.mods_root.join(&base);
        if !proposed.is_dir() {
            return Ok(FolderPlan {
                folder_name: base,
                corrupted: false,
            });
        }
        match markers::read_remote_id(&proposed) {
            Some(other) if other != remote_id => {
                let renamed = self.free_folder_name(&base, remote_id);
                tracing::info!(
                    mod_id = remote_id,
                    taken = %base,
                    folder = %renamed,
                    "folder name belongs to another package"
                );
                Ok(FolderPlan {
                    folder_name: renamed,
                    corrupted: false,
                })
            }
            Some(_) => Ok(FolderPlan {
                folder_name: base,
                corrupted: false,
            }),
            None => Ok(FolderPlan {
                folder_name: base,
                corrupted: true,
            }),
        }
    }

    pub async fn install(&self, request: &InstallRequest) -> Result<InstalledFolder, InstallError> {
        if !request.staged_path.is_dir() {
            return Err(InstallError::SourceNotFound(request.staged_path.clone()));
        }
        tokio::fs::create_dir_all(&self.mods_root)
            .await
            .map_err(InstallError::io(&self.mods_root))?;

        let plan = self.plan_folder(
            &request.remote_id,
            request.existing_folder.as_deref(),
            request.title.as_deref(),
        )?;
        let folder_name = if plan.corrupted {
            match request.resolution {
                None => {
                    return Err(InstallError::CorruptedConflict {
                        folder_name: plan.folder_name,
                    });
                }
                Some(ConflictResolution::Overwrite) => plan.folder_name,
                Some(ConflictResolution::Rename) => {
                    self.free_folder_name(&plan.folder_name, &request.remote_id)
                }
            }
        } else {
            plan.folder_name
        };
        let destination = self.mods_root.join(&folder_name);

        if request.backup {
            self.backup_folder(&request.remote_id, &folder_name, &destination)
                .await;
        }
        if destination.exists() {
            remove_dir_in_background(destination.clone()).await?;
        }
        copy_dir_in_background(request.staged_path.clone(), destination.clone()).await?;
        tracing::info!(
            mod_id = %request.remote_id,
            path = %destination.display(),
            "package installed"
        );

        if markers::read_remote_id(&destination).as_deref() != Some(request.remote_id.as_str()) {
            markers::write_remote_id(&destination, &request.remote_id)
                .map_err(InstallError::io(&destination))?;
        }

        let marked = self
            .mark_synced(&request.remote_id, request.remote_updated_at)
            .await?;
        Ok(InstalledFolder {
            folder_name,
            path: destination,
            marked,
        })
    }

    /// Writes the sync marker into every folder carrying `remote_id` and drops
    /// any skipped-version marker, which the new install supersedes.
    pub async fn mark_synced(
        &self,
        remote_id: &str,
        remote_updated_at: i64,
    ) -> Result<Vec<PathBuf>, InstallError> {
        let root = self.mods_root.clone();
        let remote_id = remote_id.to_string();
        tokio::task::spawn_blocking(move || {
            let folders = scanner::find_folders_with_id(&root, &remote_id)?;
            for folder in &folders {
                markers::write_sync_marker(folder, remote_updated_at)
                    .map_err(InstallError::io(folder))?;
                if let Err(err) = markers::remove_ignore_marker(folder) {
                    tracing::warn!(path = %folder.display(), error = %err, "failed to clear ignore marker");
                }
            }
            Ok(folders)
        })
        .await
        .map_err(|err| InstallError::Task(err.to_string()))?
    }

    /// First of `"<base> (<id>)"`, `"<base> (<id>) (2)"`, ... that is either
    /// free or already carries `remote_id`.
    fn free_folder_name(&self, base: &str, remote_id: &str) -> String {
        let first = disambiguated_name(base, remote_id);
        let mut candidate = first.clone();
        let mut counter = 2;
        loop {
            let path = self.mods_root.join(&candidate);
            if !path.exists() || markers::read_remote_id(&path).as_deref() == Some(remote_id) {
                return candidate;
            }
            tracing::debug!(mod_id = remote_id, taken = %candidate, "disambiguated folder name is taken");
            candidate = format!("{first} ({counter})");
            counter += 1;
        }
    }

    /// Replaces any previous backup named `folder_name`. A stale backup is
    /// dropped even when there is nothing to copy in its place.
    async fn backup_folder(&self, remote_id: &str, folder_name: &str, source: &Path) {
        let Some(backup_root) = &self.backup_root else {
            tracing::debug!(mod_id = remote_id, "backup requested but no backup root configured");
            return;
        };
        let target = backup_root.join(folder_name);
        let result = async {
            tokio::fs::create_dir_all(backup_root)
                .await
                .map_err(InstallError::io(backup_root))?;
            if target.exists() {
                remove_dir_in_background(target.clone()).await?;
            }
            if !source.is_dir() {
                return Ok(false);
            }
            copy_dir_in_background(source.to_path_buf(), target.clone()).await?;
            Ok::<_, InstallError>(true)
        }
        .await;
        match result {
            Ok(true) => tracing::info!(mod_id = remote_id, path = %target.display(), "backup created"),
            Ok(false) => tracing::debug!(mod_id = remote_id, "no previous version to back up"),
            Err(err) => tracing::warn!(
                mod_id = remote_id,
                path = %target.display(),
                error = %err,
                "backup failed; continuing with install"
            ),
        }
    }
}

pub(crate) fn copy_dir_all(source: &Path, destination: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(destination).map_err(InstallError::io(destination))?;
    for entry in fs::read_dir(source).map_err(InstallError::io(source))? {
        let entry = entry.map_err(InstallError::io(source))?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        if from.is_dir() {
            copy_dir_all(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(InstallError::io(&from))?;
        }
    }
    Ok(())
}

pub(crate) async fn copy_dir_in_background(
    source: PathBuf,
    destination: PathBuf,
) -> Result<(), InstallError> {
    tokio::task::spawn_blocking(move || copy_dir_all(&source, &destination))
        .await
        .map_err(|err| InstallError::Task(err.to_string()))?
}

pub(crate) async fn remove_dir_in_background(path: PathBuf) -> Result<(), InstallError> {
    tokio::task::spawn_blocking(move || fs::remove_dir_all(&path).map_err(InstallError::io(&path)))
        .await
        .map_err(|err| InstallError::Task(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stage(root: &Path, id: &str) -> PathBuf {
        let staged = root.join("stage").join(id);
        fs::create_dir_all(markers::metadata_dir(&staged)).unwrap();
        fs::write(markers::remote_id_path(&staged), id).unwrap();
        fs::write(staged.join("payload.txt"), format!("content of {id}")).unwrap();
        staged
    }

    fn request(id: &str, staged: PathBuf, title: &str) -> InstallRequest {
        InstallRequest {
            remote_id: id.to_string(),
            staged_path: staged,
            title: Some(title.to_string()),
            existing_folder: None,
            remote_updated_at: 1_700_000_000,
            backup: false,
            resolution: None,
        }
    }

    fn make_package(root: &Path, name: &str, id: Option<&str>) -> PathBuf {
        let package = root.join(name);
        fs::create_dir_all(markers::metadata_dir(&package)).unwrap();
        if let Some(id) = id {
            fs::write(markers::remote_id_path(&package), id).unwrap();
        }
        fs::write(package.join("old.txt"), "old").unwrap();
        package
    }

    #[test]
    fn sanitizes_illegal_characters_and_whitespace() {
        assert_eq!(sanitize_folder_name("Test Mod"), "Test Mod");
        assert_eq!(sanitize_folder_name("Test<Mod>"), "TestMod");
        assert_eq!(sanitize_folder_name("  A   \t B  "), "A B");
        assert_eq!(sanitize_folder_name("..hidden.."), "hidden");
        assert_eq!(sanitize_folder_name("a\u{7}b:c"), "abc");
    }

    #[test]
    fn empty_names_fall_back_to_placeholder() {
        assert_eq!(sanitize_folder_name(""), "Mod");
        assert_eq!(sanitize_folder_name("   "), "Mod");
        assert_eq!(sanitize_folder_name("???"), "Mod");
    }

    #[test]
    fn caps_length_at_200_chars() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_folder_name(&long).chars().count(), 200);
        let multibyte = "é".repeat(250);
        assert_eq!(sanitize_folder_name(&multibyte).chars().count(), 200);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let long_tail = format!("{}.  tail", "y".repeat(199));
        let samples = [
            "Example Mod",
            " <Weird>  name.. ",
            "....",
            "a/b\\c|d?e*f",
            long_tail.as_str(),
        ];
        for sample in samples {
            let once = sanitize_folder_name(sample);
            assert_eq!(sanitize_folder_name(&once), once, "sample {sample:?}");
        }
    }

    #[tokio::test]
    async fn installs_under_sanitized_title() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let staged = stage(dir.path(), "123");
        let installer = Installer::new(mods.clone());

        let installed = installer
            .install(&request("123", staged, "Example Mod"))
            .await
            .unwrap();

        assert_eq!(installed.path, mods.join("Example Mod"));
        assert_eq!(
            fs::read_to_string(installed.path.join("payload.txt")).unwrap(),
            "content of 123"
        );
        assert_eq!(
            markers::read_sync_marker(&installed.path).unwrap(),
            Some(1_700_000_000)
        );
    }

    #[tokio::test]
    async fn title_taken_by_other_id_gets_suffix() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Example Mod", Some("123"));
        let staged = stage(dir.path(), "456");

        let installed = Installer::new(mods.clone())
            .install(&request("456", staged, "Example Mod"))
            .await
            .unwrap();

        assert_eq!(installed.path, mods.join("Example Mod (456)"));
        assert!(mods.join("Example Mod").join("old.txt").is_file());
    }

    #[tokio::test]
    async fn reuses_folder_already_carrying_the_id() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Renamed By User", Some("123"));
        let staged = stage(dir.path(), "123");

        let installed = Installer::new(mods.clone())
            .install(&request("123", staged, "Example Mod"))
            .await
            .unwrap();

        assert_eq!(installed.folder_name, "Renamed By User");
        assert!(!installed.path.join("old.txt").exists());
        assert!(installed.path.join("payload.txt").is_file());
    }

    #[tokio::test]
    async fn caller_folder_takes_priority() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "By Id", Some("123"));
        let staged = stage(dir.path(), "123");
        let mut req = request("123", staged, "Example Mod");
        req.existing_folder = Some("Chosen".into());

        let installed = Installer::new(mods.clone()).install(&req).await.unwrap();
        assert_eq!(installed.path, mods.join("Chosen"));
        assert_eq!(installed.marked.len(), 2);
        assert_eq!(
            markers::read_sync_marker(&mods.join("By Id")).unwrap(),
            Some(1_700_000_000)
        );
    }

    #[tokio::test]
    async fn missing_source_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Example Mod", Some("123"));

        let err = Installer::new(mods.clone())
            .install(&request("123", dir.path().join("stage/123"), "Example Mod"))
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::SourceNotFound(_)));
        assert!(mods.join("Example Mod").join("old.txt").is_file());
    }

    #[tokio::test]
    async fn corrupted_folder_needs_a_decision() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Example Mod", None);
        let staged = stage(dir.path(), "123");
        let installer = Installer::new(mods.clone());

        let err = installer
            .install(&request("123", staged.clone(), "Example Mod"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::CorruptedConflict { ref folder_name } if folder_name == "Example Mod"
        ));

        let mut rename = request("123", staged.clone(), "Example Mod");
        rename.resolution = Some(ConflictResolution::Rename);
        let installed = installer.install(&rename).await.unwrap();
        assert_eq!(installed.path, mods.join("Example Mod (123)"));
        assert!(mods.join("Example Mod").join("old.txt").is_file());
    }

    #[tokio::test]
    async fn rename_never_reuses_a_foreign_folder() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Example Mod", None);
        let taken = mods.join("Example Mod (123)");
        fs::create_dir_all(&taken).unwrap();
        fs::write(taken.join("notes.txt"), "keep me").unwrap();
        let staged = stage(dir.path(), "123");
        let mut req = request("123", staged, "Example Mod");
        req.resolution = Some(ConflictResolution::Rename);

        let installed = Installer::new(mods.clone()).install(&req).await.unwrap();

        assert_eq!(installed.path, mods.join("Example Mod (123) (2)"));
        assert!(installed.path.join("payload.txt").is_file());
        assert_eq!(fs::read_to_string(taken.join("notes.txt")).unwrap(), "keep me");
        assert!(mods.join("Example Mod").join("old.txt").is_file());
    }

    #[tokio::test]
    async fn rejects_folder_names_outside_the_root() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let staged = stage(dir.path(), "123");
        let installer = Installer::new(mods.clone());

        for name in ["..", "/abs", "a/b", "."] {
            let mut req = request("123", staged.clone(), "Example Mod");
            req.existing_folder = Some(name.into());
            let err = installer.install(&req).await.unwrap_err();
            assert!(
                matches!(err, InstallError::InvalidFolderName(ref rejected) if rejected == name),
                "name {name:?}"
            );
        }
        assert!(!mods.join("Example Mod").exists());
        assert!(dir.path().join("stage/123/payload.txt").is_file());
    }

    #[tokio::test]
    async fn overwrite_replaces_corrupted_folder() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        make_package(&mods, "Example Mod", None);
        let staged = stage(dir.path(), "123");
        let mut req = request("123", staged, "Example Mod");
        req.resolution = Some(ConflictResolution::Overwrite);

        let installed = Installer::new(mods.clone()).install(&req).await.unwrap();
        assert_eq!(installed.path, mods.join("Example Mod"));
        assert!(!installed.path.join("old.txt").exists());
        assert!(installed.path.join("payload.txt").is_file());
    }

    #[tokio::test]
    async fn backs_up_previous_version() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let backups = dir.path().join("backups");
        make_package(&mods, "Example Mod", Some("123"));
        fs::create_dir_all(backups.join("Example Mod")).unwrap();
        fs::write(backups.join("Example Mod").join("older.txt"), "x").unwrap();
        let staged = stage(dir.path(), "123");
        let mut req = request("123", staged, "Example Mod");
        req.backup = true;

        Installer::new(mods.clone())
            .with_backup_root(Some(backups.clone()))
            .install(&req)
            .await
            .unwrap();

        assert!(backups.join("Example Mod").join("old.txt").is_file());
        assert!(!backups.join("Example Mod").join("older.txt").exists());
    }

    #[tokio::test]
    async fn fresh_install_drops_stale_backup() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let backups = dir.path().join("backups");
        fs::create_dir_all(backups.join("Example Mod")).unwrap();
        fs::write(backups.join("Example Mod").join("older.txt"), "x").unwrap();
        let staged = stage(dir.path(), "123");
        let mut req = request("123", staged, "Example Mod");
        req.backup = true;

        let installed = Installer::new(mods.clone())
            .with_backup_root(Some(backups.clone()))
            .install(&req)
            .await
            .unwrap();

        assert_eq!(installed.path, mods.join("Example Mod"));
        assert!(!backups.join("Example Mod").exists());
    }

    #[tokio::test]
    async fn writes_id_marker_when_staged_content_lacks_one() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let staged = dir.path().join("stage").join("789");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("payload.txt"), "x").unwrap();

        let installed = Installer::new(mods.clone())
            .install(&request("789", staged, "Bare"))
            .await
            .unwrap();
        assert_eq!(markers::read_remote_id(&installed.path).as_deref(), Some("789"));
        assert_eq!(installed.marked, vec![mods.join("Bare")]);
    }

    #[tokio::test]
    async fn install_clears_ignore_marker() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let existing = make_package(&mods, "Example Mod", Some("123"));
        markers::write_ignore_marker(&existing, 5).unwrap();
        let staged = stage(dir.path(), "123");

        Installer::new(mods.clone())
            .install(&request("123", staged, "Example Mod"))
            .await
            .unwrap();
        assert_eq!(markers::read_ignore_marker(&existing).unwrap(), None);
    }
}
