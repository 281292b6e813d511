use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use workshop_core::{CatalogClient, CatalogError, TtlCache};
use workshop_integrations::PackageState;

use super::backup::{self, BackupError, BackupInfo};
use super::detector::{DetectorSettings, InstalledPackage, StalePackage, UpdateDetector};
use super::downloader::{ActiveDownloads, DownloadClaim, DownloadError, DownloadJob, Downloader};
use super::events::{ConflictResolver, StateSink};
use super::installer::{InstallError, InstallRequest, InstalledFolder, Installer};
use super::markers;
use super::scanner::{self, LocalPackage, ScanError};
use crate::config::EngineConfig;

const CONTAINER_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const NOT_DOWNLOADED_REASON: &str = "package was not downloaded before the watch timeout";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("package root is not usable: {0}")]
    RootAccess(ScanError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("install error: {0}")]
    Install(#[from] InstallError),
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("no backup directory is configured")]
    BackupsDisabled,
    #[error("background task failed: {0}")]
    Task(String),
}

/// One package to fetch and install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub remote_id: String,
    pub title: Option<String>,
    /// Folder the package already lives in, if the caller knows it.
    pub existing_folder: Option<String>,
    /// Looked up in the catalog when absent.
    pub remote_updated_at: Option<i64>,
}

impl UpdateRequest {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            title: None,
            existing_folder: None,
            remote_updated_at: None,
        }
    }
}

impl From<&StalePackage> for UpdateRequest {
    fn from(stale: &StalePackage) -> Self {
        Self {
            remote_id: stale.remote_id.clone(),
            title: Some(stale.title.clone()).filter(|title| !title.trim().is_empty()),
            existing_folder: Some(stale.folder_name.clone()),
            remote_updated_at: Some(stale.remote_updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageOutcome {
    pub remote_id: String,
    #[serde(flatten)]
    pub state: PackageState,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRequest {
    pub remote_id: String,
    /// Remote version to skip; looked up in the catalog when absent.
    pub remote_updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredState {
    pub path: PathBuf,
    pub ignored_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub path: PathBuf,
    pub restored: bool,
    pub error: Option<String>,
}

pub struct SyncEngine {
    client: CatalogClient,
    detector: UpdateDetector,
    downloader: Downloader,
    installer: Installer,
    active: ActiveDownloads,
    backup_on_update: bool,
    container_flags: TtlCache<bool>,
    container_members: TtlCache<Vec<String>>,
}

impl SyncEngine {
    pub fn new(
        client: CatalogClient,
        detector: DetectorSettings,
        downloader: Downloader,
        installer: Installer,
    ) -> Self {
        Self {
            detector: UpdateDetector::new(client.clone(), detector),
            client,
            downloader,
            installer,
            active: ActiveDownloads::new(),
            backup_on_update: false,
            container_flags: TtlCache::new(CONTAINER_CACHE_TTL),
            container_members: TtlCache::new(CONTAINER_CACHE_TTL),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let client = CatalogClient::with_base_urls(&config.api_url, &config.page_url)?
            .with_scrape_delay(config.scrape_delay);
        let downloader = Downloader::new(config.tool_dir.clone(), config.app_id, config.download)
            .with_tool_bin(config.tool_bin.clone());
        let installer =
            Installer::new(config.mods_root.clone()).with_backup_root(config.backup_root.clone());
        Ok(Self::new(client, config.detector, downloader, installer)
            .with_backup_on_update(config.backup_on_update))
    }

    /// Shares the in-flight set with other engines or callers.
    pub fn with_active_downloads(mut self, active: ActiveDownloads) -> Self {
        self.active = active;
        self
    }

    pub fn with_backup_on_update(mut self, enabled: bool) -> Self {
        self.backup_on_update = enabled;
        self
    }

    pub fn mods_root(&self) -> &Path {
        self.installer.mods_root()
    }

    pub fn active_downloads(&self) -> &ActiveDownloads {
        &self.active
    }

    pub async fn check_updates(
        &self,
        ignored: &HashSet<String>,
    ) -> Result<Vec<StalePackage>, EngineError> {
        Ok(self.detector.find_stale(self.mods_root(), ignored).await?)
    }

    /// Local data only; see [`SyncEngine::attach_details`] for catalog data.
    pub async fn list_installed(&self) -> Result<Vec<LocalPackage>, EngineError> {
        Ok(scanner::scan_packages_in_background(self.mods_root().to_path_buf()).await?)
    }

    pub async fn attach_details(&self, packages: Vec<LocalPackage>) -> Vec<InstalledPackage> {
        self.detector.attach_details(packages).await
    }

    /// Downloads every requested package in one tool run, then installs them
    /// one by one. Per-package failures are reported through `sink` and the
    /// returned outcomes; only root access and tool failures abort the batch.
    pub async fn update_packages(
        &self,
        requests: &[UpdateRequest],
        sink: &dyn StateSink,
        cancel: &CancellationToken,
        resolver: &dyn ConflictResolver,
    ) -> Result<Vec<PackageOutcome>, EngineError> {
        let root = self.mods_root().to_path_buf();
        tokio::task::spawn_blocking(move || scanner::verify_root_access(&root))
            .await
            .map_err(|err| EngineError::Task(err.to_string()))?
            .map_err(EngineError::RootAccess)?;

        let mut seen = HashSet::new();
        let requests: Vec<&UpdateRequest> = requests
            .iter()
            .filter(|request| seen.insert(request.remote_id.as_str()))
            .collect();

        let mut outcomes: HashMap<String, PackageOutcome> = HashMap::new();
        let mut claimed: Vec<(&UpdateRequest, DownloadClaim)> = Vec::new();
        for request in requests.iter().copied() {
            match self.active.try_claim(&request.remote_id) {
                Ok(claim) => claimed.push((request, claim)),
                Err(err) => {
                    let outcome = finish(sink, &request.remote_id, failed(&err), None);
                    outcomes.insert(request.remote_id.clone(), outcome);
                }
            }
        }

        for (request, _) in &claimed {
            sink.emit(&request.remote_id, &PackageState::Queued);
        }
        if cancel.is_cancelled() {
            for (request, _) in &claimed {
                let outcome = finish(sink, &request.remote_id, PackageState::Cancelled, None);
                outcomes.insert(request.remote_id.clone(), outcome);
            }
            return Ok(in_request_order(&requests, outcomes));
        }

        for (request, _) in &claimed {
            sink.emit(&request.remote_id, &PackageState::Downloading);
        }
        let jobs: Vec<DownloadJob> = claimed
            .iter()
            .map(|(request, _)| DownloadJob {
                remote_id: request.remote_id.clone(),
                title: request.title.clone(),
            })
            .collect();
        let completed = match self.downloader.download_all(&jobs).await {
            Ok(completed) => completed,
            Err(err) => {
                for (request, _) in &claimed {
                    sink.emit(&request.remote_id, &failed(&err));
                }
                return Err(err.into());
            }
        };
        let staged: HashMap<String, PathBuf> = completed
            .into_iter()
            .map(|download| (download.remote_id, download.staged_path))
            .collect();

        for (request, claim) in claimed {
            let outcome = if cancel.is_cancelled() {
                finish(sink, &request.remote_id, PackageState::Cancelled, None)
            } else if let Some(staged_path) = staged.get(&request.remote_id) {
                sink.emit(&request.remote_id, &PackageState::Installing);
                match self.install_one(request, staged_path, resolver).await {
                    Ok(installed) => finish(
                        sink,
                        &request.remote_id,
                        PackageState::Completed,
                        Some(installed.path),
                    ),
                    Err(err) => finish(sink, &request.remote_id, failed(&err), None),
                }
            } else {
                let state = PackageState::Failed {
                    reason: NOT_DOWNLOADED_REASON.to_string(),
                };
                finish(sink, &request.remote_id, state, None)
            };
            drop(claim);
            outcomes.insert(request.remote_id.clone(), outcome);
        }

        Ok(in_request_order(&requests, outcomes))
    }

    async fn install_one(
        &self,
        request: &UpdateRequest,
        staged_path: &Path,
        resolver: &dyn ConflictResolver,
    ) -> Result<InstalledFolder, InstallError> {
        let known_time = request.remote_updated_at.filter(|time| *time > 0);
        let known_title = request
            .title
            .clone()
            .filter(|title| !title.trim().is_empty());
        let (title, remote_updated_at) = match (known_title, known_time) {
            (Some(title), Some(time)) => (Some(title), time),
            (title, time) => {
                let (remote_title, remote_time) =
                    self.lookup_remote_metadata(&request.remote_id).await;
                (title.or(remote_title), time.unwrap_or(remote_time))
            }
        };
        let mut install = InstallRequest {
            remote_id: request.remote_id.clone(),
            staged_path: staged_path.to_path_buf(),
            title,
            existing_folder: request.existing_folder.clone(),
            remote_updated_at,
            backup: self.backup_on_update,
            resolution: None,
        };
        match self.installer.install(&install).await {
            Err(InstallError::CorruptedConflict { folder_name }) => {
                tracing::warn!(
                    mod_id = %request.remote_id,
                    folder = %folder_name,
                    "install target exists without a package id; waiting for a decision"
                );
                let decision = resolver.resolve(&request.remote_id, &folder_name).await;
                install.resolution = Some(decision);
                self.installer.install(&install).await
            }
            other => other,
        }
    }

    /// Catalog title and update time for `remote_id`. The time falls back to
    /// now when the catalog cannot provide one.
    async fn lookup_remote_metadata(&self, remote_id: &str) -> (Option<String>, i64) {
        match self.client.fetch_one(remote_id).await {
            Ok(Some(entry)) => {
                let title = Some(entry.title).filter(|title| !title.trim().is_empty());
                if entry.time_updated > 0 {
                    (title, entry.time_updated)
                } else {
                    tracing::warn!(mod_id = remote_id, "catalog has no update time; using now");
                    (title, unix_now())
                }
            }
            Ok(None) => {
                tracing::warn!(mod_id = remote_id, "catalog has no entry; using now");
                (None, unix_now())
            }
            Err(err) => {
                tracing::warn!(mod_id = remote_id, error = %err, "failed to fetch package metadata; using now");
                (None, unix_now())
            }
        }
    }

    /// Writes an ignore marker into every folder carrying each id. Returns the
    /// folders that were marked.
    pub async fn ignore_updates(
        &self,
        requests: &[IgnoreRequest],
    ) -> Result<Vec<PathBuf>, EngineError> {
        let missing: Vec<String> = requests
            .iter()
            .filter(|request| request.remote_updated_at.is_none_or(|time| time <= 0))
            .map(|request| request.remote_id.clone())
            .collect();
        let fetched = if missing.is_empty() {
            HashMap::new()
        } else {
            self.detector.fetch_details(&missing).await
        };

        let mut marked = Vec::new();
        for request in requests {
            let timestamp = request
                .remote_updated_at
                .filter(|time| *time > 0)
                .or_else(|| {
                    fetched
                        .get(&request.remote_id)
                        .and_then(Option::as_ref)
                        .map(|entry| entry.time_updated)
                        .filter(|time| *time > 0)
                })
                .unwrap_or_else(unix_now);
            let root = self.mods_root().to_path_buf();
            let remote_id = request.remote_id.clone();
            let folders = tokio::task::spawn_blocking(move || {
                let folders = scanner::find_folders_with_id(&root, &remote_id)?;
                for folder in &folders {
                    if let Err(err) = markers::write_ignore_marker(folder, timestamp) {
                        tracing::warn!(path = %folder.display(), error = %err, "failed to write ignore marker");
                    }
                }
                Ok::<_, ScanError>(folders)
            })
            .await
            .map_err(|err| EngineError::Task(err.to_string()))??;
            tracing::info!(
                mod_id = %request.remote_id,
                folders = folders.len(),
                timestamp,
                "update ignored"
            );
            marked.extend(folders);
        }
        Ok(marked)
    }

    /// Removes ignore markers from every folder carrying each id.
    pub async fn undo_ignore_updates(&self, remote_ids: &[String]) -> Result<usize, EngineError> {
        let root = self.mods_root().to_path_buf();
        let remote_ids = remote_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for remote_id in &remote_ids {
                for folder in scanner::find_folders_with_id(&root, remote_id)? {
                    match markers::remove_ignore_marker(&folder) {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(err) => tracing::warn!(
                            path = %folder.display(),
                            error = %err,
                            "failed to remove ignore marker"
                        ),
                    }
                }
            }
            Ok::<_, EngineError>(removed)
        })
        .await
        .map_err(|err| EngineError::Task(err.to_string()))?
    }

    pub fn ignored_state(&self, paths: &[PathBuf]) -> Vec<IgnoredState> {
        paths
            .iter()
            .map(|path| IgnoredState {
                path: path.clone(),
                ignored_at: markers::read_ignore_marker(path).ok().flatten(),
            })
            .collect()
    }

    /// Replaces container ids by their member ids, keeping order and dropping
    /// duplicates. Containers whose members cannot be discovered are kept.
    pub async fn expand_containers(&self, ids: &[String]) -> Vec<String> {
        let mut expanded = Vec::new();
        for id in ids {
            if !self.is_container(id).await {
                expanded.push(id.clone());
                continue;
            }
            let members = self.container_members(id).await;
            if members.is_empty() {
                tracing::warn!(container_id = %id, "container has no discoverable members");
                expanded.push(id.clone());
            } else {
                expanded.extend(members);
            }
        }
        let mut seen = HashSet::new();
        expanded.retain(|id| seen.insert(id.clone()));
        expanded
    }

    async fn is_container(&self, id: &str) -> bool {
        if let Some(flag) = self.container_flags.get(id) {
            return flag;
        }
        match self.client.is_container(id).await {
            Ok(flag) => {
                self.container_flags.set(id, flag);
                flag
            }
            Err(err) => {
                tracing::warn!(mod_id = id, error = %err, "container check failed; treating as a package");
                false
            }
        }
    }

    async fn container_members(&self, id: &str) -> Vec<String> {
        if let Some(members) = self.container_members.get(id) {
            return members;
        }
        let members = self.client.container_children(id).await;
        if !members.is_empty() {
            self.container_members.set(id, members.clone());
        }
        members
    }

    pub fn backup_info(&self, mod_path: &Path) -> Result<BackupInfo, EngineError> {
        Ok(backup::backup_info(mod_path, self.installer.backup_root())?)
    }

    pub async fn restore_backup(&self, mod_path: &Path) -> Result<PathBuf, EngineError> {
        let backup_root = self
            .installer
            .backup_root()
            .ok_or(EngineError::BackupsDisabled)?;
        Ok(backup::restore_backup(mod_path, backup_root).await?)
    }

    pub async fn restore_backups(&self, mod_paths: &[PathBuf]) -> Vec<RestoreOutcome> {
        let mut outcomes = Vec::with_capacity(mod_paths.len());
        for path in mod_paths {
            let outcome = match self.restore_backup(path).await {
                Ok(_) => RestoreOutcome {
                    path: path.clone(),
                    restored: true,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "restore failed");
                    RestoreOutcome {
                        path: path.clone(),
                        restored: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn failed(err: &dyn std::error::Error) -> PackageState {
    PackageState::Failed {
        reason: err.to_string(),
    }
}

fn finish(
    sink: &dyn StateSink,
    remote_id: &str,
    state: PackageState,
    path: Option<PathBuf>,
) -> PackageOutcome {
    sink.emit(remote_id, &state);
    PackageOutcome {
        remote_id: remote_id.to_string(),
        state,
        path,
    }
}

fn in_request_order(
    requests: &[&UpdateRequest],
    mut outcomes: HashMap<String, PackageOutcome>,
) -> Vec<PackageOutcome> {
    requests
        .iter()
        .filter_map(|request| outcomes.remove(&request.remote_id))
        .collect()
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
