use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use workshop_core::{CatalogClient, CatalogEntry};
use workshop_integrations::ids::DEFAULT_APP_ID;

use super::scanner::{self, LocalPackage, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub batch_size: usize,
    pub stagger: Duration,
    /// Remote updates within this distance of the local baseline count as fresh.
    pub epsilon: Duration,
    pub app_id: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            stagger: Duration::from_millis(250),
            epsilon: Duration::from_secs(1),
            app_id: DEFAULT_APP_ID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum Exclusion {
    NotFound,
    Unresolvable { result: i32 },
    NotPublic { visibility: i32 },
    Banned,
    ForeignApp { app_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PackageStatus {
    UpToDate,
    Stale { remote_updated_at: i64 },
    Excluded(Exclusion),
    /// Catalog data or a local baseline is missing.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalePackage {
    pub remote_id: String,
    pub folder_name: String,
    pub path: PathBuf,
    pub last_synced_at: Option<i64>,
    pub remote_updated_at: i64,
    pub title: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackage {
    #[serde(flatten)]
    pub local: LocalPackage,
    pub details: Option<CatalogEntry>,
}

pub fn is_stale(remote_updated_at: i64, baseline: i64, epsilon: Duration) -> bool {
    let diff_ms = i128::from(remote_updated_at.saturating_sub(baseline)) * 1000;
    diff_ms > epsilon.as_millis() as i128
}

/// Applies the exclusion policy in order, then the staleness rule.
pub fn classify(
    package: &LocalPackage,
    entry: Option<&CatalogEntry>,
    settings: &DetectorSettings,
) -> PackageStatus {
    let Some(entry) = entry else {
        return PackageStatus::Unknown;
    };
    if entry.is_not_found() {
        tracing::warn!(
            mod_id = %package.remote_id,
            folder = %package.folder_name,
            "package was removed or delisted from the catalog"
        );
        return PackageStatus::Excluded(Exclusion::NotFound);
    }
    if !entry.is_success() {
        tracing::warn!(
            mod_id = %package.remote_id,
            result = entry.result,
            "catalog returned a non-success result"
        );
        if entry.time_updated <= 0 {
            return PackageStatus::Excluded(Exclusion::Unresolvable {
                result: entry.result,
            });
        }
    }
    if !entry.is_public() {
        return PackageStatus::Excluded(Exclusion::NotPublic {
            visibility: entry.visibility,
        });
    }
    if entry.banned {
        return PackageStatus::Excluded(Exclusion::Banned);
    }
    if entry.creator_app_id != settings.app_id {
        return PackageStatus::Excluded(Exclusion::ForeignApp {
            app_id: entry.creator_app_id,
        });
    }
    let Some(baseline) = package.baseline() else {
        return PackageStatus::Unknown;
    };
    if is_stale(entry.time_updated, baseline, settings.epsilon) {
        PackageStatus::Stale {
            remote_updated_at: entry.time_updated,
        }
    } else {
        PackageStatus::UpToDate
    }
}

pub struct UpdateDetector {
    client: CatalogClient,
    settings: DetectorSettings,
}

impl UpdateDetector {
    pub fn new(client: CatalogClient, settings: DetectorSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Fetches all ids in parallel batches, dispatching batch `n` after
    /// `n * stagger`. Ids from batches that failed are missing from the map.
    pub async fn fetch_details(&self, ids: &[String]) -> HashMap<String, Option<CatalogEntry>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        let batch_size = self.settings.batch_size.max(1);
        let client = &self.client;
        let stagger = self.settings.stagger;

        let requests = unique
            .chunks(batch_size)
            .enumerate()
            .map(|(index, batch)| async move {
                let delay = stagger.saturating_mul(index as u32);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (index, client.fetch_batch(batch).await)
            });

        let mut details = HashMap::new();
        for (index, result) in join_all(requests).await {
            match result {
                Ok(batch) => details.extend(batch),
                Err(err) => tracing::warn!(
                    batch = index,
                    error = %err,
                    "catalog batch failed; its packages stay unresolved"
                ),
            }
        }
        details
    }

    pub async fn classify_packages(
        &self,
        packages: &[LocalPackage],
    ) -> Vec<(LocalPackage, PackageStatus)> {
        let ids: Vec<String> = packages.iter().map(|p| p.remote_id.clone()).collect();
        let details = self.fetch_details(&ids).await;
        packages
            .iter()
            .map(|package| {
                let entry = details.get(&package.remote_id).and_then(Option::as_ref);
                (package.clone(), classify(package, entry, &self.settings))
            })
            .collect()
    }

    /// Stale packages under `root`, one per remote id, skipping `ignored`.
    pub async fn find_stale(
        &self,
        root: &Path,
        ignored: &HashSet<String>,
    ) -> Result<Vec<StalePackage>, ScanError> {
        let packages = scanner::scan_packages_in_background(root.to_path_buf()).await?;
        if packages.is_empty() {
            return Ok(Vec::new());
        }
        let candidates: Vec<LocalPackage> = packages
            .into_iter()
            .filter(|package| !ignored.contains(&package.remote_id))
            .collect();
        let ids: Vec<String> = candidates.iter().map(|p| p.remote_id.clone()).collect();
        let details = self.fetch_details(&ids).await;

        let mut reported = HashSet::new();
        let mut stale = Vec::new();
        for package in candidates {
            if reported.contains(&package.remote_id) {
                continue;
            }
            let entry = details.get(&package.remote_id).and_then(Option::as_ref);
            if let PackageStatus::Stale { remote_updated_at } =
                classify(&package, entry, &self.settings)
                && let Some(entry) = entry
            {
                reported.insert(package.remote_id.clone());
                let last_synced_at = package.baseline();
                stale.push(StalePackage {
                    remote_id: package.remote_id,
                    folder_name: package.folder_name,
                    path: package.path,
                    last_synced_at,
                    remote_updated_at,
                    title: entry.title.clone(),
                    file_size: entry.file_size,
                });
            }
        }
        tracing::info!(count = stale.len(), root = %root.display(), "update check finished");
        Ok(stale)
    }

    /// Pairs each package with its catalog entry; packages whose batch failed
    /// or that the catalog omitted keep `details: None`.
    pub async fn attach_details(&self, packages: Vec<LocalPackage>) -> Vec<InstalledPackage> {
        let ids: Vec<String> = packages.iter().map(|p| p.remote_id.clone()).collect();
        let details = self.fetch_details(&ids).await;
        packages
            .into_iter()
            .map(|local| {
                let details = details.get(&local.remote_id).cloned().flatten();
                InstalledPackage { local, details }
            })
            .collect()
    }
}
