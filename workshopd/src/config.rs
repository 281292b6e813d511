use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use workshop_integrations::ids::{BINARY_NAME, DEFAULT_APP_ID, TOOL_NAME};

use crate::sync::detector::DetectorSettings;
use crate::sync::downloader::DownloadSettings;
use crate::sync::installer::ConflictResolution;

const DEFAULT_API_URL: &str = "https://api.steampowered.com";
const DEFAULT_PAGE_URL: &str = "https://steamcommunity.com";
const DEFAULT_BATCH_SIZE: u64 = 50;
const DEFAULT_BATCH_STAGGER_MS: u64 = 250;
const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_SETTLE_MS: u64 = 1000;
const DEFAULT_SCRAPE_DELAY_MS: u64 = 2000;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mods_root: PathBuf,
    pub backup_root: Option<PathBuf>,
    pub backup_on_update: bool,
    pub tool_dir: PathBuf,
    pub tool_bin: Option<PathBuf>,
    pub app_id: u32,
    pub api_url: String,
    pub page_url: String,
    pub detector: DetectorSettings,
    pub download: DownloadSettings,
    pub scrape_delay: Duration,
    pub corrupted_policy: ConflictResolution,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let mods_root = std::env::var("WORKSHOP_MODS_DIR")
            .map(|value| expand_with_home(&value, &home))
            .context("WORKSHOP_MODS_DIR is not set")?;
        let backup_root = std::env::var("WORKSHOP_BACKUP_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home));
        let backup_on_update = read_bool_env("WORKSHOP_BACKUP_ON_UPDATE", false);
        let tool_dir = std::env::var("WORKSHOP_TOOL_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_tool_dir);
        let tool_bin = std::env::var("WORKSHOP_TOOL_BIN")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, &home));
        let app_id = std::env::var("WORKSHOP_APP_ID")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_APP_ID);
        let api_url =
            std::env::var("WORKSHOP_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let page_url =
            std::env::var("WORKSHOP_PAGE_URL").unwrap_or_else(|_| DEFAULT_PAGE_URL.to_string());

        let detector = DetectorSettings {
            batch_size: read_u64_env("WORKSHOP_BATCH_SIZE", DEFAULT_BATCH_SIZE) as usize,
            stagger: Duration::from_millis(read_u64_env(
                "WORKSHOP_BATCH_STAGGER_MS",
                DEFAULT_BATCH_STAGGER_MS,
            )),
            app_id,
            ..DetectorSettings::default()
        };
        let download = DownloadSettings {
            poll_interval: Duration::from_millis(read_u64_env(
                "WORKSHOP_POLL_MS",
                DEFAULT_POLL_MS,
            )),
            watch_timeout: Duration::from_secs(read_u64_env(
                "WORKSHOP_WATCH_TIMEOUT_SECS",
                DEFAULT_WATCH_TIMEOUT_SECS,
            )),
            settle_delay: Duration::from_millis(read_u64_env(
                "WORKSHOP_SETTLE_MS",
                DEFAULT_SETTLE_MS,
            )),
        };
        let scrape_delay = Duration::from_millis(read_u64_env(
            "WORKSHOP_SCRAPE_DELAY_MS",
            DEFAULT_SCRAPE_DELAY_MS,
        ));
        let corrupted_policy = match std::env::var("WORKSHOP_CORRUPTED_POLICY") {
            Ok(value) => parse_conflict_resolution(&value)?,
            Err(_) => ConflictResolution::Rename,
        };

        Ok(Self {
            mods_root,
            backup_root,
            backup_on_update,
            tool_dir,
            tool_bin,
            app_id,
            api_url,
            page_url,
            detector,
            download,
            scrape_delay,
            corrupted_policy,
        })
    }
}

fn parse_conflict_resolution(value: &str) -> anyhow::Result<ConflictResolution> {
    match value.trim().to_ascii_lowercase().as_str() {
        "rename" => Ok(ConflictResolution::Rename),
        "overwrite" => Ok(ConflictResolution::Overwrite),
        other => anyhow::bail!("WORKSHOP_CORRUPTED_POLICY must be rename or overwrite, got {other}"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_tool_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(BINARY_NAME)
        .join(TOOL_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
