use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use workshop_integrations::ids::{TOOL_NAME, TOOL_SCRIPT_PREFIX};

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download tool not found (searched {} locations and PATH)", .searched.len())]
    ToolNotFound { searched: Vec<PathBuf> },
    #[error("package {0} is already being downloaded")]
    AlreadyDownloading(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Ids with a download in flight. Shared by every caller that may start a
/// batch; one claim per id.
#[derive(Debug, Clone, Default)]
pub struct ActiveDownloads {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, remote_id: &str) -> Result<DownloadClaim, DownloadError> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(remote_id.to_string()) {
            return Err(DownloadError::AlreadyDownloading(remote_id.to_string()));
        }
        Ok(DownloadClaim {
            ids: Arc::clone(&self.ids),
            remote_id: remote_id.to_string(),
        })
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(remote_id)
    }
}

/// Releases the id when dropped.
#[derive(Debug)]
pub struct DownloadClaim {
    ids: Arc<Mutex<HashSet<String>>>,
    remote_id: String,
}

impl DownloadClaim {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }
}

impl Drop for DownloadClaim {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.remote_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Receives the download tool's output, line by line.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: OutputStream, line: &str);
}

#[derive(Debug, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, stream: OutputStream, line: &str) {
        tracing::debug!(stream = stream.as_str(), "{line}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSettings {
    pub poll_interval: Duration,
    pub watch_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            watch_timeout: Duration::from_secs(300),
            settle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub remote_id: String,
    pub title: Option<String>,
}

impl DownloadJob {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            title: None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.remote_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub remote_id: String,
    pub staged_path: PathBuf,
}

pub struct Downloader {
    tool_dir: PathBuf,
    tool_bin: Option<PathBuf>,
    app_id: u32,
    settings: DownloadSettings,
    output: Arc<dyn OutputSink>,
}

impl Downloader {
    pub fn new(tool_dir: PathBuf, app_id: u32, settings: DownloadSettings) -> Self {
        Self {
            tool_dir,
            tool_bin: None,
            app_id,
            settings,
            output: Arc::new(TracingSink),
        }
    }

    pub fn with_tool_bin(mut self, tool_bin: Option<PathBuf>) -> Self {
        self.tool_bin = tool_bin;
        self
    }

    pub fn with_output_sink(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn tool_dir(&self) -> &Path {
        &self.tool_dir
    }

    /// Where the tool places fetched packages, one folder per id.
    pub fn staging_root(&self) -> PathBuf {
        self.tool_dir
            .join("steamapps")
            .join("workshop")
            .join("content")
            .join(self.app_id.to_string())
    }

    pub fn staged_path(&self, remote_id: &str) -> PathBuf {
        self.staging_root().join(remote_id)
    }

    fn bookkeeping_file(&self) -> PathBuf {
        self.tool_dir
            .join("steamapps")
            .join("workshop")
            .join(format!("appworkshop_{}.acf", self.app_id))
    }

    pub fn locate_tool(&self) -> Result<PathBuf, DownloadError> {
        if let Some(bin) = &self.tool_bin {
            if bin.is_file() {
                return Ok(bin.clone());
            }
            return Err(DownloadError::ToolNotFound {
                searched: vec![bin.clone()],
            });
        }
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let work_dir = std::env::current_dir().ok();
        let candidates = tool_candidates(exe_dir.as_deref(), work_dir.as_deref(), &self.tool_dir);
        if let Some(found) = candidates.iter().find(|candidate| candidate.is_file()) {
            return Ok(found.clone());
        }
        which::which(TOOL_NAME).map_err(|_| DownloadError::ToolNotFound {
            searched: candidates,
        })
    }

    /// Runs one tool process for all `jobs` and returns the packages that
    /// arrived in the staging area. Absent ids failed or timed out.
    pub async fn download_all(
        &self,
        jobs: &[DownloadJob],
    ) -> Result<Vec<CompletedDownload>, DownloadError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let bookkeeping = self.bookkeeping_file();
        if let Err(err) = tokio::fs::remove_file(&bookkeeping).await
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %bookkeeping.display(), error = %err, "failed to remove tool bookkeeping file");
        }
        tokio::fs::create_dir_all(self.staging_root()).await?;
        for job in jobs {
            let staged = self.staged_path(&job.remote_id);
            if let Err(err) = tokio::fs::remove_dir_all(&staged).await
                && err.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %staged.display(), error = %err, "failed to clear previous staging folder");
            }
        }

        let tool_dir = std::path::absolute(&self.tool_dir)?;
        let script_path = tool_dir.join(format!(
            "{TOOL_SCRIPT_PREFIX}_{}_{}.txt",
            std::process::id(),
            SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let ids: Vec<&str> = jobs.iter().map(|job| job.remote_id.as_str()).collect();
        tokio::fs::write(&script_path, render_script(&tool_dir, self.app_id, &ids)).await?;

        let result = self.run_tool(&tool_dir, &script_path, jobs).await;
        if let Err(err) = tokio::fs::remove_file(&script_path).await {
            tracing::debug!(path = %script_path.display(), error = %err, "failed to remove tool script");
        }
        result
    }

    async fn run_tool(
        &self,
        tool_dir: &Path,
        script_path: &Path,
        jobs: &[DownloadJob],
    ) -> Result<Vec<CompletedDownload>, DownloadError> {
        let program = self.locate_tool()?;
        tracing::info!(
            program = %program.display(),
            count = jobs.len(),
            "starting download tool"
        );
        let mut child = Command::new(&program)
            .arg("+runscript")
            .arg(script_path)
            .current_dir(tool_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DownloadError::Launch {
                program: program.clone(),
                source,
            })?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&self.output),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&self.output),
            )));
        }

        let watchers: Vec<_> = jobs
            .iter()
            .map(|job| {
                let remote_id = job.remote_id.clone();
                let staged_path = self.staged_path(&remote_id);
                let settings = self.settings;
                tokio::spawn(async move {
                    let arrived = wait_for_package(
                        &staged_path,
                        settings.poll_interval,
                        settings.watch_timeout,
                    )
                    .await;
                    arrived.then_some(CompletedDownload {
                        remote_id,
                        staged_path,
                    })
                })
            })
            .collect();

        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::debug!("download tool exited successfully");
            }
            Ok(status) => tracing::warn!(%status, "download tool exited with failure"),
            Err(err) => tracing::warn!(error = %err, "failed to wait for download tool"),
        }
        join_all(readers).await;
        tokio::time::sleep(self.settings.settle_delay).await;

        let mut completed = Vec::new();
        for (job, outcome) in jobs.iter().zip(join_all(watchers).await) {
            match outcome {
                Ok(Some(download)) => {
                    completed.push(download);
                    continue;
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(mod_id = %job.remote_id, error = %err, "watcher task failed"),
            }
            // The tool may finish a package after its watcher gave up.
            let staged_path = self.staged_path(&job.remote_id);
            if is_populated_dir(&staged_path).await {
                tracing::info!(mod_id = %job.remote_id, "package arrived after the watch timeout");
                completed.push(CompletedDownload {
                    remote_id: job.remote_id.clone(),
                    staged_path,
                });
            } else {
                tracing::warn!(
                    mod_id = %job.remote_id,
                    title = job.display_title(),
                    "package did not arrive before the tool exited"
                );
            }
        }
        tracing::info!(
            requested = jobs.len(),
            completed = completed.len(),
            "download batch finished"
        );
        Ok(completed)
    }
}

pub fn render_script(tool_dir: &Path, app_id: u32, ids: &[&str]) -> String {
    let mut script = format!(
        "force_install_dir \"{}\"\nlogin anonymous\n",
        tool_dir.display()
    );
    for id in ids {
        script.push_str(&format!("workshop_download_item {app_id} {id}\n"));
    }
    script.push_str("quit\n");
    script
}

/// Search order: bundled per-platform binary next to (or one level above) the
/// running executable, then `bin/steamcmd/` under the working directory, then
/// the conventional executable in the tool dir.
pub fn tool_candidates(
    exe_dir: Option<&Path>,
    work_dir: Option<&Path>,
    tool_dir: &Path,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let (Some(exe_dir), Some(bundled)) = (exe_dir, bundled_tool_name()) {
        let mut bases = vec![exe_dir.to_path_buf(), exe_dir.join("resources")];
        if let Some(parent) = exe_dir.parent() {
            bases.push(parent.to_path_buf());
            bases.push(parent.join("resources"));
        }
        candidates.extend(bases.into_iter().map(|base| base.join(bundled)));
    }
    if let Some(work_dir) = work_dir {
        candidates.push(work_dir.join("bin").join(TOOL_NAME).join(executable_name()));
    }
    if cfg!(windows) {
        candidates.push(tool_dir.join(format!("{TOOL_NAME}.exe")));
    } else {
        candidates.push(tool_dir.join(TOOL_NAME));
        candidates.push(tool_dir.join(format!("{TOOL_NAME}.sh")));
    }
    candidates
}

fn executable_name() -> String {
    if cfg!(windows) {
        format!("{TOOL_NAME}.exe")
    } else {
        TOOL_NAME.to_string()
    }
}

fn bundled_tool_name() -> Option<&'static str> {
    if cfg!(all(target_os = "windows", target_arch = "x86_64")) {
        Some("steamcmd-x86_64-pc-windows-msvc.exe")
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        Some("steamcmd-aarch64-apple-darwin")
    } else if cfg!(all(target_os = "macos", target_arch = "x86_64")) {
        Some("steamcmd-x86_64-apple-darwin")
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        Some("steamcmd-x86_64-unknown-linux-gnu")
    } else {
        None
    }
}

/// Resolves once `path` is a directory with at least one entry. An existing
/// but empty directory keeps the watcher polling.
pub async fn wait_for_package(path: &Path, poll_interval: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if is_populated_dir(path).await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

pub async fn is_populated_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink.line(stream, &line),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(stream = stream.as_str(), error = %err, "stopped reading tool output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let active = ActiveDownloads::new();
        let claim = active.try_claim("1").unwrap();
        assert_eq!(claim.remote_id(), "1");
        assert!(matches!(
            active.try_claim("1"),
            Err(DownloadError::AlreadyDownloading(id)) if id == "1"
        ));
        let other = active.try_claim("2").unwrap();
        drop(claim);
        assert!(!active.contains("1"));
        assert!(active.contains("2"));
        assert!(active.try_claim("1").is_ok());
        drop(other);
    }

    #[test]
    fn clones_share_the_same_set() {
        let active = ActiveDownloads::new();
        let shared = active.clone();
        let _claim = active.try_claim("9").unwrap();
        assert!(shared.try_claim("9").is_err());
    }

    #[test]
    fn renders_script_with_one_directive_per_id() {
        let script = render_script(Path::new("/opt/tool"), 294100, &["11", "22"]);
        assert_eq!(
            script,
            "force_install_dir \"/opt/tool\"\n\
             login anonymous\n\
             workshop_download_item 294100 11\n\
             workshop_download_item 294100 22\n\
             quit\n"
        );
    }

    #[test]
    fn staging_layout_follows_app_id() {
        let downloader = Downloader::new(
            PathBuf::from("/tool"),
            294100,
            DownloadSettings::default(),
        );
        assert_eq!(
            downloader.staged_path("5"),
            PathBuf::from("/tool/steamapps/workshop/content/294100/5")
        );
        assert_eq!(
            downloader.bookkeeping_file(),
            PathBuf::from("/tool/steamapps/workshop/appworkshop_294100.acf")
        );
    }

    #[test]
    fn candidates_end_with_tool_dir_conventions() {
        let candidates = tool_candidates(
            Some(Path::new("/app/bin")),
            Some(Path::new("/work")),
            Path::new("/tool"),
        );
        if cfg!(windows) {
            assert_eq!(candidates.last(), Some(&PathBuf::from("/tool/steamcmd.exe")));
        } else {
            assert!(candidates.contains(&PathBuf::from("/tool/steamcmd")));
            assert_eq!(candidates.last(), Some(&PathBuf::from("/tool/steamcmd.sh")));
        }
        if let Some(bundled) = bundled_tool_name() {
            assert_eq!(candidates[0], Path::new("/app/bin").join(bundled));
            assert!(candidates.contains(&Path::new("/app/resources").join(bundled)));
        }
    }

    #[test]
    fn candidates_include_working_dir_convention() {
        let candidates = tool_candidates(None, Some(Path::new("/work")), Path::new("/tool"));
        let expected = Path::new("/work/bin/steamcmd").join(executable_name());
        let work_pos = candidates.iter().position(|c| *c == expected);
        let tool_pos = candidates.iter().position(|c| c.starts_with("/tool"));
        assert!(work_pos.is_some());
        assert!(work_pos < tool_pos);

        let without = tool_candidates(None, None, Path::new("/tool"));
        assert!(!without.contains(&expected));
    }

    #[test]
    fn explicit_missing_tool_is_not_found() {
        let dir = tempdir().unwrap();
        let downloader = Downloader::new(dir.path().to_path_buf(), 1, DownloadSettings::default())
            .with_tool_bin(Some(dir.path().join("missing-tool")));
        assert!(matches!(
            downloader.locate_tool(),
            Err(DownloadError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn populated_dir_requires_an_entry() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("123");
        assert!(!is_populated_dir(&staged).await);
        fs::create_dir(&staged).unwrap();
        assert!(!is_populated_dir(&staged).await);
        fs::write(staged.join("mod.txt"), "x").unwrap();
        assert!(is_populated_dir(&staged).await);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_waits_for_content_in_empty_dir() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("123");
        fs::create_dir(&staged).unwrap();

        let path = staged.clone();
        let watcher = tokio::spawn(async move {
            wait_for_package(&path, Duration::from_secs(1), Duration::from_secs(60)).await
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!watcher.is_finished());

        fs::write(staged.join("About.xml"), "<x/>").unwrap();
        assert!(watcher.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_times_out_without_content() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let arrived = wait_for_package(
            &dir.path().join("never"),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        assert!(!arrived);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Mutex as StdMutex;

        const FAKE_TOOL: &str = r#"#!/bin/sh
script="$2"
echo "fake tool starting"
while read -r cmd app id; do
  if [ "$cmd" = "workshop_download_item" ]; then
    mkdir -p "steamapps/workshop/content/$app/$id"
    if [ "$id" != "333" ]; then
      echo payload > "steamapps/workshop/content/$app/$id/mod.txt"
    fi
  fi
done < "$script"
echo "fake tool done" >&2
"#;

        #[derive(Default)]
        struct RecordingSink {
            lines: StdMutex<Vec<(OutputStream, String)>>,
        }

        impl OutputSink for RecordingSink {
            fn line(&self, stream: OutputStream, line: &str) {
                self.lines.lock().unwrap().push((stream, line.to_string()));
            }
        }

        fn install_fake_tool(dir: &Path) -> PathBuf {
            let tool = dir.join("fake-steamcmd");
            fs::write(&tool, FAKE_TOOL).unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
            tool
        }

        fn fast_settings() -> DownloadSettings {
            DownloadSettings {
                poll_interval: Duration::from_millis(20),
                watch_timeout: Duration::from_millis(800),
                settle_delay: Duration::from_millis(10),
            }
        }

        #[tokio::test]
        async fn downloads_packages_through_the_tool() {
            let dir = tempdir().unwrap();
            let tool_dir = dir.path().join("tool");
            let tool = install_fake_tool(dir.path());
            let sink = Arc::new(RecordingSink::default());
            let downloader = Downloader::new(tool_dir.clone(), 294100, fast_settings())
                .with_tool_bin(Some(tool))
                .with_output_sink(sink.clone());

            fs::create_dir_all(tool_dir.join("steamapps/workshop")).unwrap();
            fs::write(downloader.bookkeeping_file(), "stale").unwrap();

            let jobs = vec![DownloadJob::new("111"), DownloadJob::new("222")];
            let completed = downloader.download_all(&jobs).await.unwrap();

            let ids: Vec<&str> = completed.iter().map(|c| c.remote_id.as_str()).collect();
            assert_eq!(ids, vec!["111", "222"]);
            assert!(completed[0].staged_path.join("mod.txt").is_file());
            assert!(!downloader.bookkeeping_file().exists());

            let leftovers: Vec<_> = fs::read_dir(&tool_dir)
                .unwrap()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(TOOL_SCRIPT_PREFIX))
                .collect();
            assert!(leftovers.is_empty());

            let lines = sink.lines.lock().unwrap();
            assert!(lines.contains(&(OutputStream::Stdout, "fake tool starting".to_string())));
            assert!(lines.contains(&(OutputStream::Stderr, "fake tool done".to_string())));
        }

        const SLOW_TOOL: &str = r#"#!/bin/sh
sleep 1
mkdir -p "steamapps/workshop/content/294100/111"
echo payload > "steamapps/workshop/content/294100/111/mod.txt"
"#;

        #[tokio::test]
        async fn package_staged_after_watch_timeout_is_reported() {
            let dir = tempdir().unwrap();
            let tool = dir.path().join("slow-steamcmd");
            fs::write(&tool, SLOW_TOOL).unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
            let settings = DownloadSettings {
                watch_timeout: Duration::from_millis(300),
                ..fast_settings()
            };
            let downloader = Downloader::new(dir.path().join("tool"), 294100, settings)
                .with_tool_bin(Some(tool));

            let jobs = vec![DownloadJob::new("111"), DownloadJob::new("222")];
            let completed = downloader.download_all(&jobs).await.unwrap();

            let ids: Vec<&str> = completed.iter().map(|c| c.remote_id.as_str()).collect();
            assert_eq!(ids, vec!["111"]);
            assert!(completed[0].staged_path.join("mod.txt").is_file());
        }

        #[tokio::test]
        async fn empty_staged_folder_is_not_reported() {
            let dir = tempdir().unwrap();
            let tool = install_fake_tool(dir.path());
            let downloader =
                Downloader::new(dir.path().join("tool"), 294100, fast_settings())
                    .with_tool_bin(Some(tool));

            let jobs = vec![DownloadJob::new("333"), DownloadJob::new("444")];
            let completed = downloader.download_all(&jobs).await.unwrap();

            assert_eq!(completed.len(), 1);
            assert_eq!(completed[0].remote_id, "444");
            assert!(downloader.staged_path("333").is_dir());
        }
    }
}
