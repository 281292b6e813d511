use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use workshop_integrations::{PackageState, StateEvent};
use workshopd::config::EngineConfig;
use workshopd::sync::engine::{IgnoreRequest, PackageOutcome, SyncEngine, UpdateRequest};
use workshopd::sync::events::FixedResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Check,
    List { details: bool },
    Download(Vec<String>),
    Update(Vec<String>),
    Ignore(Vec<String>),
    Unignore(Vec<String>),
    Restore(Vec<String>),
    BackupInfo(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Help);
    };
    let rest: Vec<String> = args.collect();
    let require_ids = |rest: Vec<String>| -> anyhow::Result<Vec<String>> {
        if rest.is_empty() {
            anyhow::bail!("{command} needs at least one argument");
        }
        Ok(rest)
    };
    let mode = match command.as_str() {
        "check" => CliMode::Check,
        "list" => match rest.as_slice() {
            [] => CliMode::List { details: false },
            [flag] if flag == "--details" => CliMode::List { details: true },
            _ => anyhow::bail!("usage: list [--details]"),
        },
        "download" => CliMode::Download(require_ids(rest)?),
        "update" => CliMode::Update(rest),
        "ignore" => CliMode::Ignore(require_ids(rest)?),
        "unignore" => CliMode::Unignore(require_ids(rest)?),
        "restore" => CliMode::Restore(require_ids(rest)?),
        "backup-info" => match rest.as_slice() {
            [folder] => CliMode::BackupInfo(folder.clone()),
            _ => anyhow::bail!("usage: backup-info <folder>"),
        },
        "--help" | "-h" | "help" => CliMode::Help,
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(mode)
}

fn print_usage() {
    println!("Usage: workshopd <command> [args]");
    println!("  check                 List installed packages with a newer remote version");
    println!("  list [--details]      List installed packages");
    println!("  download <id>...      Download and install packages or collections");
    println!("  update [<id>...]      Update stale packages, optionally only the given ids");
    println!("  ignore <id>...        Skip the current remote version of packages");
    println!("  unignore <id>...      Stop skipping remote versions");
    println!("  restore <folder>...   Restore packages from their backups");
    println!("  backup-info <folder>  Show backup details for a package");
}

fn print_json_line<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_state(remote_id: &str, state: &PackageState) {
    match StateEvent::new(remote_id, state.clone()).to_json() {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!(mod_id = remote_id, error = %err, "failed to encode state event"),
    }
}

/// Folder arguments are taken relative to the package root unless absolute.
fn package_path(mods_root: &Path, folder: &str) -> PathBuf {
    let path = Path::new(folder);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        mods_root.join(path)
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling remaining packages");
            guard.cancel();
        }
    });
    cancel
}

async fn run_batch(
    engine: &SyncEngine,
    requests: &[UpdateRequest],
    resolver: &FixedResolver,
) -> anyhow::Result<()> {
    if requests.is_empty() {
        tracing::info!("nothing to update");
        return Ok(());
    }
    let cancel = cancel_on_ctrl_c();
    let outcomes = engine
        .update_packages(requests, &print_state, &cancel, resolver)
        .await
        .context("update batch failed")?;
    batch_result(&outcomes)
}

/// Fails when any package in the batch did not complete.
fn batch_result(outcomes: &[PackageOutcome]) -> anyhow::Result<()> {
    let failed = outcomes
        .iter()
        .filter(|outcome| !matches!(outcome.state, PackageState::Completed))
        .count();
    let total = outcomes.len();
    tracing::info!(total, failed, "batch finished");
    if failed > 0 {
        anyhow::bail!("{failed} of {total} packages failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    let config = EngineConfig::from_env()?;
    let resolver = FixedResolver(config.corrupted_policy);
    let engine = SyncEngine::from_config(&config).context("failed to build sync engine")?;
    let mods_root = engine.mods_root().to_path_buf();

    match mode {
        CliMode::Check => {
            for stale in engine.check_updates(&HashSet::new()).await? {
                print_json_line(&stale)?;
            }
        }
        CliMode::List { details } => {
            let packages = engine.list_installed().await?;
            if details {
                for package in engine.attach_details(packages).await {
                    print_json_line(&package)?;
                }
            } else {
                for package in packages {
                    print_json_line(&package)?;
                }
            }
        }
        CliMode::Download(ids) => {
            let ids = engine.expand_containers(&ids).await;
            let requests: Vec<UpdateRequest> = ids.into_iter().map(UpdateRequest::new).collect();
            run_batch(&engine, &requests, &resolver).await?;
        }
        CliMode::Update(ids) => {
            let only: HashSet<String> = ids.into_iter().collect();
            let requests: Vec<UpdateRequest> = engine
                .check_updates(&HashSet::new())
                .await?
                .iter()
                .filter(|stale| only.is_empty() || only.contains(&stale.remote_id))
                .map(UpdateRequest::from)
                .collect();
            run_batch(&engine, &requests, &resolver).await?;
        }
        CliMode::Ignore(ids) => {
            let requests: Vec<IgnoreRequest> = ids
                .into_iter()
                .map(|remote_id| IgnoreRequest {
                    remote_id,
                    remote_updated_at: None,
                })
                .collect();
            for path in engine.ignore_updates(&requests).await? {
                print_json_line(&serde_json::json!({ "ignored": path }))?;
            }
        }
        CliMode::Unignore(ids) => {
            let removed = engine.undo_ignore_updates(&ids).await?;
            print_json_line(&serde_json::json!({ "removed": removed }))?;
        }
        CliMode::Restore(folders) => {
            let paths: Vec<PathBuf> = folders
                .iter()
                .map(|folder| package_path(&mods_root, folder))
                .collect();
            for outcome in engine.restore_backups(&paths).await {
                print_json_line(&outcome)?;
            }
        }
        CliMode::BackupInfo(folder) => {
            let info = engine.backup_info(&package_path(&mods_root, &folder))?;
            print_json_line(&info)?;
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("workshopd")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_collects_ids() {
        assert_eq!(
            parse_cli_mode(args(&["download", "1", "2"])).unwrap(),
            CliMode::Download(vec!["1".into(), "2".into()])
        );
        assert_eq!(
            parse_cli_mode(args(&["update"])).unwrap(),
            CliMode::Update(Vec::new())
        );
        assert!(parse_cli_mode(args(&["ignore"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_list_details() {
        assert_eq!(
            parse_cli_mode(args(&["list", "--details"])).unwrap(),
            CliMode::List { details: true }
        );
        assert!(parse_cli_mode(args(&["list", "--verbose"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_command() {
        assert!(parse_cli_mode(args(&["sync"])).is_err());
        assert!(parse_cli_mode(args(&["backup-info"])).is_err());
    }

    fn outcome(remote_id: &str, state: PackageState) -> PackageOutcome {
        PackageOutcome {
            remote_id: remote_id.into(),
            state,
            path: None,
        }
    }

    #[test]
    fn batch_with_failures_is_an_error() {
        let completed = outcome("1", PackageState::Completed);
        assert!(batch_result(&[completed.clone()]).is_ok());
        assert!(batch_result(&[]).is_ok());

        let failed = outcome(
            "2",
            PackageState::Failed {
                reason: "not downloaded".into(),
            },
        );
        let err = batch_result(&[completed, failed]).unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 packages failed");
    }

    #[test]
    fn folder_arguments_resolve_under_root() {
        let root = Path::new("/mods");
        assert_eq!(package_path(root, "Example"), PathBuf::from("/mods/Example"));
        assert_eq!(package_path(root, "/srv/Other"), PathBuf::from("/srv/Other"));
    }
}
