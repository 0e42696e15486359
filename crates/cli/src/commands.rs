//! Handlers for each subcommand.

use anyhow::{bail, Context, Result};
use ctxport_migrate::backup::BackupManager;
use ctxport_migrate::{ChangeKind, Orchestrator, TranspileParams, TranspileReport, STATE_DIR};
use std::path::{Path, PathBuf};

/// File name of the user rules override under `~/.ctxport`.
const RULES_FILE: &str = "rules.toml";

pub(crate) struct MigrateArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub rules: Option<PathBuf>,
    pub force: bool,
    pub skip_backup: bool,
    pub dry_run: bool,
    pub diff: bool,
    pub json: bool,
    pub source_version: Option<String>,
}

/// `~/.ctxport/rules.toml`, if a home directory is known.
fn default_rules_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(STATE_DIR).join(RULES_FILE))
}

/// An explicitly named rules file must exist; the default one may not.
fn rules_override(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) if !path.exists() => bail!("rules file {} not found", path.display()),
        Some(path) => Ok(Some(path)),
        None => Ok(default_rules_path()),
    }
}

fn print_diffs(report: &TranspileReport) {
    for change in &report.changes {
        if change.kind != ChangeKind::Unchanged {
            print!("{}", change.diff);
        }
    }
}

pub(crate) fn handle_migrate_command(args: MigrateArgs) -> Result<()> {
    let params = TranspileParams {
        source_root: args.source,
        target_root: args.target,
        rules_override: rules_override(args.rules)?,
        source_version: args.source_version,
        force: args.force,
        skip_backup: args.skip_backup,
        dry_run: args.dry_run,
    };
    tracing::debug!(?params, "Starting migration");

    let report = Orchestrator::new().run(&params).with_context(|| {
        format!(
            "migration from {} to {} failed",
            params.source_root.display(),
            params.target_root.display()
        )
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if args.diff {
        print_diffs(&report);
    }
    print!("{}", report.format_summary());
    Ok(())
}

pub(crate) fn handle_inspect_command(source: &Path) -> Result<()> {
    let outcome = ctxport_parse::parse_source(source)
        .with_context(|| format!("failed to read source tree {}", source.display()))?;
    for err in &outcome.errors {
        eprintln!("warning: {err}");
    }
    println!("{}", outcome.ir.to_json_pretty()?);
    Ok(())
}

pub(crate) fn handle_restore_command(target: &Path, snapshot: Option<&Path>) -> Result<()> {
    let manager = BackupManager::new(target);
    let dir = match snapshot {
        Some(dir) => dir.to_path_buf(),
        None => match manager.latest_snapshot()? {
            Some(latest) => latest.dir,
            None => bail!("no snapshots found under {}", manager.backups_dir().display()),
        },
    };

    let restored = manager
        .restore(&dir)
        .with_context(|| format!("failed to restore snapshot {}", dir.display()))?;
    println!(
        "Restored {} file(s) and removed {} from {}",
        restored.restored.len(),
        restored.removed.len(),
        dir.display()
    );
    Ok(())
}

pub(crate) fn handle_snapshots_command(target: &Path) -> Result<()> {
    let manager = BackupManager::new(target);
    let snapshots = manager.list_snapshots()?;
    if snapshots.is_empty() {
        println!("No snapshots under {}", manager.backups_dir().display());
        return Ok(());
    }
    for snapshot in snapshots {
        println!(
            "{}  {} file(s), {} new  {}",
            snapshot.id(),
            snapshot.manifest.entries.len(),
            snapshot.manifest.absent.len(),
            snapshot.dir.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxport_test_utils::TestFixture;

    #[test]
    fn default_rules_path_lives_under_home() {
        let fixture = TestFixture::new().unwrap();
        let _lock = ctxport_test_utils::env_guard();
        let _home = fixture.home_guard();

        assert_eq!(
            default_rules_path(),
            Some(fixture.home_path().join(".ctxport/rules.toml"))
        );
    }

    #[test]
    fn explicit_rules_file_must_exist() {
        let err = rules_override(Some(PathBuf::from("/nonexistent/rules.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
