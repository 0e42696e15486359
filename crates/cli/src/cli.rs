use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line interface for the `ctxport` application.
#[derive(Debug, Parser)]
#[command(
    name = "ctxport",
    version,
    about = "Migrates agent tooling configuration between tools"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available `ctxport` commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Parses the source tree, transforms it, and writes the target artifacts.
    Migrate {
        /// Root of the configuration to migrate from.
        #[arg(long, env = "CTXPORT_SOURCE", value_name = "DIR")]
        source: PathBuf,
        /// Directory the migrated configuration is written into.
        #[arg(long, env = "CTXPORT_TARGET", value_name = "DIR")]
        target: PathBuf,
        /// Rules override file (TOML, or JSON by extension). Defaults to `~/.ctxport/rules.toml`.
        #[arg(long, env = "CTXPORT_RULES", value_name = "FILE")]
        rules: Option<PathBuf>,
        /// Regenerate even when the target is up to date.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Do not snapshot existing target files before overwriting them.
        #[arg(long, default_value_t = false)]
        skip_backup: bool,
        /// Preview the run without writing anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Print a unified diff for every artifact that would change.
        #[arg(long, default_value_t = false)]
        diff: bool,
        /// Print the run report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Version of the source tool, recorded in the IR.
        #[arg(long, value_name = "VERSION")]
        source_version: Option<String>,
    },
    /// Parses the source tree and prints the intermediate representation.
    Inspect {
        /// Root of the configuration to parse.
        #[arg(long, env = "CTXPORT_SOURCE", value_name = "DIR")]
        source: PathBuf,
    },
    /// Restores a backup snapshot over the target.
    Restore {
        /// Target directory holding `.ctxport/backups`.
        #[arg(long, env = "CTXPORT_TARGET", value_name = "DIR")]
        target: PathBuf,
        /// Snapshot directory to restore (default: the latest one).
        #[arg(long, value_name = "DIR")]
        snapshot: Option<PathBuf>,
    },
    /// Lists backup snapshots for a target, oldest first.
    Snapshots {
        /// Target directory holding `.ctxport/backups`.
        #[arg(long, env = "CTXPORT_TARGET", value_name = "DIR")]
        target: PathBuf,
    },
}
