use crate::cli::{Cli, Commands};
use crate::commands;
use anyhow::Result;
use clap::Parser;

/// The main entry point for the `ctxport` application.
pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Migrate {
            source,
            target,
            rules,
            force,
            skip_backup,
            dry_run,
            diff,
            json,
            source_version,
        } => commands::handle_migrate_command(commands::MigrateArgs {
            source,
            target,
            rules,
            force,
            skip_backup,
            dry_run,
            diff,
            json,
            source_version,
        }),
        Commands::Inspect { source } => commands::handle_inspect_command(&source),
        Commands::Restore { target, snapshot } => {
            commands::handle_restore_command(&target, snapshot.as_deref())
        }
        Commands::Snapshots { target } => commands::handle_snapshots_command(&target),
    }
}
