//! Run orchestrator that sequences every stage and rolls back on failure.

use crate::backup::{BackupManager, Snapshot};
use crate::emit::{
    self, ArtifactSet, AGENTS_ARTIFACT, COMMANDS_ARTIFACT, MODELS_ARTIFACT, SETTINGS_ARTIFACT,
};
use crate::error::TranspileError;
use crate::idempotency::{self, Mapping, RunManifest, RUN_MANIFEST, RUN_MANIFEST_VERSION};
use crate::report::{Outcome, RunStatus, TranspileReport};
use crate::rules::{resolve_rules, RuleSet};
use crate::target::TargetSchema;
use crate::transform::transform;
use crate::writer::{write_atomic, ArtifactWriter, FsWriter};
use crate::STATE_DIR;
use ctxport_parse::{discover, parse_tree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Pipeline states, in order. `Rollback` is reachable from `Backup`,
/// `Write`, and `PersistManifest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    IdempotencyCheck,
    Parse,
    Transform,
    Emit,
    Backup,
    Write,
    PersistManifest,
    Rollback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IdempotencyCheck => "idempotency check",
            Self::Parse => "parse",
            Self::Transform => "transform",
            Self::Emit => "emit",
            Self::Backup => "backup",
            Self::Write => "write",
            Self::PersistManifest => "persist manifest",
            Self::Rollback => "rollback",
        })
    }
}

fn enter(stage: Stage) {
    tracing::info!(stage = %stage, "Entering stage");
}

/// Parameters for a run.
///
/// ```
/// use ctxport_migrate::TranspileParams;
///
/// let params = TranspileParams {
///     source_root: "/home/me/.claude".into(),
///     target_root: "/home/me/.config/opencode".into(),
///     dry_run: true,
///     ..Default::default()
/// };
/// assert!(!params.force);
/// assert!(params.rules_override.is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranspileParams {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    /// User rules merged over the built-in ones; a missing file is ignored.
    #[serde(default)]
    pub rules_override: Option<PathBuf>,
    /// Source tool version, when a detector supplied one.
    #[serde(default)]
    pub source_version: Option<String>,
    /// Regenerate even if the target is up to date.
    #[serde(default)]
    pub force: bool,
    /// Keep pre-run contents in memory instead of an on-disk snapshot.
    #[serde(default)]
    pub skip_backup: bool,
    /// Stop after emission and report what would change.
    #[serde(default)]
    pub dry_run: bool,
}

/// Pre-run contents of a file the run may overwrite.
struct Original {
    path: PathBuf,
    /// `None` when the file did not exist.
    contents: Option<(Vec<u8>, fs::Permissions)>,
}

/// Everything needed to put the target back the way it was.
#[derive(Default)]
struct Journal {
    snapshot: Option<Snapshot>,
    /// Only filled when running without a snapshot.
    originals: Vec<Original>,
    /// Directories the run may create, deepest first.
    created_dirs: Vec<PathBuf>,
}

impl Journal {
    fn undo(self, manager: &BackupManager) -> Result<(), String> {
        let mut problems = Vec::new();

        if let Some(snapshot) = &self.snapshot {
            match manager.restore(&snapshot.dir) {
                Ok(_) => {
                    if let Err(err) = manager.discard(snapshot) {
                        problems.push(err.to_string());
                    }
                }
                Err(err) => problems.push(format!(
                    "{err} (snapshot kept at {})",
                    snapshot.dir.display()
                )),
            }
        }

        for original in &self.originals {
            let result = match &original.contents {
                Some((bytes, permissions)) => write_atomic(&original.path, bytes)
                    .and_then(|()| fs::set_permissions(&original.path, permissions.clone())),
                None => match fs::remove_file(&original.path) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(err) = result {
                problems.push(format!("{}: {err}", original.path.display()));
            }
        }

        for dir in &self.created_dirs {
            match fs::remove_dir(dir) {
                Ok(()) => tracing::debug!(dir = %dir.display(), "Removed directory created by run"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(err) => problems.push(format!("{}: {err}", dir.display())),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// Directories in the ancestry of `dirs` that do not exist yet, deepest first.
fn missing_dirs(dirs: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut missing = BTreeSet::new();
    for dir in dirs {
        let mut current = Some(dir.as_path());
        while let Some(d) = current.filter(|d| !d.as_os_str().is_empty() && !d.exists()) {
            missing.insert(d.to_path_buf());
            current = d.parent();
        }
    }
    let mut missing: Vec<PathBuf> = missing.into_iter().collect();
    missing.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    missing
}

fn read_originals(target_root: &Path, planned: &[PathBuf]) -> Result<Vec<Original>, TranspileError> {
    planned
        .iter()
        .map(|relative| {
            let path = target_root.join(relative);
            let io_err = |source| TranspileError::Io {
                stage: Stage::Backup,
                path: path.clone(),
                source,
            };
            let contents = match fs::read(&path) {
                Ok(bytes) => {
                    let permissions = fs::metadata(&path).map_err(io_err)?.permissions();
                    Some((bytes, permissions))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(io_err(e)),
            };
            Ok(Original { path, contents })
        })
        .collect()
}

/// Which source files fed which artifact.
fn mappings(schema: &TargetSchema) -> Vec<Mapping> {
    let mut out = BTreeSet::new();
    for (artifact, entities) in [
        (AGENTS_ARTIFACT, &schema.agents),
        (COMMANDS_ARTIFACT, &schema.commands),
        (MODELS_ARTIFACT, &schema.models),
    ] {
        for entity in entities {
            out.insert(Mapping {
                source: entity.source_file.clone(),
                artifact: artifact.to_string(),
            });
        }
    }
    if !schema.settings.is_empty() {
        for source in &schema.settings_sources {
            out.insert(Mapping {
                source: source.clone(),
                artifact: SETTINGS_ARTIFACT.to_string(),
            });
        }
    }
    out.into_iter().collect()
}

/// Drives one run from source tree to written target.
///
/// Every file written into the target goes through `W`.
pub struct Orchestrator<W: ArtifactWriter = FsWriter> {
    writer: W,
    builtin: RuleSet,
}

impl Default for Orchestrator<FsWriter> {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_writer(FsWriter)
    }
}

impl<W: ArtifactWriter> Orchestrator<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer,
            builtin: RuleSet::builtin(),
        }
    }

    /// Replaces the built-in rules that user overrides are merged over.
    pub fn with_builtin_rules(mut self, rules: RuleSet) -> Self {
        self.builtin = rules;
        self
    }

    /// Runs the pipeline.
    ///
    /// Either every artifact and the run manifest are written, or the
    /// target is left exactly as it was and the error says so.
    pub fn run(&self, params: &TranspileParams) -> Result<TranspileReport, TranspileError> {
        enter(Stage::IdempotencyCheck);
        let rules = resolve_rules(&self.builtin, params.rules_override.as_deref())?;
        let tree = discover(&params.source_root)?;
        let source_hash = tree.content_hash().to_string();
        let manifest_path = RunManifest::path_in(&params.target_root);
        let decision = idempotency::check(
            &source_hash,
            &rules.hash,
            &manifest_path,
            params.force,
            &params.target_root,
        );
        if !decision.regenerate {
            tracing::info!(reason = %decision.reason, "Target is up to date; nothing to do");
            return Ok(TranspileReport::skipped(decision.reason.to_string(), source_hash).finish());
        }
        tracing::info!(reason = %decision.reason, "Regenerating target");

        enter(Stage::Parse);
        let parsed = parse_tree(&tree);
        let mut ir = parsed.ir;
        ir.source.version = params.source_version.clone();

        enter(Stage::Transform);
        let transformed = transform(&ir, &rules.rules).map_err(TranspileError::Transform)?;

        enter(Stage::Emit);
        let artifacts = emit::emit(&transformed.schema)?;
        let output_hash = artifacts.hash();
        let mut report = TranspileReport {
            outcome: Outcome::DryRun,
            status: RunStatus::Success,
            decision_reason: decision.reason.to_string(),
            parse_errors: parsed.errors,
            gaps: transformed.gaps,
            artifacts: artifacts.names().map(str::to_string).collect(),
            changes: emit::preview(&artifacts, &params.target_root),
            backup: None,
            manifest_path: None,
            source_hash: source_hash.clone(),
            output_hash: Some(output_hash.clone()),
        };
        if params.dry_run {
            tracing::info!(artifacts = artifacts.len(), "Dry run; nothing written");
            return Ok(report.finish());
        }

        let manifest = RunManifest {
            schema_version: RUN_MANIFEST_VERSION,
            last_run: ctxport_ir::now_rfc3339(),
            source_hash,
            output_hash,
            rules_hash: rules.hash,
            backup: None,
            mappings: mappings(&transformed.schema),
        };
        let manifest = self.commit(params, &artifacts, manifest, &manifest_path)?;

        report.outcome = Outcome::Written;
        report.backup = manifest.backup;
        report.manifest_path = Some(manifest_path);
        tracing::info!(
            artifacts = report.artifacts.len(),
            gaps = report.gaps.len(),
            parse_errors = report.parse_errors.len(),
            "Run complete"
        );
        Ok(report.finish())
    }

    /// Backup, write, and persist the manifest; roll back on any failure.
    fn commit(
        &self,
        params: &TranspileParams,
        artifacts: &ArtifactSet,
        mut manifest: RunManifest,
        manifest_path: &Path,
    ) -> Result<RunManifest, TranspileError> {
        let target = &params.target_root;
        let manager = BackupManager::new(target);
        let planned: Vec<PathBuf> = artifacts
            .names()
            .map(PathBuf::from)
            .chain([Path::new(STATE_DIR).join(RUN_MANIFEST)])
            .collect();

        let mut journal = Journal {
            created_dirs: missing_dirs(
                planned
                    .iter()
                    .filter_map(|p| target.join(p).parent().map(Path::to_path_buf))
                    .chain([manager.backups_dir()]),
            ),
            ..Journal::default()
        };

        enter(Stage::Backup);
        if params.skip_backup {
            tracing::info!("Skipping on-disk backup; keeping pre-run contents in memory");
            journal.originals = read_originals(target, &planned)?;
        } else {
            match manager.snapshot(&planned, &params.source_root) {
                Ok(snapshot) => journal.snapshot = snapshot,
                Err(err) => return Err(rollback(journal, &manager, Stage::Backup, err.into())),
            }
        }
        manifest.backup = journal.snapshot.as_ref().map(|s| s.dir.clone());

        enter(Stage::Write);
        for (name, bytes) in artifacts.iter() {
            let path = target.join(name);
            if let Err(source) = self.writer.write(&path, bytes) {
                let err = TranspileError::Io {
                    stage: Stage::Write,
                    path,
                    source,
                };
                return Err(rollback(journal, &manager, Stage::Write, err));
            }
            tracing::debug!(artifact = name, bytes = bytes.len(), "Wrote artifact");
        }

        enter(Stage::PersistManifest);
        if let Err(source) = manifest.save(manifest_path, &self.writer) {
            let err = TranspileError::Io {
                stage: Stage::PersistManifest,
                path: manifest_path.to_path_buf(),
                source,
            };
            return Err(rollback(journal, &manager, Stage::PersistManifest, err));
        }
        Ok(manifest)
    }
}

fn rollback(
    journal: Journal,
    manager: &BackupManager,
    stage: Stage,
    error: TranspileError,
) -> TranspileError {
    tracing::warn!(stage = %stage, error = %error, "Run failed; rolling back");
    enter(Stage::Rollback);
    match journal.undo(manager) {
        Ok(()) => {
            tracing::info!("Target restored to its pre-run state");
            TranspileError::RolledBack {
                stage,
                source: Box::new(error),
            }
        }
        Err(rollback) => {
            tracing::error!(error = %rollback, "Rollback incomplete");
            TranspileError::RollbackFailed {
                stage,
                original: Box::new(error),
                rollback,
            }
        }
    }
}
