//! Timestamped snapshots of target files, restorable after a failed run.
//!
//! A snapshot is assembled in a hidden temporary directory and renamed into
//! `<target>/.ctxport/backups/<timestamp>/` only once every copy and the
//! manifest are on disk. A snapshot directory is never modified afterwards.

use crate::writer::write_atomic;
use crate::{sha256_hex, STATE_DIR};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;

pub const BACKUPS_DIR: &str = "backups";
pub const BACKUP_MANIFEST: &str = "backup-manifest.json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup manifest {path} is invalid: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("backup copy of {path} is corrupted (expected {expected}, found {actual})")]
    Corrupted {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("no snapshot found at {0}")]
    NotFound(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A file that existed when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Relative to the target root.
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
    /// Unix permission bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: String,
    pub source: PathBuf,
    pub target_root: PathBuf,
    pub entries: Vec<BackupEntry>,
    /// Files the run intended to write that did not exist beforehand.
    #[serde(default)]
    pub absent: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
}

impl Snapshot {
    /// The directory name, which is its UTC creation timestamp.
    pub fn id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    /// Files that did not exist at snapshot time and were deleted.
    pub removed: Vec<PathBuf>,
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Sortable UTC timestamp with microseconds, e.g. `20250101T120000.000123Z`.
fn timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}.{:06}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.microsecond()
    )
}

/// Orders snapshot directories by timestamp, then by numeric collision
/// suffix, so `<id>-10` follows `<id>-2`.
fn snapshot_order(dir: &Path) -> (String, u64) {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('-') {
        Some((id, suffix)) => match suffix.parse() {
            Ok(n) => (id.to_string(), n),
            Err(_) => (name, 0),
        },
        None => (name, 0),
    }
}

fn read_manifest(dir: &Path) -> Result<BackupManifest, BackupError> {
    let path = dir.join(BACKUP_MANIFEST);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::NotFound(dir.to_path_buf()))
        }
        Err(e) => return Err(io_err(&path)(e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| BackupError::Manifest { path, source })
}

/// Creates, lists, restores, and discards snapshots for one target root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    target_root: PathBuf,
}

impl BackupManager {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.target_root.join(STATE_DIR).join(BACKUPS_DIR)
    }

    /// Snapshots `paths` (relative to the target root).
    ///
    /// Returns `None` only when `paths` is empty. Files that do not exist
    /// are listed in [`BackupManifest::absent`].
    pub fn snapshot(
        &self,
        paths: &[PathBuf],
        source_root: &Path,
    ) -> Result<Option<Snapshot>, BackupError> {
        if paths.is_empty() {
            return Ok(None);
        }
        let backups = self.backups_dir();
        fs::create_dir_all(&backups).map_err(io_err(&backups))?;

        // Removed on drop, so any early return leaves no partial snapshot.
        let staging = tempfile::Builder::new()
            .prefix(".partial-")
            .tempdir_in(&backups)
            .map_err(io_err(&backups))?;

        let mut entries = Vec::new();
        let mut absent = Vec::new();
        for relative in paths {
            let live = self.target_root.join(relative);
            let bytes = match fs::read(&live) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    absent.push(relative.clone());
                    continue;
                }
                Err(e) => return Err(io_err(&live)(e)),
            };
            let meta = fs::metadata(&live).map_err(io_err(&live))?;
            let copy = staging.path().join(relative);
            if let Some(parent) = copy.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::write(&copy, &bytes).map_err(io_err(&copy))?;
            entries.push(BackupEntry {
                path: relative.clone(),
                hash: sha256_hex(&bytes),
                size: bytes.len() as u64,
                mode: file_mode(&meta),
            });
        }

        let now = OffsetDateTime::now_utc();
        let manifest = BackupManifest {
            created_at: ctxport_ir::now_rfc3339(),
            source: source_root.to_path_buf(),
            target_root: self.target_root.clone(),
            entries,
            absent,
        };
        let manifest_path = staging.path().join(BACKUP_MANIFEST);
        let json = serde_json::to_vec_pretty(&manifest).map_err(|source| {
            BackupError::Manifest {
                path: manifest_path.clone(),
                source,
            }
        })?;
        fs::write(&manifest_path, json).map_err(io_err(&manifest_path))?;

        let id = timestamp(now);
        let mut dir = backups.join(&id);
        let mut n = 1;
        while dir.exists() {
            dir = backups.join(format!("{id}-{n:04}"));
            n += 1;
        }
        fs::rename(staging.path(), &dir).map_err(io_err(&dir))?;

        tracing::info!(
            snapshot = %dir.display(),
            files = manifest.entries.len(),
            absent = manifest.absent.len(),
            "Created backup snapshot"
        );
        Ok(Some(Snapshot { dir, manifest }))
    }

    /// Loads the snapshot stored in `dir`.
    pub fn open(&self, dir: &Path) -> Result<Snapshot, BackupError> {
        Ok(Snapshot {
            dir: dir.to_path_buf(),
            manifest: read_manifest(dir)?,
        })
    }

    /// Restores the snapshot in `dir` over the target root.
    ///
    /// Every copy is verified before any live file is touched.
    pub fn restore(&self, dir: &Path) -> Result<RestoreReport, BackupError> {
        let manifest = read_manifest(dir)?;

        let mut verified = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let copy = dir.join(&entry.path);
            let bytes = match fs::read(&copy) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(BackupError::Corrupted {
                        path: entry.path.clone(),
                        expected: entry.hash.clone(),
                        actual: "missing".to_string(),
                    })
                }
                Err(e) => return Err(io_err(&copy)(e)),
            };
            let actual = sha256_hex(&bytes);
            if actual != entry.hash {
                return Err(BackupError::Corrupted {
                    path: entry.path.clone(),
                    expected: entry.hash.clone(),
                    actual,
                });
            }
            verified.push((entry, bytes));
        }

        let mut report = RestoreReport::default();
        for (entry, bytes) in verified {
            let live = self.target_root.join(&entry.path);
            write_atomic(&live, &bytes).map_err(io_err(&live))?;
            if let Some(mode) = entry.mode {
                set_mode(&live, mode).map_err(io_err(&live))?;
            }
            report.restored.push(entry.path.clone());
        }
        for relative in &manifest.absent {
            let live = self.target_root.join(relative);
            match fs::remove_file(&live) {
                Ok(()) => report.removed.push(relative.clone()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&live)(e)),
            }
        }

        tracing::info!(
            snapshot = %dir.display(),
            restored = report.restored.len(),
            removed = report.removed.len(),
            "Restored backup snapshot"
        );
        Ok(report)
    }

    /// Every complete snapshot, oldest first. Unreadable ones are skipped.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, BackupError> {
        let backups = self.backups_dir();
        let entries = match fs::read_dir(&backups) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&backups)(e)),
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.path())
            .collect();
        dirs.sort_by_cached_key(|dir| snapshot_order(dir));

        let mut snapshots = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match self.open(&dir) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    tracing::warn!(snapshot = %dir.display(), error = %err, "Skipping unreadable snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, BackupError> {
        Ok(self.list_snapshots()?.pop())
    }

    /// Deletes a snapshot directory.
    pub fn discard(&self, snapshot: &Snapshot) -> Result<(), BackupError> {
        fs::remove_dir_all(&snapshot.dir).map_err(io_err(&snapshot.dir))?;
        tracing::debug!(snapshot = %snapshot.dir.display(), "Discarded backup snapshot");
        Ok(())
    }
}
