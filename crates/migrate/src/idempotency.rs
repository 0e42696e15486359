//! Run manifest and the regenerate-or-skip decision.

use crate::writer::ArtifactWriter;
use crate::STATE_DIR;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RUN_MANIFEST: &str = "manifest.json";
pub const RUN_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read run manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("run manifest {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("run manifest {path} has unsupported schema version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

/// Which source file fed which artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mapping {
    pub source: PathBuf,
    pub artifact: String,
}

/// Record of the last successful run against a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub last_run: String,
    pub source_hash: String,
    pub output_hash: String,
    #[serde(default)]
    pub rules_hash: String,
    #[serde(default)]
    pub backup: Option<PathBuf>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl RunManifest {
    /// `<target>/.ctxport/manifest.json`
    pub fn path_in(target_root: &Path) -> PathBuf {
        target_root.join(STATE_DIR).join(RUN_MANIFEST)
    }

    /// Reads the manifest at `path`; a missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ManifestError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ManifestError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let manifest: Self =
            serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if manifest.schema_version != RUN_MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: manifest.schema_version,
            });
        }
        Ok(Some(manifest))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Writes the manifest through `writer`, replacing any previous one.
    pub fn save(&self, path: &Path, writer: &dyn ArtifactWriter) -> io::Result<()> {
        let bytes = self.to_bytes().map_err(io::Error::other)?;
        writer.write(path, &bytes)
    }

    /// Artifact names recorded by this run, deduplicated.
    pub fn artifacts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mappings.iter().map(|m| m.artifact.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum Reason {
    Forced,
    NoPreviousRun,
    /// The manifest could not be read; carries the error text.
    ManifestUnreadable(String),
    SourceChanged,
    RulesChanged,
    /// Names of recorded artifacts no longer on disk.
    ArtifactsMissing(Vec<String>),
    UpToDate,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => f.write_str("forced"),
            Self::NoPreviousRun => f.write_str("no previous run"),
            Self::ManifestUnreadable(err) => write!(f, "previous run manifest unreadable ({err})"),
            Self::SourceChanged => f.write_str("source changed"),
            Self::RulesChanged => f.write_str("rules changed"),
            Self::ArtifactsMissing(names) => {
                write!(f, "target artifacts missing: {}", names.join(", "))
            }
            Self::UpToDate => f.write_str("already up to date"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub regenerate: bool,
    pub reason: Reason,
}

impl Decision {
    fn regenerate(reason: Reason) -> Self {
        Self {
            regenerate: true,
            reason,
        }
    }
}

/// Decides whether a run must regenerate the target.
///
/// Never fails: an unreadable manifest is treated as a reason to regenerate.
pub fn check(
    source_hash: &str,
    rules_hash: &str,
    manifest_path: &Path,
    force: bool,
    target_root: &Path,
) -> Decision {
    if force {
        return Decision::regenerate(Reason::Forced);
    }

    let previous = match RunManifest::load(manifest_path) {
        Ok(Some(manifest)) => manifest,
        Ok(None) => return Decision::regenerate(Reason::NoPreviousRun),
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring unreadable run manifest");
            return Decision::regenerate(Reason::ManifestUnreadable(err.to_string()));
        }
    };

    if previous.source_hash != source_hash {
        return Decision::regenerate(Reason::SourceChanged);
    }
    if previous.rules_hash != rules_hash {
        return Decision::regenerate(Reason::RulesChanged);
    }
    let missing: Vec<String> = previous
        .artifacts()
        .into_iter()
        .filter(|name| !target_root.join(name).is_file())
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Decision::regenerate(Reason::ArtifactsMissing(missing));
    }

    Decision {
        regenerate: false,
        reason: Reason::UpToDate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::FsWriter;
    use tempfile::tempdir;

    fn manifest() -> RunManifest {
        RunManifest {
            schema_version: RUN_MANIFEST_VERSION,
            last_run: "2025-01-01T00:00:00Z".into(),
            source_hash: "src".into(),
            output_hash: "out".into(),
            rules_hash: "rules".into(),
            backup: None,
            mappings: vec![Mapping {
                source: "agents/qa.xml".into(),
                artifact: "agents.json".into(),
            }],
        }
    }

    fn saved(dir: &Path) -> PathBuf {
        let path = RunManifest::path_in(dir);
        manifest().save(&path, &FsWriter).unwrap();
        fs::write(dir.join("agents.json"), "{}").unwrap();
        path
    }

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = saved(dir.path());
        assert_eq!(RunManifest::load(&path).unwrap(), Some(manifest()));
    }

    #[test]
    fn decision_reasons() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let path = RunManifest::path_in(root);

        let first = check("src", "rules", &path, false, root);
        assert_eq!(first.reason, Reason::NoPreviousRun);
        assert!(first.regenerate);

        saved(root);
        let same = check("src", "rules", &path, false, root);
        assert!(!same.regenerate);
        assert_eq!(same.reason.to_string(), "already up to date");

        assert_eq!(check("src", "rules", &path, true, root).reason, Reason::Forced);
        assert_eq!(
            check("other", "rules", &path, false, root).reason,
            Reason::SourceChanged
        );
        assert_eq!(
            check("src", "other", &path, false, root).reason,
            Reason::RulesChanged
        );

        fs::remove_file(root.join("agents.json")).unwrap();
        assert_eq!(
            check("src", "rules", &path, false, root).reason,
            Reason::ArtifactsMissing(vec!["agents.json".into()])
        );
    }

    #[test]
    fn corrupt_manifest_means_regenerate() {
        let dir = tempdir().unwrap();
        let path = RunManifest::path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let decision = check("src", "rules", &path, false, dir.path());
        assert!(decision.regenerate);
        assert!(matches!(decision.reason, Reason::ManifestUnreadable(_)));
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = RunManifest::path_in(dir.path());
        let mut future = manifest();
        future.schema_version = 2;
        future.save(&path, &FsWriter).unwrap();

        assert!(matches!(
            RunManifest::load(&path).unwrap_err(),
            ManifestError::UnsupportedVersion { found: 2, .. }
        ));
    }
}
