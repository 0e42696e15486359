use crate::backup::BackupError;
use crate::emit::EmitError;
use crate::orchestrator::Stage;
use crate::rules::RulesError;
use crate::transform::TransformError;
use ctxport_parse::ParseError;
use std::path::PathBuf;
use thiserror::Error;

fn list(errors: &[TransformError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a run did not complete.
#[derive(Debug, Error)]
pub enum TranspileError {
    #[error(transparent)]
    SourceRoot(#[from] ParseError),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error("transform failed with {} error(s): {}", .0.len(), list(.0))]
    Transform(Vec<TransformError>),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{stage} failed at {}: {source}", path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The target was returned to its pre-run state after `stage` failed.
    #[error("{stage} failed and the target was rolled back: {source}")]
    RolledBack {
        stage: Stage,
        #[source]
        source: Box<TranspileError>,
    },
    #[error("{stage} failed ({original}) and rollback also failed: {rollback}")]
    RollbackFailed {
        stage: Stage,
        original: Box<TranspileError>,
        rollback: String,
    },
}

impl TranspileError {
    /// The error that started it all, looking through rollback wrappers.
    pub fn root_cause(&self) -> &TranspileError {
        match self {
            Self::RolledBack { source, .. } => source.root_cause(),
            Self::RollbackFailed { original, .. } => original.root_cause(),
            other => other,
        }
    }

    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}
