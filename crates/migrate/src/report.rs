//! Run report handed to whatever presents results (CLI text, JSON).

use crate::emit::{ArtifactChange, ChangeKind};
use ctxport_ir::{GapCategory, Gaps};
use ctxport_parse::FileError;
use serde::{Serialize, Serializer};
use std::path::PathBuf;

/// What the run did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Written,
    /// Stopped after emission; nothing was written.
    DryRun,
    /// The target was already up to date.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    SuccessWithWarnings,
    Skipped,
}

fn file_errors<S: Serializer>(errors: &[FileError], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(FileError::to_json))
}

#[derive(Debug, Clone, Serialize)]
pub struct TranspileReport {
    pub outcome: Outcome,
    pub status: RunStatus,
    pub decision_reason: String,
    #[serde(serialize_with = "file_errors")]
    pub parse_errors: Vec<FileError>,
    pub gaps: Gaps,
    /// Artifact names, relative to the target root.
    pub artifacts: Vec<String>,
    pub changes: Vec<ArtifactChange>,
    pub backup: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub source_hash: String,
    pub output_hash: Option<String>,
}

impl TranspileReport {
    pub(crate) fn skipped(reason: String, source_hash: String) -> Self {
        Self {
            outcome: Outcome::Skipped,
            status: RunStatus::Skipped,
            decision_reason: reason,
            parse_errors: Vec::new(),
            gaps: Gaps::default(),
            artifacts: Vec::new(),
            changes: Vec::new(),
            backup: None,
            manifest_path: None,
            source_hash,
            output_hash: None,
        }
    }

    /// Derives [`RunStatus`] from the outcome, parse errors, and gaps.
    pub(crate) fn finish(mut self) -> Self {
        self.status = if self.outcome == Outcome::Skipped {
            RunStatus::Skipped
        } else if self.parse_errors.is_empty() && self.gaps.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::SuccessWithWarnings
        };
        self
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    fn gap_count(&self, category: GapCategory) -> usize {
        self.gaps
            .unmapped
            .iter()
            .filter(|g| g.category == category)
            .count()
            + self
                .gaps
                .approximations
                .iter()
                .filter(|g| g.category == category)
                .count()
    }

    fn change_count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// Generates a formatted summary for display.
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        let headline = match self.outcome {
            Outcome::Written => "Migration complete",
            Outcome::DryRun => "Dry run complete (nothing written)",
            Outcome::Skipped => "Migration skipped",
        };
        out.push_str(&format!("{headline}: {}\n", self.decision_reason));
        if self.outcome == Outcome::Skipped {
            return out;
        }

        out.push_str(&format!(
            "  Artifacts:    {} ({} created, {} modified, {} unchanged)\n",
            self.artifacts.len(),
            self.change_count(ChangeKind::Created),
            self.change_count(ChangeKind::Modified),
            self.change_count(ChangeKind::Unchanged)
        ));
        out.push_str(&format!("  Parse errors: {}\n", self.parse_errors.len()));
        out.push_str(&format!(
            "  Gaps:         {} unmapped, {} approximated\n",
            self.gaps.unmapped.len(),
            self.gaps.approximations.len()
        ));
        for category in [
            GapCategory::Unsupported,
            GapCategory::PlatformDifference,
            GapCategory::MissingDependency,
        ] {
            let count = self.gap_count(category);
            if count > 0 {
                out.push_str(&format!("    {category}: {count}\n"));
            }
        }
        if let Some(backup) = &self.backup {
            out.push_str(&format!("  Backup:       {}\n", backup.display()));
        }
        for err in &self.parse_errors {
            out.push_str(&format!("  ! {err}\n"));
        }
        for gap in &self.gaps.unmapped {
            out.push_str(&format!(
                "  - {} dropped: {} ({})\n",
                gap.field, gap.reason, gap.suggestion
            ));
        }
        out
    }
}
