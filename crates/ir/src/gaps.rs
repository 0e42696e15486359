//! Gap tracking: source fields that did not map cleanly onto the target.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Why a field could not be carried over verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapCategory {
    /// The target has no equivalent concept.
    Unsupported,
    /// The target has a concept, but with different shape or semantics.
    PlatformDifference,
    /// The field refers to something that was not found in the source.
    MissingDependency,
}

impl GapCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::PlatformDifference => "platform-difference",
            Self::MissingDependency => "missing-dependency",
        }
    }
}

impl std::fmt::Display for GapCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source field dropped from the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedField {
    pub source_file: PathBuf,
    /// Dotted path, e.g. `config.permissions.bash`.
    pub field: String,
    pub original: Value,
    pub reason: String,
    pub category: GapCategory,
    pub suggestion: String,
}

/// A source field carried over with a substitute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approximation {
    pub source_file: PathBuf,
    pub field: String,
    pub original: Value,
    pub substituted: Value,
    pub reason: String,
    pub category: GapCategory,
}

/// Append-only gap collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gaps {
    #[serde(default)]
    pub unmapped: Vec<UnmappedField>,
    #[serde(default)]
    pub approximations: Vec<Approximation>,
}

impl Gaps {
    pub fn record_unmapped(&mut self, gap: UnmappedField) {
        self.unmapped.push(gap);
    }

    pub fn record_approximation(&mut self, gap: Approximation) {
        self.approximations.push(gap);
    }

    /// Appends every gap of `other`, preserving order.
    pub fn extend(&mut self, other: Gaps) {
        self.unmapped.extend(other.unmapped);
        self.approximations.extend(other.approximations);
    }

    pub fn len(&self) -> usize {
        self.unmapped.len() + self.approximations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds a gap of either kind by exact field path.
    pub fn mentions(&self, field: &str) -> bool {
        self.unmapped.iter().any(|g| g.field == field)
            || self.approximations.iter().any(|g| g.field == field)
    }

    pub fn approximation(&self, field: &str) -> Option<&Approximation> {
        self.approximations.iter().find(|g| g.field == field)
    }

    pub fn unmapped_field(&self, field: &str) -> Option<&UnmappedField> {
        self.unmapped.iter().find(|g| g.field == field)
    }
}
