//! Intermediate representation shared by every ctxport pipeline stage.
//!
//! Source files of any supported format are parsed into an [`Ir`], which is
//! then transformed into the target schema. The IR is plain data: it holds no
//! shared references and round-trips through JSON, so it can be persisted,
//! diffed, or inspected on its own.
//!
//! # Examples
//!
//! ```
//! use ctxport_ir::{Agent, Ir, SourceMetadata};
//!
//! let mut ir = Ir::new(SourceMetadata::new("/tmp/source", "abc123"));
//! ir.agents.push(Agent::new("qa-agent", "agents/qa.xml"));
//!
//! let json = ir.to_json_pretty().unwrap();
//! let back = Ir::from_json(&json).unwrap();
//! assert_eq!(back.agents[0].name, "qa-agent");
//! ```

#![deny(unsafe_code)]

mod config;
mod entities;
mod gaps;

pub use config::{Config, Permission};
pub use entities::{Agent, Command, Model, Variable};
pub use gaps::{Approximation, GapCategory, Gaps, UnmappedField};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Version tag written into every serialized IR.
pub const IR_VERSION: &str = "1";

/// Describes where an IR came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Source root the files were discovered under.
    pub root: PathBuf,
    /// Order-independent hash of every discovered file (path + bytes).
    pub content_hash: String,
    /// RFC 3339 timestamp of the parse.
    pub parsed_at: String,
    /// Source tool version, when a detector supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceMetadata {
    /// Creates metadata stamped with the current UTC time.
    pub fn new(root: impl Into<PathBuf>, content_hash: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            content_hash: content_hash.into(),
            parsed_at: now_rfc3339(),
            version: None,
        }
    }
}

/// Root of the intermediate representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ir {
    pub version: String,
    pub source: SourceMetadata,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub gaps: Gaps,
}

impl Ir {
    /// Creates an empty IR for the given source.
    pub fn new(source: SourceMetadata) -> Self {
        Self {
            version: IR_VERSION.to_string(),
            source,
            agents: Vec::new(),
            commands: Vec::new(),
            models: Vec::new(),
            config: Config::default(),
            gaps: Gaps::default(),
        }
    }

    /// Total number of first-class entities (agents, commands, models).
    pub fn entity_count(&self) -> usize {
        self.agents.len() + self.commands.len() + self.models.len()
    }

    /// Returns true when nothing at all was extracted.
    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0 && self.config.is_empty()
    }

    /// Looks up an agent by name (first match wins; names are not deduplicated).
    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::UNIX_EPOCH.to_string())
}
