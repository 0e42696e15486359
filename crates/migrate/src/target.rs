//! Target-side configuration schema.
//!
//! Values of these types only come out of [`crate::transform`]; the
//! `#[non_exhaustive]` attributes keep other crates from assembling one
//! by hand and skipping the gap accounting.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One agent, command, or model in target field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TargetEntity {
    pub name: String,
    #[serde(skip)]
    pub source_file: PathBuf,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl TargetEntity {
    pub(crate) fn new(name: String, source_file: PathBuf, fields: BTreeMap<String, Value>) -> Self {
        Self {
            name,
            source_file,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TargetSchema {
    pub agents: Vec<TargetEntity>,
    pub commands: Vec<TargetEntity>,
    pub models: Vec<TargetEntity>,
    pub settings: BTreeMap<String, Value>,
    /// Files that contributed `settings`.
    #[serde(skip)]
    pub settings_sources: Vec<PathBuf>,
}

impl TargetSchema {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.commands.is_empty()
            && self.models.is_empty()
            && self.settings.is_empty()
    }

    pub fn agent(&self, name: &str) -> Option<&TargetEntity> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn command(&self, name: &str) -> Option<&TargetEntity> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn model(&self, name: &str) -> Option<&TargetEntity> {
        self.models.iter().find(|m| m.name == name)
    }
}
