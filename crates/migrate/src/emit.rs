//! Deterministic serialization of the target schema.
//!
//! Same schema in, same bytes out: object keys are sorted recursively,
//! entity order follows the schema, and every artifact ends in a newline.

use crate::target::{TargetEntity, TargetSchema};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const AGENTS_ARTIFACT: &str = "agents.json";
pub const COMMANDS_ARTIFACT: &str = "commands.json";
pub const MODELS_ARTIFACT: &str = "models.json";
pub const SETTINGS_ARTIFACT: &str = "settings.json";

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to serialize {artifact}: {source}")]
    Serialize {
        artifact: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Artifact name (relative to the target root) -> bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl ArtifactSet {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.artifacts.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.artifacts
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// SHA-256 over every name and its bytes, in name order.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, bytes) in &self.artifacts {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Rebuilds `value` with every object's keys in sorted order.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn entity_value(entity: &TargetEntity) -> Value {
    let mut map: Map<String, Value> = entity
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    map.insert("name".to_string(), Value::String(entity.name.clone()));
    Value::Object(map)
}

fn render(artifact: &str, value: Value) -> Result<Vec<u8>, EmitError> {
    let mut bytes =
        serde_json::to_vec_pretty(&canonicalize(value)).map_err(|source| EmitError::Serialize {
            artifact: artifact.to_string(),
            source,
        })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn section(key: &str, entities: &[TargetEntity]) -> Value {
    let mut doc = Map::new();
    doc.insert(
        key.to_string(),
        Value::Array(entities.iter().map(entity_value).collect()),
    );
    Value::Object(doc)
}

/// Serializes the schema. Empty sections produce no artifact.
pub fn emit(schema: &TargetSchema) -> Result<ArtifactSet, EmitError> {
    let mut artifacts = BTreeMap::new();
    let sections = [
        (AGENTS_ARTIFACT, "agents", &schema.agents),
        (COMMANDS_ARTIFACT, "commands", &schema.commands),
        (MODELS_ARTIFACT, "models", &schema.models),
    ];
    for (artifact, key, entities) in sections {
        if !entities.is_empty() {
            artifacts.insert(artifact.to_string(), render(artifact, section(key, entities))?);
        }
    }
    if !schema.settings.is_empty() {
        let settings: Map<String, Value> = schema
            .settings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        artifacts.insert(
            SETTINGS_ARTIFACT.to_string(),
            render(SETTINGS_ARTIFACT, Value::Object(settings))?,
        );
    }

    tracing::debug!(artifacts = artifacts.len(), "Emitted artifacts");
    Ok(ArtifactSet { artifacts })
}

/// How an artifact compares with what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ArtifactChange {
    pub artifact: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Unified diff against the current file; empty when unchanged.
    pub diff: String,
}

/// Compares each artifact with the file currently at its target path.
pub fn preview(artifacts: &ArtifactSet, target_root: &Path) -> Vec<ArtifactChange> {
    artifacts
        .iter()
        .map(|(name, bytes)| {
            let path = target_root.join(name);
            let current = fs::read(&path).ok();
            let kind = match &current {
                None => ChangeKind::Created,
                Some(existing) if existing.as_slice() == bytes => ChangeKind::Unchanged,
                Some(_) => ChangeKind::Modified,
            };
            let diff = if kind == ChangeKind::Unchanged {
                String::new()
            } else {
                let old = current
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();
                let new = String::from_utf8_lossy(bytes);
                TextDiff::from_lines(&*old, &*new)
                    .unified_diff()
                    .context_radius(3)
                    .header(&format!("a/{name}"), &format!("b/{name}"))
                    .to_string()
            };
            ArtifactChange {
                artifact: name.to_string(),
                path,
                kind,
                diff,
            }
        })
        .collect()
}
