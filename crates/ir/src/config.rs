//! Tool-wide configuration extracted from structured-data files.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A permission value: either an allow/deny flag or a mode string (`"ask"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Permission {
    Bool(bool),
    Text(String),
}

impl Permission {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Merged configuration from every config-shaped source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub theme: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keybindings: BTreeMap<String, String>,
    /// Has no target equivalent; always surfaces as a gap.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub permissions: BTreeMap<String, Permission>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
    /// Dotted key (`permissions.bash`, `theme.name`) -> contributing file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub origins: BTreeMap<String, PathBuf>,
}

impl Config {
    pub fn is_empty(&self) -> bool {
        self.theme.is_empty()
            && self.keybindings.is_empty()
            && self.permissions.is_empty()
            && self.custom.is_empty()
    }

    /// File that contributed `section.key`, if recorded.
    pub fn origin(&self, section: &str, key: &str) -> Option<&Path> {
        self.origins
            .get(&format!("{section}.{key}"))
            .map(PathBuf::as_path)
    }

    /// Records the contributing file for `section.key`.
    pub fn record_origin(&mut self, section: &str, key: &str, file: &Path) {
        self.origins
            .insert(format!("{section}.{key}"), file.to_path_buf());
    }

    /// Every distinct contributing file, sorted.
    pub fn source_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.origins.values().cloned().collect();
        files.sort();
        files.dedup();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_accepts_bool_or_string() {
        let perms: BTreeMap<String, Permission> =
            serde_json::from_str(r#"{"bash": true, "edit": "ask"}"#).unwrap();
        assert_eq!(perms["bash"], Permission::Bool(true));
        assert_eq!(perms["edit"], Permission::Text("ask".into()));
    }

    #[test]
    fn origins_track_contributing_files() {
        let mut config = Config::default();
        config.record_origin("permissions", "bash", Path::new("settings.json"));
        config.record_origin("theme", "name", Path::new("theme.json"));
        config.record_origin("theme", "accent", Path::new("theme.json"));

        assert_eq!(
            config.origin("permissions", "bash"),
            Some(Path::new("settings.json"))
        );
        assert_eq!(
            config.source_files(),
            vec![PathBuf::from("settings.json"), PathBuf::from("theme.json")]
        );
    }

    #[test]
    fn default_config_is_empty() {
        assert!(Config::default().is_empty());
    }
}
