//! Declarative mapping rules and user overrides.
//!
//! The built-in rule set is plain data. A user override file (TOML, or JSON
//! by extension) is deep-merged over it leaf by leaf, so an override that
//! sets one value map entry leaves every other rule intact.

use crate::sha256_hex;
use ctxport_ir::GapCategory;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules override {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rules override {path} is not valid {format}: {message}")]
    Syntax {
        path: PathBuf,
        format: &'static str,
        message: String,
    },
    #[error("rules override {path} does not describe a rule set: {message}")]
    Shape { path: PathBuf, message: String },
}

/// How a gap is described to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GapRule {
    pub reason: String,
    pub category: GapCategory,
    #[serde(default)]
    pub suggestion: String,
}

impl GapRule {
    pub fn new(reason: &str, category: GapCategory, suggestion: &str) -> Self {
        Self {
            reason: reason.to_string(),
            category,
            suggestion: suggestion.to_string(),
        }
    }
}

/// Rules for one section (`agents`, `commands`, `models`, `config`).
///
/// Keys are source (IR) field names unless noted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SectionRules {
    /// Field -> target field name.
    pub renames: BTreeMap<String, String>,
    /// Target field -> value used when the field is absent.
    pub defaults: BTreeMap<String, Value>,
    /// Field -> (source string value -> target string value).
    pub value_maps: BTreeMap<String, BTreeMap<String, String>>,
    /// Substring replacements applied to entity names.
    pub name_replacements: BTreeMap<String, String>,
    /// Field -> target container field it is folded into.
    pub folds: BTreeMap<String, String>,
    /// Fields kept (or folded) with a substitute, recorded as approximations.
    pub approximations: BTreeMap<String, GapRule>,
    /// Fields dropped, recorded as unmapped.
    pub unmapped: BTreeMap<String, GapRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleSet {
    pub agents: SectionRules,
    pub commands: SectionRules,
    pub models: SectionRules,
    pub config: SectionRules,
}

fn strings<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl RuleSet {
    /// The rules shipped with ctxport.
    pub fn builtin() -> Self {
        use GapCategory::{PlatformDifference, Unsupported};

        let agents = SectionRules {
            renames: strings([("system_prompt", "system_message")]),
            defaults: BTreeMap::from([("temperature".to_string(), json!(0.7))]),
            value_maps: BTreeMap::from([(
                "model".to_string(),
                strings([
                    ("opus", "anthropic/claude-opus-4-1"),
                    ("sonnet", "anthropic/claude-sonnet-4-5"),
                    ("haiku", "anthropic/claude-haiku-4-5"),
                ]),
            )]),
            folds: strings([("extensions", "options")]),
            approximations: BTreeMap::from([
                (
                    "tools".to_string(),
                    GapRule::new(
                        "tool names are carried over verbatim and may not exist in the target",
                        PlatformDifference,
                        "check each tool against the target's tool list",
                    ),
                ),
                (
                    "extensions".to_string(),
                    GapRule::new(
                        "source-specific field folded into 'options'",
                        PlatformDifference,
                        "confirm the target reads this option",
                    ),
                ),
            ]),
            ..SectionRules::default()
        };

        let commands = SectionRules {
            name_replacements: strings([(":", "-")]),
            folds: strings([("agent", "config"), ("extensions", "config")]),
            approximations: BTreeMap::from([
                (
                    "name".to_string(),
                    GapRule::new(
                        "namespaced command names are flattened",
                        PlatformDifference,
                        "invoke the command by its flattened name",
                    ),
                ),
                (
                    "variables".to_string(),
                    GapRule::new(
                        "typed variables are described in an Arguments section of the template",
                        PlatformDifference,
                        "review the generated Arguments section",
                    ),
                ),
                (
                    "agent".to_string(),
                    GapRule::new(
                        "agent reference folded into command config",
                        PlatformDifference,
                        "confirm the target resolves the agent by name",
                    ),
                ),
                (
                    "extensions".to_string(),
                    GapRule::new(
                        "source-specific field folded into command config",
                        PlatformDifference,
                        "confirm the target reads this setting",
                    ),
                ),
            ]),
            ..SectionRules::default()
        };

        let models = SectionRules {
            renames: strings([("endpoint", "base_url")]),
            folds: strings([("extensions", "options")]),
            approximations: BTreeMap::from([(
                "extensions".to_string(),
                GapRule::new(
                    "source-specific model setting folded into 'options'",
                    PlatformDifference,
                    "confirm the provider accepts this option",
                ),
            )]),
            ..SectionRules::default()
        };

        let config = SectionRules {
            renames: strings([("keybindings", "keybinds")]),
            folds: strings([("custom", "custom")]),
            approximations: BTreeMap::from([(
                "custom".to_string(),
                GapRule::new(
                    "unrecognized setting preserved under 'custom'",
                    Unsupported,
                    "move the setting to its target equivalent if one exists",
                ),
            )]),
            unmapped: BTreeMap::from([(
                "permissions".to_string(),
                GapRule::new(
                    "the target has no per-tool permission model",
                    Unsupported,
                    "configure tool permissions manually in the target",
                ),
            )]),
            ..SectionRules::default()
        };

        Self {
            agents,
            commands,
            models,
            config,
        }
    }
}

/// A merged rule set and its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRules {
    pub rules: RuleSet,
    /// SHA-256 of the merged rules; changes whenever any rule changes.
    pub hash: String,
    /// The override file that was applied, if any.
    pub override_path: Option<PathBuf>,
}

/// Overrides `base` with `over`, recursing into objects so only leaves change.
pub fn deep_merge(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Object(base), Value::Object(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

fn read_override(path: &Path) -> Result<Value, RulesError> {
    let text = fs::read_to_string(path).map_err(|source| RulesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&text).map_err(|e| RulesError::Syntax {
            path: path.to_path_buf(),
            format: "JSON",
            message: e.to_string(),
        })
    } else {
        toml::from_str(&text).map_err(|e| RulesError::Syntax {
            path: path.to_path_buf(),
            format: "TOML",
            message: e.to_string(),
        })
    }
}

fn fingerprint(rules: &RuleSet) -> String {
    // BTreeMaps serialize in key order, so the bytes are canonical.
    let bytes = serde_json::to_vec(rules).unwrap_or_default();
    sha256_hex(&bytes)
}

/// Merges the override at `override_path` (if the file exists) over `builtin`.
///
/// A missing override file is not an error. Neither input is modified.
pub fn resolve_rules(
    builtin: &RuleSet,
    override_path: Option<&Path>,
) -> Result<ResolvedRules, RulesError> {
    let Some(path) = override_path.filter(|p| p.exists()) else {
        if let Some(path) = override_path {
            tracing::debug!(path = %path.display(), "No rules override found, using built-in rules");
        }
        return Ok(ResolvedRules {
            rules: builtin.clone(),
            hash: fingerprint(builtin),
            override_path: None,
        });
    };

    let overrides = read_override(path)?;
    let mut merged = serde_json::to_value(builtin).map_err(|e| RulesError::Shape {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    deep_merge(&mut merged, overrides);
    let rules: RuleSet = serde_json::from_value(merged).map_err(|e| RulesError::Shape {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    tracing::info!(path = %path.display(), "Applied rules override");
    Ok(ResolvedRules {
        hash: fingerprint(&rules),
        rules,
        override_path: Some(path.to_path_buf()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_covers_core_mappings() {
        let rules = RuleSet::builtin();
        assert_eq!(rules.agents.renames["system_prompt"], "system_message");
        assert_eq!(rules.models.renames["endpoint"], "base_url");
        assert_eq!(rules.config.renames["keybindings"], "keybinds");
        assert_eq!(rules.agents.defaults["temperature"], json!(0.7));
        assert_eq!(rules.commands.name_replacements[":"], "-");
        assert!(rules.config.unmapped.contains_key("permissions"));
    }

    #[test]
    fn missing_override_uses_builtin() {
        let dir = tempdir().unwrap();
        let builtin = RuleSet::builtin();
        let resolved = resolve_rules(&builtin, Some(&dir.path().join("rules.toml"))).unwrap();
        assert_eq!(resolved.rules, builtin);
        assert!(resolved.override_path.is_none());
        assert_eq!(resolved.hash, resolve_rules(&builtin, None).unwrap().hash);
    }

    #[test]
    fn toml_override_changes_one_leaf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(
            &path,
            "[agents.value_maps.model]\nsonnet = \"openai/gpt-4o\"\n",
        )
        .unwrap();

        let builtin = RuleSet::builtin();
        let resolved = resolve_rules(&builtin, Some(&path)).unwrap();
        let models = &resolved.rules.agents.value_maps["model"];
        assert_eq!(models["sonnet"], "openai/gpt-4o");
        assert_eq!(models["opus"], "anthropic/claude-opus-4-1");

        let mut expected = builtin.clone();
        expected
            .agents
            .value_maps
            .get_mut("model")
            .unwrap()
            .insert("sonnet".into(), "openai/gpt-4o".into());
        assert_eq!(resolved.rules, expected);
        assert_ne!(resolved.hash, resolve_rules(&builtin, None).unwrap().hash);
    }

    #[test]
    fn json_override_is_detected_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"agents": {"defaults": {"temperature": 0.2}}}"#).unwrap();

        let resolved = resolve_rules(&RuleSet::builtin(), Some(&path)).unwrap();
        assert_eq!(resolved.rules.agents.defaults["temperature"], json!(0.2));
    }

    #[test]
    fn invalid_override_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, "[agents\n").unwrap();
        assert!(matches!(
            resolve_rules(&RuleSet::builtin(), Some(&path)).unwrap_err(),
            RulesError::Syntax { format: "TOML", .. }
        ));

        fs::write(&path, "[agents]\nrenamez = {}\n").unwrap();
        assert!(matches!(
            resolve_rules(&RuleSet::builtin(), Some(&path)).unwrap_err(),
            RulesError::Shape { .. }
        ));
    }

    #[test]
    fn deep_merge_replaces_only_leaves() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        deep_merge(&mut base, json!({"a": {"c": 3}, "d": [9]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": [9]}));
    }
}
