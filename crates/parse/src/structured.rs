//! Structured-data (JSON) files: model catalogues and settings.

use crate::error::{line_of, Malformed};
use crate::values::field_key;
use crate::Extracted;
use ctxport_ir::{Config, Model, Permission};
use serde_json::{Map, Value};
use std::path::Path;

const CONFIG_KEYS: &[&str] = &["theme", "keybindings", "keybinds", "permissions"];
const MODEL_FIELDS: &[&str] = &["name", "provider", "endpoint", "baseurl", "base-url", "url"];

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lookup<'a>(entry: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    entry
        .iter()
        .find(|(k, _)| keys.contains(&field_key(k).as_str()))
        .map(|(_, v)| v)
}

/// Byte offsets where each element of the root object's `models` array
/// begins. Expects syntactically valid JSON.
fn model_entry_offsets(content: &str) -> Vec<usize> {
    let bytes = content.as_bytes();
    let mut offsets = Vec::new();
    let mut depth = 0usize;
    let mut last_key: Option<&str> = None;
    let mut in_models = false;
    let mut awaiting_entry = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_models && depth == 2 && awaiting_entry && !b.is_ascii_whitespace() && b != b']' {
            offsets.push(i);
            awaiting_entry = false;
        }
        match b {
            b'"' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if depth == 1 {
                    last_key = content.get(start + 1..i);
                }
            }
            b'{' | b'[' => {
                depth += 1;
                if depth == 2 && b == b'[' && last_key.is_some_and(|k| field_key(k) == "models") {
                    in_models = true;
                    awaiting_entry = true;
                }
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if in_models && depth == 1 {
                    return offsets;
                }
            }
            b',' if in_models && depth == 2 => awaiting_entry = true,
            _ => {}
        }
        i += 1;
    }
    offsets
}

fn model_entry(
    entry: &Value,
    index: usize,
    line: Option<usize>,
    path: &Path,
) -> Result<Model, Malformed> {
    let malformed = |message: String| Malformed { message, line };
    let Value::Object(entry) = entry else {
        return Err(malformed(format!("models[{index}] is not an object")));
    };
    let name = lookup(entry, &["name"])
        .and_then(text)
        .ok_or_else(|| malformed(format!("models[{index}] is missing required 'name'")))?;

    let mut model = Model::new(name, path);
    model.provider = lookup(entry, &["provider"]).and_then(text);
    model.endpoint = lookup(entry, &["endpoint", "baseurl", "base-url", "url"]).and_then(text);
    model.extensions = entry
        .iter()
        .filter(|(k, _)| !MODEL_FIELDS.contains(&field_key(k).as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(model)
}

fn object<'a>(value: &'a Value, key: &str) -> Result<&'a Map<String, Value>, Malformed> {
    value
        .as_object()
        .ok_or_else(|| Malformed::new(format!("'{key}' must be an object")))
}

fn config_from(root: &Map<String, Value>, path: &Path) -> Result<Config, Malformed> {
    let mut config = Config::default();
    for (key, value) in root {
        match field_key(key).as_str() {
            "theme" => {
                for (k, v) in object(value, key)? {
                    config.theme.insert(k.clone(), v.clone());
                    config.record_origin("theme", k, path);
                }
            }
            "keybindings" | "keybinds" => {
                for (k, v) in object(value, key)? {
                    let binding = text(v).ok_or_else(|| {
                        Malformed::new(format!("keybinding '{k}' must be a string"))
                    })?;
                    config.keybindings.insert(k.clone(), binding);
                    config.record_origin("keybindings", k, path);
                }
            }
            "permissions" => {
                for (k, v) in object(value, key)? {
                    let permission = match v {
                        Value::Bool(b) => Permission::Bool(*b),
                        Value::String(s) => Permission::Text(s.clone()),
                        _ => {
                            return Err(Malformed::new(format!(
                                "permission '{k}' must be a boolean or string"
                            )))
                        }
                    };
                    config.permissions.insert(k.clone(), permission);
                    config.record_origin("permissions", k, path);
                }
            }
            "models" => {}
            _ => {
                config.custom.insert(key.clone(), value.clone());
                config.record_origin("custom", key, path);
            }
        }
    }
    Ok(config)
}

/// Extracts models and/or config from a JSON document.
pub(crate) fn extract(content: &str, path: &Path) -> Result<Extracted, Malformed> {
    if content.trim().is_empty() {
        return Ok(Extracted::Ignored);
    }
    let doc: Value = serde_json::from_str(content)
        .map_err(|e| Malformed::at(format!("invalid JSON: {e}"), e.line().max(1)))?;
    let Value::Object(root) = doc else {
        tracing::debug!(path = %path.display(), "Ignoring JSON without a top-level object");
        return Ok(Extracted::Ignored);
    };

    let mut models = Vec::new();
    let mut entry_errors = Vec::new();
    let has_models = match lookup(&root, &["models"]) {
        Some(Value::Array(entries)) => {
            let offsets = model_entry_offsets(content);
            for (index, entry) in entries.iter().enumerate() {
                let line = offsets.get(index).map(|&offset| line_of(content, offset));
                match model_entry(entry, index, line, path) {
                    Ok(model) => models.push(model),
                    Err(err) => entry_errors.push(err),
                }
            }
            true
        }
        Some(_) => return Err(Malformed::new("'models' must be an array")),
        None => false,
    };

    let has_config = root
        .keys()
        .any(|k| CONFIG_KEYS.contains(&field_key(k).as_str()));
    if !has_models && !has_config {
        return Ok(Extracted::Ignored);
    }

    // Keys beside a models array still reach the config, so none is dropped.
    let has_other = root.keys().any(|k| field_key(k) != "models");
    let config = if has_config || has_other {
        Some(config_from(&root, path)?)
    } else {
        None
    };
    Ok(Extracted::Data {
        models,
        config,
        entry_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(doc: &str) -> (Vec<Model>, Option<Config>, Vec<Malformed>) {
        match extract(doc, Path::new("settings.json")).unwrap() {
            Extracted::Data {
                models,
                config,
                entry_errors,
            } => (models, config, entry_errors),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn models_array_becomes_models() {
        let (models, config, errors) = data(
            r#"{"models": [
                {"name": "fast", "provider": "openai", "baseURL": "https://api.example.com", "context": 128000},
                {"provider": "anthropic"}
            ]}"#,
        );
        assert!(config.is_none());
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].endpoint.as_deref(), Some("https://api.example.com"));
        assert_eq!(models[0].extensions["context"], serde_json::json!(128000));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("models[1]"));
        assert_eq!(errors[0].line, Some(3));
    }

    #[test]
    fn entry_errors_point_at_their_entry() {
        let (models, _, errors) = data(
            "{\n  \"note\": \"[not, models]\",\n  \"models\": [\n    {\"name\": \"a\", \"tags\": [1, {\"x\": 2}]},\n    \"bare\",\n\n    {\n      \"provider\": \"x\"\n    }\n  ]\n}",
        );
        assert_eq!(models.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("not an object"));
        assert_eq!(errors[0].line, Some(5));
        assert!(errors[1].message.contains("'name'"));
        assert_eq!(errors[1].line, Some(7));
    }

    #[test]
    fn keys_beside_models_reach_custom_config() {
        let (models, config, errors) = data(
            r#"{"models": [{"name": "fast", "provider": "openai"}], "provider_defaults": {"retries": 2}}"#,
        );
        assert!(errors.is_empty());
        assert_eq!(models.len(), 1);
        let config = config.expect("non-model keys kept as config");
        assert_eq!(config.custom["provider_defaults"], serde_json::json!({"retries": 2}));
        assert_eq!(
            config.origin("custom", "provider_defaults"),
            Some(Path::new("settings.json"))
        );
    }

    #[test]
    fn config_keys_route_into_config_and_rest_into_custom() {
        let (models, config, _) = data(
            r#"{
                "theme": {"name": "dark"},
                "keybinds": {"submit": "ctrl+enter"},
                "permissions": {"bash": true, "edit": "ask"},
                "telemetry": false
            }"#,
        );
        assert!(models.is_empty());
        let config = config.unwrap();
        assert_eq!(config.theme["name"], serde_json::json!("dark"));
        assert_eq!(config.keybindings["submit"], "ctrl+enter");
        assert_eq!(config.permissions["edit"], Permission::Text("ask".into()));
        assert_eq!(config.custom["telemetry"], Value::Bool(false));
        assert_eq!(
            config.origin("permissions", "bash"),
            Some(Path::new("settings.json"))
        );
    }

    #[test]
    fn unrelated_json_is_ignored() {
        let out = extract(r#"{"name": "pkg", "version": "1.0.0"}"#, Path::new("package.json"))
            .unwrap();
        assert!(matches!(out, Extracted::Ignored));
        let out = extract("[1, 2, 3]", Path::new("list.json")).unwrap();
        assert!(matches!(out, Extracted::Ignored));
    }

    #[test]
    fn invalid_json_carries_line() {
        let err = extract("{\n  \"theme\": {\n    \"name\": \n}\n", Path::new("settings.json"))
            .unwrap_err();
        assert!(err.message.starts_with("invalid JSON"));
        assert_eq!(err.line, Some(4));
    }

    #[test]
    fn bad_permission_value_is_malformed() {
        let err = extract(r#"{"permissions": {"bash": 3}}"#, Path::new("settings.json"))
            .unwrap_err();
        assert!(err.message.contains("bash"));
    }
}
