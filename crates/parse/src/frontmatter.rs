//! Markdown files with a leading `---` YAML block.

use crate::error::{line_of, Malformed};
use crate::values::{field_key, parse_max_tokens, parse_temperature, split_list};
use crate::Extracted;
use ctxport_ir::{Agent, Command, Variable};
use serde_json::Value;
use serde_yaml::Value as Yaml;
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// Front matter split from its body.
#[derive(Debug, PartialEq)]
pub(crate) struct Split<'a> {
    pub yaml: Option<&'a str>,
    pub body: &'a str,
    /// 1-based line of the first YAML line.
    pub yaml_line: usize,
}

/// Splits a leading `---` block from the body.
///
/// A file without a leading delimiter is all body. An opening delimiter
/// with no closing one is malformed.
pub(crate) fn split_frontmatter(content: &str) -> Result<Split<'_>, Malformed> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Ok(Split {
            yaml: None,
            body: content,
            yaml_line: 1,
        });
    }

    let open_offset = content.len() - trimmed.len();
    let open_line = line_of(content, open_offset);
    let after_open = &trimmed[3..];
    let after_open = after_open
        .strip_prefix("\r\n")
        .or_else(|| after_open.strip_prefix('\n'))
        .unwrap_or(after_open);

    let (start, end) = closing_delimiter(after_open)
        .ok_or_else(|| Malformed::at("unterminated front matter", open_line))?;
    let yaml = &after_open[..start];
    let rest = after_open[end..].trim_start_matches(['\r', '\n']);
    Ok(Split {
        yaml: Some(yaml.trim_end_matches(['\r', '\n'])),
        body: rest,
        yaml_line: open_line + 1,
    })
}

/// Byte range of the first line that is exactly `---`, ignoring trailing
/// whitespace.
fn closing_delimiter(text: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((offset, offset + line.len()));
        }
        offset += line.len();
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Agent,
    Command,
}

/// Nearest ancestor directory named `agents` or `commands`, with the
/// components that follow it.
fn kind_from_path(path: &Path) -> Option<(Kind, Vec<String>)> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let dirs = parts.len().saturating_sub(1);
    (0..dirs).rev().find_map(|i| {
        let kind = match parts[i].to_ascii_lowercase().as_str() {
            "agents" => Kind::Agent,
            "commands" => Kind::Command,
            _ => return None,
        };
        Some((kind, parts[i + 1..].to_vec()))
    })
}

fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// `git/commit.md` under `commands/` becomes `git:commit`.
fn namespaced_name(under: &[String]) -> String {
    let mut parts: Vec<&str> = under.iter().map(String::as_str).collect();
    if let Some(last) = parts.last_mut() {
        *last = stem(last);
    }
    parts.join(":")
}

fn scalar_text(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Tagged(tagged) => scalar_text(&tagged.value),
        Yaml::Null | Yaml::Sequence(_) | Yaml::Mapping(_) => None,
    }
}

fn list_items(value: &Yaml) -> Vec<String> {
    match value {
        Yaml::Sequence(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).map(|s| split_list(&s)).unwrap_or_default(),
    }
}

/// Flat front matter: original key -> value, plus the line each key sits on.
struct Fields {
    entries: Vec<(String, Yaml, usize)>,
}

impl Fields {
    fn parse(yaml: &str, yaml_line: usize) -> Result<Self, Malformed> {
        if yaml.trim().is_empty() {
            return Ok(Self {
                entries: Vec::new(),
            });
        }
        let doc: Yaml = serde_yaml::from_str(yaml).map_err(|e| {
            let line = e
                .location()
                .map_or(yaml_line, |loc| yaml_line + loc.line().saturating_sub(1));
            Malformed::at(format!("invalid front matter: {e}"), line)
        })?;

        let mapping = match doc {
            Yaml::Mapping(m) => m,
            Yaml::Null => return Ok(Self { entries: Vec::new() }),
            _ => {
                return Err(Malformed::at(
                    "front matter must be a mapping of keys to values",
                    yaml_line,
                ))
            }
        };

        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = scalar_text(&key)
                .ok_or_else(|| Malformed::at("front matter keys must be strings", yaml_line))?;
            let line = yaml
                .lines()
                .position(|l| {
                    l.strip_prefix(key.as_str())
                        .is_some_and(|rest| rest.trim_start().starts_with(':'))
                })
                .map_or(yaml_line, |index| yaml_line + index);
            let nested = match &value {
                Yaml::Mapping(_) => true,
                Yaml::Sequence(items) => items
                    .iter()
                    .any(|i| matches!(i, Yaml::Mapping(_) | Yaml::Sequence(_))),
                _ => false,
            };
            if nested {
                return Err(Malformed::at(
                    format!("'{key}' is nested; front matter must be flat"),
                    line,
                ));
            }
            entries.push((key, value, line));
        }
        Ok(Self { entries })
    }

    fn get(&self, key: &str) -> Option<&(String, Yaml, usize)> {
        self.entries.iter().find(|(k, _, _)| field_key(k) == key)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|(_, v, _)| scalar_text(v))
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(|(_, v, _)| list_items(v)).unwrap_or_default()
    }

    fn line(&self, key: &str) -> Option<usize> {
        self.get(key).map(|(_, _, line)| *line)
    }

    fn extensions(&self, known: &[&str]) -> Result<BTreeMap<String, Value>, Malformed> {
        let mut out = BTreeMap::new();
        for (key, value, line) in &self.entries {
            if known.contains(&field_key(key).as_str()) {
                continue;
            }
            let json = serde_json::to_value(value)
                .map_err(|e| Malformed::at(format!("'{key}': {e}"), *line))?;
            out.insert(key.clone(), json);
        }
        Ok(out)
    }
}

const AGENT_FIELDS: &[&str] = &[
    "type",
    "name",
    "description",
    "model",
    "temperature",
    "tools",
    "max-tokens",
    "system-prompt",
];

fn build_agent(fields: &Fields, body: &str, path: &Path) -> Result<Agent, Malformed> {
    let name = fields
        .text("name")
        .or_else(|| {
            path.file_name()
                .map(|n| stem(&n.to_string_lossy()).to_string())
        })
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Malformed::new("agent has no name"))?;

    let mut agent = Agent::new(name, path);
    agent.description = fields.text("description");
    agent.model = fields.text("model");
    agent.tools = fields.list("tools");
    let body = body.trim();
    agent.system_prompt = if body.is_empty() {
        fields.text("system-prompt")
    } else {
        Some(body.to_string())
    };
    if let Some(raw) = fields.text("temperature") {
        let line = fields.line("temperature").unwrap_or(1);
        agent.temperature = Some(parse_temperature(&raw).map_err(|e| Malformed::at(e, line))?);
    }
    if let Some(raw) = fields.text("max-tokens") {
        let line = fields.line("max-tokens").unwrap_or(1);
        agent.max_tokens = Some(parse_max_tokens(&raw).map_err(|e| Malformed::at(e, line))?);
    }
    agent.extensions = fields.extensions(AGENT_FIELDS)?;
    Ok(agent)
}

const COMMAND_FIELDS: &[&str] = &[
    "type",
    "name",
    "description",
    "agent",
    "variables",
    "arguments",
    "template",
];

fn build_command(
    fields: &Fields,
    body: &str,
    path: &Path,
    under_commands: Option<&[String]>,
) -> Result<Command, Malformed> {
    let name = fields
        .text("name")
        .or_else(|| under_commands.map(namespaced_name))
        .or_else(|| {
            path.file_name()
                .map(|n| stem(&n.to_string_lossy()).to_string())
        })
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Malformed::new("command has no name"))?;

    let mut command = Command::new(name, path);
    command.description = fields.text("description");
    command.agent = fields.text("agent");
    command.template = if body.trim().is_empty() {
        fields.text("template")
    } else {
        Some(body.to_string())
    };
    let mut variables = fields.list("variables");
    variables.extend(fields.list("arguments"));
    command.variables = variables.into_iter().map(Variable::named).collect();
    command.extensions = fields.extensions(COMMAND_FIELDS)?;
    Ok(command)
}

/// Extracts an agent or command from a front-matter markdown file.
pub(crate) fn extract(content: &str, path: &Path) -> Result<Extracted, Malformed> {
    let split = split_frontmatter(content)?;
    let fields = match split.yaml {
        Some(yaml) => Fields::parse(yaml, split.yaml_line)?,
        None => Fields {
            entries: Vec::new(),
        },
    };

    let from_path = kind_from_path(path);
    let declared = fields.text("type").map(|t| t.to_ascii_lowercase());
    let kind = match declared.as_deref() {
        Some("agent") => Kind::Agent,
        Some("command") => Kind::Command,
        Some(other) => {
            tracing::debug!(path = %path.display(), kind = other, "Ignoring front matter of unknown type");
            return Ok(Extracted::Ignored);
        }
        None => match &from_path {
            Some((kind, _)) => *kind,
            None => return Ok(Extracted::Ignored),
        },
    };

    let under_commands = match &from_path {
        Some((Kind::Command, rest)) => Some(rest.as_slice()),
        _ => None,
    };

    match kind {
        Kind::Agent => build_agent(&fields, split.body, path).map(Extracted::Agent),
        Kind::Command => {
            build_command(&fields, split.body, path, under_commands).map(Extracted::Command)
        }
    }
}
