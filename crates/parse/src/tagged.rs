//! Tag-structured (XML-like) source files.
//!
//! This is deliberately not a full XML parser. The root element decides the
//! entity kind, and only the root's direct children are read as fields, so a
//! `<command>` that carries an `<agent>` child is a command referencing that
//! agent rather than an agent definition.

use crate::error::{line_of, Malformed};
use crate::values::{field_key, parse_bool, parse_max_tokens, parse_temperature, split_list};
use crate::Extracted;
use ctxport_ir::{Agent, Command, Model, Variable};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^<([A-Za-z_][\w.:-]*)((?:\s+[^\s=/>]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#,
    )
    .expect("valid regex")
});

static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s=/>]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

#[derive(Debug)]
struct Element<'a> {
    name: String,
    attrs: BTreeMap<String, String>,
    inner: &'a str,
    /// Byte offset of the opening `<` in the document.
    offset: usize,
    inner_offset: usize,
    /// Byte offset just past the closing tag.
    end: usize,
}

impl Element<'_> {
    fn key(&self) -> String {
        field_key(&self.name)
    }

    fn text(&self) -> String {
        decode_text(self.inner)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| field_key(k) == name)
            .map(|(_, v)| v.as_str())
    }

    fn has_child_elements(&self) -> bool {
        self.inner.trim_start().starts_with('<') && !self.inner.trim_start().starts_with("<![CDATA[")
    }
}

fn parse_attrs(raw: &str) -> BTreeMap<String, String> {
    ATTR.captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| unescape(m.as_str()))
                .unwrap_or_default();
            (caps[1].to_string(), value)
        })
        .collect()
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Element text with CDATA kept verbatim and entities decoded elsewhere.
fn decode_text(raw: &str) -> String {
    let mut out = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("<![CDATA[") {
        out.push_str(&unescape(&rest[..start]));
        let after = &rest[start + "<![CDATA[".len()..];
        match after.find("]]>") {
            Some(end) => {
                out.push_str(&after[..end]);
                rest = &after[end + 3..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(&unescape(rest));
    out.trim().to_string()
}

/// Finds the close tag matching an already-open `name`, honoring nesting.
/// CDATA sections and comments are opaque to the scan.
fn find_close(doc: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let pattern = format!(r"^<(/?){}(?:\s[^>]*?)?(/?)>", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    let mut depth = 1usize;
    let mut pos = from;
    while let Some(rel) = doc[pos..].find('<') {
        let at = pos + rel;
        let rest = &doc[at..];
        if rest.starts_with("<![CDATA[") {
            pos = skip_past(doc, at, "]]>", "CDATA section").ok()?;
            continue;
        }
        if rest.starts_with("<!--") {
            pos = skip_past(doc, at, "-->", "comment").ok()?;
            continue;
        }
        let Some(caps) = re.captures(rest) else {
            pos = at + 1;
            continue;
        };
        let end = at + caps.get(0)?.end();
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let self_closing = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
        if closing {
            depth -= 1;
            if depth == 0 {
                return Some((at, end));
            }
        } else if !self_closing {
            depth += 1;
        }
        pos = end;
    }
    None
}

/// Parses the element whose `<` sits at `pos`; `doc` bounds the close search.
fn element_at(doc: &str, pos: usize) -> Result<Element<'_>, Malformed> {
    let caps = OPEN_TAG
        .captures(&doc[pos..])
        .ok_or_else(|| Malformed::at("malformed opening tag", line_of(doc, pos)))?;
    let open_len = caps[0].len();
    let name = caps[1].to_string();
    let attrs = parse_attrs(caps.get(2).map_or("", |m| m.as_str()));
    let open_end = pos + open_len;

    if caps.get(3).is_some_and(|m| !m.as_str().is_empty()) {
        return Ok(Element {
            name,
            attrs,
            inner: "",
            offset: pos,
            inner_offset: open_end,
            end: open_end,
        });
    }

    let (close_start, close_end) = find_close(doc, &name, open_end)
        .ok_or_else(|| Malformed::at(format!("<{name}> is never closed"), line_of(doc, pos)))?;
    Ok(Element {
        name,
        attrs,
        inner: &doc[open_end..close_start],
        offset: pos,
        inner_offset: open_end,
        end: close_end,
    })
}

fn skip_past(text: &str, pos: usize, terminator: &str, what: &str) -> Result<usize, Malformed> {
    text[pos..]
        .find(terminator)
        .map(|i| pos + i + terminator.len())
        .ok_or_else(|| Malformed::at(format!("unterminated {what}"), line_of(text, pos)))
}

/// Locates the root element, skipping the prolog, comments, and doctype.
fn root_element(doc: &str) -> Result<Option<Element<'_>>, Malformed> {
    let mut pos = 0;
    loop {
        let rest = &doc[pos..];
        let trimmed = rest.trim_start();
        pos += rest.len() - trimmed.len();

        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.starts_with("<?") {
            pos = skip_past(doc, pos, "?>", "processing instruction")?;
        } else if trimmed.starts_with("<!--") {
            pos = skip_past(doc, pos, "-->", "comment")?;
        } else if trimmed.starts_with("<!") {
            pos = skip_past(doc, pos, ">", "declaration")?;
        } else if trimmed.starts_with('<') {
            return element_at(doc, pos).map(Some);
        } else {
            return Err(Malformed::at(
                "text found before the root element",
                line_of(doc, pos),
            ));
        }
    }
}

/// Direct child elements of `parent`; text between them is ignored.
fn children<'a>(doc: &'a str, parent: &Element<'a>) -> Result<Vec<Element<'a>>, Malformed> {
    let end = parent.inner_offset + parent.inner.len();
    let bounded = &doc[..end];
    let mut out = Vec::new();
    let mut pos = parent.inner_offset;

    while pos < end {
        let Some(rel) = bounded[pos..].find('<') else {
            break;
        };
        let at = pos + rel;
        let rest = &bounded[at..];
        if rest.starts_with("<!--") {
            pos = skip_past(bounded, at, "-->", "comment")?;
        } else if rest.starts_with("<![CDATA[") {
            pos = skip_past(bounded, at, "]]>", "CDATA section")?;
        } else if rest.starts_with("</") {
            return Err(Malformed::at(
                format!("unexpected closing tag inside <{}>", parent.name),
                line_of(doc, at),
            ));
        } else {
            let child = element_at(bounded, at)?;
            pos = child.end;
            out.push(child);
        }
    }
    Ok(out)
}

/// Field lookup over a root's attributes and direct children.
struct Fields<'a> {
    doc: &'a str,
    root: &'a Element<'a>,
    children: Vec<Element<'a>>,
}

impl<'a> Fields<'a> {
    fn new(doc: &'a str, root: &'a Element<'a>) -> Result<Self, Malformed> {
        Ok(Self {
            doc,
            root,
            children: children(doc, root)?,
        })
    }

    fn child(&self, keys: &[&str]) -> Option<&Element<'a>> {
        self.children
            .iter()
            .find(|c| keys.contains(&c.key().as_str()))
    }

    /// Child text first, then a root attribute; empty values count as absent.
    fn text(&self, keys: &[&str]) -> Option<String> {
        if let Some(child) = self.child(keys) {
            let text = child.text();
            if !text.is_empty() {
                return Some(text);
            }
            if let Some(name) = child.attr("name") {
                return Some(name.to_string());
            }
        }
        keys.iter()
            .find_map(|k| self.root.attr(k))
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    }

    fn line(&self, keys: &[&str]) -> usize {
        let offset = self.child(keys).map_or(self.root.offset, |c| c.offset);
        line_of(self.doc, offset)
    }

    /// Children and root attributes not in `known`, as string extensions.
    fn extensions(&self, known: &[&str]) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (name, value) in &self.root.attrs {
            if !known.contains(&field_key(name).as_str()) {
                out.insert(name.clone(), Value::String(value.clone()));
            }
        }
        for child in &self.children {
            if !known.contains(&child.key().as_str()) {
                out.entry(child.name.clone())
                    .or_insert_with(|| Value::String(child.text()));
            }
        }
        out
    }
}

const AGENT_FIELDS: &[&str] = &[
    "name",
    "description",
    "model",
    "temperature",
    "system-prompt",
    "prompt",
    "instructions",
    "tools",
    "max-tokens",
];
const PROMPT_KEYS: &[&str] = &["system-prompt", "prompt", "instructions"];

fn list_field(doc: &str, fields: &Fields<'_>, key: &str) -> Result<Vec<String>, Malformed> {
    let Some(el) = fields.child(&[key]) else {
        return Ok(fields.text(&[key]).map(|s| split_list(&s)).unwrap_or_default());
    };
    if el.has_child_elements() {
        let items = children(doc, el)?;
        return Ok(items
            .iter()
            .map(|item| item.text())
            .filter(|s| !s.is_empty())
            .collect());
    }
    Ok(split_list(&el.text()))
}

fn extract_agent(doc: &str, root: &Element<'_>, path: &Path) -> Result<Agent, Malformed> {
    let fields = Fields::new(doc, root)?;
    let name = fields.text(&["name"]).ok_or_else(|| {
        Malformed::at("agent is missing required <name>", line_of(doc, root.offset))
    })?;

    let mut agent = Agent::new(name, path);
    agent.description = fields.text(&["description"]);
    agent.model = fields.text(&["model"]);
    agent.system_prompt = fields.text(PROMPT_KEYS);
    agent.tools = list_field(doc, &fields, "tools")?;
    if let Some(raw) = fields.text(&["temperature"]) {
        agent.temperature = Some(
            parse_temperature(&raw).map_err(|e| Malformed::at(e, fields.line(&["temperature"])))?,
        );
    }
    if let Some(raw) = fields.text(&["max-tokens"]) {
        agent.max_tokens = Some(
            parse_max_tokens(&raw).map_err(|e| Malformed::at(e, fields.line(&["max-tokens"])))?,
        );
    }
    agent.extensions = fields.extensions(AGENT_FIELDS);
    Ok(agent)
}

const COMMAND_FIELDS: &[&str] = &[
    "name",
    "description",
    "template",
    "body",
    "prompt",
    "variables",
    "agent",
];

fn extract_variable(doc: &str, el: &Element<'_>) -> Result<Variable, Malformed> {
    let fields = Fields::new(doc, el)?;
    let name = fields.text(&["name"]).ok_or_else(|| {
        Malformed::at("variable is missing a name", line_of(doc, el.offset))
    })?;

    let mut var = Variable::named(name);
    var.kind = fields.text(&["type"]);
    var.default = fields.text(&["default"]);
    var.choices = fields
        .text(&["choices"])
        .map(|s| split_list(&s))
        .unwrap_or_default();
    var.description = fields.text(&["description"]).or_else(|| {
        Some(el.text())
            .filter(|t| !t.is_empty() && !el.has_child_elements())
    });
    if let Some(raw) = fields.text(&["required"]) {
        var.required = Some(parse_bool(&raw).ok_or_else(|| {
            Malformed::at(
                format!("required='{raw}' is not a boolean"),
                line_of(doc, el.offset),
            )
        })?);
    }
    Ok(var)
}

fn extract_command(doc: &str, root: &Element<'_>, path: &Path) -> Result<Command, Malformed> {
    let fields = Fields::new(doc, root)?;
    let name = fields.text(&["name"]).ok_or_else(|| {
        Malformed::at("command is missing required <name>", line_of(doc, root.offset))
    })?;

    let mut command = Command::new(name, path);
    command.description = fields.text(&["description"]);
    command.template = fields.text(&["template", "body", "prompt"]);
    command.agent = fields.text(&["agent"]);
    if let Some(vars) = fields.child(&["variables"]) {
        for var in children(doc, vars)? {
            command.variables.push(extract_variable(doc, &var)?);
        }
    }
    command.extensions = fields.extensions(COMMAND_FIELDS);
    Ok(command)
}

const MODEL_FIELDS: &[&str] = &["name", "provider", "endpoint", "base-url", "url"];

fn extract_model(doc: &str, root: &Element<'_>, path: &Path) -> Result<Model, Malformed> {
    let fields = Fields::new(doc, root)?;
    let name = fields.text(&["name"]).ok_or_else(|| {
        Malformed::at("model is missing required <name>", line_of(doc, root.offset))
    })?;

    let mut model = Model::new(name, path);
    model.provider = fields.text(&["provider"]);
    model.endpoint = fields.text(&["endpoint", "base-url", "url"]);
    model.extensions = fields.extensions(MODEL_FIELDS);
    Ok(model)
}

/// Extracts the entity described by a tag-structured document.
pub(crate) fn extract(doc: &str, path: &Path) -> Result<Extracted, Malformed> {
    let Some(root) = root_element(doc)? else {
        return Ok(Extracted::Ignored);
    };

    match root.key().as_str() {
        "agent" => extract_agent(doc, &root, path).map(Extracted::Agent),
        "command" => extract_command(doc, &root, path).map(Extracted::Command),
        "model" => extract_model(doc, &root, path).map(|m| Extracted::Data {
            models: vec![m],
            config: None,
            entry_errors: Vec::new(),
        }),
        "models" => {
            let mut models = Vec::new();
            let mut entry_errors = Vec::new();
            for child in children(doc, &root)? {
                if child.key() != "model" {
                    continue;
                }
                match extract_model(doc, &child, path) {
                    Ok(model) => models.push(model),
                    Err(err) => entry_errors.push(err),
                }
            }
            Ok(Extracted::Data {
                models,
                config: None,
                entry_errors,
            })
        }
        other => {
            tracing::debug!(path = %path.display(), root = other, "Ignoring unrecognized root element");
            Ok(Extracted::Ignored)
        }
    }
}
