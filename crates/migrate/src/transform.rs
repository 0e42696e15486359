//! Applies a [`RuleSet`] to the IR, producing the target schema and its gaps.

use crate::rules::{GapRule, RuleSet, SectionRules};
use crate::target::{TargetEntity, TargetSchema};
use ctxport_ir::{Approximation, GapCategory, Gaps, Ir, UnmappedField, Variable};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransformError {
    #[error("model '{model}' ({}) has no provider; the target requires one", file.display())]
    MissingProvider { model: String, file: PathBuf },
    #[error("{section} entry '{original}' ({}) has an empty name after normalization", file.display())]
    EmptyName {
        section: &'static str,
        original: String,
        file: PathBuf,
    },
}

/// Transformer output: the target schema plus every gap, parse-time first.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub schema: TargetSchema,
    pub gaps: Gaps,
}

/// Rules for one section plus the dotted prefix of its gap paths.
struct Section<'a> {
    rules: &'a SectionRules,
    /// `agents.qa-agent`, `commands.git:commit`, or `config`.
    prefix: String,
}

impl Section<'_> {
    fn path(&self, field: &str, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}.{field}.{key}", self.prefix),
            None => format!("{}.{field}", self.prefix),
        }
    }

    fn approximation_rule(&self, field: &str) -> Option<&GapRule> {
        self.rules.approximations.get(field)
    }
}

/// Object values are accounted per key; anything else as a single value.
fn per_key(value: Value) -> Vec<(Option<String>, Value)> {
    match value {
        Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        other => vec![(None, other)],
    }
}

fn map_value(rules: &SectionRules, field: &str, value: Value) -> Value {
    let Some(table) = rules.value_maps.get(field) else {
        return value;
    };
    let lookup = |s: &str| {
        table
            .get(s)
            .or_else(|| table.get(&s.to_ascii_lowercase()))
            .cloned()
    };
    match value {
        Value::String(s) => match lookup(&s) {
            Some(mapped) => {
                tracing::debug!(field, from = %s, to = %mapped, "Mapped value");
                Value::String(mapped)
            }
            None => {
                tracing::debug!(field, value = %s, "Unknown value passed through without mapping");
                Value::String(s)
            }
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(lookup(&s).unwrap_or(s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

/// `{container: {key: value}}`, describing where a folded value landed.
fn relocated(container: &str, key: &str, value: Value) -> Value {
    let mut inner = Map::new();
    inner.insert(key.to_string(), value);
    let mut outer = Map::new();
    outer.insert(container.to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Applies renames, value maps, folds, gap rules, and defaults to one
/// entity's fields. `origin` names the file behind a field (and key).
fn apply_section(
    section: &Section<'_>,
    fields: BTreeMap<String, Value>,
    origin: &dyn Fn(&str, Option<&str>) -> PathBuf,
    gaps: &mut Gaps,
) -> BTreeMap<String, Value> {
    let rules = section.rules;
    let mut out = BTreeMap::new();
    let mut containers: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

    for (field, value) in fields {
        if let Some(rule) = rules.unmapped.get(&field) {
            for (key, original) in per_key(value) {
                gaps.record_unmapped(UnmappedField {
                    source_file: origin(&field, key.as_deref()),
                    field: section.path(&field, key.as_deref()),
                    original,
                    reason: rule.reason.clone(),
                    category: rule.category,
                    suggestion: rule.suggestion.clone(),
                });
            }
            continue;
        }

        let value = map_value(rules, &field, value);

        if let Some(container) = rules.folds.get(&field) {
            let rule = section.approximation_rule(&field);
            let slot = containers.entry(container.clone()).or_default();
            for (key, folded) in per_key(value) {
                let slot_key = key.clone().unwrap_or_else(|| field.clone());
                gaps.record_approximation(Approximation {
                    source_file: origin(&field, key.as_deref()),
                    field: section.path(&field, key.as_deref()),
                    original: folded.clone(),
                    substituted: relocated(container, &slot_key, folded.clone()),
                    reason: rule
                        .map(|r| r.reason.clone())
                        .unwrap_or_else(|| format!("folded into '{container}'")),
                    category: rule.map_or(GapCategory::PlatformDifference, |r| r.category),
                });
                slot.insert(slot_key, folded);
            }
            continue;
        }

        if let Some(rule) = section.approximation_rule(&field) {
            gaps.record_approximation(Approximation {
                source_file: origin(&field, None),
                field: section.path(&field, None),
                original: value.clone(),
                substituted: value.clone(),
                reason: rule.reason.clone(),
                category: rule.category,
            });
        }

        let target = rules.renames.get(&field).cloned().unwrap_or(field);
        out.insert(target, value);
    }

    for (container, entries) in containers {
        match out.get_mut(&container) {
            Some(Value::Object(existing)) => existing.extend(entries),
            _ => {
                out.insert(container, Value::Object(entries));
            }
        }
    }
    for (field, default) in &rules.defaults {
        out.entry(field.clone()).or_insert_with(|| default.clone());
    }
    out
}

/// An entity's IR fields, minus identity.
fn entity_fields<T: Serialize>(entity: &T) -> BTreeMap<String, Value> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter(|(k, _)| k != "name" && k != "source_file")
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Applies name replacements; records an approximation when the name changes.
fn normalize_name(
    section_name: &'static str,
    rules: &SectionRules,
    original: &str,
    source_file: &Path,
    gaps: &mut Gaps,
) -> Result<String, TransformError> {
    let mut name = original.to_string();
    for (from, to) in &rules.name_replacements {
        if !from.is_empty() {
            name = name.replace(from.as_str(), to);
        }
    }
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(TransformError::EmptyName {
            section: section_name,
            original: original.to_string(),
            file: source_file.to_path_buf(),
        });
    }
    if name != original {
        let rule = rules.approximations.get("name");
        gaps.record_approximation(Approximation {
            source_file: source_file.to_path_buf(),
            field: format!("{section_name}.{original}.name"),
            original: json!(original),
            substituted: json!(name),
            reason: rule.map_or_else(
                || "name normalized for the target".to_string(),
                |r| r.reason.clone(),
            ),
            category: rule.map_or(GapCategory::PlatformDifference, |r| r.category),
        });
    }
    Ok(name)
}

fn references(template: &str, name: &str) -> bool {
    if template.contains("$ARGUMENTS") {
        return true;
    }
    let braced = [
        format!("{{{{{name}}}}}"),
        format!("{{{{ {name} }}}}"),
        format!("${{{name}}}"),
    ];
    if braced.iter().any(|m| template.contains(m.as_str())) {
        return true;
    }
    let bare = format!("${name}");
    template.match_indices(&bare).any(|(at, _)| {
        template[at + bare.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
    })
}

fn describe_variable(var: &Variable) -> String {
    let mut details = Vec::new();
    if let Some(kind) = &var.kind {
        details.push(kind.clone());
    }
    if var.required == Some(true) {
        details.push("required".to_string());
    }
    if let Some(default) = &var.default {
        details.push(format!("default: {default}"));
    }
    if !var.choices.is_empty() {
        details.push(format!("one of: {}", var.choices.join(", ")));
    }

    let mut line = format!("- `{}`", var.name);
    if !details.is_empty() {
        line.push_str(&format!(" ({})", details.join("; ")));
    }
    if let Some(description) = &var.description {
        line.push_str(&format!(": {description}"));
    }
    line
}

/// Renders variables as an `## Arguments` section.
pub fn arguments_section(variables: &[Variable]) -> String {
    let lines: Vec<String> = variables.iter().map(describe_variable).collect();
    format!("## Arguments\n\n{}\n", lines.join("\n"))
}

fn with_arguments(template: Option<&str>, variables: &[Variable]) -> String {
    let section = arguments_section(variables);
    match template.map(str::trim_end).filter(|t| !t.is_empty()) {
        Some(template) => format!("{template}\n\n{section}"),
        None => section,
    }
}

fn transform_agents(
    ir: &Ir,
    rules: &SectionRules,
    gaps: &mut Gaps,
    errors: &mut Vec<TransformError>,
) -> Vec<TargetEntity> {
    let mut out = Vec::with_capacity(ir.agents.len());
    for agent in &ir.agents {
        let name = match normalize_name("agents", rules, &agent.name, &agent.source_file, gaps) {
            Ok(name) => name,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        let section = Section {
            rules,
            prefix: format!("agents.{}", agent.name),
        };
        let origin = |_: &str, _: Option<&str>| agent.source_file.clone();
        let fields = apply_section(&section, entity_fields(agent), &origin, gaps);
        tracing::debug!(agent = %name, fields = fields.len(), "Transformed agent");
        out.push(TargetEntity::new(name, agent.source_file.clone(), fields));
    }
    out
}

fn transform_commands(
    ir: &Ir,
    rules: &SectionRules,
    gaps: &mut Gaps,
    errors: &mut Vec<TransformError>,
) -> Vec<TargetEntity> {
    let mut out = Vec::with_capacity(ir.commands.len());
    for command in &ir.commands {
        let name =
            match normalize_name("commands", rules, &command.name, &command.source_file, gaps) {
                Ok(name) => name,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
        let section = Section {
            rules,
            prefix: format!("commands.{}", command.name),
        };
        let mut local = Gaps::default();
        let mut fields = entity_fields(command);

        let template = command.template.as_deref().unwrap_or_default();
        for var in &command.variables {
            if !references(template, &var.name) {
                tracing::warn!(
                    command = %command.name,
                    variable = %var.name,
                    file = %command.source_file.display(),
                    "Variable is declared but never referenced in the template"
                );
            }
        }

        let fold_variables = !command.variables.is_empty()
            && !rules.unmapped.contains_key("variables")
            && !rules.folds.contains_key("variables");
        if fold_variables {
            fields.remove("variables");
            let rendered = with_arguments(command.template.as_deref(), &command.variables);
            let rule = section.approximation_rule("variables");
            local.record_approximation(Approximation {
                source_file: command.source_file.clone(),
                field: section.path("variables", None),
                original: serde_json::to_value(&command.variables).unwrap_or(Value::Null),
                substituted: json!(arguments_section(&command.variables)),
                reason: rule.map_or_else(
                    || "variables described in the template".to_string(),
                    |r| r.reason.clone(),
                ),
                category: rule.map_or(GapCategory::PlatformDifference, |r| r.category),
            });
            fields.insert("template".to_string(), Value::String(rendered));
        }

        let origin = |_: &str, _: Option<&str>| command.source_file.clone();
        let fields = apply_section(&section, fields, &origin, &mut local);

        if let Some(agent) = &command.agent {
            if ir.agent(agent).is_none() {
                mark_missing_agent(&section, agent, &command.source_file, &mut local);
            }
        }

        gaps.extend(local);
        tracing::debug!(command = %name, fields = fields.len(), "Transformed command");
        out.push(TargetEntity::new(name, command.source_file.clone(), fields));
    }
    out
}

/// Re-categorizes the agent reference gap of a command whose agent is absent.
fn mark_missing_agent(section: &Section<'_>, agent: &str, file: &Path, gaps: &mut Gaps) {
    let field = section.path("agent", None);
    let note = format!("agent '{agent}' was not found in the source");
    let mut found = false;
    for gap in gaps.approximations.iter_mut().filter(|g| g.field == field) {
        gap.category = GapCategory::MissingDependency;
        gap.reason = format!("{}; {note}", gap.reason);
        found = true;
    }
    for gap in gaps.unmapped.iter_mut().filter(|g| g.field == field) {
        gap.category = GapCategory::MissingDependency;
        gap.reason = format!("{}; {note}", gap.reason);
        found = true;
    }
    if !found {
        gaps.record_approximation(Approximation {
            source_file: file.to_path_buf(),
            field,
            original: json!(agent),
            substituted: json!(agent),
            reason: note,
            category: GapCategory::MissingDependency,
        });
    }
    tracing::warn!(agent, file = %file.display(), "Command references an unknown agent");
}

fn transform_models(
    ir: &Ir,
    rules: &SectionRules,
    gaps: &mut Gaps,
    errors: &mut Vec<TransformError>,
) -> Vec<TargetEntity> {
    let provider_field = rules
        .renames
        .get("provider")
        .map_or("provider", String::as_str);
    let mut out = Vec::with_capacity(ir.models.len());
    for model in &ir.models {
        let mut local = Gaps::default();
        let name =
            match normalize_name("models", rules, &model.name, &model.source_file, &mut local) {
                Ok(name) => name,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
        let section = Section {
            rules,
            prefix: format!("models.{}", model.name),
        };
        let origin = |_: &str, _: Option<&str>| model.source_file.clone();
        let fields = apply_section(&section, entity_fields(model), &origin, &mut local);

        // Checked after defaults, which may supply the provider.
        if fields.get(provider_field).map_or(true, Value::is_null) {
            errors.push(TransformError::MissingProvider {
                model: model.name.clone(),
                file: model.source_file.clone(),
            });
            continue;
        }
        gaps.extend(local);
        out.push(TargetEntity::new(name, model.source_file.clone(), fields));
    }
    out
}

fn transform_config(ir: &Ir, rules: &SectionRules, gaps: &mut Gaps) -> BTreeMap<String, Value> {
    let config = &ir.config;
    if config.is_empty() {
        return BTreeMap::new();
    }

    let mut fields = BTreeMap::new();
    let mut put = |name: &str, map: Map<String, Value>| {
        if !map.is_empty() {
            fields.insert(name.to_string(), Value::Object(map));
        }
    };
    put("theme", config.theme.clone().into_iter().collect());
    put(
        "keybindings",
        config
            .keybindings
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    put(
        "permissions",
        config
            .permissions
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect(),
    );
    put("custom", config.custom.clone().into_iter().collect());

    let fallback = config.source_files().into_iter().next().unwrap_or_default();
    let origin = |field: &str, key: Option<&str>| {
        key.and_then(|k| config.origin(field, k))
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback.clone())
    };
    let section = Section {
        rules,
        prefix: "config".to_string(),
    };
    apply_section(&section, fields, &origin, gaps)
}

/// Transforms the IR. Every error of the run is collected and returned
/// together; gaps never cause failure.
pub fn transform(ir: &Ir, rules: &RuleSet) -> Result<Transformed, Vec<TransformError>> {
    let mut gaps = ir.gaps.clone();
    let mut errors = Vec::new();

    let agents = transform_agents(ir, &rules.agents, &mut gaps, &mut errors);
    let commands = transform_commands(ir, &rules.commands, &mut gaps, &mut errors);
    let models = transform_models(ir, &rules.models, &mut gaps, &mut errors);
    let settings = transform_config(ir, &rules.config, &mut gaps);

    if !errors.is_empty() {
        tracing::warn!(errors = errors.len(), "Transform failed");
        return Err(errors);
    }

    let schema = TargetSchema {
        agents,
        commands,
        models,
        settings,
        settings_sources: ir.config.source_files(),
    };
    tracing::info!(
        agents = schema.agents.len(),
        commands = schema.commands.len(),
        models = schema.models.len(),
        gaps = gaps.len(),
        "Transformed IR"
    );
    Ok(Transformed { schema, gaps })
}
