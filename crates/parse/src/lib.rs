//! Source discovery and best-effort parsing into the ctxport IR.
//!
//! A run never stops at the first bad file: every file that parses
//! contributes to the [`Ir`], and every file that does not contributes a
//! [`FileError`]. Only an unusable source root is fatal.

#![deny(unsafe_code)]

mod error;
mod frontmatter;
mod scanner;
mod structured;
mod tagged;
mod values;

pub use error::{FileError, ParseError};
pub use scanner::{
    discover, hash_source_tree, normalized_key, SourceFile, SourceTree, IGNORED_DIRS,
};

use ctxport_ir::{Agent, Command, Config, Ir, Model, SourceMetadata};
use error::Malformed;
use rayon::prelude::*;
use std::path::Path;

/// How a file is read, decided by extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `.xml`
    Tagged,
    /// `.md`, `.markdown`
    FrontMatter,
    /// `.json`
    Structured,
    Ignored,
}

impl SourceKind {
    pub fn of(file: &SourceFile) -> Self {
        match file.extension().as_deref() {
            Some("xml") => Self::Tagged,
            Some("md" | "markdown") => Self::FrontMatter,
            Some("json") => Self::Structured,
            _ => Self::Ignored,
        }
    }
}

/// What a single file contributed.
#[derive(Debug)]
pub(crate) enum Extracted {
    Agent(Agent),
    Command(Command),
    /// Models and/or config from a data file; bad model entries do not
    /// discard the good ones.
    Data {
        models: Vec<Model>,
        config: Option<Config>,
        entry_errors: Vec<Malformed>,
    },
    Ignored,
}

/// Result of parsing a whole source tree.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub ir: Ir,
    /// Per-file problems, sorted by file.
    pub errors: Vec<FileError>,
}

impl ParseOutcome {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Discovers and parses everything under `root`.
pub fn parse_source(root: &Path) -> Result<ParseOutcome, ParseError> {
    let tree = discover(root)?;
    Ok(parse_tree(&tree))
}

fn extract_file(file: &SourceFile) -> Result<Extracted, Malformed> {
    let kind = SourceKind::of(file);
    if kind == SourceKind::Ignored {
        return Ok(Extracted::Ignored);
    }
    let text = std::str::from_utf8(&file.bytes)
        .map_err(|e| Malformed::new(format!("not valid UTF-8: {e}")))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    match kind {
        SourceKind::Tagged => tagged::extract(text, &file.relative),
        SourceKind::FrontMatter => frontmatter::extract(text, &file.relative),
        SourceKind::Structured => structured::extract(text, &file.relative),
        SourceKind::Ignored => Ok(Extracted::Ignored),
    }
}

/// Later files win per key; overrides are logged.
fn merge_config(into: &mut Config, from: Config) {
    fn merge<V>(
        section: &str,
        into: &mut std::collections::BTreeMap<String, V>,
        from: std::collections::BTreeMap<String, V>,
    ) {
        for (key, value) in from {
            if into.insert(key.clone(), value).is_some() {
                tracing::debug!(section, key = %key, "Config key overridden by a later file");
            }
        }
    }

    merge("theme", &mut into.theme, from.theme);
    merge("keybindings", &mut into.keybindings, from.keybindings);
    merge("permissions", &mut into.permissions, from.permissions);
    merge("custom", &mut into.custom, from.custom);
    into.origins.extend(from.origins);
}

/// Parses an already-discovered tree.
///
/// Files are extracted in parallel and folded in the tree's sorted order, so
/// the outcome matches a sequential run exactly.
pub fn parse_tree(tree: &SourceTree) -> ParseOutcome {
    let extracted: Vec<(&SourceFile, Result<Extracted, Malformed>)> = tree
        .files
        .par_iter()
        .map(|file| (file, extract_file(file)))
        .collect();

    let mut ir = Ir::new(SourceMetadata::new(&tree.root, tree.content_hash()));
    let mut errors = tree.unreadable.clone();

    for (file, result) in extracted {
        match result {
            Ok(Extracted::Agent(agent)) => {
                tracing::debug!(file = %file.key, agent = %agent.name, "Parsed agent");
                ir.agents.push(agent);
            }
            Ok(Extracted::Command(command)) => {
                tracing::debug!(file = %file.key, command = %command.name, "Parsed command");
                ir.commands.push(command);
            }
            Ok(Extracted::Data {
                models,
                config,
                entry_errors,
            }) => {
                tracing::debug!(file = %file.key, models = models.len(), config = config.is_some(), "Parsed data file");
                ir.models.extend(models);
                if let Some(config) = config {
                    merge_config(&mut ir.config, config);
                }
                errors.extend(
                    entry_errors
                        .into_iter()
                        .map(|e| e.into_file_error(&file.relative)),
                );
            }
            Ok(Extracted::Ignored) => {
                tracing::trace!(file = %file.key, "Ignored");
            }
            Err(err) => {
                let err = err.into_file_error(&file.relative);
                tracing::warn!(error = %err, "Failed to parse source file");
                errors.push(err);
            }
        }
    }

    errors.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
    tracing::info!(
        agents = ir.agents.len(),
        commands = ir.commands.len(),
        models = ir.models.len(),
        errors = errors.len(),
        "Parsed source tree"
    );
    ParseOutcome { ir, errors }
}
