use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Aborts a parse before any file is read.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("source root {root} is not readable: {source}")]
    RootUnreadable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source root {0} is not a directory")]
    RootNotDirectory(PathBuf),
}

/// A non-fatal problem with a single source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    /// Path relative to the source root.
    pub file: PathBuf,
    pub message: String,
    /// 1-based line, when it could be derived.
    pub line: Option<usize>,
}

impl FileError {
    pub fn new(file: impl Into<PathBuf>, message: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
            line,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "file": self.file,
            "message": self.message,
            "line": self.line,
        })
    }
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file.display(), line, self.message),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}

/// Extractor-level failure, converted to a [`FileError`] once the file is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Malformed {
    pub message: String,
    pub line: Option<usize>,
}

impl Malformed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn into_file_error(self, file: impl Into<PathBuf>) -> FileError {
        FileError::new(file, self.message, self.line)
    }
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    let end = offset.min(text.len());
    text.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}
