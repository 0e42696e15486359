//! Shared test utilities for ctxport crates.
//!
//! Provides a source/target fixture pair, helpers for writing source files
//! in each supported format, and a byte-level tree snapshot for asserting
//! that a failed run left the target untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, MutexGuard};
use walkdir::WalkDir;

/// Serialize tests that mutate process-global state (env vars, cwd, etc).
///
/// Acquire this guard at the start of any test that modifies environment
/// variables to prevent race conditions between parallel tests.
pub fn env_guard() -> MutexGuard<'static, ()> {
    static TEST_SERIAL: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
    TEST_SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// RAII guard for environment variables - restores original value on drop.
pub struct EnvVarGuard {
    key: &'static str,
    previous: Option<String>,
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        if let Some(v) = &self.previous {
            std::env::set_var(self.key, v);
        } else {
            std::env::remove_var(self.key);
        }
    }
}

/// Set an environment variable and return a guard that restores the original on drop.
pub fn set_env_var(key: &'static str, value: Option<&str>) -> EnvVarGuard {
    let previous = std::env::var(key).ok();
    if let Some(val) = value {
        std::env::set_var(key, val);
    } else {
        std::env::remove_var(key);
    }
    EnvVarGuard { key, previous }
}

/// Every regular file under `root` (relative path -> bytes).
///
/// Two equal snapshots mean the trees are bit-identical.
pub fn tree_contents(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(root).ok()?.to_path_buf();
            let bytes = std::fs::read(e.path()).ok()?;
            Some((relative, bytes))
        })
        .collect()
}

/// Every directory under `root`, relative and sorted.
pub fn tree_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| Some(e.path().strip_prefix(root).ok()?.to_path_buf()))
        .collect()
}

/// Source and target trees inside one temporary directory.
///
/// The tempdir is automatically cleaned up when this struct is dropped.
pub struct TestFixture {
    pub tempdir: tempfile::TempDir,
    /// Root of the tool configuration being migrated from.
    pub source: PathBuf,
    /// Directory the migrated configuration is written into.
    pub target: PathBuf,
}

impl TestFixture {
    /// Creates `source/` and `target/` under a fresh tempdir.
    pub fn new() -> std::io::Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let source = tempdir.path().join("source");
        let target = tempdir.path().join("target");

        std::fs::create_dir_all(&source)?;
        std::fs::create_dir_all(&target)?;

        Ok(Self {
            tempdir,
            source,
            target,
        })
    }

    /// Get the path that should be set as HOME.
    pub fn home_path(&self) -> &Path {
        self.tempdir.path()
    }

    /// Create an RAII guard that sets HOME to this fixture's temp directory.
    pub fn home_guard(&self) -> EnvVarGuard {
        set_env_var("HOME", Some(&self.home_path().to_string_lossy()))
    }

    /// Writes `content` at `relative` under the source root.
    pub fn write_source(&self, relative: &str, content: &str) -> std::io::Result<PathBuf> {
        write_file(&self.source.join(relative), content)
    }

    /// Writes `content` at `relative` under the target root.
    pub fn write_target(&self, relative: &str, content: &str) -> std::io::Result<PathBuf> {
        write_file(&self.target.join(relative), content)
    }

    /// Writes `agents/<name>.xml` with the given inner elements.
    pub fn write_agent_xml(&self, name: &str, inner: &str) -> std::io::Result<PathBuf> {
        let content = format!("<agent>\n  <name>{name}</name>\n{inner}\n</agent>\n");
        self.write_source(&format!("agents/{name}.xml"), &content)
    }

    /// Writes a command under `commands/` with standard frontmatter.
    pub fn write_command_md(
        &self,
        relative: &str,
        description: &str,
        body: &str,
    ) -> std::io::Result<PathBuf> {
        let content = format!("---\ndescription: {description}\n---\n{body}");
        self.write_source(&format!("commands/{relative}"), &content)
    }

    /// Writes a JSON document under the source root.
    pub fn write_json(&self, relative: &str, json: &str) -> std::io::Result<PathBuf> {
        self.write_source(relative, json)
    }

    /// Byte-level snapshot of the target tree.
    pub fn target_contents(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        tree_contents(&self.target)
    }
}

fn write_file(path: &Path, content: &str) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(path.to_path_buf())
}
