use crate::error::{FileError, ParseError};
use pathdiff::diff_paths;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories never descended into: VCS metadata, dependency caches, build
/// output, and ctxport's own state directory.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    ".ctxport",
];

/// A discovered file with its contents loaded.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the source root.
    pub relative: PathBuf,
    /// `relative` with `/` separators on every platform; the sort and hash key.
    pub key: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn extension(&self) -> Option<String> {
        self.relative
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_ascii_lowercase)
    }
}

/// Every file under a source root, sorted by [`SourceFile::key`].
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub root: PathBuf,
    pub files: Vec<SourceFile>,
    /// Files that were enumerated but could not be read.
    pub unreadable: Vec<FileError>,
    content_hash: String,
}

impl SourceTree {
    /// Order-independent SHA-256 over every readable file's path and bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_ignored_dir(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| IGNORED_DIRS.contains(&n))
}

/// Joins path components with `/` regardless of platform.
pub fn normalized_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively enumerates `root`, skipping [`IGNORED_DIRS`] and symlinks.
///
/// A missing or unreadable root is the only fatal condition; files that fail
/// to read are reported in [`SourceTree::unreadable`] and excluded from the hash.
pub fn discover(root: &Path) -> Result<SourceTree, ParseError> {
    let meta = fs::metadata(root).map_err(|source| ParseError::RootUnreadable {
        root: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ParseError::RootNotDirectory(root.to_path_buf()));
    }
    fs::read_dir(root).map_err(|source| ParseError::RootUnreadable {
        root: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    let mut unreadable = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_ignored_dir(e.file_name())));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                let relative = diff_paths(&path, root).unwrap_or(path);
                tracing::warn!(path = %relative.display(), error = %err, "Skipping unreadable entry");
                unreadable.push(FileError::new(relative, err.to_string(), None));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = diff_paths(path, root).unwrap_or_else(|| path.to_path_buf());
        match fs::read(path) {
            Ok(bytes) => files.push(SourceFile {
                key: normalized_key(&relative),
                relative,
                bytes,
            }),
            Err(err) => {
                tracing::warn!(path = %relative.display(), error = %err, "Skipping unreadable file");
                unreadable.push(FileError::new(relative, format!("unreadable: {err}"), None));
            }
        }
    }

    files.sort_by(|a, b| a.key.cmp(&b.key));
    unreadable.sort_by(|a, b| a.file.cmp(&b.file));
    let content_hash = hash_files(&files);

    tracing::debug!(
        root = %root.display(),
        files = files.len(),
        hash = %content_hash,
        "Discovered source tree"
    );

    Ok(SourceTree {
        root: root.to_path_buf(),
        files,
        unreadable,
        content_hash,
    })
}

/// Hashes files in the given order; callers pass the sorted list.
fn hash_files(files: &[SourceFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.key.as_bytes());
        hasher.update([0u8]);
        hasher.update((file.bytes.len() as u64).to_le_bytes());
        hasher.update(&file.bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Computes the content hash of `root` without keeping the tree.
pub fn hash_source_tree(root: &Path) -> Result<String, ParseError> {
    discover(root).map(|tree| tree.content_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn skips_ignored_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::create_dir_all(dir.path().join("agents")).unwrap();
        fs::write(dir.path().join(".git/config"), "x").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.json"), "{}").unwrap();
        fs::write(dir.path().join("agents/qa.xml"), "<agent/>").unwrap();

        let tree = discover(dir.path()).unwrap();
        let keys: Vec<_> = tree.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["agents/qa.xml"]);
    }

    #[test]
    fn files_are_sorted_by_normalized_key() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("c.md"), "").unwrap();
        fs::write(dir.path().join("b/a.md"), "").unwrap();
        fs::write(dir.path().join("a.md"), "").unwrap();

        let tree = discover(dir.path()).unwrap();
        let keys: Vec<_> = tree.files.iter().map(|f| f.key.clone()).collect();
        assert_eq!(keys, vec!["a.md", "b/a.md", "c.md"]);
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let err = discover(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ParseError::RootUnreadable { .. }));
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.md");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            discover(&file).unwrap_err(),
            ParseError::RootNotDirectory(_)
        ));
    }

    #[test]
    fn hash_changes_with_content_and_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "one").unwrap();
        let first = hash_source_tree(dir.path()).unwrap();

        fs::write(dir.path().join("a.md"), "two").unwrap();
        let second = hash_source_tree(dir.path()).unwrap();
        assert_ne!(first, second);

        fs::rename(dir.path().join("a.md"), dir.path().join("b.md")).unwrap();
        let third = hash_source_tree(dir.path()).unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn empty_tree_has_stable_hash() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        assert_eq!(
            hash_source_tree(a.path()).unwrap(),
            hash_source_tree(b.path()).unwrap()
        );
    }

    #[test]
    fn normalized_key_uses_forward_slashes() {
        let path: PathBuf = ["commands", "git", "commit.md"].iter().collect();
        assert_eq!(normalized_key(&path), "commands/git/commit.md");
    }
}
