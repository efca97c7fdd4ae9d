// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Immutable file tree snapshots
//!
//! A [`FileTree`] maps normalized relative paths (`a/b/c`, no leading slash,
//! no `.` or `..` components) to file contents. Directories are implicit.
//! Trees are the currency passed between the workspace, the step executor,
//! the artifact store and the compositor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blake3::Hasher;

use crate::errors::{StagehandError, StagehandResult};

/// A single file inside a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    data: Arc<[u8]>,
    executable: bool,
}

impl FileEntry {
    /// Create a regular file entry
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
            executable: false,
        }
    }

    /// Create an executable file entry
    pub fn executable(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
            executable: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Normalize a relative path into tree form
///
/// Leading slashes and `.` components are dropped; `..` is rejected so a
/// path can never escape the tree it is applied to. The empty string
/// denotes the tree root.
pub fn normalize_path(raw: &str) -> StagehandResult<String> {
    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(StagehandError::invalid_path(raw, "'..' is not allowed")),
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Join a destination prefix with a path relative to an extracted source
///
/// When `rel` is empty the source was a single file: it lands at `dest`, or
/// under its own file name when `dest` is the root.
pub fn join_dest(dest: &str, rel: &str, source: &str) -> StagehandResult<String> {
    let path = match (dest.is_empty(), rel.is_empty()) {
        (true, true) => source.rsplit('/').next().unwrap_or_default().to_string(),
        (true, false) => rel.to_string(),
        (false, true) => dest.to_string(),
        (false, false) => format!("{}/{}", dest, rel),
    };

    if path.is_empty() {
        return Err(StagehandError::invalid_path(
            source,
            "a file cannot be placed at the tree root",
        ));
    }

    Ok(path)
}

/// An immutable snapshot of a filesystem tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    entries: BTreeMap<String, FileEntry>,
}

impl FileTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a regular file
    pub fn insert(&mut self, path: &str, data: impl Into<Vec<u8>>) -> StagehandResult<()> {
        self.insert_entry(path, FileEntry::new(data))
    }

    /// Insert an entry, replacing any existing file at the same path
    pub fn insert_entry(&mut self, path: &str, entry: FileEntry) -> StagehandResult<()> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(StagehandError::invalid_path(
                "/",
                "a file cannot be placed at the tree root",
            ));
        }
        self.entries.insert(path, entry);
        Ok(())
    }

    /// Builder-style insert, mainly for tests and fixtures
    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> StagehandResult<Self> {
        self.insert(path, data)?;
        Ok(self)
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        let path = normalize_path(path).ok()?;
        self.entries.get(&path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Total size of all file contents
    pub fn size_bytes(&self) -> u64 {
        self.entries.values().map(FileEntry::len).sum()
    }

    /// Deterministic content digest over paths, modes and contents
    pub fn digest(&self) -> String {
        let mut hasher = Hasher::new();
        for (path, entry) in &self.entries {
            hasher.update(&(path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update(&[entry.executable as u8]);
            hasher.update(&entry.len().to_le_bytes());
            hasher.update(entry.data());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Select the entries under `source`
    ///
    /// Returns `(relative path, entry)` pairs, where the relative path is
    /// empty if `source` names a single file. `None` if nothing matches; an
    /// empty `source` always matches, even on an empty tree.
    pub fn extract(&self, source: &str) -> StagehandResult<Option<Vec<(String, FileEntry)>>> {
        let source = normalize_path(source)?;

        if source.is_empty() {
            let all: Vec<_> = self
                .entries
                .iter()
                .map(|(p, e)| (p.clone(), e.clone()))
                .collect();
            return Ok(Some(all));
        }

        if let Some(entry) = self.entries.get(&source) {
            return Ok(Some(vec![(String::new(), entry.clone())]));
        }

        let prefix = format!("{}/", source);
        let selected: Vec<_> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, e)| (p[prefix.len()..].to_string(), e.clone()))
            .collect();

        Ok(if selected.is_empty() {
            None
        } else {
            Some(selected)
        })
    }

    /// Re-root the entries under `source` at `dest`, returning a new tree
    pub fn subtree(&self, source: &str, dest: &str) -> StagehandResult<Option<FileTree>> {
        let Some(entries) = self.extract(source)? else {
            return Ok(None);
        };
        let source = normalize_path(source)?;
        let dest = normalize_path(dest)?;

        let mut tree = FileTree::new();
        for (rel, entry) in entries {
            let path = join_dest(&dest, &rel, &source)?;
            tree.entries.insert(path, entry);
        }
        Ok(Some(tree))
    }

    /// Overlay another tree on top of this one (later entries win)
    pub fn overlay(&mut self, other: &FileTree) {
        for (path, entry) in &other.entries {
            self.entries.insert(path.clone(), entry.clone());
        }
    }

    /// Remove a file, returning it if present
    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        let path = normalize_path(path).ok()?;
        self.entries.remove(&path)
    }

    /// Remove every file below the directory `path`
    pub fn remove_under(&mut self, path: &str) -> usize {
        let Ok(path) = normalize_path(path) else {
            return 0;
        };
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        for p in &doomed {
            self.entries.remove(p);
        }
        doomed.len()
    }

    /// Load a file or directory from disk
    ///
    /// A directory is loaded recursively with paths relative to it; a file
    /// is loaded as a single-entry tree keyed by its file name.
    pub fn from_path(path: &Path) -> StagehandResult<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let base = if path.is_file() { name } else { String::new() };
        Self::load_at(path, &base, &[])
    }

    /// Load a file or directory from disk, placing it at `base`
    ///
    /// A file lands exactly at `base`; a directory's contents land under
    /// `base/`. Paths listed in `excluded` (absolute) are not descended into.
    pub fn load_at(path: &Path, base: &str, excluded: &[PathBuf]) -> StagehandResult<Self> {
        let base = normalize_path(base)?;
        let mut tree = FileTree::new();
        let meta = std::fs::metadata(path).map_err(|e| StagehandError::FileRead {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        if meta.is_file() {
            if base.is_empty() {
                return Err(StagehandError::invalid_path(
                    &path.display().to_string(),
                    "a file cannot be placed at the tree root",
                ));
            }
            tree.entries.insert(base, read_entry(path)?);
        } else {
            Self::load_dir(path, &base, excluded, &mut tree)?;
        }

        Ok(tree)
    }

    fn load_dir(
        dir: &Path,
        prefix: &str,
        excluded: &[PathBuf],
        tree: &mut FileTree,
    ) -> StagehandResult<()> {
        let read = std::fs::read_dir(dir).map_err(|e| StagehandError::FileRead {
            path: dir.to_path_buf(),
            error: e.to_string(),
        })?;

        for entry in read {
            let entry = entry?;
            let path = entry.path();
            if excluded.iter().any(|x| x == &path) {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            let meta = std::fs::metadata(&path)?;
            if meta.is_dir() {
                Self::load_dir(&path, &rel, excluded, tree)?;
            } else if meta.is_file() {
                tree.entries.insert(rel, read_entry(&path)?);
            }
        }

        Ok(())
    }

    /// Materialize the tree under `root`
    pub fn write_to(&self, root: &Path) -> StagehandResult<()> {
        std::fs::create_dir_all(root)?;

        for (rel, entry) in &self.entries {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, entry.data())?;
            if entry.executable {
                set_executable(&path)?;
            }
        }

        Ok(())
    }
}

fn read_entry(path: &Path) -> StagehandResult<FileEntry> {
    let data = std::fs::read(path).map_err(|e| StagehandError::FileRead {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    Ok(FileEntry {
        data: Arc::from(data),
        executable: is_executable(path),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> StagehandResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> StagehandResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> FileTree {
        FileTree::new()
            .with_file("bin/router", b"router".to_vec())
            .unwrap()
            .with_file("lib/python/site.py", b"site".to_vec())
            .unwrap()
            .with_file("lib/python/ext/ops.so", b"ops".to_vec())
            .unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/usr/./lib/").unwrap(), "usr/lib");
        assert_eq!(normalize_path("").unwrap(), "");
        assert!(normalize_path("a/../../etc").is_err());
    }

    #[test]
    fn test_extract_directory() {
        let tree = sample();
        let entries = tree.extract("/lib/python").unwrap().unwrap();
        let rels: Vec<_> = entries.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(rels, vec!["ext/ops.so", "site.py"]);
    }

    #[test]
    fn test_extract_does_not_match_sibling_prefix() {
        let tree = FileTree::new()
            .with_file("lib/a", b"1".to_vec())
            .unwrap()
            .with_file("lib2/b", b"2".to_vec())
            .unwrap();
        let entries = tree.extract("lib").unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_subtree_single_file() {
        let tree = sample();
        let sub = tree.subtree("bin/router", "usr/local/bin/router").unwrap().unwrap();
        assert!(sub.contains("usr/local/bin/router"));
        assert_eq!(sub.len(), 1);

        let sub = tree.subtree("bin/router", "").unwrap().unwrap();
        assert!(sub.contains("router"));
    }

    #[test]
    fn test_remove_under() {
        let mut tree = sample();
        assert_eq!(tree.remove_under("lib/python"), 2);
        assert_eq!(tree.len(), 1);
        assert!(tree.remove("bin/router").is_some());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_load_at_places_file_and_excludes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".stagehand/store")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join(".stagehand/store/junk"), "x").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();

        let file = FileTree::load_at(&dir.path().join("Cargo.toml"), "app/Cargo.toml", &[]).unwrap();
        assert!(file.contains("app/Cargo.toml"));

        let excluded = vec![dir.path().join(".stagehand")];
        let all = FileTree::load_at(dir.path(), "", &excluded).unwrap();
        assert!(all.contains("src/main.rs"));
        assert!(all.contains("Cargo.toml"));
        assert!(!all.paths().any(|p| p.starts_with(".stagehand")));
    }

    #[test]
    fn test_extract_missing() {
        assert!(sample().extract("nope").unwrap().is_none());
    }

    #[test]
    fn test_digest_sensitive_to_content_and_mode() {
        let a = FileTree::new().with_file("x", b"1".to_vec()).unwrap();
        let b = FileTree::new().with_file("x", b"2".to_vec()).unwrap();
        let mut c = FileTree::new();
        c.insert_entry("x", FileEntry::executable(b"1".to_vec())).unwrap();

        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_disk_round_trip_keeps_executable_bit() {
        let dir = TempDir::new().unwrap();
        let mut tree = sample();
        tree.insert_entry("bin/launcher", FileEntry::executable(b"#!/bin/sh".to_vec()))
            .unwrap();

        tree.write_to(dir.path()).unwrap();
        let loaded = FileTree::from_path(dir.path()).unwrap();

        assert_eq!(loaded.len(), tree.len());
        if cfg!(unix) {
            assert!(loaded.get("bin/launcher").unwrap().is_executable());
        }
        assert_eq!(loaded.get("lib/python/site.py").unwrap().data(), b"site");
    }
}
