// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Workspace input snapshots
//!
//! Workspace inputs are read at most once per build invocation. The
//! fingerprinter and the input-view assembly share the same snapshot, so a
//! file edited mid-build cannot make a stage run against bytes other than
//! the ones its fingerprint was computed from.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{StagehandError, StagehandResult};
use crate::tree::{normalize_path, FileTree};

/// Read-once view of the workspace directory
pub struct Workspace {
    root: PathBuf,
    excluded: Vec<PathBuf>,
    snapshots: DashMap<(String, String), Arc<FileTree>>,
}

impl Workspace {
    /// Create a workspace rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
            snapshots: DashMap::new(),
        }
    }

    /// Never descend into `path` (e.g. the artifact store directory)
    pub fn excluding(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        self.excluded.push(absolute);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of a workspace input, placed at `dest`
    ///
    /// `path` may be a glob pattern, in which case every match lands at
    /// `dest/<file name>` (or at its own workspace path when `dest` equals
    /// the pattern).
    pub fn snapshot(&self, path: &str, dest: &str) -> StagehandResult<Arc<FileTree>> {
        let key = (path.to_string(), dest.to_string());
        if let Some(tree) = self.snapshots.get(&key) {
            return Ok(tree.clone());
        }

        // The entry holds its shard lock across the read
        let tree = self
            .snapshots
            .entry(key)
            .or_try_insert_with(|| self.read(path, dest).map(Arc::new))?;
        Ok(tree.clone())
    }

    fn read(&self, path: &str, dest: &str) -> StagehandResult<FileTree> {
        if is_glob(path) {
            return self.read_glob(path, dest);
        }

        let rel = normalize_path(path)?;
        let absolute = self.root.join(&rel);
        if !absolute.exists() {
            return Err(StagehandError::FileRead {
                path: absolute,
                error: "workspace input does not exist".to_string(),
            });
        }

        FileTree::load_at(&absolute, dest, &self.excluded)
    }

    fn read_glob(&self, pattern: &str, dest: &str) -> StagehandResult<FileTree> {
        let full_pattern = self.root.join(pattern).to_string_lossy().to_string();
        let mut matches: Vec<PathBuf> = glob::glob(&full_pattern)?
            .filter_map(Result::ok)
            .filter(|m| !self.excluded.iter().any(|x| m.starts_with(x)))
            .collect();

        if matches.is_empty() {
            return Err(StagehandError::FileRead {
                path: PathBuf::from(pattern),
                error: "pattern matched no workspace files".to_string(),
            });
        }

        // Sort for consistent ordering
        matches.sort();

        let keep_layout = dest == pattern;
        let mut tree = FileTree::new();
        for m in matches {
            let base = if keep_layout {
                m.strip_prefix(&self.root)
                    .unwrap_or(&m)
                    .to_string_lossy()
                    .to_string()
            } else {
                let name = m
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}/{}", dest, name)
            };
            tree.overlay(&FileTree::load_at(&m, &base, &self.excluded)?);
        }

        Ok(tree)
    }
}

fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("router/src")).unwrap();
        std::fs::write(dir.path().join("router/src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[workspace]").unwrap();
        std::fs::write(dir.path().join("a.proto"), "a").unwrap();
        std::fs::write(dir.path().join("b.proto"), "b").unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn test_snapshot_directory_at_dest() {
        let (_dir, ws) = workspace();
        let tree = ws.snapshot("router", "app/router").unwrap();
        assert!(tree.contains("app/router/src/main.rs"));
    }

    #[test]
    fn test_snapshot_is_memoized() {
        let (dir, ws) = workspace();
        let first = ws.snapshot("Cargo.toml", "Cargo.toml").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "changed").unwrap();
        let second = ws.snapshot("Cargo.toml", "Cargo.toml").unwrap();
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_concurrent_first_reads_share_one_snapshot() {
        let (_dir, ws) = workspace();

        let trees: Vec<Arc<FileTree>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| ws.snapshot("router", "router").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(trees.iter().all(|t| Arc::ptr_eq(t, &trees[0])));
    }

    #[test]
    fn test_glob_keeps_layout_or_collects_into_dest() {
        let (_dir, ws) = workspace();

        let same = ws.snapshot("*.proto", "*.proto").unwrap();
        assert!(same.contains("a.proto"));
        assert!(same.contains("b.proto"));

        let moved = ws.snapshot("*.proto", "proto").unwrap();
        assert!(moved.contains("proto/a.proto"));
        assert_eq!(moved.len(), 2);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let (_dir, ws) = workspace();
        assert!(ws.snapshot("nope.txt", "nope.txt").is_err());
        assert!(ws.snapshot("*.nothing", "x").is_err());
    }

    #[test]
    fn test_excluded_directory_is_skipped() {
        let (dir, ws) = workspace();
        std::fs::create_dir_all(dir.path().join(".stagehand/store")).unwrap();
        std::fs::write(dir.path().join(".stagehand/store/blob"), "x").unwrap();
        let ws = ws.excluding(".stagehand");

        let tree = ws.snapshot(".", "").unwrap();
        assert!(tree.contains("Cargo.toml"));
        assert!(!tree.paths().any(|p| p.starts_with(".stagehand")));
    }
}
