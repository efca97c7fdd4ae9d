// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Final tree composition
//!
//! Copies selected subpaths of stage artifacts into one tree, in entry
//! order. Two entries writing the same path is an error unless the later
//! entry is marked `override`.

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::{CompositionSpec, FinalArtifactSet, Target};
use crate::tree::FileTree;

/// Composes stage artifacts into a final tree
pub struct Compositor;

impl Compositor {
    /// Produce the tree a target asks for
    ///
    /// A stage target yields that stage's artifact unchanged.
    pub fn assemble(
        target: &Target,
        composition: Option<&CompositionSpec>,
        artifacts: &FinalArtifactSet,
        skipped: &HashSet<String>,
    ) -> StagehandResult<FileTree> {
        match target {
            Target::Stage(name) => artifacts
                .get(name)
                .map(|a| a.tree().clone())
                .ok_or_else(|| StagehandError::UnknownTarget {
                    target: name.clone(),
                }),
            Target::Final => {
                let spec = composition.ok_or_else(|| StagehandError::UnknownTarget {
                    target: target.to_string(),
                })?;
                Self::compose(spec, artifacts, skipped)
            }
        }
    }

    /// Apply composition entries in order into an empty tree
    pub fn compose(
        spec: &CompositionSpec,
        artifacts: &FinalArtifactSet,
        skipped: &HashSet<String>,
    ) -> StagehandResult<FileTree> {
        let mut tree = FileTree::new();
        // path -> stage that wrote it
        let mut owners: BTreeMap<String, String> = BTreeMap::new();

        for entry in &spec.entries {
            if skipped.contains(&entry.stage) {
                debug!(stage = %entry.stage, "composition entry skipped for this platform");
                continue;
            }

            let artifact =
                artifacts
                    .get(&entry.stage)
                    .ok_or_else(|| StagehandError::MissingSource {
                        stage: entry.stage.clone(),
                        path: entry.source.clone(),
                    })?;
            let incoming = artifact
                .tree()
                .subtree(&entry.source, &entry.dest)?
                .ok_or_else(|| StagehandError::MissingSource {
                    stage: entry.stage.clone(),
                    path: entry.source.clone(),
                })?;

            for (path, file) in incoming.iter() {
                if let Some(first) = conflicting_owner(&owners, path) {
                    if !entry.overridable {
                        return Err(StagehandError::PathCollision {
                            first: first.owner,
                            second: entry.stage.clone(),
                            path: first.path,
                        });
                    }

                    // The overriding entry replaces whatever blocked it
                    tree.remove(&first.path);
                    owners.remove(&first.path);
                    tree.remove_under(path);
                    remove_owners_under(&mut owners, path);
                }

                tree.insert_entry(path, file.clone())?;
                owners.insert(path.to_string(), entry.stage.clone());
            }
        }

        Ok(tree)
    }
}

struct Conflict {
    owner: String,
    path: String,
}

/// Earlier write that `path` collides with
///
/// The same path, a file where `path` needs a directory, or a directory
/// where `path` would be a file.
fn conflicting_owner(owners: &BTreeMap<String, String>, path: &str) -> Option<Conflict> {
    if let Some(owner) = owners.get(path) {
        return Some(Conflict {
            owner: owner.clone(),
            path: path.to_string(),
        });
    }

    let mut prefix = String::new();
    for component in path.split('/') {
        if !prefix.is_empty() {
            if let Some(owner) = owners.get(&prefix) {
                return Some(Conflict {
                    owner: owner.clone(),
                    path: prefix,
                });
            }
            prefix.push('/');
        }
        prefix.push_str(component);
    }

    let dir = format!("{}/", path);
    owners
        .range(dir.clone()..)
        .next()
        .filter(|(p, _)| p.starts_with(&dir))
        .map(|(p, owner)| Conflict {
            owner: owner.clone(),
            path: p.clone(),
        })
}

fn remove_owners_under(owners: &mut BTreeMap<String, String>, path: &str) {
    let dir = format!("{}/", path);
    let doomed: Vec<String> = owners
        .range(dir.clone()..)
        .take_while(|(p, _)| p.starts_with(&dir))
        .map(|(p, _)| p.clone())
        .collect();
    for p in doomed {
        owners.remove(&p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Artifact, ArtifactMeta, ArtifactOrigin, Fingerprint};
    use crate::pipeline::CompositionEntry;
    use std::sync::Arc;

    fn artifact(stage: &str, files: &[(&str, &str)]) -> Artifact {
        let mut tree = FileTree::new();
        for (path, content) in files {
            tree.insert(path, content.as_bytes().to_vec()).unwrap();
        }
        let origin = ArtifactOrigin {
            stage: stage.into(),
            stable: "s".into(),
        };
        let meta = ArtifactMeta::new(&Fingerprint::of(stage.as_bytes()), &origin, &tree);
        Artifact::new(meta, Arc::new(tree))
    }

    fn artifacts() -> FinalArtifactSet {
        let mut set = FinalArtifactSet::new();
        set.insert(
            "router".into(),
            artifact("router", &[("target/release/router", "r")]),
        );
        set.insert(
            "launcher".into(),
            artifact("launcher", &[("target/release/launcher", "l")]),
        );
        set.insert(
            "runtime".into(),
            artifact(
                "runtime",
                &[("usr/bin/python", "py"), ("usr/bin/router", "stale")],
            ),
        );
        set
    }

    #[test]
    fn test_compose_places_entries() {
        let spec = CompositionSpec::new(vec![
            CompositionEntry::new("runtime", "usr", "usr"),
            CompositionEntry::new("launcher", "target/release/launcher", "usr/local/bin/launcher"),
        ]);

        let tree = Compositor::compose(&spec, &artifacts(), &HashSet::new()).unwrap();
        assert!(tree.contains("usr/bin/python"));
        assert_eq!(tree.get("usr/local/bin/launcher").unwrap().data(), b"l");
    }

    #[test]
    fn test_collision_names_both_stages_and_path() {
        let spec = CompositionSpec::new(vec![
            CompositionEntry::new("runtime", "", ""),
            CompositionEntry::new("router", "target/release/router", "usr/bin/router"),
        ]);

        match Compositor::compose(&spec, &artifacts(), &HashSet::new()) {
            Err(StagehandError::PathCollision {
                first,
                second,
                path,
            }) => {
                assert_eq!(first, "runtime");
                assert_eq!(second, "router");
                assert_eq!(path, "usr/bin/router");
            }
            other => panic!("expected collision, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn test_override_wins() {
        let spec = CompositionSpec::new(vec![
            CompositionEntry::new("runtime", "", ""),
            CompositionEntry::new("router", "target/release/router", "usr/bin/router").overriding(),
        ]);

        let tree = Compositor::compose(&spec, &artifacts(), &HashSet::new()).unwrap();
        assert_eq!(tree.get("usr/bin/router").unwrap().data(), b"r");
    }

    #[test]
    fn test_file_directory_conflict() {
        let spec = CompositionSpec::new(vec![
            CompositionEntry::new("router", "target/release/router", "opt/app"),
            CompositionEntry::new("launcher", "target/release", "opt/app"),
        ]);

        assert!(matches!(
            Compositor::compose(&spec, &artifacts(), &HashSet::new()),
            Err(StagehandError::PathCollision { .. })
        ));
    }

    #[test]
    fn test_skipped_entries_are_ignored() {
        let spec = CompositionSpec::new(vec![
            CompositionEntry::new("runtime", "usr", "usr"),
            CompositionEntry::new("exllama", "", "opt/exllama"),
        ]);
        let skipped: HashSet<String> = ["exllama".to_string()].into_iter().collect();

        let tree = Compositor::compose(&spec, &artifacts(), &skipped).unwrap();
        assert!(!tree.paths().any(|p| p.starts_with("opt")));
    }

    #[test]
    fn test_missing_source() {
        let spec = CompositionSpec::new(vec![CompositionEntry::new("runtime", "nope", "x")]);
        assert!(matches!(
            Compositor::compose(&spec, &artifacts(), &HashSet::new()),
            Err(StagehandError::MissingSource { .. })
        ));
    }

    #[test]
    fn test_stage_target_returns_artifact_tree() {
        let tree = Compositor::assemble(
            &Target::Stage("router".into()),
            None,
            &artifacts(),
            &HashSet::new(),
        )
        .unwrap();
        assert!(tree.contains("target/release/router"));
    }
}
