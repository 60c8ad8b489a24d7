//! Dockerfile discovery.

use std::path::{Path, PathBuf};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

/// File name the locator looks for (case-sensitive).
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "__pycache__"];

/// Outcome of a Dockerfile search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateResult {
    /// Whether at least one Dockerfile was found.
    pub success: bool,
    /// Matches in traversal order.
    pub dockerfiles: Vec<PathBuf>,
    /// Why the search failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocateResult {
    /// The Dockerfile the pipeline builds.
    pub fn first(&self) -> Option<&PathBuf> {
        self.dockerfiles.first()
    }

    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            dockerfiles: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Recursively finds files named `Dockerfile` under `root`.
///
/// Siblings are walked in file-name order and shallower matches come first,
/// so the order is stable across filesystems and a root `Dockerfile` always
/// wins. Hidden entries, gitignored paths and dependency folders are
/// skipped; symlinks are not followed. Unreadable entries are logged and
/// skipped.
pub fn locate_dockerfiles(root: &Path) -> LocateResult {
    if !root.exists() {
        return LocateResult::failed(format!(
            "repository path does not exist: {}",
            root.display()
        ));
    }

    let mut override_builder = OverrideBuilder::new(root);
    for dir in SKIPPED_DIRS {
        override_builder.add(&format!("!{}/", dir)).ok();
    }
    let overrides = match override_builder.build() {
        Ok(overrides) => overrides,
        Err(e) => {
            return LocateResult::failed(format!(
                "failed to search {} for Dockerfiles: {}",
                root.display(),
                e
            ))
        }
    };

    let mut dockerfiles = Vec::new();
    for result in WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .follow_links(false)
        .overrides(overrides)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
    {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(root = ?root, error = %err, "failed to read directory entry");
                continue;
            }
        };

        let is_file = entry.file_type().is_some_and(|t| t.is_file());
        if is_file && entry.file_name() == DOCKERFILE_NAME {
            dockerfiles.push(entry.into_path());
        }
    }
    dockerfiles.sort_by_key(|path| path.components().count());

    if dockerfiles.is_empty() {
        return LocateResult::failed(format!(
            "No Dockerfiles found in repository at {}",
            root.display()
        ));
    }

    tracing::debug!(root = ?root, count = dockerfiles.len(), "found Dockerfiles");

    LocateResult {
        success: true,
        dockerfiles,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "FROM alpine\n").unwrap();
    }

    #[test]
    fn finds_root_dockerfile() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "Dockerfile");

        let result = locate_dockerfiles(temp.path());

        assert!(result.success);
        assert_eq!(result.first(), Some(&temp.path().join("Dockerfile")));
    }

    #[test]
    fn root_dockerfile_precedes_nested_ones() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "Api/Dockerfile");
        touch(temp.path(), "Dockerfile");
        touch(temp.path(), "b/Dockerfile");

        let result = locate_dockerfiles(temp.path());

        assert_eq!(
            result.dockerfiles,
            vec![
                temp.path().join("Dockerfile"),
                temp.path().join("Api/Dockerfile"),
                temp.path().join("b/Dockerfile"),
            ]
        );
    }

    #[test]
    fn name_match_is_case_sensitive() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "dockerfile");
        touch(temp.path(), "Dockerfile.dev");

        let result = locate_dockerfiles(temp.path());

        assert!(!result.success);
        assert!(result.error.unwrap().contains("No Dockerfiles found"));
    }

    #[test]
    fn skips_hidden_and_dependency_dirs() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), ".git/Dockerfile");
        touch(temp.path(), "node_modules/pkg/Dockerfile");
        touch(temp.path(), "services/target/Dockerfile");
        touch(temp.path(), "docker/Dockerfile");

        let result = locate_dockerfiles(temp.path());

        assert_eq!(result.dockerfiles, vec![temp.path().join("docker/Dockerfile")]);
    }

    #[test]
    fn nested_matches_keep_name_order_within_a_depth() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "b/deep/Dockerfile");
        touch(temp.path(), "c/Dockerfile");
        touch(temp.path(), "a/Dockerfile");

        let result = locate_dockerfiles(temp.path());

        assert_eq!(
            result.dockerfiles,
            vec![
                temp.path().join("a/Dockerfile"),
                temp.path().join("c/Dockerfile"),
                temp.path().join("b/deep/Dockerfile"),
            ]
        );
    }

    #[test]
    fn missing_path_fails() {
        let temp = TempDir::new().unwrap();

        let result = locate_dockerfiles(&temp.path().join("nope"));

        assert!(!result.success);
        assert!(result.error.unwrap().contains("does not exist"));
    }
}
