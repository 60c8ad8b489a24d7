//! Local checkouts of the repositories named in a prompt.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::prompt::RepoRef;

/// Makes a repository available on the local filesystem.
#[async_trait]
pub trait RepositoryCheckout: Send + Sync {
    /// Returns the local path of `repo`, fetching it if needed.
    async fn checkout(&self, repo: &RepoRef) -> Result<PathBuf>;
}

/// Where `repo` lives under `workdir`.
///
/// Fails for names that would resolve outside `workdir`.
pub fn checkout_path(workdir: &Path, repo: &RepoRef) -> Result<PathBuf> {
    if !repo.is_valid() {
        return Err(Error::Parse(format!(
            "refusing to check out {} outside {}",
            repo,
            workdir.display()
        )));
    }
    Ok(workdir.join(&repo.org).join(&repo.name))
}

/// Clones repositories from GitHub with the `gh` CLI.
///
/// An existing git checkout at the target path is reused as-is.
#[derive(Debug, Clone)]
pub struct GitHubCheckout {
    workdir: PathBuf,
    gh_path: String,
}

impl GitHubCheckout {
    /// Creates a checkout rooted at `workdir`.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            gh_path: "gh".to_string(),
        }
    }

    /// Uses a custom gh binary.
    pub fn with_gh_path(mut self, gh_path: impl Into<String>) -> Self {
        self.gh_path = gh_path.into();
        self
    }

    fn clone_args(repo: &RepoRef, target: &Path) -> Vec<String> {
        vec![
            "repo".to_string(),
            "clone".to_string(),
            repo.full_name(),
            target.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl RepositoryCheckout for GitHubCheckout {
    async fn checkout(&self, repo: &RepoRef) -> Result<PathBuf> {
        let target = checkout_path(&self.workdir, repo)?;

        if target.join(".git").exists() {
            tracing::info!(repo = %repo, path = ?target, "reusing existing checkout");
            return Ok(target);
        }
        if target.exists() {
            return Err(Error::Git(format!(
                "{} exists but is not a git checkout",
                target.display()
            )));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(repo = %repo, path = ?target, "cloning repository");

        let output = Command::new(&self.gh_path)
            .args(Self::clone_args(repo, &target))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::GitHub(format!("failed to run gh: {}", e)))?;

        if !output.status.success() {
            return Err(Error::GitHub(format!(
                "failed to clone {}: {}",
                repo,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(target)
    }
}

/// Resolves repositories to directories that already exist under a root.
///
/// Used with `--local`, where checkouts are managed outside dockhand.
#[derive(Debug, Clone)]
pub struct LocalCheckout {
    root: PathBuf,
}

impl LocalCheckout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RepositoryCheckout for LocalCheckout {
    async fn checkout(&self, repo: &RepoRef) -> Result<PathBuf> {
        let nested = checkout_path(&self.root, repo)?;
        [nested, self.root.join(&repo.name)]
            .into_iter()
            .find(|p| p.is_dir())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no local checkout of {} under {}",
                    repo,
                    self.root.display()
                ))
            })
    }
}
