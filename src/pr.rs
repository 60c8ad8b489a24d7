//! Pull request creation for repaired repositories.
//!
//! Commits the agent's edits on a fresh branch, pushes it and opens a PR
//! with the `gh` CLI.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::prompt::RepoRef;
use crate::repair::AppliedFix;

/// Prefix for branches created by dockhand.
pub const BRANCH_PREFIX: &str = "dockhand/fix";

/// Information about a created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR number.
    pub number: u64,
    /// PR URL.
    pub url: String,
    /// PR title.
    pub title: String,
    /// Target branch.
    pub base_branch: String,
    /// Source branch.
    pub head_branch: String,
}

/// Result of trying to open a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestOutcome {
    /// Whether a PR was opened.
    pub success: bool,
    /// PR URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// PR number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    /// What happened.
    pub message: String,
}

impl PullRequestOutcome {
    fn opened(pr: &PullRequest) -> Self {
        Self {
            success: true,
            pr_url: Some(pr.url.clone()),
            pr_number: Some(pr.number),
            message: format!("opened pull request #{}", pr.number),
        }
    }

    fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: false,
            pr_url: None,
            pr_number: None,
            message: message.into(),
        }
    }
}

/// Something that publishes a repository's fixes for review.
pub trait PullRequestPublisher: Send + Sync {
    /// Publishes the working-tree changes in `repo_path`.
    ///
    /// Failures are reported in the outcome rather than as errors.
    fn publish(
        &self,
        repo_path: &Path,
        repo: &RepoRef,
        fixes: &[AppliedFix],
        report: &str,
    ) -> PullRequestOutcome;
}

/// Lists files with uncommitted changes, relative to the repository root.
pub fn changed_files(repo_path: &Path) -> Result<Vec<String>> {
    let output = git(repo_path, &["status", "--porcelain", "--untracked-files=all"])?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to read status: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_porcelain(status: &str) -> Vec<String> {
    status
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            // Renames are reported as "old -> new".
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            path.trim_matches('"').to_string()
        })
        .collect()
}

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))
}

/// Manager for creating pull requests from a checkout.
pub struct PRManager {
    /// Repository path.
    repo_path: PathBuf,
    /// Branch the PR targets.
    base_branch: String,
}

impl PRManager {
    /// Creates a new PR manager for the given checkout.
    pub fn new(repo_path: PathBuf) -> Self {
        Self {
            repo_path,
            base_branch: "main".to_string(),
        }
    }

    /// Sets the branch PRs target.
    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }

    /// Creates and switches to `branch_name`, keeping working-tree changes.
    pub fn create_branch(&self, branch_name: &str) -> Result<()> {
        let output = git(&self.repo_path, &["checkout", "-b", branch_name])?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "failed to create branch {}: {}",
                branch_name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Commits all changes. Returns the commit hash, or `None` if the tree
    /// was clean.
    pub fn commit_changes(&self, message: &str) -> Result<Option<String>> {
        if changed_files(&self.repo_path)?.is_empty() {
            return Ok(None);
        }

        let add = git(&self.repo_path, &["add", "-A"])?;
        if !add.status.success() {
            return Err(Error::Git(format!(
                "failed to stage changes: {}",
                String::from_utf8_lossy(&add.stderr)
            )));
        }

        let commit = git(&self.repo_path, &["commit", "-m", message])?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr);
            if stderr.contains("nothing to commit") {
                return Ok(None);
            }
            return Err(Error::Git(format!("failed to commit: {}", stderr)));
        }

        let rev = git(&self.repo_path, &["rev-parse", "HEAD"])?;
        Ok(Some(String::from_utf8_lossy(&rev.stdout).trim().to_string()))
    }

    /// Pushes a branch to origin.
    pub fn push_branch(&self, branch_name: &str) -> Result<()> {
        let output = git(&self.repo_path, &["push", "-u", "origin", branch_name])?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "failed to push branch: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Creates a pull request against `repo` using the gh CLI.
    pub fn create_pr(
        &self,
        repo: &RepoRef,
        title: &str,
        body: &str,
        head_branch: &str,
    ) -> Result<PullRequest> {
        let full_name = repo.full_name();
        let output = Command::new("gh")
            .current_dir(&self.repo_path)
            .args([
                "pr",
                "create",
                "--repo",
                full_name.as_str(),
                "--title",
                title,
                "--body",
                body,
                "--head",
                head_branch,
                "--base",
                self.base_branch.as_str(),
            ])
            .output()
            .map_err(|e| Error::GitHub(format!("failed to run gh: {}", e)))?;

        if !output.status.success() {
            return Err(Error::GitHub(format!(
                "failed to create PR: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let url = String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(PullRequest {
            number: pr_number_from_url(&url).unwrap_or(0),
            url,
            title: title.to_string(),
            base_branch: self.base_branch.clone(),
            head_branch: head_branch.to_string(),
        })
    }

    /// Commits, pushes and opens a PR for the current changes.
    pub fn open_pull_request(
        &self,
        repo: &RepoRef,
        fixes: &[AppliedFix],
        report: &str,
    ) -> PullRequestOutcome {
        match self.try_open(repo, fixes, report) {
            Ok(Some(pr)) => {
                tracing::info!(repo = %repo, url = %pr.url, "opened pull request");
                PullRequestOutcome::opened(&pr)
            }
            Ok(None) => PullRequestOutcome::skipped("no changes to commit"),
            Err(e) => {
                tracing::warn!(repo = %repo, error = %e, "pull request failed");
                PullRequestOutcome::skipped(e.to_string())
            }
        }
    }

    fn try_open(
        &self,
        repo: &RepoRef,
        fixes: &[AppliedFix],
        report: &str,
    ) -> Result<Option<PullRequest>> {
        if changed_files(&self.repo_path)?.is_empty() {
            return Ok(None);
        }

        let branch = branch_name(repo, chrono::Utc::now().timestamp_millis());
        let title = format!("Fix Docker validation for {}", repo);

        self.create_branch(&branch)?;
        if self.commit_changes(&title)?.is_none() {
            return Ok(None);
        }
        self.push_branch(&branch)?;

        let body = generate_pr_body(repo, fixes, report);
        self.create_pr(repo, &title, &body, &branch).map(Some)
    }
}

/// Branch name for a fix PR.
pub fn branch_name(repo: &RepoRef, millis: i64) -> String {
    format!(
        "{}-{}-{}",
        BRANCH_PREFIX,
        crate::pipeline::sanitize_name(&repo.name.to_lowercase()),
        millis
    )
}

fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Generates the PR description for a set of fixes.
pub fn generate_pr_body(repo: &RepoRef, fixes: &[AppliedFix], report: &str) -> String {
    let mut body = String::new();

    body.push_str("## Docker Validation Fixes\n\n");
    body.push_str(&format!("**Repository:** `{}`\n\n", repo));

    body.push_str("### Changes\n\n");
    if fixes.is_empty() {
        body.push_str("_No individual fixes were recorded._\n\n");
    } else {
        for fix in fixes {
            body.push_str(&format!("- `{}`: {}\n", fix.file, fix.description));
        }
        body.push('\n');
    }

    if !report.trim().is_empty() {
        body.push_str("<details>\n");
        body.push_str("<summary>Validation Report</summary>\n\n");
        body.push_str("```\n");
        body.push_str(report.trim_end());
        body.push_str("\n```\n\n");
        body.push_str("</details>\n\n");
    }

    body.push_str("---\n");
    body.push_str("*Created by dockhand*\n");

    body
}

/// Publishes fixes through [`PRManager`].
#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    base_branch: String,
}

impl GitHubPublisher {
    pub fn new(base_branch: impl Into<String>) -> Self {
        Self {
            base_branch: base_branch.into(),
        }
    }
}

impl PullRequestPublisher for GitHubPublisher {
    fn publish(
        &self,
        repo_path: &Path,
        repo: &RepoRef,
        fixes: &[AppliedFix],
        report: &str,
    ) -> PullRequestOutcome {
        PRManager::new(repo_path.to_path_buf())
            .with_base_branch(&self.base_branch)
            .open_pull_request(repo, fixes, report)
    }
}
