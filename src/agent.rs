//! LLM-backed sub-agents.
//!
//! [`AgentRepair`] edits a repository to address validation errors and
//! plugs into the repair loop. [`FeatureAgent`] applies the user's requested
//! change before the first validation. Both run a headless LLM CLI inside
//! the checkout and report the files it changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pr::changed_files;
use crate::prompt::RepoRef;
use crate::repair::{AppliedFix, RepairOperation, RepairOutcome, RepairRequest};
use crate::runner::{LLMInvocation, LLMOutput, LLMResult, LLMRunner};

/// Default limit on a single agent run.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Tools the agents may use.
pub const AGENT_TOOLS: &[&str] = &["Read", "Edit", "Write", "Glob", "Grep", "Bash"];

const OUTPUT_BUFFER: usize = 256;

/// Builder for prompts asking an agent to fix validation errors.
pub struct RepairPromptBuilder {
    repository: String,
    errors: String,
    attempt: u32,
    max_attempts: u32,
    intent: Option<String>,
}

impl RepairPromptBuilder {
    /// Creates a new repair prompt builder.
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            errors: String::new(),
            attempt: 1,
            max_attempts: crate::repair::DEFAULT_MAX_REPAIR_ATTEMPTS,
            intent: None,
        }
    }

    /// Sets the stage errors to address.
    pub fn with_errors(mut self, errors: impl Into<String>) -> Self {
        self.errors = errors.into();
        self
    }

    /// Sets which attempt this is.
    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the user's original request.
    pub fn with_intent(mut self, intent: Option<String>) -> Self {
        self.intent = intent;
        self
    }

    /// Builds the repair prompt.
    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str("## Docker Repair Request\n\n");
        prompt.push_str(&format!(
            "The repository `{}` failed Docker validation (attempt {} of {}). \
             The validator builds the first Dockerfile found, starts a container \
             from it and reads the container logs.\n\n",
            self.repository, self.attempt, self.max_attempts
        ));

        if let Some(intent) = &self.intent {
            prompt.push_str("### Original Request\n\n");
            prompt.push_str(intent);
            prompt.push_str("\n\n");
        }

        prompt.push_str("### Errors\n\n");
        prompt.push_str("```\n");
        prompt.push_str(self.errors.trim_end());
        prompt.push_str("\n```\n\n");

        prompt.push_str("### Instructions\n\n");
        prompt.push_str("1. Find the root cause of each error.\n");
        prompt.push_str("2. Edit the Dockerfile or source files in this directory to fix it.\n");
        prompt.push_str("3. Keep changes minimal and do not commit them.\n");
        prompt.push_str("4. If nothing in the repository can fix the error, change nothing.\n");

        prompt
    }
}

/// Builder for prompts asking an agent to implement a requested change.
pub struct FeaturePromptBuilder {
    repository: String,
    intent: String,
}

impl FeaturePromptBuilder {
    pub fn new(repository: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            intent: intent.into(),
        }
    }

    /// Builds the feature prompt.
    pub fn build(&self) -> String {
        let mut prompt = String::new();

        prompt.push_str("## Change Request\n\n");
        prompt.push_str(&format!(
            "Apply the following change to the repository `{}`.\n\n",
            self.repository
        ));
        prompt.push_str("### Task\n\n");
        prompt.push_str(self.intent.trim());
        prompt.push_str("\n\n");
        prompt.push_str("### Constraints\n\n");
        prompt.push_str("- The Docker image must still build and its container must still start.\n");
        prompt.push_str("- Do not commit changes.\n");

        prompt
    }
}

/// What one agent run produced.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Process result.
    pub result: LLMResult,
    /// Files the agent reported writing, as emitted.
    pub written: Vec<PathBuf>,
    /// Number of tool calls observed.
    pub tool_calls: usize,
}

/// Runs `invocation` to completion, collecting output as it streams.
pub async fn run_agent(
    runner: &dyn LLMRunner,
    invocation: LLMInvocation,
    timeout: Duration,
) -> Result<AgentRun> {
    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let name = runner.name().to_string();

    let collect = async {
        let mut written = Vec::new();
        let mut tool_calls = 0;
        while let Some(output) = rx.recv().await {
            match output {
                LLMOutput::FileWrite(path) => {
                    tracing::debug!(runner = %name, path = ?path, "agent wrote file");
                    written.push(path);
                }
                LLMOutput::ToolCall { tool, .. } => {
                    tool_calls += 1;
                    tracing::debug!(runner = %name, tool = %tool, "agent tool call");
                }
                LLMOutput::Stdout(line) => tracing::trace!(runner = %name, "{}", line),
                LLMOutput::Stderr(line) => tracing::debug!(runner = %name, stderr = %line),
            }
        }
        (written, tool_calls)
    };

    let run = tokio::time::timeout(timeout, runner.run(invocation, tx));
    let (result, (written, tool_calls)) = tokio::join!(run, collect);

    let result = result
        .map_err(|_| Error::Agent(format!("{} timed out after {:?}", name, timeout)))??;

    if !result.success {
        return Err(Error::Agent(format!(
            "{} exited with status {}",
            name,
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )));
    }

    Ok(AgentRun {
        result,
        written,
        tool_calls,
    })
}

/// Snapshot of dirty files and their contents, used to spot new edits.
#[derive(Debug, Default)]
struct DirtySnapshot {
    files: Option<BTreeMap<String, Option<Vec<u8>>>>,
}

impl DirtySnapshot {
    /// Takes a snapshot on the blocking pool; git and file reads are sync.
    async fn take(repo_path: &Path) -> Self {
        let path = repo_path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::take_blocking(&path))
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, "snapshot task failed");
                Self::default()
            })
    }

    fn take_blocking(repo_path: &Path) -> Self {
        match changed_files(repo_path) {
            Ok(files) => Self {
                files: Some(
                    files
                        .into_iter()
                        .map(|f| {
                            let content = std::fs::read(repo_path.join(&f)).ok();
                            (f, content)
                        })
                        .collect(),
                ),
            },
            Err(e) => {
                tracing::debug!(repo = ?repo_path, error = %e, "cannot read git status");
                Self { files: None }
            }
        }
    }

    /// Files whose state differs from `before`.
    fn changed_since(&self, before: &DirtySnapshot) -> BTreeSet<String> {
        let (Some(after), Some(before)) = (&self.files, &before.files) else {
            return BTreeSet::new();
        };
        after
            .iter()
            .filter(|(file, content)| before.get(file.as_str()) != Some(*content))
            .map(|(file, _)| file.clone())
            .collect()
    }
}

/// Files touched by an agent run, relative to `repo_path` and sorted.
async fn touched_files(
    repo_path: &Path,
    before: &DirtySnapshot,
    written: &[PathBuf],
) -> Vec<String> {
    let after = DirtySnapshot::take(repo_path).await;
    let mut files = after.changed_since(before);

    for path in written {
        let relative = path.strip_prefix(repo_path).unwrap_or(path);
        files.insert(relative.to_string_lossy().into_owned());
    }

    files.into_iter().collect()
}

/// Repair operation that asks an LLM to fix validation errors.
pub struct AgentRepair {
    runner: Arc<dyn LLMRunner>,
    model: Option<String>,
    timeout: Duration,
    max_attempts: u32,
}

impl AgentRepair {
    /// Creates a repair agent backed by `runner`.
    pub fn new(runner: Arc<dyn LLMRunner>) -> Self {
        Self {
            runner,
            model: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
            max_attempts: crate::repair::DEFAULT_MAX_REPAIR_ATTEMPTS,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt budget quoted in prompts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[async_trait]
impl RepairOperation for AgentRepair {
    async fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome> {
        let repository = crate::pipeline::repo_dir_name(&request.repo_path);
        let prompt = RepairPromptBuilder::new(&repository)
            .with_errors(&request.errors)
            .with_attempt(request.attempt, self.max_attempts)
            .with_intent(request.intent.clone())
            .build();

        let invocation = LLMInvocation::new(prompt, &request.repo_path)
            .with_model(self.model.clone())
            .with_allowed_tools(AGENT_TOOLS);

        let before = DirtySnapshot::take(&request.repo_path).await;
        let run = run_agent(self.runner.as_ref(), invocation, self.timeout).await?;
        let files = touched_files(&request.repo_path, &before, &run.written).await;

        let cause = request
            .errors
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("validation failure")
            .trim();
        let applied_fixes: Vec<AppliedFix> = files
            .into_iter()
            .map(|file| {
                AppliedFix::new(file, format!("repair attempt {}: {}", request.attempt, cause))
            })
            .collect();

        tracing::info!(
            repo = %repository,
            attempt = request.attempt,
            fixes = applied_fixes.len(),
            tool_calls = run.tool_calls,
            "repair agent finished"
        );

        Ok(RepairOutcome {
            needs_revalidation: !applied_fixes.is_empty(),
            applied_fixes,
        })
    }

    fn name(&self) -> &str {
        self.runner.name()
    }
}

/// Something that applies a requested change to a repository.
#[async_trait]
pub trait FeatureOperation: Send + Sync {
    /// Applies `intent` to the checkout at `repo_path`.
    async fn apply(&self, repo_path: &Path, repo: &RepoRef, intent: &str) -> Result<Vec<AppliedFix>>;

    /// Returns the name of this operation.
    fn name(&self) -> &str;
}

/// Feature operation backed by an LLM.
pub struct FeatureAgent {
    runner: Arc<dyn LLMRunner>,
    model: Option<String>,
    timeout: Duration,
}

impl FeatureAgent {
    pub fn new(runner: Arc<dyn LLMRunner>) -> Self {
        Self {
            runner,
            model: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FeatureOperation for FeatureAgent {
    async fn apply(&self, repo_path: &Path, repo: &RepoRef, intent: &str) -> Result<Vec<AppliedFix>> {
        let prompt = FeaturePromptBuilder::new(repo.full_name(), intent).build();
        let invocation = LLMInvocation::new(prompt, repo_path)
            .with_model(self.model.clone())
            .with_allowed_tools(AGENT_TOOLS);

        let before = DirtySnapshot::take(repo_path).await;
        let run = run_agent(self.runner.as_ref(), invocation, self.timeout).await?;
        let summary = intent.lines().next().unwrap_or(intent).trim();

        let fixes: Vec<AppliedFix> = touched_files(repo_path, &before, &run.written)
            .await
            .into_iter()
            .map(|file| AppliedFix::new(file, format!("requested change: {}", summary)))
            .collect();

        tracing::info!(repo = %repo, files = fixes.len(), "feature agent finished");
        Ok(fixes)
    }

    fn name(&self) -> &str {
        self.runner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Runner that writes files into the working dir instead of calling an LLM.
    struct ScriptedRunner {
        writes: Vec<(&'static str, &'static str)>,
        success: bool,
        delay: Option<Duration>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn writing(writes: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                writes,
                success: true,
                delay: None,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LLMRunner for ScriptedRunner {
        async fn run(
            &self,
            invocation: LLMInvocation,
            output_tx: mpsc::Sender<LLMOutput>,
        ) -> Result<LLMResult> {
            self.prompts.lock().unwrap().push(invocation.prompt.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            for (file, content) in &self.writes {
                let path = invocation.working_dir.join(file);
                std::fs::write(&path, content)?;
                let _ = output_tx.send(LLMOutput::FileWrite(path)).await;
            }
            Ok(LLMResult {
                exit_code: Some(if self.success { 0 } else { 1 }),
                output_lines: self.writes.len(),
                success: self.success,
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn git_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").current_dir(temp.path()).args(&args).output().unwrap();
        }
        std::fs::write(temp.path().join("Dockerfile"), "FROM pyhton:3.11\n").unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "Initial"]] {
            Command::new("git").current_dir(temp.path()).args(&args).output().unwrap();
        }
        temp
    }

    fn request(repo: &Path, attempt: u32) -> RepairRequest {
        RepairRequest {
            repo_path: repo.to_path_buf(),
            errors: "build: pull access denied for pyhton".to_string(),
            attempt,
            intent: None,
        }
    }

    #[test]
    fn repair_prompt_includes_errors_and_attempt() {
        let prompt = RepairPromptBuilder::new("worker-basic")
            .with_errors("build: no such file requirements.txt")
            .with_attempt(2, 3)
            .with_intent(Some("add a health check".to_string()))
            .build();

        assert!(prompt.contains("`worker-basic`"));
        assert!(prompt.contains("attempt 2 of 3"));
        assert!(prompt.contains("no such file requirements.txt"));
        assert!(prompt.contains("### Original Request"));
    }

    #[test]
    fn repair_prompt_omits_missing_intent() {
        let prompt = RepairPromptBuilder::new("r").with_errors("run: exit 1").build();
        assert!(!prompt.contains("Original Request"));
    }

    #[test]
    fn feature_prompt_includes_task() {
        let prompt = FeaturePromptBuilder::new("RunPod/worker-basic", "Add CUDA 12 support").build();

        assert!(prompt.contains("RunPod/worker-basic"));
        assert!(prompt.contains("Add CUDA 12 support"));
    }

    #[tokio::test]
    async fn repair_reports_edited_files() {
        let repo = git_repo();
        let runner = Arc::new(ScriptedRunner::writing(vec![("Dockerfile", "FROM python:3.11\n")]));
        let agent = AgentRepair::new(runner.clone()).with_max_attempts(3);

        let outcome = agent.repair(&request(repo.path(), 1)).await.unwrap();

        assert!(outcome.needs_revalidation);
        assert_eq!(outcome.applied_fixes.len(), 1);
        assert_eq!(outcome.applied_fixes[0].file, "Dockerfile");
        assert!(outcome.applied_fixes[0].description.contains("pull access denied"));
        assert!(runner.prompts.lock().unwrap()[0].contains("attempt 1 of 3"));
    }

    #[tokio::test]
    async fn repair_without_changes_needs_no_revalidation() {
        let repo = git_repo();
        let agent = AgentRepair::new(Arc::new(ScriptedRunner::writing(vec![])));

        let outcome = agent.repair(&request(repo.path(), 1)).await.unwrap();

        assert!(!outcome.needs_revalidation);
        assert!(outcome.applied_fixes.is_empty());
    }

    #[tokio::test]
    async fn second_edit_to_dirty_file_counts() {
        let repo = git_repo();
        std::fs::write(repo.path().join("Dockerfile"), "FROM python:3.10\n").unwrap();
        let agent = AgentRepair::new(Arc::new(ScriptedRunner::writing(vec![(
            "Dockerfile",
            "FROM python:3.11\n",
        )])));

        let outcome = agent.repair(&request(repo.path(), 2)).await.unwrap();

        assert_eq!(outcome.applied_fixes.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_tracks_dirty_files_off_the_runtime() {
        let repo = git_repo();
        let clean = DirtySnapshot::take(repo.path()).await;
        std::fs::write(repo.path().join("Dockerfile"), "FROM python:3.12\n").unwrap();
        std::fs::write(repo.path().join("handler.py"), "print('ok')\n").unwrap();

        let dirty = DirtySnapshot::take(repo.path()).await;

        assert_eq!(
            dirty.changed_since(&clean).into_iter().collect::<Vec<_>>(),
            vec!["Dockerfile", "handler.py"]
        );

        let plain = TempDir::new().unwrap();
        let outside_git = DirtySnapshot::take(plain.path()).await;
        assert!(outside_git.files.is_none());
    }

    #[tokio::test]
    async fn failed_runner_is_an_error() {
        let repo = git_repo();
        let runner = ScriptedRunner {
            success: false,
            ..ScriptedRunner::writing(vec![])
        };

        let err = AgentRepair::new(Arc::new(runner))
            .repair(&request(repo.path(), 1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Agent(msg) if msg.contains("exited with status 1")));
    }

    #[tokio::test]
    async fn slow_runner_times_out() {
        let repo = git_repo();
        let runner = ScriptedRunner {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedRunner::writing(vec![])
        };

        let err = AgentRepair::new(Arc::new(runner))
            .with_timeout(Duration::from_millis(50))
            .repair(&request(repo.path(), 1))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn feature_agent_reports_new_files() {
        let repo = git_repo();
        let agent = FeatureAgent::new(Arc::new(ScriptedRunner::writing(vec![(
            "healthcheck.sh",
            "#!/bin/sh\nexit 0\n",
        )])));

        let fixes = agent
            .apply(repo.path(), &RepoRef::new("RunPod", "worker-basic"), "Add a health check")
            .await
            .unwrap();

        assert_eq!(fixes, vec![AppliedFix::new("healthcheck.sh", "requested change: Add a health check")]);
    }
}
