//! Drives a parsed prompt through checkout, validation, repair and PR
//! creation, one repository at a time.
//!
//! Every collaborator is passed in at construction; nothing here reaches
//! for global state.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::FeatureOperation;
use crate::checkout::RepositoryCheckout;
use crate::config::Validate;
use crate::engine::ContainerEngine;
use crate::pipeline::{Pipeline, ValidationReport, ValidationRequest};
use crate::pr::{PullRequestOutcome, PullRequestPublisher};
use crate::prompt::{ParsedPrompt, PromptMode, RepoRef};
use crate::repair::{AppliedFix, LoopStatus, RepairLoop, RepairLoopResult, RepairOperation};
use crate::store::{ResultStore, RunRecord, RunStatus};

/// What happened to one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryOutcome {
    pub repository: RepoRef,
    /// Terminal status; [`LoopStatus::Error`] when the loop never ran.
    pub status: LoopStatus,
    /// Local checkout, if one was made.
    pub repo_path: Option<PathBuf>,
    /// Changes made by the feature pass.
    #[serde(default)]
    pub feature_fixes: Vec<AppliedFix>,
    /// Result of the validate/repair loop, if it ran.
    pub repair: Option<RepairLoopResult>,
    /// Result of publishing the changes, if attempted.
    pub pull_request: Option<PullRequestOutcome>,
    /// Why the repository could not be processed.
    pub error: Option<String>,
}

impl RepositoryOutcome {
    fn errored(repository: &RepoRef, repo_path: Option<PathBuf>, error: impl ToString) -> Self {
        Self {
            repository: repository.clone(),
            status: LoopStatus::Error,
            repo_path,
            feature_fixes: Vec::new(),
            repair: None,
            pull_request: None,
            error: Some(error.to_string()),
        }
    }

    /// Feature changes followed by repair changes.
    pub fn applied_fixes(&self) -> Vec<AppliedFix> {
        let mut fixes = self.feature_fixes.clone();
        if let Some(repair) = &self.repair {
            fixes.extend(repair.applied_fixes());
        }
        fixes
    }

    /// The last validation report, if validation ran.
    pub fn final_report(&self) -> Option<&ValidationReport> {
        self.repair.as_ref().map(|r| &r.final_report)
    }

    /// Repair attempts made.
    pub fn attempts(&self) -> usize {
        self.repair.as_ref().map_or(0, |r| r.attempts.len())
    }
}

/// Outcomes of one run over every repository in a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub prompt: ParsedPrompt,
    pub outcomes: Vec<RepositoryOutcome>,
}

impl RunSummary {
    /// True when every repository ended passed or fixed.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    /// Number of repositories that ended with `status`.
    pub fn count(&self, status: LoopStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Sequential per-repository driver.
pub struct Orchestrator<E: ContainerEngine> {
    pipeline: Pipeline<E>,
    repair_loop: RepairLoop,
    checkout: Arc<dyn RepositoryCheckout>,
    repair: Arc<dyn RepairOperation>,
    store: Arc<dyn ResultStore>,
    feature: Option<Arc<dyn FeatureOperation>>,
    publisher: Option<Arc<dyn PullRequestPublisher>>,
}

impl<E: ContainerEngine> Orchestrator<E> {
    /// Creates an orchestrator that validates and repairs but neither runs a
    /// feature pass nor opens pull requests.
    pub fn new(
        pipeline: Pipeline<E>,
        checkout: Arc<dyn RepositoryCheckout>,
        repair: Arc<dyn RepairOperation>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            pipeline,
            repair_loop: RepairLoop::default(),
            checkout,
            repair,
            store,
            feature: None,
            publisher: None,
        }
    }

    pub fn with_repair_loop(mut self, repair_loop: RepairLoop) -> Self {
        self.repair_loop = repair_loop;
        self
    }

    /// Enables the feature pass for prompts given in DSL form.
    pub fn with_feature(mut self, feature: Arc<dyn FeatureOperation>) -> Self {
        self.feature = Some(feature);
        self
    }

    /// Enables pull requests for repositories that end with changes.
    pub fn with_publisher(mut self, publisher: Arc<dyn PullRequestPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Processes every repository in `prompt`, in order.
    pub async fn process(&self, prompt: &ParsedPrompt, run_id: &str) -> RunSummary {
        tracing::info!(
            run_id = %run_id,
            repositories = prompt.repositories.len(),
            mode = ?prompt.mode,
            "starting run"
        );

        let mut outcomes = Vec::with_capacity(prompt.repositories.len());
        for repo in &prompt.repositories {
            outcomes.push(self.process_repository(prompt, repo, run_id).await);
        }

        let summary = RunSummary {
            run_id: run_id.to_string(),
            prompt: prompt.clone(),
            outcomes,
        };

        tracing::info!(
            run_id = %run_id,
            passed = summary.count(LoopStatus::Passed),
            fixed = summary.count(LoopStatus::Fixed),
            unfixable = summary.count(LoopStatus::Unfixable),
            errors = summary.count(LoopStatus::Error),
            "run finished"
        );

        summary
    }

    async fn process_repository(
        &self,
        prompt: &ParsedPrompt,
        repo: &RepoRef,
        run_id: &str,
    ) -> RepositoryOutcome {
        let intent = feature_intent(prompt);
        let record = RunRecord::running(run_id, repo.full_name())
            .with_prompts(Some(prompt.original_prompt.clone()), intent.map(str::to_string));
        self.persist(&record);

        let outcome = self.drive(repo, intent).await;

        let status = if outcome.status.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let results = serde_json::to_value(&outcome)
            .unwrap_or_else(|e| serde_json::json!({ "serialization_error": e.to_string() }));
        self.persist(&record.finish(status, results));

        outcome
    }

    async fn drive(&self, repo: &RepoRef, intent: Option<&str>) -> RepositoryOutcome {
        let repo_path = match self.checkout.checkout(repo).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(repo = %repo, error = %e, "checkout failed");
                return RepositoryOutcome::errored(repo, None, e);
            }
        };

        let mut feature_fixes = Vec::new();
        if let (Some(feature), Some(intent)) = (&self.feature, intent) {
            tracing::info!(repo = %repo, operation = %feature.name(), "applying requested change");
            match feature.apply(&repo_path, repo, intent).await {
                Ok(fixes) => feature_fixes = fixes,
                Err(e) => {
                    tracing::error!(repo = %repo, error = %e, "feature pass failed");
                    return RepositoryOutcome::errored(repo, Some(repo_path), e);
                }
            }
        }

        let request = ValidationRequest::new(&repo_path);
        if let Err(e) = request.validate().into_result() {
            return RepositoryOutcome::errored(repo, Some(repo_path), e);
        }

        let result = self
            .repair_loop
            .validate_and_repair(&self.pipeline, &request, self.repair.as_ref(), intent)
            .await;

        let mut outcome = RepositoryOutcome {
            repository: repo.clone(),
            status: result.status,
            repo_path: Some(repo_path),
            feature_fixes,
            error: result.error.clone(),
            repair: Some(result),
            pull_request: None,
        };

        outcome.pull_request = self.publish(&outcome).await;
        outcome
    }

    /// Opens a pull request on the blocking pool; git and gh calls are sync.
    async fn publish(&self, outcome: &RepositoryOutcome) -> Option<PullRequestOutcome> {
        let publisher = Arc::clone(self.publisher.as_ref()?);
        let repo_path = outcome.repo_path.clone()?;

        let fixes = outcome.applied_fixes();
        if fixes.is_empty() {
            tracing::debug!(repo = %outcome.repository, "no changes to publish");
            return None;
        }
        if !outcome.status.is_success() {
            tracing::info!(
                repo = %outcome.repository,
                status = ?outcome.status,
                "leaving changes unpublished"
            );
            return None;
        }

        let report = outcome
            .final_report()
            .map(|r| r.report.clone())
            .unwrap_or_default();
        let repo = outcome.repository.clone();

        let task = tokio::task::spawn_blocking(move || {
            publisher.publish(&repo_path, &repo, &fixes, &report)
        });
        match task.await {
            Ok(pr) => Some(pr),
            Err(e) => {
                tracing::warn!(repo = %outcome.repository, error = %e, "pull request task failed");
                None
            }
        }
    }

    fn persist(&self, record: &RunRecord) {
        if let Err(e) = self.store.upsert(record) {
            tracing::warn!(
                run_id = %record.run_id,
                repo = %record.repository_name,
                error = %e,
                "failed to store run record"
            );
        }
    }
}

/// The instruction handed to agents: the action intent of a DSL prompt.
fn feature_intent(prompt: &ParsedPrompt) -> Option<&str> {
    match prompt.mode {
        PromptMode::Dsl if !prompt.action_intent.trim().is_empty() => {
            Some(prompt.action_intent.trim())
        }
        _ => None,
    }
}
