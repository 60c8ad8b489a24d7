//! Bounded validate → repair → re-validate loop.
//!
//! The loop starts from a validation report. A failing report is handed to a
//! [`RepairOperation`], after which the whole pipeline runs again. The loop
//! ends when a report passes, when the attempt budget is spent, or when the
//! repair operation itself errors.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::pipeline::{Pipeline, ValidationReport, ValidationRequest};

/// Repair attempts allowed per repository by default.
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u32 = 3;

/// A change a repair operation made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    /// File that was changed, relative to the repository root.
    pub file: String,
    /// What was changed.
    pub description: String,
}

impl AppliedFix {
    pub fn new(file: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            description: description.into(),
        }
    }
}

/// Input to a repair operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    /// Repository to edit.
    pub repo_path: PathBuf,
    /// Stage error excerpts from the failing report.
    pub errors: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// What the user originally asked for, if anything beyond validation.
    #[serde(default)]
    pub intent: Option<String>,
}

/// What a repair operation reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOutcome {
    /// Changes made.
    pub applied_fixes: Vec<AppliedFix>,
    /// Whether the repository should be validated again.
    pub needs_revalidation: bool,
}

/// Something that edits a repository to address validation errors.
#[async_trait]
pub trait RepairOperation: Send + Sync {
    /// Attempts a repair. An `Err` ends the loop with [`LoopStatus::Error`].
    async fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome>;

    /// Returns the name of this operation.
    fn name(&self) -> &str;
}

/// States of the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Inspecting the latest report.
    Validating,
    /// Report failed; deciding whether another attempt is allowed.
    NeedsRepair,
    /// Running the repair operation and re-validating.
    Repairing,
    /// First report passed.
    Passed,
    /// A later report passed.
    Fixed,
    /// Attempts exhausted or the repair made nothing to re-validate.
    Unfixable,
    /// The repair operation failed outright.
    Error,
}

impl LoopState {
    /// Terminal status for a final state.
    pub fn status(&self) -> Option<LoopStatus> {
        match self {
            LoopState::Passed => Some(LoopStatus::Passed),
            LoopState::Fixed => Some(LoopStatus::Fixed),
            LoopState::Unfixable => Some(LoopStatus::Unfixable),
            LoopState::Error => Some(LoopStatus::Error),
            LoopState::Validating | LoopState::NeedsRepair | LoopState::Repairing => None,
        }
    }
}

/// Final status of a repository after the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Passed,
    Fixed,
    Unfixable,
    Error,
}

impl LoopStatus {
    /// True for `passed` and `fixed`.
    pub fn is_success(&self) -> bool {
        matches!(self, LoopStatus::Passed | LoopStatus::Fixed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Passed => "passed",
            LoopStatus::Fixed => "fixed",
            LoopStatus::Unfixable => "unfixable",
            LoopStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One repair iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Errors handed to the repair operation.
    pub errors: String,
    /// Fixes the operation reported.
    pub applied_fixes: Vec<AppliedFix>,
    /// Report from the re-validation that followed, if one ran.
    pub report: Option<ValidationReport>,
}

/// Outcome of a repair loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairLoopResult {
    /// Terminal status.
    pub status: LoopStatus,
    /// Attempts made, in order.
    pub attempts: Vec<RepairAttempt>,
    /// The most recent report.
    pub final_report: ValidationReport,
    /// Set when the loop ended in [`LoopStatus::Error`].
    pub error: Option<String>,
}

impl RepairLoopResult {
    /// Every fix applied across all attempts.
    pub fn applied_fixes(&self) -> Vec<AppliedFix> {
        self.attempts
            .iter()
            .flat_map(|a| a.applied_fixes.iter().cloned())
            .collect()
    }
}

/// Drives the bounded repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairLoop {
    max_attempts: u32,
}

impl Default for RepairLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPAIR_ATTEMPTS)
    }
}

impl RepairLoop {
    /// Creates a loop allowing at most `max_attempts` repairs.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Maximum repair attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Validates `request` once, then repairs as needed.
    pub async fn validate_and_repair<E, R>(
        &self,
        pipeline: &Pipeline<E>,
        request: &ValidationRequest,
        repair: &R,
        intent: Option<&str>,
    ) -> RepairLoopResult
    where
        E: ContainerEngine,
        R: RepairOperation + ?Sized,
    {
        let report = pipeline.validate(request).await;
        self.run(pipeline, request, repair, report, intent).await
    }

    /// Runs the loop starting from an existing report.
    pub async fn run<E, R>(
        &self,
        pipeline: &Pipeline<E>,
        request: &ValidationRequest,
        repair: &R,
        initial: ValidationReport,
        intent: Option<&str>,
    ) -> RepairLoopResult
    where
        E: ContainerEngine,
        R: RepairOperation + ?Sized,
    {
        let mut state = LoopState::Validating;
        let mut report = initial;
        let mut attempts: Vec<RepairAttempt> = Vec::new();
        let mut error = None;

        let status = loop {
            if let Some(status) = state.status() {
                break status;
            }

            tracing::debug!(repo = %report.repository, state = ?state, attempts = attempts.len(), "repair loop step");

            state = match state {
                LoopState::Validating if report.passed() => {
                    if attempts.is_empty() {
                        LoopState::Passed
                    } else {
                        LoopState::Fixed
                    }
                }
                LoopState::Validating => LoopState::NeedsRepair,
                LoopState::NeedsRepair if (attempts.len() as u32) < self.max_attempts => {
                    LoopState::Repairing
                }
                LoopState::NeedsRepair => {
                    tracing::warn!(
                        repo = %report.repository,
                        max_attempts = self.max_attempts,
                        "repair attempts exhausted"
                    );
                    LoopState::Unfixable
                }
                LoopState::Repairing => {
                    let attempt = attempts.len() as u32 + 1;
                    let repair_request = RepairRequest {
                        repo_path: request.repo_path.clone(),
                        errors: report.error_summary(),
                        attempt,
                        intent: intent.map(str::to_string),
                    };

                    tracing::info!(
                        repo = %report.repository,
                        attempt,
                        operation = %repair.name(),
                        "attempting repair"
                    );

                    match repair.repair(&repair_request).await {
                        Err(e) => {
                            tracing::error!(repo = %report.repository, error = %e, "repair operation failed");
                            error = Some(e.to_string());
                            LoopState::Error
                        }
                        Ok(outcome) => {
                            let needs_revalidation = outcome.needs_revalidation;
                            attempts.push(RepairAttempt {
                                attempt,
                                errors: repair_request.errors,
                                applied_fixes: outcome.applied_fixes,
                                report: None,
                            });

                            if needs_revalidation {
                                report = pipeline.validate(request).await;
                                if let Some(last) = attempts.last_mut() {
                                    last.report = Some(report.clone());
                                }
                                LoopState::Validating
                            } else {
                                tracing::warn!(repo = %report.repository, attempt, "repair made no changes to validate");
                                LoopState::Unfixable
                            }
                        }
                    }
                }
                terminal => terminal,
            };
        };

        tracing::info!(
            repo = %report.repository,
            status = ?status,
            attempts = attempts.len(),
            "repair loop finished"
        );

        RepairLoopResult {
            status,
            attempts,
            final_report: report,
            error,
        }
    }
}
