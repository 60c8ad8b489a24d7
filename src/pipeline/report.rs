//! Validation report synthesis.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{BuildResult, LogsResult, RunResult};

/// Lines of a stage error kept in the report.
pub const ERROR_EXCERPT_LINES: usize = 8;

/// A pipeline stage that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Dockerfile search and image build.
    Build,
    /// Container start.
    Run,
    /// Log retrieval.
    Logs,
}

impl Stage {
    /// Stage key as used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Run => "run",
            Stage::Logs => "logs",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall verdict of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Passed,
    Failed,
}

/// Whatever the pipeline produced before it finished or stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcomes {
    /// Repository that was validated.
    pub repo_path: Option<PathBuf>,
    /// Dockerfile selected for the build.
    pub dockerfile: Option<PathBuf>,
    /// Build stage result, if the stage ran.
    pub build: Option<BuildResult>,
    /// Run stage result, if the stage ran.
    pub run: Option<RunResult>,
    /// Log stage result, if the stage ran.
    pub logs: Option<LogsResult>,
}

impl StageOutcomes {
    /// Error carried by a stage that ran and failed.
    pub fn stage_error(&self, stage: Stage) -> Option<&str> {
        let (success, error) = match stage {
            Stage::Build => self.build.as_ref().map(|r| (r.success, &r.error))?,
            Stage::Run => self.run.as_ref().map(|r| (r.success, &r.error))?,
            Stage::Logs => self.logs.as_ref().map(|r| (r.success, &r.error))?,
        };
        if success {
            return None;
        }
        error.as_deref()
    }

    /// True when every stage ran and reported success.
    ///
    /// A successful build must carry an image name and a successful run a
    /// container id. Log content is irrelevant; only retrieval matters.
    pub fn all_steps_completed(&self) -> bool {
        let built = self
            .build
            .as_ref()
            .is_some_and(|b| b.success && b.image_name.as_deref().is_some_and(|n| !n.is_empty()));
        let started = self
            .run
            .as_ref()
            .is_some_and(|r| r.success && r.container_id.as_deref().is_some_and(|id| !id.is_empty()));
        let logged = self.logs.as_ref().is_some_and(|l| l.success);

        self.repo_path.is_some() && self.dockerfile.is_some() && built && started && logged
    }
}

/// The terminal artifact of one validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Repository name.
    pub repository: String,
    /// Overall verdict.
    pub status: ReportStatus,
    /// Last lines of each failed stage's error.
    pub errors: BTreeMap<Stage, String>,
    /// Stage results the report was built from.
    pub stages: StageOutcomes,
    /// Human-readable report.
    pub report: String,
}

impl ValidationReport {
    /// Returns true if the repository passed validation.
    pub fn passed(&self) -> bool {
        self.status == ReportStatus::Passed
    }

    /// Stage errors joined into one block, suitable as repair input.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() && !self.passed() {
            return "validation did not complete all stages".to_string();
        }
        self.errors
            .iter()
            .map(|(stage, excerpt)| format!("{}: {}", stage, excerpt))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Builds a report from stage outcomes.
///
/// Never fails: missing upstream data yields a failing report.
pub fn generate_report(repository: &str, stages: StageOutcomes) -> ValidationReport {
    let errors: BTreeMap<Stage, String> = [Stage::Build, Stage::Run, Stage::Logs]
        .into_iter()
        .filter_map(|stage| {
            stages
                .stage_error(stage)
                .map(|error| (stage, tail_lines(error, ERROR_EXCERPT_LINES)))
        })
        .collect();

    let has_errors = !errors.is_empty();
    let status = if !has_errors && stages.all_steps_completed() {
        ReportStatus::Passed
    } else {
        ReportStatus::Failed
    };

    let report = render(repository, status, &errors);

    ValidationReport {
        repository: repository.to_string(),
        status,
        errors,
        stages,
        report,
    }
}

fn render(repository: &str, status: ReportStatus, errors: &BTreeMap<Stage, String>) -> String {
    let mut text = String::new();

    text.push_str(&format!("Repository: {}\n", repository));
    match status {
        ReportStatus::Passed => text.push_str("Status: ✅ PASSED\n"),
        ReportStatus::Failed => text.push_str("Status: ❌ FAILED\n"),
    }

    if status == ReportStatus::Failed {
        if errors.is_empty() {
            text.push_str("Not all validation steps completed.\n");
        } else {
            text.push_str("Errors:\n");
            for (stage, excerpt) in errors {
                let indented = excerpt.lines().collect::<Vec<_>>().join("\n  ");
                text.push_str(&format!("- {}: {}\n", stage, indented));
            }
        }
    }

    text
}

/// Returns the last `n` lines of `text`, ignoring trailing blank lines.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
