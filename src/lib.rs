//! Dockhand - validates and repairs Docker worker repositories
//!
//! Given a prompt naming repositories, dockhand checks each one out, builds
//! its Dockerfile, starts a container, reads its logs and reports. Failing
//! repositories are handed to an LLM repair agent for a bounded number of
//! attempts, and repaired ones get a pull request.

pub mod agent;
pub mod checkout;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod pr;
pub mod prompt;
pub mod repair;
pub mod runner;
pub mod store;

pub use error::{Error, Result};

pub use agent::{AgentRepair, FeatureAgent, FeatureOperation, FeaturePromptBuilder, RepairPromptBuilder};
pub use checkout::{GitHubCheckout, LocalCheckout, RepositoryCheckout};
pub use config::{DockhandConfig, Validate, ValidationResult};
pub use engine::{BuildSpec, ContainerEngine, DockerCli, EngineOutput, RunSpec};
pub use orchestrator::{Orchestrator, RepositoryOutcome, RunSummary};
pub use pipeline::{
    generate_report, locate_dockerfiles, BuildResult, LocateResult, LogsResult, Pipeline,
    PipelineOptions, ReportStatus, RunResult, Stage, StageOutcomes, ValidationReport,
    ValidationRequest,
};
pub use pr::{GitHubPublisher, PRManager, PullRequest, PullRequestOutcome, PullRequestPublisher};
pub use prompt::{parse_prompt, parse_prompt_with_org, ParsedPrompt, PromptMode, RepoRef};
pub use repair::{
    AppliedFix, LoopState, LoopStatus, RepairAttempt, RepairLoop, RepairLoopResult,
    RepairOperation, RepairOutcome, RepairRequest,
};
pub use runner::{ClaudeRunner, GeminiRunner, LLMInvocation, LLMOutput, LLMResult, LLMRunner};
pub use store::{JsonFileStore, MemoryStore, ResultStore, RunRecord, RunStatus};
