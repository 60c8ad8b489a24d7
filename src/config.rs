//! Configuration loading and boundary validation.
//!
//! `DockhandConfig` is read from TOML with per-field defaults and can be
//! overridden from the environment. The [`Validate`] trait checks
//! configuration and requests before they reach the pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Known LLM runner identifiers.
pub const KNOWN_RUNNERS: &[&str] = &["claude", "gemini"];

/// Upper bound accepted for `max_repair_attempts`.
pub const MAX_REPAIR_ATTEMPTS_LIMIT: u32 = 10;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal issues.
    pub errors: Vec<String>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    ///
    /// Warnings are logged and returned on success.
    pub fn into_result(self) -> Result<Vec<String>> {
        for warning in &self.warnings {
            tracing::warn!(warning = %warning, "validation warning");
        }
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Types that can be checked before use.
pub trait Validate {
    /// Validates the value and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockhandConfig {
    /// Organization used for repository names given without one.
    #[serde(default = "default_org")]
    pub default_org: String,

    /// Target platform passed to image builds.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Number of log lines fetched from a container.
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,

    /// Pause before reading container logs, in milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Limit on the log read itself, in seconds.
    #[serde(default = "default_log_timeout_secs")]
    pub log_timeout_secs: u64,

    /// Repair attempts per repository before giving up.
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,

    /// Directory repositories are checked out into.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Directory run records are written to.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// LLM runner used by the sub-agents.
    #[serde(default = "default_runner")]
    pub runner: String,

    /// Model passed to the runner, if any.
    #[serde(default)]
    pub model: Option<String>,

    /// Limit on a single sub-agent run, in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Branch pull requests target.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Whether to open a pull request after applying fixes.
    #[serde(default = "default_create_pr")]
    pub create_pr: bool,

    /// Container CLI binary.
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,
}

fn default_org() -> String {
    crate::prompt::DEFAULT_ORG.to_string()
}

fn default_platform() -> String {
    "linux/amd64".to_string()
}

fn default_log_tail() -> usize {
    100
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_log_timeout_secs() -> u64 {
    5
}

fn default_max_repair_attempts() -> u32 {
    3
}

fn default_workdir() -> PathBuf {
    PathBuf::from("./repos")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from(".dockhand/runs")
}

fn default_runner() -> String {
    "claude".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    900
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_create_pr() -> bool {
    true
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

impl Default for DockhandConfig {
    fn default() -> Self {
        Self {
            default_org: default_org(),
            platform: default_platform(),
            log_tail: default_log_tail(),
            settle_delay_ms: default_settle_delay_ms(),
            log_timeout_secs: default_log_timeout_secs(),
            max_repair_attempts: default_max_repair_attempts(),
            workdir: default_workdir(),
            results_dir: default_results_dir(),
            runner: default_runner(),
            model: None,
            agent_timeout_secs: default_agent_timeout_secs(),
            base_branch: default_base_branch(),
            create_pr: default_create_pr(),
            docker_cli: default_docker_cli(),
        }
    }
}

impl DockhandConfig {
    /// Reads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = ?path, "loaded configuration");
        Ok(config)
    }

    /// Loads from `path` if given, otherwise defaults, then applies
    /// environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `DOCKHAND_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(runner) = lookup("DOCKHAND_RUNNER") {
            self.runner = runner;
        }
        if let Some(platform) = lookup("DOCKHAND_PLATFORM") {
            self.platform = platform;
        }
        if let Some(workdir) = lookup("DOCKHAND_WORKDIR") {
            self.workdir = PathBuf::from(workdir);
        }
        if let Some(attempts) = lookup("DOCKHAND_MAX_ATTEMPTS") {
            self.max_repair_attempts = attempts.parse().map_err(|_| {
                Error::Config(format!("DOCKHAND_MAX_ATTEMPTS is not a number: {}", attempts))
            })?;
        }
        Ok(self)
    }

    /// Settle delay as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Sub-agent run limit as a duration.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Log read timeout as a duration.
    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_secs)
    }
}

/// Returns true for `os/arch` or `os/arch/variant`.
pub fn is_platform(value: &str) -> bool {
    let parts: Vec<&str> = value.split('/').collect();
    (2..=3).contains(&parts.len()) && parts.iter().all(|p| !p.is_empty())
}

impl Validate for DockhandConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_repair_attempts == 0 {
            result.add_error("max_repair_attempts must be at least 1");
        }
        if self.max_repair_attempts > MAX_REPAIR_ATTEMPTS_LIMIT {
            result.add_error(format!(
                "max_repair_attempts must not exceed {}",
                MAX_REPAIR_ATTEMPTS_LIMIT
            ));
        }

        if self.log_tail == 0 {
            result.add_error("log_tail must be greater than 0");
        }

        if !is_platform(&self.platform) {
            result.add_error(format!("platform '{}' is not of the form os/arch", self.platform));
        }

        if self.default_org.trim().is_empty() {
            result.add_error("default_org cannot be empty");
        }

        if !KNOWN_RUNNERS.contains(&self.runner.as_str()) {
            result.add_error(format!(
                "unknown runner '{}' (expected one of: {})",
                self.runner,
                KNOWN_RUNNERS.join(", ")
            ));
        }

        if self.agent_timeout_secs == 0 {
            result.add_error("agent_timeout_secs must be greater than 0");
        }

        if self.log_timeout_secs == 0 {
            result.add_warning("log_timeout_secs = 0 will time out every log read");
        }

        if self.settle_delay_ms > 60_000 {
            result.add_warning("settle_delay_ms over a minute slows every validation");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn config_has_sensible_defaults() {
        let config = DockhandConfig::default();

        assert_eq!(config.default_org, "RunPod");
        assert_eq!(config.platform, "linux/amd64");
        assert_eq!(config.log_tail, 100);
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.log_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_repair_attempts, 3);
        assert_eq!(config.runner, "claude");
        assert!(config.create_pr);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn config_deserializes_partial_toml() {
        let toml = r#"
            platform = "linux/arm64"
            max_repair_attempts = 2
            runner = "gemini"
        "#;

        let config: DockhandConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.platform, "linux/arm64");
        assert_eq!(config.max_repair_attempts, 2);
        assert_eq!(config.runner, "gemini");
        assert_eq!(config.log_tail, 100);
        assert_eq!(config.base_branch, "main");
    }

    #[test]
    fn config_loads_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dockhand.toml");
        std::fs::write(&path, "default_org = \"acme\"\ncreate_pr = false\n").unwrap();

        let config = DockhandConfig::load(&path).unwrap();

        assert_eq!(config.default_org, "acme");
        assert!(!config.create_pr);
    }

    #[test]
    fn config_load_reports_bad_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dockhand.toml");
        std::fs::write(&path, "log_tail = \"many\"").unwrap();

        let err = DockhandConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("DOCKHAND_RUNNER", "gemini"),
            ("DOCKHAND_PLATFORM", "linux/arm64"),
            ("DOCKHAND_MAX_ATTEMPTS", "5"),
        ]
        .into_iter()
        .collect();

        let config = DockhandConfig::default()
            .with_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.runner, "gemini");
        assert_eq!(config.platform, "linux/arm64");
        assert_eq!(config.max_repair_attempts, 5);
    }

    #[test]
    fn env_override_rejects_bad_number() {
        let result = DockhandConfig::default().with_env_overrides(|key| {
            (key == "DOCKHAND_MAX_ATTEMPTS").then(|| "three".to_string())
        });

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_attempts_and_bad_platform() {
        let config = DockhandConfig {
            max_repair_attempts: 0,
            platform: "amd64".to_string(),
            ..Default::default()
        };

        let result = config.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn validate_rejects_unknown_runner() {
        let config = DockhandConfig {
            runner: "gpt".to_string(),
            ..Default::default()
        };

        assert!(config.validate().into_result().is_err());
    }

    #[test]
    fn validation_result_merges() {
        let mut a = ValidationResult::default();
        a.add_error("one");
        let mut b = ValidationResult::default();
        b.add_warning("two");

        a.merge(b);

        assert_eq!(a.errors, vec!["one"]);
        assert_eq!(a.warnings, vec!["two"]);
    }

    #[test]
    fn platform_shapes() {
        assert!(is_platform("linux/amd64"));
        assert!(is_platform("linux/arm/v7"));
        assert!(!is_platform("linux"));
        assert!(!is_platform("linux/"));
    }
}
