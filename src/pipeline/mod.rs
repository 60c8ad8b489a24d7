//! Docker validation pipeline.
//!
//! Locate a Dockerfile, build it, start a container, read its logs, and
//! fold the results into a [`ValidationReport`]. Stages run strictly in
//! order and the pipeline stops at the first failing stage. Stage failures
//! are data, never errors.

mod locator;
pub mod report;

pub use locator::{locate_dockerfiles, LocateResult, DOCKERFILE_NAME};
pub use report::{
    generate_report, tail_lines, ReportStatus, Stage, StageOutcomes, ValidationReport,
    ERROR_EXCERPT_LINES,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{is_platform, DockhandConfig, Validate, ValidationResult};
use crate::engine::{BuildSpec, ContainerEngine, RunSpec};

/// Lines of build output kept when a build fails.
pub const BUILD_OUTPUT_TAIL: usize = 50;

/// Platform used when a request does not name one.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Input to one validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Location of the checked-out repository.
    pub repo_path: PathBuf,
    /// Image tag; derived from the directory name when absent.
    #[serde(default)]
    pub image_name: Option<String>,
    /// Target platform; the pipeline default when absent.
    #[serde(default)]
    pub platform: Option<String>,
    /// Port mappings passed to the container.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command overriding the image default.
    #[serde(default)]
    pub command: Option<String>,
}

impl ValidationRequest {
    /// Creates a request for the repository at `repo_path`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            image_name: None,
            platform: None,
            ports: Vec::new(),
            env: BTreeMap::new(),
            command: None,
        }
    }

    /// Sets the image name.
    pub fn with_image_name(mut self, image_name: impl Into<String>) -> Self {
        self.image_name = Some(image_name.into());
        self
    }

    /// Sets the target platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Adds a port mapping.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.ports.push(port.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the override command.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Name of the repository directory.
    pub fn repository_name(&self) -> String {
        repo_dir_name(&self.repo_path)
    }
}

impl Validate for ValidationRequest {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.repo_path.as_os_str().is_empty() {
            result.add_error("repo_path cannot be empty");
        }

        if let Some(image) = &self.image_name {
            if image.is_empty() || image.chars().any(|c| c.is_whitespace() || c.is_uppercase()) {
                result.add_error(format!(
                    "image_name '{}' must be non-empty lowercase without whitespace",
                    image
                ));
            }
        }

        if let Some(platform) = &self.platform {
            if !is_platform(platform) {
                result.add_error(format!("platform '{}' is not of the form os/arch", platform));
            }
        }

        for port in &self.ports {
            if !is_port_mapping(port) {
                result.add_error(format!("invalid port mapping '{}'", port));
            }
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
                result.add_error(format!("invalid environment variable name '{}'", key));
            }
        }

        if matches!(&self.command, Some(cmd) if cmd.trim().is_empty()) {
            result.add_warning("command is blank and will be ignored");
        }

        result
    }
}

/// Returns true for `[ip:][host:]container[/proto]` mappings.
pub fn is_port_mapping(value: &str) -> bool {
    let (ports, proto) = match value.split_once('/') {
        Some((ports, proto)) => (ports, Some(proto)),
        None => (value, None),
    };
    if !matches!(proto, None | Some("tcp") | Some("udp") | Some("sctp")) {
        return false;
    }

    let is_port = |s: &str| {
        !s.is_empty()
            && s.split('-').count() <= 2
            && s.split('-').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    };

    let parts: Vec<&str> = ports.split(':').collect();
    match parts.as_slice() {
        [container] => is_port(*container),
        [host, container] => is_port(*host) && is_port(*container),
        [ip, host, container] => {
            !ip.is_empty() && (host.is_empty() || is_port(*host)) && is_port(*container)
        }
        _ => false,
    }
}

/// Outcome of the build stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildResult {
    /// A successful build of `image_name`.
    pub fn ok(image_name: impl Into<String>) -> Self {
        Self {
            success: true,
            image_name: Some(image_name.into()),
            error: None,
        }
    }

    /// A failed build.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_name: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of the run stage.
///
/// Port, env, and command are carried through even on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    /// A failed run with no pass-through fields.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Outcome of the log stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Non-blank lines in `logs`.
    pub line_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogsResult {
    /// Successfully retrieved logs, possibly empty.
    pub fn ok(logs: String) -> Self {
        let line_count = logs.lines().filter(|l| !l.trim().is_empty()).count();
        Self {
            success: true,
            logs: Some(logs),
            line_count,
            error: None,
        }
    }

    /// Log retrieval failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            logs: None,
            line_count: 0,
            error: Some(error.into()),
        }
    }
}

/// Tunables for a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Platform used when the request has none.
    pub platform: String,
    /// Log lines to fetch.
    pub log_tail: usize,
    /// Pause before reading logs.
    pub settle_delay: Duration,
    /// Limit on the log read.
    pub log_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            platform: DEFAULT_PLATFORM.to_string(),
            log_tail: 100,
            settle_delay: Duration::from_secs(1),
            log_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DockhandConfig> for PipelineOptions {
    fn from(config: &DockhandConfig) -> Self {
        Self {
            platform: config.platform.clone(),
            log_tail: config.log_tail,
            settle_delay: config.settle_delay(),
            log_timeout: config.log_timeout(),
        }
    }
}

/// Runs validation stages against a container engine.
pub struct Pipeline<E: ContainerEngine> {
    engine: E,
    options: PipelineOptions,
}

impl<E: ContainerEngine> Pipeline<E> {
    /// Creates a pipeline.
    pub fn new(engine: E, options: PipelineOptions) -> Self {
        Self { engine, options }
    }

    /// Returns the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Returns the options.
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Builds `dockerfile` for `platform`, tagged `image_name`.
    ///
    /// The build context is the Dockerfile's directory.
    pub async fn build_image(&self, dockerfile: &Path, image_name: &str, platform: &str) -> BuildResult {
        let context = dockerfile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let spec = BuildSpec {
            dockerfile: dockerfile.to_path_buf(),
            context,
            image_name: image_name.to_string(),
            platform: platform.to_string(),
        };

        match self.engine.build(&spec).await {
            Ok(output) if output.success => BuildResult::ok(image_name),
            Ok(output) => {
                tracing::warn!(image = %image_name, "image build failed");
                BuildResult::failed(tail_lines(&output.combined(), BUILD_OUTPUT_TAIL))
            }
            Err(e) => BuildResult::failed(e.to_string()),
        }
    }

    /// Starts a detached container from a successful build.
    ///
    /// A failed build is forwarded without touching the engine.
    pub async fn run_container(
        &self,
        build: &BuildResult,
        container_name: &str,
        ports: &[String],
        env: &BTreeMap<String, String>,
        command: Option<&str>,
    ) -> RunResult {
        let mut result = RunResult {
            container_name: Some(container_name.to_string()),
            ports: ports.to_vec(),
            env: env.clone(),
            command: command.map(str::to_string),
            ..Default::default()
        };

        let image_name = match (&build.image_name, build.success) {
            (Some(image), true) => image.clone(),
            _ => {
                tracing::debug!(container = %container_name, "build failed, not starting container");
                result.error = Some(
                    build
                        .error
                        .clone()
                        .unwrap_or_else(|| "image was not built".to_string()),
                );
                return result;
            }
        };

        let spec = RunSpec {
            image_name,
            container_name: container_name.to_string(),
            ports: ports.to_vec(),
            env: env.clone(),
            command: command.filter(|c| !c.trim().is_empty()).map(str::to_string),
        };

        match self.engine.run(&spec).await {
            Ok(output) if output.success => {
                let container_id = output.stdout.trim().to_string();
                if container_id.is_empty() {
                    result.error = Some("container engine returned no container id".to_string());
                } else {
                    result.success = true;
                    result.container_id = Some(container_id);
                }
            }
            Ok(output) => {
                tracing::warn!(container = %container_name, "container failed to start");
                result.error = Some(output.combined().trim().to_string());
            }
            Err(e) => result.error = Some(e.to_string()),
        }

        result
    }

    /// Waits for the settle delay, then reads the container's recent logs.
    ///
    /// Empty logs are a success; only a failed or timed-out read is not.
    pub async fn collect_logs(&self, run: &RunResult) -> LogsResult {
        let container_id = match (&run.container_id, run.success) {
            (Some(id), true) => id.clone(),
            _ => {
                return LogsResult::failed(
                    run.error
                        .clone()
                        .unwrap_or_else(|| "container was not started".to_string()),
                )
            }
        };

        tokio::time::sleep(self.options.settle_delay).await;

        let read = self.engine.logs(&container_id, self.options.log_tail);
        match tokio::time::timeout(self.options.log_timeout, read).await {
            Ok(Ok(output)) if output.success => {
                let result = LogsResult::ok(output.combined());
                tracing::debug!(container = %container_id, lines = result.line_count, "collected logs");
                result
            }
            Ok(Ok(output)) => LogsResult::failed(output.combined().trim().to_string()),
            Ok(Err(e)) => LogsResult::failed(e.to_string()),
            Err(_) => LogsResult::failed(format!(
                "timed out reading logs after {}s",
                self.options.log_timeout.as_secs_f64()
            )),
        }
    }

    /// Runs every stage for `request` and returns the report.
    pub async fn validate(&self, request: &ValidationRequest) -> ValidationReport {
        let repository = request.repository_name();
        let mut stages = StageOutcomes {
            repo_path: Some(request.repo_path.clone()),
            ..Default::default()
        };

        tracing::info!(repo = %repository, path = ?request.repo_path, "validating repository");

        let root = request.repo_path.clone();
        let located = tokio::task::spawn_blocking(move || locate_dockerfiles(&root))
            .await
            .unwrap_or_else(|e| LocateResult::failed(format!("dockerfile search aborted: {}", e)));
        let Some(dockerfile) = located.first().cloned() else {
            stages.build = Some(BuildResult::failed(
                located
                    .error
                    .unwrap_or_else(|| "No Dockerfiles found".to_string()),
            ));
            return generate_report(&repository, stages);
        };
        stages.dockerfile = Some(dockerfile.clone());

        let image_name = request
            .image_name
            .clone()
            .unwrap_or_else(|| derive_image_name(&request.repo_path));
        let platform = request.platform.as_deref().unwrap_or(&self.options.platform);

        let build = self.build_image(&dockerfile, &image_name, platform).await;
        if !build.success {
            stages.build = Some(build);
            return generate_report(&repository, stages);
        }

        let container_name = derive_container_name(&request.repo_path);
        let run = self
            .run_container(
                &build,
                &container_name,
                &request.ports,
                &request.env,
                request.command.as_deref(),
            )
            .await;
        stages.build = Some(build);
        if !run.success {
            stages.run = Some(run);
            return generate_report(&repository, stages);
        }

        let logs = self.collect_logs(&run).await;
        stages.run = Some(run);
        stages.logs = Some(logs);

        let report = generate_report(&repository, stages);
        tracing::info!(repo = %repository, status = ?report.status, "validation finished");
        report
    }
}

/// Last path component of `path`, or `repo` if there is none.
pub fn repo_dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "repo".to_string())
}

/// Replaces characters not allowed in image/container names with `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// `<dir-name-lowercased>-<epoch-millis>`.
pub fn derive_image_name(repo_path: &Path) -> String {
    format!(
        "{}-{}",
        sanitize_name(&repo_dir_name(repo_path).to_lowercase()),
        chrono::Utc::now().timestamp_millis()
    )
}

/// `<dir-name>-container-<epoch-millis>`.
pub fn derive_container_name(repo_path: &Path) -> String {
    format!(
        "{}-container-{}",
        sanitize_name(&repo_dir_name(repo_path).to_lowercase()),
        chrono::Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_fields() {
        let request = ValidationRequest::new("/repos/worker-basic")
            .with_platform("linux/arm64")
            .with_port("8080:80")
            .with_env("MODE", "test")
            .with_command("python handler.py");

        assert_eq!(request.repository_name(), "worker-basic");
        assert_eq!(request.platform.as_deref(), Some("linux/arm64"));
        assert_eq!(request.ports, vec!["8080:80"]);
        assert_eq!(request.env.get("MODE").map(String::as_str), Some("test"));
        assert!(request.validate().is_valid());
    }

    #[test]
    fn request_validation_rejects_bad_fields() {
        let request = ValidationRequest::new("/r")
            .with_image_name("Bad Name")
            .with_port("http")
            .with_env("A=B", "x");

        let result = request.validate();
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: ValidationRequest =
            serde_json::from_str(r#"{"repo_path": "/repos/worker-basic"}"#).unwrap();

        assert_eq!(request, ValidationRequest::new("/repos/worker-basic"));
    }

    #[test]
    fn port_mapping_shapes() {
        assert!(is_port_mapping("80"));
        assert!(is_port_mapping("8080:80"));
        assert!(is_port_mapping("8080:80/udp"));
        assert!(is_port_mapping("127.0.0.1:8080:80"));
        assert!(is_port_mapping("127.0.0.1::80"));
        assert!(is_port_mapping("8000-8010:8000-8010"));
        assert!(!is_port_mapping("80/http"));
        assert!(!is_port_mapping("a:b"));
        assert!(!is_port_mapping(""));
    }

    #[test]
    fn sanitize_replaces_disallowed_chars() {
        assert_eq!(sanitize_name("my repo@v2"), "my-repo-v2");
        assert_eq!(sanitize_name("worker_basic.x-1"), "worker_basic.x-1");
    }

    #[test]
    fn derived_names_use_lowercased_dir_name() {
        let image = derive_image_name(Path::new("/repos/Worker-Basic"));
        let container = derive_container_name(Path::new("/repos/Worker Basic"));

        assert!(image.starts_with("worker-basic-"));
        assert!(image["worker-basic-".len()..].chars().all(|c| c.is_ascii_digit()));
        assert!(container.starts_with("worker-basic-container-"));
    }

    #[test]
    fn repo_dir_name_falls_back() {
        assert_eq!(repo_dir_name(Path::new("/")), "repo");
        assert_eq!(repo_dir_name(Path::new("/a/b")), "b");
    }

    #[test]
    fn logs_result_counts_non_blank_lines() {
        let result = LogsResult::ok("one\n\n  \ntwo\n".to_string());
        assert_eq!(result.line_count, 2);

        let empty = LogsResult::ok(String::new());
        assert!(empty.success);
        assert_eq!(empty.line_count, 0);
    }
}
