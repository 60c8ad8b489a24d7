//! Docker CLI engine.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::{BuildSpec, ContainerEngine, EngineOutput, RunSpec};

/// Engine backed by the `docker` command line client.
pub struct DockerCli {
    /// Path to the docker binary.
    cli_path: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Creates an engine using the default `docker` command.
    pub fn new() -> Self {
        Self {
            cli_path: "docker".to_string(),
        }
    }

    /// Creates an engine with a custom CLI path (e.g. `podman`).
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn build_args(spec: &BuildSpec) -> Vec<String> {
        vec![
            "build".to_string(),
            "--platform".to_string(),
            spec.platform.clone(),
            "-t".to_string(),
            spec.image_name.clone(),
            "-f".to_string(),
            spec.dockerfile.display().to_string(),
            spec.context.display().to_string(),
        ]
    }

    fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
        ];

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image_name.clone());

        if let Some(command) = &spec.command {
            args.extend(command.split_whitespace().map(str::to_string));
        }

        args
    }

    fn logs_args(container_id: &str, tail: usize) -> Vec<String> {
        vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container_id.to_string(),
        ]
    }

    async fn exec(&self, args: Vec<String>) -> Result<EngineOutput> {
        tracing::debug!(cli = %self.cli_path, args = ?args, "invoking container CLI");

        let output = Command::new(&self.cli_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to run {}: {}", self.cli_path, e)))?;

        Ok(EngineOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn build(&self, spec: &BuildSpec) -> Result<EngineOutput> {
        tracing::info!(
            image = %spec.image_name,
            dockerfile = ?spec.dockerfile,
            platform = %spec.platform,
            "building image"
        );
        self.exec(Self::build_args(spec)).await
    }

    async fn run(&self, spec: &RunSpec) -> Result<EngineOutput> {
        tracing::info!(
            image = %spec.image_name,
            container = %spec.container_name,
            "starting container"
        );
        self.exec(Self::run_args(spec)).await
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<EngineOutput> {
        self.exec(Self::logs_args(container_id, tail)).await
    }

    fn name(&self) -> &str {
        &self.cli_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn build_args_include_platform_and_tag() {
        let spec = BuildSpec {
            dockerfile: PathBuf::from("/repo/Dockerfile"),
            context: PathBuf::from("/repo"),
            image_name: "worker-basic-1".to_string(),
            platform: "linux/amd64".to_string(),
        };

        let args = DockerCli::build_args(&spec);

        assert_eq!(
            args,
            vec![
                "build",
                "--platform",
                "linux/amd64",
                "-t",
                "worker-basic-1",
                "-f",
                "/repo/Dockerfile",
                "/repo"
            ]
        );
    }

    #[test]
    fn run_args_include_ports_env_and_command() {
        let mut spec = RunSpec {
            image_name: "img".to_string(),
            container_name: "img-container".to_string(),
            ports: vec!["8080:80".to_string()],
            command: Some("python handler.py --test".to_string()),
            ..Default::default()
        };
        spec.env.insert("MODE".to_string(), "test".to_string());

        let args = DockerCli::run_args(&spec);

        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "img-container",
                "-p",
                "8080:80",
                "-e",
                "MODE=test",
                "img",
                "python",
                "handler.py",
                "--test"
            ]
        );
    }

    #[test]
    fn logs_args_use_tail() {
        assert_eq!(
            DockerCli::logs_args("abc123", 100),
            vec!["logs", "--tail", "100", "abc123"]
        );
    }

    #[tokio::test]
    async fn missing_cli_is_an_engine_error() {
        let engine = DockerCli::with_cli_path("/nonexistent/dockhand-docker");

        let err = engine.logs("abc", 10).await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }
}
