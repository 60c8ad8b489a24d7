//! Container engine boundary.
//!
//! The pipeline talks to the container runtime only through
//! [`ContainerEngine`]. [`DockerCli`] drives the local `docker` binary.

mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Image build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Dockerfile to build.
    pub dockerfile: PathBuf,
    /// Build context directory.
    pub context: PathBuf,
    /// Tag for the resulting image.
    pub image_name: String,
    /// Target platform, e.g. `linux/amd64`.
    pub platform: String,
}

/// Container start parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Image to start.
    pub image_name: String,
    /// Name given to the container.
    pub container_name: String,
    /// Port mappings in `[host:]container[/proto]` form.
    pub ports: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Command overriding the image entrypoint arguments.
    pub command: Option<String>,
}

/// Captured output of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl EngineOutput {
    /// Creates a successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed output with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr, skipping empty streams.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// A container runtime the pipeline can build, run, and read logs with.
///
/// An `Err` means the engine could not be invoked at all; a command that
/// ran and failed is an `Ok` output with `success == false`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Builds an image and waits for completion.
    async fn build(&self, spec: &BuildSpec) -> Result<EngineOutput>;

    /// Starts a detached container. Stdout carries the container id.
    async fn run(&self, spec: &RunSpec) -> Result<EngineOutput>;

    /// Reads up to `tail` most recent log lines of a container.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<EngineOutput>;

    /// Returns the name of this engine.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_joins_both_streams() {
        let output = EngineOutput {
            success: false,
            stdout: "step 1\n".to_string(),
            stderr: "error: boom\n".to_string(),
        };

        assert_eq!(output.combined(), "step 1\nerror: boom\n");
    }

    #[test]
    fn combined_skips_empty_streams() {
        assert_eq!(EngineOutput::ok("abc").combined(), "abc");
        assert_eq!(EngineOutput::failed("bad").combined(), "bad");
        assert_eq!(EngineOutput::ok("  \n").combined(), "");
    }
}
