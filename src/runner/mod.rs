//! LLM CLI runners used by the repair and feature agents.
//!
//! Supports Claude Code and Gemini CLI in headless mode.

mod claude;
mod gemini;

pub use claude::ClaudeRunner;
pub use gemini::GeminiRunner;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Output from an LLM during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LLMOutput {
    /// Standard output line.
    Stdout(String),
    /// Standard error line.
    Stderr(String),
    /// Tool call detected.
    ToolCall { tool: String, args: String },
    /// File write detected.
    FileWrite(PathBuf),
}

/// One headless LLM invocation.
#[derive(Debug, Clone)]
pub struct LLMInvocation {
    /// The prompt to send.
    pub prompt: String,
    /// Directory the LLM works in (the repository).
    pub working_dir: PathBuf,
    /// Model to use, if not the CLI default.
    pub model: Option<String>,
    /// Tools the LLM may use; empty means the CLI default.
    pub allowed_tools: Vec<String>,
}

impl LLMInvocation {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            model: None,
            allowed_tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_allowed_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Result of an LLM execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LLMResult {
    /// Process exit code, if it exited normally.
    pub exit_code: Option<i32>,
    /// Total output lines.
    pub output_lines: usize,
    /// Whether the LLM exited successfully.
    pub success: bool,
}

/// Trait for LLM runners.
#[async_trait]
pub trait LLMRunner: Send + Sync {
    /// Runs the LLM to completion, streaming output to `output_tx`.
    async fn run(
        &self,
        invocation: LLMInvocation,
        output_tx: mpsc::Sender<LLMOutput>,
    ) -> Result<LLMResult>;

    /// Returns the name of this runner.
    fn name(&self) -> &str;
}

/// Returns the runner registered under `name`.
pub fn runner_for(name: &str) -> Result<Arc<dyn LLMRunner>> {
    match name {
        "claude" | "claude-code" => Ok(Arc::new(ClaudeRunner::new())),
        "gemini" | "gemini-cli" => Ok(Arc::new(GeminiRunner::new())),
        other => Err(Error::Config(format!("unknown runner '{}'", other))),
    }
}

/// Spawns `cli` and forwards its output line by line until it exits.
///
/// Stdout lines go through `parse`; stderr lines are forwarded as-is.
pub(crate) async fn stream_process(
    cli: &str,
    args: &[String],
    working_dir: &Path,
    output_tx: mpsc::Sender<LLMOutput>,
    parse: fn(&str) -> LLMOutput,
) -> Result<LLMResult> {
    let mut child = Command::new(cli)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Agent(format!("failed to spawn {}: {}", cli, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Agent(format!("{} stdout was not captured", cli)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Agent(format!("{} stderr was not captured", cli)))?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stderr_open = true;
    let mut output_lines = 0;

    loop {
        tokio::select! {
            line = stdout_reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        output_lines += 1;
                        tracing::trace!(cli = %cli, line = %line, "stdout");
                        if output_tx.send(parse(&line)).await.is_err() {
                            tracing::warn!("output receiver dropped");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "error reading stdout");
                        break;
                    }
                }
            }
            line = stderr_reader.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => {
                        output_lines += 1;
                        if output_tx.send(LLMOutput::Stderr(line)).await.is_err() {
                            tracing::warn!("output receiver dropped");
                            break;
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::error!(error = %e, "error reading stderr");
                        stderr_open = false;
                    }
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Agent(format!("failed to wait for {}: {}", cli, e)))?;

    Ok(LLMResult {
        exit_code: status.code(),
        output_lines,
        success: status.success(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_for_known_names() {
        assert_eq!(runner_for("claude").unwrap().name(), "claude-code");
        assert_eq!(runner_for("gemini-cli").unwrap().name(), "gemini-cli");
        assert!(runner_for("gpt").is_err());
    }

    #[test]
    fn invocation_builder_sets_fields() {
        let invocation = LLMInvocation::new("fix it", "/tmp/repo")
            .with_model(Some("sonnet".to_string()))
            .with_allowed_tools(&["Read", "Edit"]);

        assert_eq!(invocation.model.as_deref(), Some("sonnet"));
        assert_eq!(invocation.allowed_tools, vec!["Read", "Edit"]);
    }

    #[tokio::test]
    async fn stream_process_forwards_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let args = vec!["-c".to_string(), "echo one; echo two 1>&2".to_string()];

        let result = stream_process("sh", &args, Path::new("."), tx, |l| {
            LLMOutput::Stdout(l.to_string())
        })
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Some(output) = rx.recv().await {
            seen.push(output);
        }

        assert!(result.success);
        assert!(seen.contains(&LLMOutput::Stdout("one".to_string())));
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn stream_process_reports_spawn_failure() {
        let (tx, _rx) = mpsc::channel(1);

        let err = stream_process(
            "/nonexistent/dockhand-llm",
            &[],
            Path::new("."),
            tx,
            |l| LLMOutput::Stdout(l.to_string()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Agent(_)));
    }
}
