//! Claude Code CLI runner.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

use super::{stream_process, LLMInvocation, LLMOutput, LLMResult, LLMRunner};

/// Runner for Claude Code CLI.
pub struct ClaudeRunner {
    /// Path to the claude CLI binary.
    cli_path: String,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeRunner {
    /// Creates a new Claude runner using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }

    /// Creates a new Claude runner with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn build_args(&self, invocation: &LLMInvocation) -> Vec<String> {
        // Headless: the agent edits the checkout without permission prompts.
        let mut args = vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if !invocation.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(invocation.allowed_tools.join(","));
        }

        args.push("-p".to_string());
        args.push(invocation.prompt.clone());

        args
    }

    /// Maps one stream-json line to an output event.
    fn parse_output_line(line: &str) -> LLMOutput {
        let Ok(json) = serde_json::from_str::<Value>(line) else {
            return LLMOutput::Stdout(line.to_string());
        };

        match json.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let tool_use = json
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items
                            .iter()
                            .find(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
                    });

                if let Some(item) = tool_use {
                    let tool = item.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = item.get("input");
                    let file_path = input
                        .and_then(|i| i.get("file_path"))
                        .and_then(Value::as_str);

                    return match (tool, file_path) {
                        ("Write" | "Edit" | "MultiEdit", Some(path)) => LLMOutput::FileWrite(path.into()),
                        _ => LLMOutput::ToolCall {
                            tool: tool.to_string(),
                            args: input.map(Value::to_string).unwrap_or_default(),
                        },
                    };
                }
            }
            Some("user") => {
                let result = json.get("tool_use_result");
                let kind = result.and_then(|r| r.get("type")).and_then(Value::as_str);
                let path = result.and_then(|r| r.get("filePath")).and_then(Value::as_str);

                if let (Some("create" | "update"), Some(path)) = (kind, path) {
                    return LLMOutput::FileWrite(path.into());
                }
            }
            _ => {}
        }

        LLMOutput::Stdout(line.to_string())
    }
}

#[async_trait]
impl LLMRunner for ClaudeRunner {
    async fn run(
        &self,
        invocation: LLMInvocation,
        output_tx: mpsc::Sender<LLMOutput>,
    ) -> Result<LLMResult> {
        let args = self.build_args(&invocation);

        tracing::info!(
            cli = %self.cli_path,
            working_dir = ?invocation.working_dir,
            "spawning Claude CLI"
        );

        stream_process(
            &self.cli_path,
            &args,
            &invocation.working_dir,
            output_tx,
            Self::parse_output_line,
        )
        .await
    }

    fn name(&self) -> &str {
        "claude-code"
    }
}
