//! Gemini CLI runner.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use crate::error::Result;

use super::{stream_process, LLMInvocation, LLMOutput, LLMResult, LLMRunner};

/// Runner for Gemini CLI.
pub struct GeminiRunner {
    /// Path to the gemini CLI binary.
    cli_path: String,
}

impl Default for GeminiRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn file_write_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:writ(?:e|ing)|edit(?:ing)?|creat(?:e|ing))\b.*?\bfile\b\W*["'`]([^"'`]+)["'`]"#)
            .expect("valid file write regex")
    })
}

fn function_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"function_call:\s*([A-Za-z_][A-Za-z0-9_]*)\((.*)\)\s*$")
            .expect("valid function call regex")
    })
}

impl GeminiRunner {
    /// Creates a new Gemini runner using the default `gemini` command.
    pub fn new() -> Self {
        Self {
            cli_path: "gemini".to_string(),
        }
    }

    /// Creates a new Gemini runner with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn build_args(&self, invocation: &LLMInvocation) -> Vec<String> {
        // --yolo auto-approves edits in the checkout.
        let mut args = vec!["--yolo".to_string()];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--prompt".to_string());
        args.push(invocation.prompt.clone());

        args
    }

    /// Maps one line of Gemini output to an output event.
    fn parse_output_line(line: &str) -> LLMOutput {
        if let Some(caps) = file_write_regex().captures(line) {
            let path = &caps[1];
            if path.contains('/') || path.contains('.') {
                return LLMOutput::FileWrite(path.into());
            }
        }

        if let Some(caps) = function_call_regex().captures(line) {
            return LLMOutput::ToolCall {
                tool: caps[1].to_string(),
                args: caps[2].to_string(),
            };
        }

        LLMOutput::Stdout(line.to_string())
    }
}

#[async_trait]
impl LLMRunner for GeminiRunner {
    async fn run(
        &self,
        invocation: LLMInvocation,
        output_tx: mpsc::Sender<LLMOutput>,
    ) -> Result<LLMResult> {
        let args = self.build_args(&invocation);

        tracing::info!(
            cli = %self.cli_path,
            working_dir = ?invocation.working_dir,
            "spawning Gemini CLI"
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
        "gemini-cli"
    }
}
