//! Error types for dockhand.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type.
///
/// Stage failures inside the validation pipeline are not errors; they are
/// carried in the stage results. This type covers parse failures and
/// anything the pipeline cannot express as a failed report.
#[derive(Error, Debug)]
pub enum Error {
    /// The prompt could not be turned into a repository list.
    #[error("prompt parse error: {0}")]
    Parse(String),

    /// Configuration or request failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// GitHub CLI operation failed.
    #[error("GitHub operation failed: {0}")]
    GitHub(String),

    /// A sub-agent (repair or feature) could not run.
    #[error("agent error: {0}")]
    Agent(String),

    /// The container engine could not be invoked at all.
    #[error("container engine error: {0}")]
    Engine(String),

    /// Reading or writing a run record failed.
    #[error("result store error at {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    /// JSON or TOML (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for dockhand operations.
pub type Result<T> = std::result::Result<T, Error>;
