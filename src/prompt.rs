//! Prompt parsing.
//!
//! Turns the text a user hands to dockhand into a list of repositories and
//! an action intent. Two formats are accepted:
//!
//! 1. A DSL document with a `# PROMPT` section followed by a `# REPOS`
//!    section (one repository per line or comma separated).
//! 2. Free text such as `validate RunPod/worker-basic, RunPod/worker-template`.
//!
//! The DSL always wins when both markers are present.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Organization assumed when a repository is named without one.
pub const DEFAULT_ORG: &str = "RunPod";

/// Marker that opens the instruction section of a DSL prompt.
pub const PROMPT_MARKER: &str = "# PROMPT";

/// Marker that opens the repository section of a DSL prompt.
pub const REPOS_MARKER: &str = "# REPOS";

/// Words that follow a keyword in free text but never name a repository.
const STOP_WORDS: &[&str] = &[
    "a",
    "all",
    "and",
    "my",
    "or",
    "please",
    "repo",
    "repos",
    "repository",
    "repositories",
    "the",
];

static GITHUB_URL_REGEX: OnceLock<Regex> = OnceLock::new();
static DIRECT_REGEX: OnceLock<Regex> = OnceLock::new();
static WORKER_REGEX: OnceLock<Regex> = OnceLock::new();
static KEYWORD_REGEX: OnceLock<Regex> = OnceLock::new();
static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();

fn github_url_regex() -> &'static Regex {
    GITHUB_URL_REGEX.get_or_init(|| {
        Regex::new(r"(?i)https?://(?:www\.)?github\.com/([^/\s]+)/([^/\s#?]+)\S*")
            .expect("GITHUB_URL_REGEX is valid")
    })
}

fn direct_regex() -> &'static Regex {
    DIRECT_REGEX.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+").expect("DIRECT_REGEX is valid")
    })
}

fn worker_regex() -> &'static Regex {
    WORKER_REGEX
        .get_or_init(|| Regex::new(r"\bworker-[A-Za-z0-9_.\-]+").expect("WORKER_REGEX is valid"))
}

fn keyword_regex() -> &'static Regex {
    KEYWORD_REGEX.get_or_init(|| {
        Regex::new(r"(?is)\b(?:validate|check|repos?)\b[:\s]*(.*)").expect("KEYWORD_REGEX is valid")
    })
}

fn token_regex() -> &'static Regex {
    TOKEN_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)?$").expect("TOKEN_REGEX is valid")
    })
}

/// A repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Owning organization or user.
    pub org: String,
    /// Repository name.
    pub name: String,
}

impl RepoRef {
    /// Creates a repository reference.
    pub fn new(org: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            name: name.into(),
        }
    }

    /// Parses `org/name` or a bare `name`.
    ///
    /// Splits on the first `/`. Both parts must be non-empty and made of
    /// `[A-Za-z0-9_.-]` without `..`, since they become checkout paths.
    pub fn parse(token: &str, default_org: &str) -> Result<Self> {
        let (org, name) = match token.split_once('/') {
            Some((org, name)) => (org.trim(), name.trim()),
            None => ("", token.trim()),
        };

        let name = clean_name(name);
        let org = if org.is_empty() { default_org } else { org };

        if !is_valid_segment(org) || !is_valid_segment(name) {
            return Err(Error::Parse(format!(
                "invalid repository name: {}",
                token.trim()
            )));
        }

        Ok(Self::new(org, name))
    }

    /// Like [`RepoRef::parse`], but drops invalid tokens.
    pub fn from_token(token: &str, default_org: &str) -> Option<Self> {
        match Self::parse(token, default_org) {
            Ok(repo) => Some(repo),
            Err(e) => {
                tracing::debug!(token = %token, error = %e, "skipping token");
                None
            }
        }
    }

    /// Whether both parts are safe to use as path components.
    pub fn is_valid(&self) -> bool {
        is_valid_segment(&self.org) && is_valid_segment(&self.name)
    }

    /// Returns `org/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org, self.name)
    }
}

/// Which input format produced a [`ParsedPrompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// `# PROMPT` / `# REPOS` document.
    Dsl,
    /// Unstructured text.
    FreeText,
}

/// Result of parsing a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPrompt {
    /// Repositories in first-seen order, without duplicates.
    pub repositories: Vec<RepoRef>,
    /// What the user wants done.
    pub action_intent: String,
    /// The unmodified input.
    pub original_prompt: String,
    /// Format the input was parsed as.
    pub mode: PromptMode,
}

/// Parses a prompt using [`DEFAULT_ORG`] for unqualified names.
pub fn parse_prompt(input: &str) -> Result<ParsedPrompt> {
    parse_prompt_with_org(input, DEFAULT_ORG)
}

/// Parses a prompt, choosing DSL mode when both section markers are present.
pub fn parse_prompt_with_org(input: &str, default_org: &str) -> Result<ParsedPrompt> {
    if is_dsl(input) {
        tracing::debug!("prompt contains section markers, parsing as DSL");
        parse_dsl(input, default_org)
    } else {
        parse_legacy(input, default_org)
    }
}

/// Returns true if the input carries both DSL section markers.
pub fn is_dsl(input: &str) -> bool {
    input.contains(PROMPT_MARKER) && input.contains(REPOS_MARKER)
}

/// Parses a `# PROMPT` / `# REPOS` document.
pub fn parse_dsl(input: &str, default_org: &str) -> Result<ParsedPrompt> {
    let prompt_at = input
        .find(PROMPT_MARKER)
        .ok_or_else(|| Error::Parse(format!("missing `{}` section", PROMPT_MARKER)))?;
    let repos_at = input
        .find(REPOS_MARKER)
        .ok_or_else(|| Error::Parse(format!("missing `{}` section", REPOS_MARKER)))?;

    if repos_at < prompt_at {
        return Err(Error::Parse(format!(
            "`{}` section must come after `{}`",
            REPOS_MARKER, PROMPT_MARKER
        )));
    }

    let action_intent = input[prompt_at + PROMPT_MARKER.len()..repos_at].trim();
    let section = &input[repos_at + REPOS_MARKER.len()..];

    let repositories = parse_repo_section(section, default_org)?;
    if repositories.is_empty() {
        return Err(Error::Parse(format!(
            "`{}` section does not list any repositories",
            REPOS_MARKER
        )));
    }

    Ok(ParsedPrompt {
        repositories,
        action_intent: action_intent.to_string(),
        original_prompt: input.to_string(),
        mode: PromptMode::Dsl,
    })
}

/// Parses the body of a `# REPOS` section.
///
/// Entries are separated by newlines or commas and may carry a `-` or `*`
/// bullet. Any malformed entry fails the whole section.
pub fn parse_repo_section(section: &str, default_org: &str) -> Result<Vec<RepoRef>> {
    let repos = section
        .split(['\n', ','])
        .map(|line| {
            let line = line.trim();
            line.strip_prefix('-')
                .or_else(|| line.strip_prefix('*'))
                .unwrap_or(line)
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(|line| RepoRef::parse(line, default_org))
        .collect::<Result<Vec<_>>>()?;

    Ok(dedup(repos))
}

/// Parses free text.
///
/// Strategies are tried in order and the first one that finds anything wins:
/// explicit `org/name` tokens, bare `worker-*` names, then whatever follows a
/// `validate`/`check`/`repo(s)` keyword.
pub fn parse_legacy(input: &str, default_org: &str) -> Result<ParsedPrompt> {
    let normalized = github_url_regex().replace_all(input, "${1}/${2}");

    let mut repositories = direct_matches(&normalized, default_org);
    if repositories.is_empty() {
        repositories = worker_matches(&normalized, default_org);
    }
    if repositories.is_empty() {
        repositories = keyword_matches(&normalized, default_org);
    }

    if repositories.is_empty() {
        return Err(Error::Parse(format!(
            "no repositories found in prompt: {}",
            input.trim()
        )));
    }

    tracing::debug!(count = repositories.len(), "parsed repositories from free text");

    Ok(ParsedPrompt {
        repositories,
        action_intent: input.to_string(),
        original_prompt: input.to_string(),
        mode: PromptMode::FreeText,
    })
}

fn direct_matches(text: &str, default_org: &str) -> Vec<RepoRef> {
    dedup(
        direct_regex()
            .find_iter(text)
            .filter_map(|m| RepoRef::from_token(m.as_str(), default_org)),
    )
}

fn worker_matches(text: &str, default_org: &str) -> Vec<RepoRef> {
    dedup(
        worker_regex()
            .find_iter(text)
            .filter_map(|m| RepoRef::from_token(m.as_str(), default_org)),
    )
}

fn keyword_matches(text: &str, default_org: &str) -> Vec<RepoRef> {
    let Some(rest) = keyword_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return Vec::new();
    };

    let tokens = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| !STOP_WORDS.contains(&t.to_lowercase().as_str()))
        .filter(|t| token_regex().is_match(t))
        .filter_map(|t| RepoRef::from_token(t, default_org));

    dedup(tokens)
}

/// Strips a `.git` suffix and trailing sentence punctuation.
fn clean_name(name: &str) -> &str {
    let name = name.trim_end_matches(['.', '!', '?', ';', ':']);
    name.strip_suffix(".git").unwrap_or(name)
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains("..")
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Removes duplicate `org/name` pairs, keeping the first occurrence.
fn dedup(repos: impl IntoIterator<Item = RepoRef>) -> Vec<RepoRef> {
    let mut seen = HashSet::new();
    repos
        .into_iter()
        .filter(|repo| seen.insert(repo.full_name()))
        .collect()
}
