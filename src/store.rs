//! Persistence of per-repository run records.
//!
//! Records are keyed by `(run_id, repository_name)`; writing a record with an
//! existing key replaces it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status of a repository within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// The persisted outcome of one repository in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub repository_name: String,
    pub validation_status: RunStatus,
    /// Serialized repository outcome, if any.
    #[serde(default)]
    pub results_json: Option<serde_json::Value>,
    /// The prompt as the user wrote it.
    #[serde(default)]
    pub original_prompt: Option<String>,
    /// The intent passed to agents for this repository.
    #[serde(default)]
    pub repository_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// A record marking `repository_name` as in progress.
    pub fn running(run_id: impl Into<String>, repository_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            repository_name: repository_name.into(),
            validation_status: RunStatus::Running,
            results_json: None,
            original_prompt: None,
            repository_prompt: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_prompts(mut self, original: Option<String>, repository: Option<String>) -> Self {
        self.original_prompt = original;
        self.repository_prompt = repository;
        self
    }

    /// Moves the record to a terminal status with its results.
    pub fn finish(mut self, status: RunStatus, results: serde_json::Value) -> Self {
        self.validation_status = status;
        self.results_json = Some(results);
        self.updated_at = Utc::now();
        self
    }
}

/// Storage for run records.
pub trait ResultStore: Send + Sync {
    /// Inserts or replaces a record.
    fn upsert(&self, record: &RunRecord) -> Result<()>;

    /// Fetches one record.
    fn get(&self, run_id: &str, repository_name: &str) -> Result<Option<RunRecord>>;

    /// All records of a run, ordered by repository name.
    fn list(&self, run_id: &str) -> Result<Vec<RunRecord>>;
}

/// Stores each record as `<root>/<run_id>/<repository>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, run_id: &str, repository_name: &str) -> PathBuf {
        self.root
            .join(file_stem(run_id))
            .join(format!("{}.json", file_stem(repository_name)))
    }

    fn store_error(path: &Path, reason: impl ToString) -> Error {
        Error::Store {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn read(path: &Path) -> Result<RunRecord> {
        let content = std::fs::read_to_string(path).map_err(|e| Self::store_error(path, e))?;
        serde_json::from_str(&content).map_err(|e| Self::store_error(path, e))
    }
}

/// `org/name` becomes `org__name`; other unsafe characters become `-`.
fn file_stem(name: &str) -> String {
    name.replace('/', "__")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl ResultStore for JsonFileStore {
    fn upsert(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_id, &record.repository_name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Self::store_error(dir, e))?;
        }

        let json = serde_json::to_string_pretty(record)?;
        // Write then rename so readers never see a partial record.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| Self::store_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Self::store_error(&path, e))?;

        tracing::debug!(path = ?path, status = ?record.validation_status, "stored run record");
        Ok(())
    }

    fn get(&self, run_id: &str, repository_name: &str) -> Result<Option<RunRecord>> {
        let path = self.record_path(run_id, repository_name);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self, run_id: &str) -> Result<Vec<RunRecord>> {
        let dir = self.root.join(file_stem(run_id));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Self::store_error(&dir, e))? {
            let path = entry.map_err(|e| Self::store_error(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                records.push(Self::read(&path)?);
            }
        }
        records.sort_by(|a, b| a.repository_name.cmp(&b.repository_name));
        Ok(records)
    }
}

/// In-memory store, used by `--dry-run` and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), RunRecord>>> {
        self.records.lock().map_err(|_| Error::Store {
            path: PathBuf::from("<memory>"),
            reason: "store lock poisoned".to_string(),
        })
    }
}

impl ResultStore for MemoryStore {
    fn upsert(&self, record: &RunRecord) -> Result<()> {
        self.lock()?.insert(
            (record.run_id.clone(), record.repository_name.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn get(&self, run_id: &str, repository_name: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()?
            .get(&(run_id.to_string(), repository_name.to_string()))
            .cloned())
    }

    fn list(&self, run_id: &str) -> Result<Vec<RunRecord>> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }
}
