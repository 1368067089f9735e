//! Append-only storage of trial results

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::tasks::{Experiment, TrialKey, TrialResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("{path}:{line}: unreadable record: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("duplicate result for {task_id} / {model_id} / run {run_index}")]
    Duplicate {
        task_id: String,
        model_id: String,
        run_index: u32,
    },
}

impl StoreError {
    fn duplicate(key: TrialKey) -> Self {
        StoreError::Duplicate {
            task_id: key.task_id,
            model_id: key.model_id,
            run_index: key.run_index,
        }
    }
}

/// Sink for trial results; a key is written at most once
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn append(&self, result: &TrialResult) -> Result<(), StoreError>;

    /// Everything stored so far, sorted by key
    async fn load(&self) -> Result<Vec<TrialResult>, StoreError>;
}

/// Keeps results in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: Mutex<Vec<TrialResult>>,
    seen: Mutex<HashSet<TrialKey>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn claim(seen: &Mutex<HashSet<TrialKey>>, key: TrialKey) -> Result<(), StoreError> {
    let mut seen = seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if !seen.insert(key.clone()) {
        return Err(StoreError::duplicate(key));
    }
    Ok(())
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn append(&self, result: &TrialResult) -> Result<(), StoreError> {
        claim(&self.seen, result.key())?;
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<TrialResult>, StoreError> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        results.sort_by_key(TrialResult::key);
        Ok(results)
    }
}

/// One directory per experiment, one `<model>.jsonl` file per model,
/// one JSON record per line
#[derive(Debug)]
pub struct JsonlResultStore {
    root: PathBuf,
    seen: Mutex<HashSet<TrialKey>>,
    write_lock: tokio::sync::Mutex<()>,
}

/// File-name safe form of a model id (`org/model:tag` -> `org_model_tag`)
pub fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

impl JsonlResultStore {
    /// Open a store rooted at `root`, indexing records already present
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let existing = load_dir(&root)?;
        if !existing.is_empty() {
            tracing::info!("Resuming store at {} with {} records", root.display(), existing.len());
        }
        Ok(Self {
            seen: Mutex::new(existing.iter().map(TrialResult::key).collect()),
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_for(&self, experiment: Experiment, model_id: &str) -> PathBuf {
        self.root
            .join(experiment.as_str())
            .join(format!("{}.jsonl", sanitize_model_id(model_id)))
    }

    /// Whether a trial is already recorded
    pub fn contains(&self, key: &TrialKey) -> bool {
        self.seen
            .lock()
            .map(|seen| seen.contains(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn append(&self, result: &TrialResult) -> Result<(), StoreError> {
        let key = result.key();
        claim(&self.seen, key.clone())?;

        let mut line = serde_json::to_string(result).map_err(|e| StoreError::Serialize(e.to_string()))?;
        line.push('\n');
        let path = self.file_for(result.experiment, &result.model_id);

        let _guard = self.write_lock.lock().await;
        let written = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // the record never landed, so the key may be retried
            if let Ok(mut seen) = self.seen.lock() {
                seen.remove(&key);
            }
            tracing::error!("Failed to append result to {}: {}", path.display(), e);
            return Err(e.into());
        }
        tracing::debug!(task = %result.task_id, run = result.run_index, "Recorded {}", result.outcome.as_str());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<TrialResult>, StoreError> {
        let _guard = self.write_lock.lock().await;
        load_dir(&self.root)
    }
}

fn load_file(path: &Path) -> Result<Vec<TrialResult>, StoreError> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Read every `*.jsonl` file under `root`, one level of experiment
/// directories deep, sorted by key
pub fn load_dir(root: impl AsRef<Path>) -> Result<Vec<TrialResult>, StoreError> {
    let root = root.as_ref();
    let mut results = Vec::new();
    if !root.exists() {
        return Ok(results);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            for inner in std::fs::read_dir(&path)? {
                let inner = inner?.path();
                if inner.extension().is_some_and(|ext| ext == "jsonl") {
                    files.push(inner);
                }
            }
        } else if path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();

    for file in files {
        results.extend(load_file(&file)?);
    }
    results.sort_by_key(TrialResult::key);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::equivalence::Verdict;
    use crate::providers::CompletionResponse;
    use crate::tasks::TrialContext;

    fn trial(id: &str, model: &str, run_index: u32) -> TrialResult {
        let ctx = TrialContext {
            task_id: id.to_string(),
            model_id: model.to_string(),
            run_index,
            experiment: Experiment::Translation,
            batch_size: 1,
        };
        TrialResult::scored(ctx, Verdict::matched(), vec![], &CompletionResponse::default(), 1)
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicates() {
        let store = MemoryResultStore::new();
        store.append(&trial("t1", "m", 0)).await.unwrap();
        store.append(&trial("t1", "m", 1)).await.unwrap();
        let err = store.append(&trial("t1", "m", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { run_index: 0, .. }));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_layout_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlResultStore::open(dir.path()).unwrap();
        store.append(&trial("t2", "org/model:7b", 0)).await.unwrap();
        store.append(&trial("t1", "org/model:7b", 0)).await.unwrap();
        store.append(&trial("t1", "other", 0)).await.unwrap();

        let file = dir.path().join("translation").join("org_model_7b.jsonl");
        let content = std::fs::read_to_string(&file).unwrap();
        assert_eq!(content.lines().count(), 2);

        let loaded = load_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].task_id, "t1");
        assert_eq!(store.load().await.unwrap(), loaded);
    }

    #[tokio::test]
    async fn test_reopened_store_keeps_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlResultStore::open(dir.path()).unwrap();
            store.append(&trial("t1", "m", 0)).await.unwrap();
        }
        let store = JsonlResultStore::open(dir.path()).unwrap();
        assert!(store.contains(&trial("t1", "m", 0).key()));
        assert!(store.append(&trial("t1", "m", 0)).await.is_err());
    }

    #[test]
    fn test_corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("code")).unwrap();
        std::fs::write(dir.path().join("code").join("m.jsonl"), "{not json}\n").unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
    }
}
