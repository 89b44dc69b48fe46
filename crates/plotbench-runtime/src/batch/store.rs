//! Per-unit persistence.
//!
//! Each finished unit is written to its own file so an interrupted batch can
//! pick up where it stopped. The unit of recovery is one row.

use async_trait::async_trait;
use plotbench_core::EvaluationRecord;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from a unit store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where finished units are kept between runs.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Every usable record, keyed by unit index.
    async fn load(&self) -> Result<BTreeMap<usize, EvaluationRecord>, StoreError>;

    /// Persist one record, replacing any earlier one for the same index.
    async fn save(&self, record: &EvaluationRecord) -> Result<(), StoreError>;
}

/// One JSON file per unit: `<dir>/<index>.json`.
#[derive(Debug, Clone)]
pub struct FsUnitStore {
    dir: PathBuf,
}

impl FsUnitStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn unit_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.json", index))
    }

    /// Remove every stored unit.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.dir, e)),
        }
    }
}

/// `Some(index)` for names like `12.json`.
fn unit_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(".json")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[async_trait]
impl UnitStore for FsUnitStore {
    async fn load(&self) -> Result<BTreeMap<usize, EvaluationRecord>, StoreError> {
        let mut records = BTreeMap::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(unit_index) else {
                continue;
            };

            let path = entry.path();
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable unit file");
                    continue;
                }
            };

            match serde_json::from_slice::<EvaluationRecord>(&bytes) {
                Ok(record) if record.index() == index && record.is_consistent() => {
                    records.insert(index, record);
                }
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "Skipping inconsistent unit file");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt unit file");
                }
            }
        }

        Ok(records)
    }

    async fn save(&self, record: &EvaluationRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let body = serde_json::to_vec_pretty(record)?;
        let path = self.unit_path(record.index());
        let staged = self.dir.join(format!(".{}.json.partial", record.index()));

        tokio::fs::write(&staged, body)
            .await
            .map_err(|e| StoreError::io(&staged, e))?;
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        Ok(())
    }
}
