use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Keyed, StageStore, Stores, WatermarkStore};
use crate::error::StoreError;
use crate::models::{CleanedRecord, MetricsRecord, RawRecord, Stage};

const WATERMARK_FILE: &str = "watermark.json";

/// Directory-backed stage store: one `<call_id>.json` file per record.
///
/// Writes go to a unique temporary file that is then renamed over the
/// target, so a reader only ever sees a complete record and concurrent
/// upserts of one key resolve to the last rename.
#[derive(Debug)]
pub struct FileStore<R> {
    dir: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R> FileStore<R>
where
    R: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            _record: PhantomData,
        })
    }

    /// Use `dir` as is, without creating it
    pub fn existing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _record: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, call_id: &str) -> Result<PathBuf, StoreError> {
        if call_id.is_empty()
            || call_id.starts_with('.')
            || call_id.contains(['/', '\\'])
        {
            return Err(StoreError::Corrupt {
                key: call_id.to_string(),
                reason: "key is not usable as a file name".to_string(),
            });
        }
        Ok(self.dir.join(format!("{call_id}.json")))
    }

    /// Every stored record, ordered by key. Unreadable files are skipped.
    pub async fn records(&self) -> Result<Vec<R>, StoreError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<R>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl<R> StageStore<R> for FileStore<R>
where
    R: Keyed + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, call_id: &str) -> Result<Option<R>, StoreError> {
        let path = self.path_for(call_id)?;
        read_json(&path).await
    }

    async fn upsert(&self, record: R) -> Result<(), StoreError> {
        let path = self.path_for(record.key())?;
        write_json_atomic(&path, &record).await
    }

    async fn exists(&self, call_id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(call_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let meta = tokio::fs::metadata(&self.dir).await?;
        if !meta.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    watermark: DateTime<Utc>,
}

/// Watermark kept in `<root>/watermark.json`
#[derive(Debug)]
pub struct FileWatermark {
    path: PathBuf,
}

impl FileWatermark {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(WATERMARK_FILE),
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermark {
    async fn read_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(read_json::<WatermarkFile>(&self.path)
            .await?
            .map(|file| file.watermark))
    }

    async fn write_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        write_json_atomic(&self.path, &WatermarkFile { watermark }).await
    }
}

/// All stores of a pipeline rooted in one directory:
/// `<root>/raw`, `<root>/cleaned`, `<root>/metrics`, `<root>/watermark.json`
#[derive(Debug, Clone)]
pub struct FileBackend {
    pub raw: Arc<FileStore<RawRecord>>,
    pub cleaned: Arc<FileStore<CleanedRecord>>,
    pub metrics: Arc<FileStore<MetricsRecord>>,
    pub watermark: Arc<FileWatermark>,
}

impl FileBackend {
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            raw: Arc::new(FileStore::open(root.join(Stage::Raw.to_string())).await?),
            cleaned: Arc::new(FileStore::open(root.join(Stage::Cleaned.to_string())).await?),
            metrics: Arc::new(FileStore::open(root.join(Stage::Metrics.to_string())).await?),
            watermark: Arc::new(FileWatermark::new(root)),
        })
    }

    /// Open stores that a previous run created, failing instead of creating
    /// them when `root` does not hold a pipeline
    pub async fn open_existing(root: &Path) -> Result<Self, StoreError> {
        let backend = Self {
            raw: Arc::new(FileStore::existing(root.join(Stage::Raw.to_string()))),
            cleaned: Arc::new(FileStore::existing(root.join(Stage::Cleaned.to_string()))),
            metrics: Arc::new(FileStore::existing(root.join(Stage::Metrics.to_string()))),
            watermark: Arc::new(FileWatermark::new(root)),
        };

        for dir in [backend.raw.dir(), backend.cleaned.dir(), backend.metrics.dir()] {
            match tokio::fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(StoreError::Unavailable(format!("{} is not a directory", dir.display())));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::Unavailable(format!(
                        "no stage stores in {} (missing {})",
                        root.display(),
                        dir.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(backend)
    }

    pub fn stores(&self) -> Stores {
        Stores {
            raw: self.raw.clone(),
            cleaned: self.cleaned.clone(),
            metrics: self.metrics.clone(),
            watermark: self.watermark.clone(),
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            key: path.display().to_string(),
            reason: e.to_string(),
        })
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        key: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
