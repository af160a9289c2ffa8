use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::models::RawRecord;
use crate::store::{retain_after, sort_by_source_order, IngestionSource};

/// A call file holds either one record or an array of records
#[derive(Deserialize)]
#[serde(untagged)]
enum CallFile {
    One(RawRecord),
    Many(Vec<RawRecord>),
}

/// Parse the contents of a call file
pub fn parse_call_json(json: &str) -> Result<Vec<RawRecord>, serde_json::Error> {
    Ok(match serde_json::from_str(json)? {
        CallFile::One(record) => vec![record],
        CallFile::Many(records) => records,
    })
}

/// Ingestion source over a directory of `*.json` call files, as written by
/// data acquisition (`<call_id>.json`, one record per file)
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn call_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| unavailable(&self.dir, e))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<RawRecord>, SourceError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SourceError::NotFound(path.display().to_string()),
                _ => unavailable(path, e),
            })?;
        parse_call_json(&content).map_err(|e| SourceError::Malformed {
            id: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Every readable record in the directory; malformed files are skipped
    async fn read_all(&self) -> Result<Vec<RawRecord>, SourceError> {
        let mut records = Vec::new();
        for path in self.call_files().await? {
            match self.read_file(&path).await {
                Ok(mut batch) => records.append(&mut batch),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping call file"),
            }
        }
        sort_by_source_order(&mut records);
        Ok(records)
    }
}

#[async_trait]
impl IngestionSource for DirectorySource {
    async fn list_available(&self, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        let mut records = self.read_all().await?;
        debug!(dir = %self.dir.display(), found = records.len(), limit, "Listed call files");
        records.truncate(limit);
        Ok(records)
    }

    async fn fetch(&self, call_id: &str) -> Result<RawRecord, SourceError> {
        if !call_id.contains(['/', '\\']) && !call_id.starts_with('.') {
            let path = self.dir.join(format!("{call_id}.json"));
            match self.read_file(&path).await {
                Ok(records) => {
                    if let Some(record) = records.into_iter().find(|r| r.call_id == call_id) {
                        return Ok(record);
                    }
                }
                Err(SourceError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Fall back to a scan for files holding several records
        self.read_all()
            .await?
            .into_iter()
            .find(|r| r.call_id == call_id)
            .ok_or_else(|| SourceError::NotFound(call_id.to_string()))
    }

    async fn list_since(
        &self,
        marker: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let Some(marker) = marker else {
            return self.list_available(limit).await;
        };
        let mut records = self.read_all().await?;
        retain_after(&mut records, marker, limit);
        debug!(dir = %self.dir.display(), found = records.len(), %marker, "Listed newer call files");
        Ok(records)
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> SourceError {
    SourceError::Unavailable(format!("{}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALL: &str = r#"{
        "call_id": "CALL_8F2A91C3",
        "agent_name": "Maria Garcia",
        "timestamp": "2024-03-12T15:42:10.512345",
        "transcript_text": "Agent: Thanks for calling. Customer: Count me in!"
    }"#;

    #[test]
    fn test_parse_single_and_array() {
        let one = parse_call_json(CALL).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].call_id, "CALL_8F2A91C3");

        let many = parse_call_json(&format!("[{CALL}, {CALL}]")).unwrap();
        assert_eq!(many.len(), 2);
    }

    #[tokio::test]
    async fn test_directory_source_lists_and_fetches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CALL_8F2A91C3.json"), CALL).unwrap();
        std::fs::write(
            dir.path().join("batch.json"),
            r#"[{"call_id": "CALL_EARLY", "agent_name": "Kevin Martinez",
                 "timestamp": "2024-03-01 08:00:00", "transcript_text": "hello"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = DirectorySource::new(dir.path());
        let records = source.list_available(10).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["CALL_EARLY", "CALL_8F2A91C3"]);

        assert_eq!(source.list_available(1).await.unwrap().len(), 1);

        let after_early = records[0].timestamp;
        let newer = source.list_since(Some(after_early), 1).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].call_id, "CALL_8F2A91C3");
        assert_eq!(source.fetch("CALL_8F2A91C3").await.unwrap().agent_name, "Maria Garcia");
        assert_eq!(source.fetch("CALL_EARLY").await.unwrap().transcript_text, "hello");
        assert!(matches!(
            source.fetch("CALL_MISSING").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("absent"));
        let err = source.list_available(10).await.unwrap_err();
        assert!(err.is_transient());
    }
}
