use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use crate::error::SourceError;
use crate::models::RawRecord;
use crate::stages::validate_call_id;
use crate::store::{sort_by_source_order, IngestionSource};

/// Ingestion source backed by the data-acquisition HTTP service.
///
/// Endpoints:
/// - `GET {base}/calls?limit=N[&since=RFC3339]` returns a JSON array of records
/// - `GET {base}/calls/{call_id}` returns one record
pub struct HttpSource {
    client: Client,
    calls_url: Url,
}

impl HttpSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let mut calls_url =
            Url::parse(base_url).with_context(|| format!("Invalid source URL: {base_url}"))?;
        calls_url
            .path_segments_mut()
            .map_err(|_| anyhow!("Source URL cannot carry a path: {base_url}"))?
            .pop_if_empty()
            .push("calls");

        Ok(Self { client, calls_url })
    }

    fn calls_url(&self) -> Url {
        self.calls_url.clone()
    }

    /// `{base}/calls/{call_id}` with the id as one encoded path segment
    fn call_url(&self, call_id: &str) -> Result<Url, SourceError> {
        validate_call_id(call_id).map_err(|e| SourceError::Malformed {
            id: call_id.to_string(),
            reason: e.to_string(),
        })?;

        let mut url = self.calls_url();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(call_id);
        }
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, SourceError> {
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{what}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(what.to_string()));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Unavailable(format!("{what}: HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Malformed {
                id: what.to_string(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        response.json().await.map_err(|e| SourceError::Malformed {
            id: what.to_string(),
            reason: e.to_string(),
        })
    }

    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }

        let request = self.client.get(self.calls_url()).query(&query);
        let mut records: Vec<RawRecord> = self.get_json(request, "call listing").await?;
        debug!(url = %self.calls_url(), found = records.len(), "Listed calls");

        if let Some(since) = since {
            records.retain(|r| r.timestamp > since);
        }
        sort_by_source_order(&mut records);
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl IngestionSource for HttpSource {
    async fn list_available(&self, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        self.list(None, limit).await
    }

    async fn fetch(&self, call_id: &str) -> Result<RawRecord, SourceError> {
        let url = self.call_url(call_id)?;
        match self.get_json(self.client.get(url), call_id).await {
            Err(SourceError::NotFound(_)) => Err(SourceError::NotFound(call_id.to_string())),
            other => other,
        }
    }

    async fn list_since(
        &self,
        marker: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        self.list(marker, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let source = HttpSource::new("http://acquisition.local:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(source.calls_url().as_str(), "http://acquisition.local:8080/calls");

        let nested = HttpSource::new("http://acquisition.local/api", Duration::from_secs(1)).unwrap();
        assert_eq!(
            nested.call_url("CALL_8F2A91C3").unwrap().as_str(),
            "http://acquisition.local/api/calls/CALL_8F2A91C3"
        );
    }

    #[tokio::test]
    async fn test_fetch_rejects_ids_that_escape_the_path() {
        // Port 9 would answer Unavailable if a request went out
        let source = HttpSource::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        for call_id in ["../admin", "a?x=y", "a/b", ".."] {
            let err = source.fetch(call_id).await.unwrap_err();
            assert!(matches!(err, SourceError::Malformed { .. }), "{call_id}: {err}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Nothing listens on port 9 of the loopback interface
        let source = HttpSource::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = source.list_available(10).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert!(err.is_transient());
    }
}
