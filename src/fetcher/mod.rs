//! Input staging
//!
//! Jobs may reference input files by URL; before submission the client can
//! stage them locally so tasks reference a resolved path. Fetching sits
//! behind a trait so tests never touch the network.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// Fetcher
// ============================================================================

/// Retrieves the bytes behind one input URL.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP(S) fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(format!("{url}: {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Fetch each URL and write it under `dir`, named by the URL's last path
/// segment (or its position when the URL has none). Returns the staged
/// paths in input order; the first failure aborts the whole batch.
pub async fn stage_inputs(
    fetcher: &dyn ResourceFetcher,
    urls: &[String],
    dir: &Path,
) -> Result<Vec<PathBuf>, FetchError> {
    let mut staged = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let bytes = fetcher.fetch(url).await?;
        let name = url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("input-{index}"));
        let path = dir.join(name);
        std::fs::write(&path, &bytes).map_err(|e| FetchError::Write(format!("{}: {e}", path.display())))?;
        tracing::info!(%url, path = %path.display(), bytes = bytes.len(), "input staged");
        staged.push(path);
    }
    Ok(staged)
}

// ============================================================================
// Fetch Errors
// ============================================================================

/// Fetch errors
#[derive(Debug, Clone)]
pub enum FetchError {
    /// HTTP client construction failed
    Client(String),

    /// Request failed in transit
    Request(String),

    /// Server replied with a non-success status
    Status(String),

    /// Staged file could not be written
    Write(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(msg) => write!(f, "HTTP client error: {msg}"),
            Self::Request(msg) => write!(f, "Fetch request failed: {msg}"),
            Self::Status(msg) => write!(f, "Fetch rejected: {msg}"),
            Self::Write(msg) => write!(f, "Failed writing staged input: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFetcher;

    #[async_trait]
    impl ResourceFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            if url.contains("missing") {
                return Err(FetchError::Status(format!("{url}: 404 Not Found")));
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_stage_inputs_names_by_last_segment() {
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            "http://example.test/data/model.bin".to_string(),
            "http://example.test/".to_string(),
        ];

        let staged = stage_inputs(&FakeFetcher, &urls, dir.path()).await.unwrap();
        assert_eq!(staged.len(), 2);
        assert!(staged[0].ends_with("model.bin"));
        assert!(staged[1].ends_with("input-1"));
        assert_eq!(std::fs::read(&staged[0]).unwrap(), urls[0].as_bytes());
    }

    #[tokio::test]
    async fn test_stage_inputs_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            "http://example.test/missing.bin".to_string(),
            "http://example.test/ok.bin".to_string(),
        ];

        let err = stage_inputs(&FakeFetcher, &urls, dir.path()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(_)));
        // nothing after the failure was written
        assert!(!dir.path().join("ok.bin").exists());
    }
}
