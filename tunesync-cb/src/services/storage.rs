//! Durable object storage client
//!
//! Provider URLs are often time-limited; every variant the callbacks
//! discover is re-hosted in the application's own storage. The trait is
//! the collaborator contract consumed by the upload fan-out and is
//! swapped for a recording double in tests.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("tunesync/", env!("CARGO_PKG_VERSION"));
const DOWNLOAD_RETRIES: u32 = 3;

/// Storage client errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Durable storage collaborator: pull a file from a provider URL and
/// persist it under our own public URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Re-host an audio file; returns the durable public URL.
    async fn upload_audio(
        &self,
        source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError>;

    /// Re-host a cover image; returns the durable public URL.
    async fn upload_cover(
        &self,
        source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError>;
}

/// HTTP-backed storage client: GET the provider URL, PUT the bytes to
/// the storage endpoint, derive the public URL from the configured base.
pub struct HttpObjectStorage {
    http_client: reqwest::Client,
    endpoint: String,
    public_base: String,
}

impl HttpObjectStorage {
    pub fn new(endpoint: String, public_base: String) -> Result<Self, StorageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            public_base: public_base.trim_end_matches('/').to_string(),
        })
    }

    /// Download with up to three attempts and linear backoff; provider
    /// CDNs drop connections on fresh renders often enough that a single
    /// attempt loses real files.
    async fn download_with_retry(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let mut last_error = String::new();

        for attempt in 1..=DOWNLOAD_RETRIES {
            match self.http_client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| StorageError::Download(e.to_string()));
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                    warn!(url, attempt, status = %response.status(), "Download attempt failed");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(url, attempt, error = %e, "Download attempt failed");
                }
            }

            if attempt < DOWNLOAD_RETRIES {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
        }

        Err(StorageError::Download(format!(
            "{url} failed after {DOWNLOAD_RETRIES} attempts: {last_error}"
        )))
    }

    async fn transfer(
        &self,
        source_url: &str,
        bucket: &str,
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let body = self.download_with_retry(source_url).await?;
        debug!(
            bucket,
            path,
            bytes = body.len(),
            "Downloaded source, uploading to storage"
        );

        let upload_url = format!("{}/{}/{}", self.endpoint, bucket, path);
        let response = self
            .http_client
            .put(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Upload(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Upload(format!(
                "{} returned status {}",
                upload_url,
                response.status()
            )));
        }

        Ok(format!("{}/{}/{}", self.public_base, bucket, path))
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload_audio(
        &self,
        source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError> {
        let path = format!("{user_id}/{track_id}/{file_name}");
        self.transfer(source_url, "tracks-audio", &path, "audio/mpeg")
            .await
    }

    async fn upload_cover(
        &self,
        source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError> {
        let path = format!("{user_id}/{track_id}/{file_name}");
        self.transfer(source_url, "tracks-covers", &path, "image/webp")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_normalizes_trailing_slashes() {
        let storage = HttpObjectStorage::new(
            "http://127.0.0.1:9000/media/".to_string(),
            "https://cdn.example/media/".to_string(),
        )
        .unwrap();
        assert_eq!(storage.endpoint, "http://127.0.0.1:9000/media");
        assert_eq!(storage.public_base, "https://cdn.example/media");
    }
}
