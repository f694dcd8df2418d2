//! Durable storage for downloaded form artifacts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use taxmirror_core::SyncPeriod;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::retry::{retryable_status, retryable_transport, BackoffPolicy};

/// Where one artifact lives: one object per (entity, period, folio).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobKey {
    pub entity_id: Uuid,
    pub period: SyncPeriod,
    pub folio: String,
    pub extension: String,
}

impl BlobKey {
    pub fn pdf(entity_id: Uuid, period: SyncPeriod, folio: impl Into<String>) -> Self {
        Self {
            entity_id,
            period,
            folio: folio.into(),
            extension: "pdf".to_string(),
        }
    }

    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/{}.{}",
            self.entity_id,
            self.period.code(),
            sanitize_segment(&self.folio),
            self.extension.trim_start_matches('.')
        )
    }
}

fn sanitize_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("upload failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the bytes and return a reference that later readers can resolve.
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<String, BlobError>;
}

/// Filesystem store laid out as `<root>/<entity>/<period>/<folio>.pdf`.
/// A re-download replaces the previous file for the same key.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.object_path())
    }

    async fn write(&self, key: &BlobKey, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let target = std::path::absolute(self.path_for(key))
            .with_context(|| format!("resolving artifact path under {}", self.root.display()))?;
        let dir = target.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating artifact directory {}", dir.display()))?;

        // Readers only ever see a complete file: write aside, then rename over the target.
        let partial = dir.join(format!(".{}.part", Uuid::new_v4()));
        let written = async {
            fs::write(&partial, bytes).await?;
            fs::rename(&partial, &target).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("writing artifact {}", target.display()));
        }
        Ok(target)
    }
}

#[async_trait]
impl BlobStore for ArtifactStore {
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<String, BlobError> {
        let path = self.write(key, bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(format!("file://{}", path.display()))
    }
}

/// Object store reached over HTTP PUT, e.g. a bucket behind a signing proxy.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff,
        })
    }

    pub fn object_url(&self, key: &BlobKey) -> String {
        format!("{}/{}", self.base_url, key.object_path())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, key: &BlobKey, bytes: &[u8]) -> Result<String, BlobError> {
        let url = self.object_url(key);
        let span = info_span!("blob_upload", url = %url, bytes = bytes.len());
        self.put_with_retries(url, bytes).instrument(span).await
    }
}

impl HttpBlobStore {
    async fn put_with_retries(&self, url: String, bytes: &[u8]) -> Result<String, BlobError> {
        let mut attempt = 0usize;
        loop {
            let result = self
                .client
                .put(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/pdf")
                .body(bytes.to_vec())
                .send()
                .await;

            let failure = match result {
                Ok(resp) if resp.status().is_success() => return Ok(url),
                Ok(resp) if retryable_status(resp.status()) => BlobError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: url.clone(),
                },
                Ok(resp) => {
                    return Err(BlobError::HttpStatus {
                        status: resp.status().as_u16(),
                        url,
                    })
                }
                Err(err) if retryable_transport(&err) => BlobError::Request(err),
                Err(err) => return Err(BlobError::Request(err)),
            };
            let Some(delay) = self.backoff.retry_delay(attempt) else {
                return Err(failure);
            };
            warn!(attempt = attempt + 1, error = %failure, ?delay, "blob upload failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
