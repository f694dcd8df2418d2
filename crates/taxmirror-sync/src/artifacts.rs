//! Form artifact download, validation, extraction and upload.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::json;
use taxmirror_adapters::{ParsedPayload, PortalAdapter, PortalError, PortalRequest};
use taxmirror_core::FormArtifactRecord;
use taxmirror_storage::{ArtifactUpdate, BackoffPolicy, BlobKey, BlobStore, DocumentStore};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::SyncError;

pub const DEFAULT_MIN_ARTIFACT_BYTES: usize = 512;
pub const MISSING_INTERNAL_ID: &str = "missing internal id";

/// Lowercased markers of portal error pages served with a 200 status.
pub const DEFAULT_ERROR_SIGNATURES: [&str; 6] = [
    "<!doctype html",
    "<html",
    "sesión ha expirado",
    "sesion ha expirado",
    "servicio no disponible",
    "error en la aplicación",
];

const SIGNATURE_SCAN_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactRejection {
    #[error("artifact is {size} bytes, below the {min} byte minimum")]
    TooSmall { size: usize, min: usize },
    #[error("artifact is an error page ({signature}){}", title_suffix(.title))]
    ErrorPage {
        signature: String,
        title: Option<String>,
    },
    #[error("artifact is not a PDF document")]
    NotPdf,
}

fn title_suffix(title: &Option<String>) -> String {
    title.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ArtifactValidator {
    pub min_bytes: usize,
    pub signatures: Vec<String>,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_ARTIFACT_BYTES,
            signatures: DEFAULT_ERROR_SIGNATURES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn page_title(text: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(text);
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

impl ArtifactValidator {
    pub fn validate(&self, bytes: &[u8]) -> Result<(), ArtifactRejection> {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(SIGNATURE_SCAN_BYTES)]).to_lowercase();
        if let Some(signature) = self.signatures.iter().find(|s| head.contains(s.as_str())) {
            return Err(ArtifactRejection::ErrorPage {
                signature: signature.clone(),
                title: page_title(&String::from_utf8_lossy(bytes)),
            });
        }
        if bytes.len() < self.min_bytes {
            return Err(ArtifactRejection::TooSmall {
                size: bytes.len(),
                min: self.min_bytes,
            });
        }
        if !bytes.starts_with(b"%PDF-") {
            return Err(ArtifactRejection::NotPdf);
        }
        Ok(())
    }
}

/// `code -> amount` pairs from lines such as `538 TOTAL DEBITOS 150.000`.
pub fn extract_form_fields(bytes: &[u8]) -> anyhow::Result<BTreeMap<String, i64>> {
    let document = lopdf::Document::load_mem(bytes)?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    let text = document.extract_text(&pages)?;
    Ok(form_fields_from_text(&text))
}

fn form_fields_from_text(text: &str) -> BTreeMap<String, i64> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (Some(code), Some(last)) = (tokens.first(), tokens.last()) else {
            continue;
        };
        if tokens.len() < 2 || !(2..=4).contains(&code.len()) || !code.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let negative = last.starts_with('-');
        let digits = last.trim_start_matches('-').replace('.', "");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(amount) = digits.parse::<i64>() {
            fields.insert(code.to_string(), if negative { -amount } else { amount });
        }
    }
    fields
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub artifact_id: Uuid,
    pub success: bool,
    pub storage_ref: Option<String>,
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn stored(artifact_id: Uuid, storage_ref: String) -> Self {
        Self {
            artifact_id,
            success: true,
            storage_ref: Some(storage_ref),
            error: None,
        }
    }

    fn failed(artifact_id: Uuid, error: String) -> Self {
        Self {
            artifact_id,
            success: false,
            storage_ref: None,
            error: Some(error),
        }
    }
}

enum Fetched {
    Payload(Vec<u8>),
    Rejected(String),
}

struct Inspected {
    bytes: Vec<u8>,
    extracted: Option<serde_json::Value>,
}

/// Validate, then extract. Both parse the whole payload, so this runs on the
/// blocking pool.
fn inspect(validator: &ArtifactValidator, form_code: &str, folio: &str, bytes: Vec<u8>) -> Result<Inspected, String> {
    validator.validate(&bytes).map_err(|rejection| rejection.to_string())?;
    let extracted = match extract_form_fields(&bytes) {
        Ok(fields) if fields.is_empty() => None,
        Ok(fields) => Some(json!({ "form_code": form_code, "fields": fields })),
        Err(err) => {
            warn!(%folio, error = %err, "structured extraction failed");
            None
        }
    };
    Ok(Inspected { bytes, extracted })
}

#[derive(Clone)]
pub struct ArtifactPipeline {
    adapter: PortalAdapter,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    validator: ArtifactValidator,
    backoff: BackoffPolicy,
}

impl ArtifactPipeline {
    pub fn new(adapter: PortalAdapter, documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            adapter,
            documents,
            blobs,
            validator: ArtifactValidator::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_validator(mut self, validator: ArtifactValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn record(&self, artifact_id: Uuid, update: ArtifactUpdate) -> Result<(), SyncError> {
        self.documents
            .record_artifact_result(artifact_id, &update)
            .await
            .map_err(SyncError::from_store)
    }

    async fn fail(&self, artifact_id: Uuid, error: String) -> Result<DownloadOutcome, SyncError> {
        warn!(%artifact_id, error = %error, "artifact download failed");
        self.record(artifact_id, ArtifactUpdate::Failed { error: error.clone() })
            .await?;
        Ok(DownloadOutcome::failed(artifact_id, error))
    }

    /// Download one form artifact. Validation and storage failures are recorded on
    /// the form record and reported in the outcome; only a missing record or
    /// session is an error.
    pub async fn download(&self, artifact_id: Uuid, session_id: Uuid) -> Result<DownloadOutcome, SyncError> {
        let span = info_span!("artifact_download", %artifact_id, %session_id);
        self.download_inner(artifact_id, session_id).instrument(span).await
    }

    async fn download_inner(&self, artifact_id: Uuid, session_id: Uuid) -> Result<DownloadOutcome, SyncError> {
        let form = self
            .documents
            .get_form(artifact_id)
            .await
            .map_err(SyncError::from_store)?;
        let Some(internal_id) = form.internal_id.clone() else {
            return self.fail(artifact_id, MISSING_INTERNAL_ID.to_string()).await;
        };

        let request = PortalRequest::FormArtifact {
            form_code: form.form_code.clone(),
            folio: form.folio.clone(),
            internal_id,
        };
        let bytes = match self.fetch_with_retries(session_id, &request).await? {
            Fetched::Payload(bytes) => bytes,
            Fetched::Rejected(reason) => return self.fail(artifact_id, reason).await,
        };
        let Inspected { bytes, extracted } = match self.inspect_off_thread(&form, bytes).await {
            Ok(inspected) => inspected,
            Err(reason) => return self.fail(artifact_id, reason).await,
        };

        let key = BlobKey::pdf(form.entity_id, form.period, form.folio.clone());
        let storage_ref = match self.blobs.upload(&key, &bytes).await {
            Ok(storage_ref) => storage_ref,
            Err(err) => return self.fail(artifact_id, format!("upload failed: {err}")).await,
        };

        self.record(
            artifact_id,
            ArtifactUpdate::Downloaded {
                storage_ref: storage_ref.clone(),
                downloaded_at: Utc::now(),
                extracted,
            },
        )
        .await?;
        info!(%artifact_id, storage_ref = %storage_ref, bytes = bytes.len(), "artifact stored");
        Ok(DownloadOutcome::stored(artifact_id, storage_ref))
    }

    /// Transient portal failures are retried with backoff; auth failures end the
    /// attempt immediately.
    async fn fetch_with_retries(&self, session_id: Uuid, request: &PortalRequest) -> Result<Fetched, SyncError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.adapter.fetch_parsed(session_id, request).await {
                Ok(ParsedPayload::Artifact { bytes, .. }) => return Ok(Fetched::Payload(bytes)),
                Ok(other) => format!("expected artifact payload, got {}", other.kind()),
                Err(PortalError::SessionNotFound(id)) => return Err(SyncError::SessionNotFound(id)),
                Err(err @ (PortalError::Authentication(_) | PortalError::SessionExpired(_))) => {
                    return Ok(Fetched::Rejected(err.to_string()));
                }
                Err(err) => err.to_string(),
            };
            let Some(delay) = self.backoff.retry_delay(attempt) else {
                return Ok(Fetched::Rejected(failure));
            };
            warn!(attempt = attempt + 1, error = %failure, ?delay, "artifact fetch failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn inspect_off_thread(&self, form: &FormArtifactRecord, bytes: Vec<u8>) -> Result<Inspected, String> {
        let validator = self.validator.clone();
        let form_code = form.form_code.clone();
        let folio = form.folio.clone();
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            inspect(&validator, &form_code, &folio, bytes)
        })
        .await
        .map_err(|err| format!("artifact inspection failed: {err}"))?
    }

    /// Run the pipeline for every downloadable pending record of an entity.
    pub async fn download_pending(
        &self,
        entity_id: Uuid,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DownloadOutcome>, SyncError> {
        let pending = self
            .documents
            .pending_forms(entity_id, limit)
            .await
            .map_err(SyncError::from_store)?;
        info!(%entity_id, pending = pending.len(), "downloading pending artifacts");
        let mut outcomes = Vec::with_capacity(pending.len());
        for form in pending {
            let outcome = match self.download(form.id, session_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(artifact_id = %form.id, error = %err, "artifact download aborted");
                    DownloadOutcome::failed(form.id, err.to_string())
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
