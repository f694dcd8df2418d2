//! Credential, document and artifact storage for the tax portal mirror.

pub mod blob;
pub mod credentials;
pub mod documents;
pub mod postgres;
pub mod retry;
pub mod upsert;

use thiserror::Error;

pub use blob::{ArtifactStore, BlobError, BlobKey, BlobStore, HttpBlobStore};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use documents::{ArtifactUpdate, DocumentStore, MemoryDocumentStore};
pub use postgres::PgDocumentStore;
pub use retry::BackoffPolicy;
pub use upsert::{ContactResolver, UpsertEngine, UpsertOutcome};

pub const CRATE_NAME: &str = "taxmirror-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("corrupt {kind} row: {detail}")]
    Corrupt { kind: &'static str, detail: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
