//! Relational store contract for mirrored documents, contacts and form records.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use taxmirror_core::{
    ArtifactState, Contact, DocumentKey, DocumentRecord, FormArtifactRecord, FormKey,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

/// Terminal outcome of one artifact pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactUpdate {
    Downloaded {
        storage_ref: String,
        downloaded_at: DateTime<Utc>,
        extracted: Option<JsonValue>,
    },
    /// Clears any artifact a previous attempt stored.
    Failed {
        error: String,
    },
}

/// Every write is an atomic insert-or-update on the natural key; callers never
/// read-then-write to decide between insert and update.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn existing_document_keys(
        &self,
        entity_id: Uuid,
        keys: &[DocumentKey],
    ) -> Result<HashSet<DocumentKey>, StoreError>;

    /// Insert rows; on natural-key conflict overwrite every mutable column but
    /// never the key or the creation timestamp. Rows must have distinct keys.
    async fn upsert_documents(&self, rows: &[DocumentRecord]) -> Result<(), StoreError>;

    async fn list_documents(&self, entity_id: Uuid) -> Result<Vec<DocumentRecord>, StoreError>;

    async fn find_contact(&self, entity_id: Uuid, rut: &str) -> Result<Option<Contact>, StoreError>;

    /// Insert or widen a contact; returns the stored row.
    async fn save_contact(&self, contact: &Contact) -> Result<Contact, StoreError>;

    async fn existing_form_keys(
        &self,
        entity_id: Uuid,
        keys: &[FormKey],
    ) -> Result<HashSet<FormKey>, StoreError>;

    /// Same conflict rules as documents, except a missing `internal_id` never
    /// clears a stored one.
    async fn upsert_forms(&self, rows: &[FormArtifactRecord]) -> Result<(), StoreError>;

    async fn get_form(&self, id: Uuid) -> Result<FormArtifactRecord, StoreError>;

    /// Pending records that can be downloaded (internal id present, no artifact yet).
    async fn pending_forms(
        &self,
        entity_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FormArtifactRecord>, StoreError>;

    async fn record_artifact_result(&self, id: Uuid, update: &ArtifactUpdate) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    record: DocumentRecord,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<DocumentKey, StoredDocument>,
    contacts: HashMap<(Uuid, String), Contact>,
    forms: HashMap<Uuid, FormArtifactRecord>,
    form_index: HashMap<FormKey, Uuid>,
}

/// In-process store with the same conflict semantics as the Postgres schema.
/// Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn document_created_at(&self, key: &DocumentKey) -> Option<DateTime<Utc>> {
        self.state.lock().await.documents.get(key).map(|d| d.created_at)
    }

    pub async fn contacts(&self, entity_id: Uuid) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .state
            .lock()
            .await
            .contacts
            .values()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| a.rut.cmp(&b.rut));
        contacts
    }

    pub async fn forms(&self, entity_id: Uuid) -> Vec<FormArtifactRecord> {
        let mut forms: Vec<FormArtifactRecord> = self
            .state
            .lock()
            .await
            .forms
            .values()
            .filter(|f| f.entity_id == entity_id)
            .cloned()
            .collect();
        forms.sort_by(|a, b| a.key().cmp(&b.key()));
        forms
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn existing_document_keys(
        &self,
        entity_id: Uuid,
        keys: &[DocumentKey],
    ) -> Result<HashSet<DocumentKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|k| k.entity_id == entity_id && state.documents.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn upsert_documents(&self, rows: &[DocumentRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for row in rows {
            state
                .documents
                .entry(row.key())
                .and_modify(|stored| stored.record = row.clone())
                .or_insert_with(|| StoredDocument {
                    record: row.clone(),
                    created_at: now,
                });
        }
        Ok(())
    }

    async fn list_documents(&self, entity_id: Uuid) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .values()
            .filter(|d| d.record.entity_id == entity_id)
            .map(|d| d.record.clone())
            .collect())
    }

    async fn find_contact(&self, entity_id: Uuid, rut: &str) -> Result<Option<Contact>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.contacts.get(&(entity_id, rut.to_string())).cloned())
    }

    async fn save_contact(&self, contact: &Contact) -> Result<Contact, StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .contacts
            .entry((contact.entity_id, contact.rut.clone()))
            .and_modify(|existing| {
                existing.kind = existing.kind.widen(contact.kind);
                if existing.name.is_none() {
                    existing.name = contact.name.clone();
                }
            })
            .or_insert_with(|| contact.clone());
        Ok(stored.clone())
    }

    async fn existing_form_keys(
        &self,
        entity_id: Uuid,
        keys: &[FormKey],
    ) -> Result<HashSet<FormKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|k| k.entity_id == entity_id && state.form_index.contains_key(*k))
            .cloned()
            .collect())
    }

    async fn upsert_forms(&self, rows: &[FormArtifactRecord]) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for row in rows {
            let key = row.key();
            let existing_id = state.form_index.get(&key).copied();
            match existing_id.and_then(|id| state.forms.get_mut(&id)) {
                Some(existing) => {
                    if row.internal_id.is_some() {
                        existing.internal_id = row.internal_id.clone();
                    }
                    existing.period = row.period;
                    existing.status = row.status.clone();
                    if row.amount.is_some() {
                        existing.amount = row.amount;
                    }
                }
                None => {
                    state.form_index.insert(key, row.id);
                    state.forms.insert(row.id, row.clone());
                }
            }
        }
        Ok(())
    }

    async fn get_form(&self, id: Uuid) -> Result<FormArtifactRecord, StoreError> {
        self.state
            .lock()
            .await
            .forms
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("form artifact", id))
    }

    async fn pending_forms(
        &self,
        entity_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FormArtifactRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<FormArtifactRecord> = state
            .forms
            .values()
            .filter(|f| {
                f.entity_id == entity_id
                    && f.download_state == ArtifactState::Pending
                    && f.internal_id.is_some()
                    && f.storage_ref.is_none()
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.period.cmp(&b.period).then_with(|| a.folio.cmp(&b.folio)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn record_artifact_result(&self, id: Uuid, update: &ArtifactUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let form = state
            .forms
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("form artifact", id))?;
        match update {
            ArtifactUpdate::Downloaded {
                storage_ref,
                downloaded_at,
                extracted,
            } => {
                form.download_state = ArtifactState::Downloaded;
                form.storage_ref = Some(storage_ref.clone());
                form.downloaded_at = Some(*downloaded_at);
                form.last_error = None;
                if extracted.is_some() {
                    form.extracted = extracted.clone();
                }
            }
            ArtifactUpdate::Failed { error } => {
                form.download_state = ArtifactState::Error;
                form.last_error = Some(error.clone());
                form.storage_ref = None;
                form.downloaded_at = None;
                form.extracted = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxmirror_core::SyncPeriod;

    fn form(entity_id: Uuid, folio: &str, internal_id: Option<&str>) -> FormArtifactRecord {
        FormArtifactRecord::listed(
            entity_id,
            "F29",
            folio,
            SyncPeriod::new(2024, 9).unwrap(),
            internal_id.map(str::to_string),
            "vigente",
        )
    }

    #[tokio::test]
    async fn internal_id_is_append_only() {
        let store = MemoryDocumentStore::new();
        let entity = Uuid::new_v4();
        store.upsert_forms(&[form(entity, "9001", Some("INT-1"))]).await.unwrap();

        let mut relisted = form(entity, "9001", None);
        relisted.status = "rectificada".into();
        store.upsert_forms(&[relisted]).await.unwrap();

        let forms = store.forms(entity).await;
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].internal_id.as_deref(), Some("INT-1"));
        assert_eq!(forms[0].status, "rectificada");
    }

    #[tokio::test]
    async fn pending_forms_require_internal_id() {
        let store = MemoryDocumentStore::new();
        let entity = Uuid::new_v4();
        store
            .upsert_forms(&[form(entity, "1", Some("INT-1")), form(entity, "2", None)])
            .await
            .unwrap();
        let pending = store.pending_forms(entity, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].folio, "1");
    }

    #[tokio::test]
    async fn failed_result_keeps_downloaded_at_empty() {
        let store = MemoryDocumentStore::new();
        let entity = Uuid::new_v4();
        let f = form(entity, "1", Some("INT-1"));
        store.upsert_forms(&[f.clone()]).await.unwrap();
        store
            .record_artifact_result(f.id, &ArtifactUpdate::Failed { error: "boom".into() })
            .await
            .unwrap();
        let stored = store.get_form(f.id).await.unwrap();
        assert_eq!(stored.download_state, ArtifactState::Error);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.downloaded_at.is_none());

        let missing = store.get_form(Uuid::new_v4()).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn failure_after_success_drops_the_stored_artifact() {
        let store = MemoryDocumentStore::new();
        let entity = Uuid::new_v4();
        let f = form(entity, "1", Some("INT-1"));
        store.upsert_forms(&[f.clone()]).await.unwrap();
        store
            .record_artifact_result(
                f.id,
                &ArtifactUpdate::Downloaded {
                    storage_ref: "file://x".into(),
                    downloaded_at: Utc::now(),
                    extracted: Some(serde_json::json!({ "fields": { "538": 1 } })),
                },
            )
            .await
            .unwrap();
        store
            .record_artifact_result(f.id, &ArtifactUpdate::Failed { error: "error page".into() })
            .await
            .unwrap();

        let stored = store.get_form(f.id).await.unwrap();
        assert_eq!(stored.download_state, ArtifactState::Error);
        assert_eq!(stored.last_error.as_deref(), Some("error page"));
        assert!(stored.storage_ref.is_none());
        assert!(stored.downloaded_at.is_none());
        assert!(stored.extracted.is_none());
    }
}
