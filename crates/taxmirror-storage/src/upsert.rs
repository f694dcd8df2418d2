//! Batch upserts with new/updated accounting and counterparty resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::ops::AddAssign;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use taxmirror_core::{normalize_rut, Contact, ContactKind, DocumentRecord, FormArtifactRecord};
use tracing::debug;
use uuid::Uuid;

use crate::documents::DocumentStore;
use crate::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub total: usize,
    pub new: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.total += other.total;
        self.new += other.new;
        self.updated += other.updated;
    }
}

impl AddAssign for UpsertOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.absorb(rhs);
    }
}

/// Maps normalized counterparty RUTs to contact ids for one batch.
pub struct ContactResolver<'a> {
    store: &'a dyn DocumentStore,
    resolved: HashMap<(Uuid, String), Contact>,
}

impl<'a> ContactResolver<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            resolved: HashMap::new(),
        }
    }

    /// Returns `None` when the RUT does not normalize.
    pub async fn resolve(
        &mut self,
        entity_id: Uuid,
        raw_rut: &str,
        name: Option<&str>,
        kind: ContactKind,
    ) -> Result<Option<Uuid>, StoreError> {
        let Some(rut) = normalize_rut(raw_rut) else {
            return Ok(None);
        };
        let cache_key = (entity_id, rut.clone());
        if let Some(known) = self.resolved.get(&cache_key) {
            if known.kind.widen(kind) == known.kind {
                return Ok(Some(known.id));
            }
        }

        let current = match self.resolved.get(&cache_key) {
            Some(known) => Some(known.clone()),
            None => self.store.find_contact(entity_id, &rut).await?,
        };
        let saved = match current {
            Some(existing) if existing.kind.widen(kind) == existing.kind => existing,
            Some(existing) => {
                debug!(%entity_id, %rut, from = existing.kind.as_str(), "widening contact kind");
                self.store.save_contact(&Contact { kind, ..existing }).await?
            }
            None => {
                self.store
                    .save_contact(&Contact {
                        id: Uuid::new_v4(),
                        entity_id,
                        rut: rut.clone(),
                        name: name.map(str::to_string).filter(|n| !n.trim().is_empty()),
                        kind,
                    })
                    .await?
            }
        };
        let id = saved.id;
        self.resolved.insert(cache_key, saved);
        Ok(Some(id))
    }
}

/// Collapse rows sharing a key; the last occurrence wins and keeps the slot of the first.
fn collapse_by_key<T, K, F>(rows: Vec<T>, key_of: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut slots: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        let key = key_of(&row);
        match slots.get(&key) {
            Some(&idx) => out[idx] = row,
            None => {
                slots.insert(key, out.len());
                out.push(row);
            }
        }
    }
    out
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn DocumentStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Resolve contacts, then persist the batch with one existence query and one
    /// conflict-resolving write. Existing keys are looked up fresh on every call.
    pub async fn upsert_documents(&self, rows: Vec<DocumentRecord>) -> Result<UpsertOutcome, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let mut rows = collapse_by_key(rows, DocumentRecord::key);

        let mut resolver = ContactResolver::new(self.store.as_ref());
        for row in rows.iter_mut() {
            if let Some(rut) = row.counterparty_rut.clone() {
                row.contact_id = resolver
                    .resolve(
                        row.entity_id,
                        &rut,
                        row.counterparty_name.as_deref(),
                        row.family.contact_kind(),
                    )
                    .await?;
            }
        }

        let mut keys_by_entity: BTreeMap<Uuid, Vec<_>> = BTreeMap::new();
        for row in &rows {
            keys_by_entity.entry(row.entity_id).or_default().push(row.key());
        }
        let mut existing = HashSet::new();
        for (entity_id, keys) in &keys_by_entity {
            existing.extend(self.store.existing_document_keys(*entity_id, keys).await?);
        }

        let total = rows.len();
        let new = rows.iter().filter(|r| !existing.contains(&r.key())).count();
        self.store.upsert_documents(&rows).await?;
        debug!(total, new, "document batch persisted");
        Ok(UpsertOutcome {
            total,
            new,
            updated: total - new,
        })
    }

    pub async fn upsert_forms(&self, rows: Vec<FormArtifactRecord>) -> Result<UpsertOutcome, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let rows = collapse_by_key(rows, FormArtifactRecord::key);

        let mut keys_by_entity: BTreeMap<Uuid, Vec<_>> = BTreeMap::new();
        for row in &rows {
            keys_by_entity.entry(row.entity_id).or_default().push(row.key());
        }
        let mut existing = HashSet::new();
        for (entity_id, keys) in &keys_by_entity {
            existing.extend(self.store.existing_form_keys(*entity_id, keys).await?);
        }

        let total = rows.len();
        let new = rows.iter().filter(|r| !existing.contains(&r.key())).count();
        self.store.upsert_forms(&rows).await?;
        Ok(UpsertOutcome {
            total,
            new,
            updated: total - new,
        })
    }
}
