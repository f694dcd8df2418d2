//! Postgres implementation of [`DocumentStore`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use taxmirror_core::{
    ArtifactState, Contact, ContactKind, DocumentFamily, DocumentKey, DocumentRecord,
    FormArtifactRecord, FormKey, Granularity, SyncPeriod,
};
use tracing::debug;
use uuid::Uuid;

use crate::documents::{ArtifactUpdate, DocumentStore};
use crate::StoreError;

/// Rows per INSERT statement; keeps bind counts well under the protocol limit.
const UPSERT_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(kind: &'static str, detail: impl ToString) -> StoreError {
    StoreError::Corrupt {
        kind,
        detail: detail.to_string(),
    }
}

fn document_from_row(row: &PgRow) -> Result<DocumentRecord, StoreError> {
    let family: String = row.try_get("family")?;
    let period: String = row.try_get("period")?;
    let granularity: String = row.try_get("granularity")?;
    Ok(DocumentRecord {
        entity_id: row.try_get("entity_id")?,
        family: family.parse().map_err(|e| corrupt("document", e))?,
        document_type: row.try_get("document_type")?,
        folio: row.try_get("folio")?,
        period: period.parse().map_err(|e| corrupt("document", e))?,
        granularity: granularity.parse().map_err(|e| corrupt("document", e))?,
        issue_date: row.try_get::<Option<NaiveDate>, _>("issue_date")?,
        counterparty_rut: row.try_get("counterparty_rut")?,
        counterparty_name: row.try_get("counterparty_name")?,
        net_amount: row.try_get("net_amount")?,
        tax_amount: row.try_get("tax_amount")?,
        exempt_amount: row.try_get("exempt_amount")?,
        total_amount: row.try_get("total_amount")?,
        status: row.try_get("status")?,
        extra_data: row.try_get::<JsonValue, _>("extra_data")?,
        contact_id: row.try_get("contact_id")?,
    })
}

fn contact_from_row(row: &PgRow) -> Result<Contact, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Contact {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        rut: row.try_get("rut")?,
        name: row.try_get("name")?,
        kind: kind.parse::<ContactKind>().map_err(|e| corrupt("contact", e))?,
    })
}

fn form_from_row(row: &PgRow) -> Result<FormArtifactRecord, StoreError> {
    let period: String = row.try_get("period")?;
    let state: String = row.try_get("download_state")?;
    Ok(FormArtifactRecord {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        form_code: row.try_get("form_code")?,
        folio: row.try_get("folio")?,
        internal_id: row.try_get("internal_id")?,
        period: period.parse::<SyncPeriod>().map_err(|e| corrupt("form artifact", e))?,
        status: row.try_get("status")?,
        amount: row.try_get("amount")?,
        storage_ref: row.try_get("storage_ref")?,
        download_state: state
            .parse::<ArtifactState>()
            .map_err(|e| corrupt("form artifact", e))?,
        last_error: row.try_get("last_error")?,
        downloaded_at: row.try_get::<Option<DateTime<Utc>>, _>("downloaded_at")?,
        extracted: row.try_get::<Option<JsonValue>, _>("extracted")?,
    })
}

const FORM_COLUMNS: &str = "id, entity_id, form_code, folio, internal_id, period, status, amount, \
     storage_ref, download_state, last_error, downloaded_at, extracted";

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn existing_document_keys(
        &self,
        entity_id: Uuid,
        keys: &[DocumentKey],
    ) -> Result<HashSet<DocumentKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let families: Vec<String> = keys.iter().map(|k| k.family.as_str().to_string()).collect();
        let types: Vec<String> = keys.iter().map(|k| k.document_type.clone()).collect();
        let folios: Vec<String> = keys.iter().map(|k| k.folio.clone()).collect();
        let counterparties: Vec<String> = keys.iter().map(|k| k.counterparty_key.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT d.family, d.document_type, d.folio, d.counterparty_key
              FROM portal_documents d
              JOIN UNNEST($2::text[], $3::text[], $4::text[], $5::text[])
                   AS k(family, document_type, folio, counterparty_key)
                ON d.family = k.family
               AND d.document_type = k.document_type
               AND d.folio = k.folio
               AND d.counterparty_key = k.counterparty_key
             WHERE d.entity_id = $1
            "#,
        )
        .bind(entity_id)
        .bind(&families)
        .bind(&types)
        .bind(&folios)
        .bind(&counterparties)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let family: String = row.try_get("family")?;
            out.insert(DocumentKey {
                entity_id,
                family: family
                    .parse::<DocumentFamily>()
                    .map_err(|e| corrupt("document", e))?,
                document_type: row.try_get("document_type")?,
                folio: row.try_get("folio")?,
                counterparty_key: row.try_get("counterparty_key")?,
            });
        }
        Ok(out)
    }

    async fn upsert_documents(&self, rows: &[DocumentRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO portal_documents (entity_id, family, document_type, folio, \
                 counterparty_key, period, granularity, issue_date, counterparty_rut, \
                 counterparty_name, net_amount, tax_amount, exempt_amount, total_amount, \
                 status, extra_data, contact_id) ",
            );
            qb.push_values(chunk, |mut b, row| {
                let key = row.key();
                b.push_bind(row.entity_id)
                    .push_bind(row.family.as_str())
                    .push_bind(row.document_type.clone())
                    .push_bind(row.folio.clone())
                    .push_bind(key.counterparty_key)
                    .push_bind(row.period.code())
                    .push_bind(row.granularity.as_str())
                    .push_bind(row.issue_date)
                    .push_bind(row.counterparty_rut.clone())
                    .push_bind(row.counterparty_name.clone())
                    .push_bind(row.net_amount)
                    .push_bind(row.tax_amount)
                    .push_bind(row.exempt_amount)
                    .push_bind(row.total_amount)
                    .push_bind(row.status.clone())
                    .push_bind(row.extra_data.clone())
                    .push_bind(row.contact_id);
            });
            qb.push(
                " ON CONFLICT (entity_id, family, document_type, folio, counterparty_key) DO UPDATE SET \
                 period = EXCLUDED.period, \
                 granularity = EXCLUDED.granularity, \
                 issue_date = EXCLUDED.issue_date, \
                 counterparty_rut = EXCLUDED.counterparty_rut, \
                 counterparty_name = EXCLUDED.counterparty_name, \
                 net_amount = EXCLUDED.net_amount, \
                 tax_amount = EXCLUDED.tax_amount, \
                 exempt_amount = EXCLUDED.exempt_amount, \
                 total_amount = EXCLUDED.total_amount, \
                 status = EXCLUDED.status, \
                 extra_data = EXCLUDED.extra_data, \
                 contact_id = EXCLUDED.contact_id, \
                 updated_at = now()",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "upserted portal documents");
        Ok(())
    }

    async fn list_documents(&self, entity_id: Uuid) -> Result<Vec<DocumentRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, family, document_type, folio, period, granularity, issue_date,
                   counterparty_rut, counterparty_name, net_amount, tax_amount, exempt_amount,
                   total_amount, status, extra_data, contact_id
              FROM portal_documents
             WHERE entity_id = $1
             ORDER BY period, family, document_type, folio
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn find_contact(&self, entity_id: Uuid, rut: &str) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query(
            "SELECT id, entity_id, rut, name, kind FROM contacts WHERE entity_id = $1 AND rut = $2",
        )
        .bind(entity_id)
        .bind(rut)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn save_contact(&self, contact: &Contact) -> Result<Contact, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO contacts (id, entity_id, rut, name, kind)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_id, rut) DO UPDATE SET
                kind = CASE WHEN contacts.kind = EXCLUDED.kind THEN contacts.kind ELSE 'both' END,
                name = COALESCE(contacts.name, EXCLUDED.name),
                updated_at = now()
            RETURNING id, entity_id, rut, name, kind
            "#,
        )
        .bind(contact.id)
        .bind(contact.entity_id)
        .bind(&contact.rut)
        .bind(&contact.name)
        .bind(contact.kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        contact_from_row(&row)
    }

    async fn existing_form_keys(
        &self,
        entity_id: Uuid,
        keys: &[FormKey],
    ) -> Result<HashSet<FormKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let codes: Vec<String> = keys.iter().map(|k| k.form_code.clone()).collect();
        let folios: Vec<String> = keys.iter().map(|k| k.folio.clone()).collect();
        let rows = sqlx::query(
            r#"
            SELECT f.form_code, f.folio
              FROM form_artifacts f
              JOIN UNNEST($2::text[], $3::text[]) AS k(form_code, folio)
                ON f.form_code = k.form_code AND f.folio = k.folio
             WHERE f.entity_id = $1
            "#,
        )
        .bind(entity_id)
        .bind(&codes)
        .bind(&folios)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(FormKey {
                entity_id,
                form_code: row.try_get("form_code")?,
                folio: row.try_get("folio")?,
            });
        }
        Ok(out)
    }

    async fn upsert_forms(&self, rows: &[FormArtifactRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO form_artifacts (id, entity_id, form_code, folio, internal_id, period, status, amount) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.entity_id)
                    .push_bind(row.form_code.clone())
                    .push_bind(row.folio.clone())
                    .push_bind(row.internal_id.clone())
                    .push_bind(row.period.code())
                    .push_bind(row.status.clone())
                    .push_bind(row.amount);
            });
            qb.push(
                " ON CONFLICT (entity_id, form_code, folio) DO UPDATE SET \
                 internal_id = COALESCE(EXCLUDED.internal_id, form_artifacts.internal_id), \
                 period = EXCLUDED.period, \
                 status = EXCLUDED.status, \
                 amount = COALESCE(EXCLUDED.amount, form_artifacts.amount), \
                 updated_at = now()",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_form(&self, id: Uuid) -> Result<FormArtifactRecord, StoreError> {
        let row = sqlx::query(&format!("SELECT {FORM_COLUMNS} FROM form_artifacts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => form_from_row(&row),
            None => Err(StoreError::not_found("form artifact", id)),
        }
    }

    async fn pending_forms(
        &self,
        entity_id: Uuid,
        limit: usize,
    ) -> Result<Vec<FormArtifactRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FORM_COLUMNS} FROM form_artifacts \
             WHERE entity_id = $1 AND download_state = 'pending' \
               AND internal_id IS NOT NULL AND storage_ref IS NULL \
             ORDER BY period, folio LIMIT $2"
        ))
        .bind(entity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(form_from_row).collect()
    }

    async fn record_artifact_result(&self, id: Uuid, update: &ArtifactUpdate) -> Result<(), StoreError> {
        let result = match update {
            ArtifactUpdate::Downloaded {
                storage_ref,
                downloaded_at,
                extracted,
            } => {
                sqlx::query(
                    r#"
                    UPDATE form_artifacts
                       SET download_state = 'downloaded',
                           storage_ref = $2,
                           downloaded_at = $3,
                           extracted = COALESCE($4, extracted),
                           last_error = NULL,
                           updated_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(storage_ref)
                .bind(downloaded_at)
                .bind(extracted)
                .execute(&self.pool)
                .await?
            }
            ArtifactUpdate::Failed { error } => {
                sqlx::query(
                    r#"
                    UPDATE form_artifacts
                       SET download_state = 'error',
                           last_error = $2,
                           storage_ref = NULL,
                           downloaded_at = NULL,
                           extracted = NULL,
                           updated_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("form artifact", id));
        }
        Ok(())
    }
}
