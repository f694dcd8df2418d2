//! Validates raw portal payloads into a closed set of typed shapes and maps
//! them onto persisted records.

use chrono::NaiveDate;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use taxmirror_core::{
    aggregate_folio, daily_folio, DocumentFamily, DocumentRecord, FormArtifactRecord, Granularity,
    SyncPeriod,
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::automation::{PortalPayload, PortalRequest};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{what} payload has an unexpected shape: {source}")]
    Shape {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what} payload must be json, got {got}")]
    NotJson { what: &'static str, got: &'static str },
    #[error("{what} payload must be binary, got json")]
    NotBinary { what: &'static str },
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Integers arrive either as numbers or as display strings such as `"1.234.567"`.
fn lenient_amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    match value {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| de::Error::custom(format!("amount out of range: {n}"))),
        Some(JsonValue::String(s)) => parse_amount_text(&s)
            .ok_or_else(|| de::Error::custom(format!("not an amount: {s:?}"))),
        Some(other) => Err(de::Error::custom(format!("not an amount: {other}"))),
    }
}

fn lenient_optional_amount<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => lenient_amount(v).map(Some).map_err(de::Error::custom),
    }
}

fn parse_amount_text(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    let negative = trimmed.starts_with('-');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Folios and type codes show up as numbers or strings.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_text(deserializer)?.ok_or_else(|| de::Error::custom("missing value"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    #[serde(deserialize_with = "required_text")]
    pub document_type: String,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub net_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub tax_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub exempt_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_amount: i64,
    /// The portal only reports totals for this type.
    #[serde(default)]
    pub aggregated: bool,
    /// Per-document listing can be opened from the summary.
    #[serde(default = "default_true")]
    pub has_detail: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawDocument {
    #[serde(default, deserialize_with = "lenient_text")]
    pub folio: Option<String>,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub counterparty_rut: Option<String>,
    #[serde(default)]
    pub counterparty_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub net_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub tax_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub exempt_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DailyTotal {
    pub date: String,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub net_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub tax_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub exempt_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_amount: i64,
}

/// Professional-fee receipt. Gross maps to total and the withheld amount to tax.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawReceipt {
    #[serde(default, deserialize_with = "lenient_text")]
    pub folio: Option<String>,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub issuer_rut: Option<String>,
    #[serde(default)]
    pub issuer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub gross_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub retention_amount: i64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub net_amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawForm {
    #[serde(default, deserialize_with = "lenient_text")]
    pub folio: Option<String>,
    #[serde(deserialize_with = "required_text")]
    pub period: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub internal_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_optional_amount")]
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EconomicActivity {
    #[serde(deserialize_with = "required_text")]
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorInfo {
    #[serde(deserialize_with = "required_text")]
    pub rut: String,
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub activities: Vec<EconomicActivity>,
}

#[derive(Debug, Deserialize)]
struct SummaryEnvelope {
    entries: Vec<SummaryEntry>,
}

#[derive(Debug, Deserialize)]
struct DocumentsEnvelope {
    documents: Vec<RawDocument>,
}

#[derive(Debug, Deserialize)]
struct DailyEnvelope {
    days: Vec<DailyTotal>,
}

#[derive(Debug, Deserialize)]
struct ReceiptsEnvelope {
    receipts: Vec<RawReceipt>,
}

#[derive(Debug, Deserialize)]
struct FormsEnvelope {
    forms: Vec<RawForm>,
}

/// Every payload shape the engine accepts, keyed by the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    Contributor(ContributorInfo),
    Summary(Vec<SummaryEntry>),
    Documents(Vec<RawDocument>),
    DailyTotals(Vec<DailyTotal>),
    Receipts(Vec<RawReceipt>),
    Forms(Vec<RawForm>),
    Artifact { bytes: Vec<u8>, content_type: String },
}

fn decode_json<T: DeserializeOwned>(what: &'static str, payload: PortalPayload) -> Result<T, ParseError> {
    match payload {
        PortalPayload::Json(value) => {
            serde_json::from_value(value).map_err(|source| ParseError::Shape { what, source })
        }
        other => Err(ParseError::NotJson {
            what,
            got: other.kind(),
        }),
    }
}

impl ParsedPayload {
    pub fn decode(request: &PortalRequest, payload: PortalPayload) -> Result<Self, ParseError> {
        Ok(match request {
            PortalRequest::ContributorInfo => Self::Contributor(decode_json("contributor", payload)?),
            PortalRequest::Summary { .. } => {
                Self::Summary(decode_json::<SummaryEnvelope>("summary", payload)?.entries)
            }
            PortalRequest::Documents { .. } => {
                Self::Documents(decode_json::<DocumentsEnvelope>("documents", payload)?.documents)
            }
            PortalRequest::DailyTotals { .. } => {
                Self::DailyTotals(decode_json::<DailyEnvelope>("daily totals", payload)?.days)
            }
            PortalRequest::Receipts { .. } => {
                Self::Receipts(decode_json::<ReceiptsEnvelope>("receipts", payload)?.receipts)
            }
            PortalRequest::FormList { .. } => {
                Self::Forms(decode_json::<FormsEnvelope>("form list", payload)?.forms)
            }
            PortalRequest::FormArtifact { .. } => match payload {
                PortalPayload::Binary {
                    bytes,
                    content_type,
                } => Self::Artifact {
                    bytes,
                    content_type,
                },
                PortalPayload::Json(_) => return Err(ParseError::NotBinary { what: "form artifact" }),
            },
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contributor(_) => "contributor",
            Self::Summary(_) => "summary",
            Self::Documents(_) => "documents",
            Self::DailyTotals(_) => "daily totals",
            Self::Receipts(_) => "receipts",
            Self::Forms(_) => "forms",
            Self::Artifact { .. } => "artifact",
        }
    }
}

/// Accepts `YYYY-MM-DD` and the portal's `DD/MM/YYYY` / `DD-MM-YYYY`.
pub fn parse_portal_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn status_or_default(status: Option<String>) -> String {
    non_empty(status).unwrap_or_else(|| "registered".to_string())
}

/// One record per listed document. Items without a folio are skipped.
pub fn document_records(
    entity_id: Uuid,
    family: DocumentFamily,
    period: SyncPeriod,
    document_type: &str,
    raw: Vec<RawDocument>,
) -> Vec<DocumentRecord> {
    let mut records = Vec::with_capacity(raw.len());
    for (index, doc) in raw.into_iter().enumerate() {
        let Some(folio) = doc.folio else {
            warn!(
                family = family.as_str(),
                period = %period,
                document_type,
                index,
                "skipping document without folio"
            );
            continue;
        };
        records.push(DocumentRecord {
            entity_id,
            family,
            document_type: document_type.to_string(),
            folio,
            period,
            granularity: Granularity::Detail,
            issue_date: doc.issue_date.as_deref().and_then(parse_portal_date),
            counterparty_rut: non_empty(doc.counterparty_rut),
            counterparty_name: non_empty(doc.counterparty_name),
            net_amount: doc.net_amount,
            tax_amount: doc.tax_amount,
            exempt_amount: doc.exempt_amount,
            total_amount: doc.total_amount,
            status: status_or_default(doc.status),
            extra_data: JsonValue::Object(doc.extra),
            contact_id: None,
        });
    }
    records
}

/// One record per day with a deterministic synthetic folio.
pub fn daily_records(
    entity_id: Uuid,
    family: DocumentFamily,
    period: SyncPeriod,
    document_type: &str,
    days: Vec<DailyTotal>,
) -> Result<Vec<DocumentRecord>, ParseError> {
    days.into_iter()
        .map(|day| {
            let date = parse_portal_date(&day.date).ok_or_else(|| ParseError::InvalidField {
                field: "daily date",
                value: day.date.clone(),
            })?;
            Ok(DocumentRecord {
                entity_id,
                family,
                document_type: document_type.to_string(),
                folio: daily_folio(date),
                period,
                granularity: Granularity::Daily,
                issue_date: Some(date),
                counterparty_rut: None,
                counterparty_name: None,
                net_amount: day.net_amount,
                tax_amount: day.tax_amount,
                exempt_amount: day.exempt_amount,
                total_amount: day.total_amount,
                status: "aggregated".to_string(),
                extra_data: serde_json::json!({ "document_count": day.document_count }),
                contact_id: None,
            })
        })
        .collect()
}

pub fn aggregate_record(
    entity_id: Uuid,
    family: DocumentFamily,
    period: SyncPeriod,
    entry: &SummaryEntry,
) -> DocumentRecord {
    DocumentRecord {
        entity_id,
        family,
        document_type: entry.document_type.clone(),
        folio: aggregate_folio(period, &entry.document_type),
        period,
        granularity: Granularity::MonthlyAggregate,
        issue_date: period.first_day(),
        counterparty_rut: None,
        counterparty_name: None,
        net_amount: entry.net_amount,
        tax_amount: entry.tax_amount,
        exempt_amount: entry.exempt_amount,
        total_amount: entry.total_amount,
        status: "aggregated".to_string(),
        extra_data: serde_json::json!({ "document_count": entry.document_count }),
        contact_id: None,
    }
}

/// Receipts carry no document type on the portal; they are stored under this code.
pub const RECEIPT_DOCUMENT_TYPE: &str = "BHE";

pub fn receipt_records(entity_id: Uuid, period: SyncPeriod, raw: Vec<RawReceipt>) -> Vec<DocumentRecord> {
    let mut records = Vec::with_capacity(raw.len());
    for (index, receipt) in raw.into_iter().enumerate() {
        let Some(folio) = receipt.folio else {
            warn!(period = %period, index, "skipping receipt without folio");
            continue;
        };
        let mut extra = receipt.extra;
        extra.insert("net_amount".to_string(), JsonValue::from(receipt.net_amount));
        records.push(DocumentRecord {
            entity_id,
            family: DocumentFamily::Receipt,
            document_type: RECEIPT_DOCUMENT_TYPE.to_string(),
            folio,
            period,
            granularity: Granularity::Detail,
            issue_date: receipt.issue_date.as_deref().and_then(parse_portal_date),
            counterparty_rut: non_empty(receipt.issuer_rut),
            counterparty_name: non_empty(receipt.issuer_name),
            net_amount: receipt.net_amount,
            tax_amount: receipt.retention_amount,
            exempt_amount: 0,
            total_amount: receipt.gross_amount,
            status: status_or_default(receipt.status),
            extra_data: JsonValue::Object(extra),
            contact_id: None,
        });
    }
    records
}

pub fn form_records(
    entity_id: Uuid,
    form_code: &str,
    raw: Vec<RawForm>,
) -> Result<Vec<FormArtifactRecord>, ParseError> {
    let mut records = Vec::with_capacity(raw.len());
    for (index, form) in raw.into_iter().enumerate() {
        let Some(folio) = form.folio else {
            warn!(form_code, index, "skipping form without folio");
            continue;
        };
        let period: SyncPeriod = form
            .period
            .replace(['-', '/'], "")
            .parse()
            .map_err(|_| ParseError::InvalidField {
                field: "form period",
                value: form.period.clone(),
            })?;
        let mut record = FormArtifactRecord::listed(
            entity_id,
            form_code,
            folio,
            period,
            non_empty(form.internal_id),
            status_or_default(form.status),
        );
        record.amount = form.amount;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn period() -> SyncPeriod {
        SyncPeriod::new(2024, 10).unwrap()
    }

    fn summary_request() -> PortalRequest {
        PortalRequest::Summary {
            family: DocumentFamily::Purchase,
            period: period(),
        }
    }

    #[test]
    fn summary_accepts_numeric_codes_and_display_amounts() {
        let payload = PortalPayload::Json(json!({
            "entries": [
                {"document_type": 33, "document_count": 2, "total_amount": "1.190.000"},
                {"document_type": "39", "aggregated": true, "has_detail": false, "total_amount": 5000}
            ]
        }));
        let ParsedPayload::Summary(entries) = ParsedPayload::decode(&summary_request(), payload).unwrap() else {
            panic!("expected summary");
        };
        assert_eq!(entries[0].document_type, "33");
        assert_eq!(entries[0].total_amount, 1_190_000);
        assert!(entries[0].has_detail);
        assert!(entries[1].aggregated && !entries[1].has_detail);
    }

    #[test]
    fn wrong_shape_is_a_parse_error() {
        let err = ParsedPayload::decode(&summary_request(), PortalPayload::Json(json!({"rows": []}))).unwrap_err();
        assert!(matches!(err, ParseError::Shape { what: "summary", .. }));

        let err = ParsedPayload::decode(
            &summary_request(),
            PortalPayload::Binary {
                bytes: vec![1],
                content_type: "application/pdf".into(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::NotJson { .. }));
    }

    #[test]
    fn documents_without_folio_are_skipped_and_extras_kept() {
        let raw: DocumentsEnvelope = serde_json::from_value(json!({
            "documents": [
                {"folio": 100, "issue_date": "03/10/2024", "counterparty_rut": "76.123.456-K",
                 "total_amount": 1190, "sii_track_id": "abc"},
                {"folio": null, "total_amount": 1},
                {"folio": "101", "issue_date": "2024-10-04", "total_amount": "2.380"}
            ]
        }))
        .unwrap();
        let records = document_records(Uuid::nil(), DocumentFamily::Purchase, period(), "33", raw.documents);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].folio, "100");
        assert_eq!(records[0].issue_date, NaiveDate::from_ymd_opt(2024, 10, 3));
        assert_eq!(records[0].extra_data["sii_track_id"], "abc");
        assert_eq!(records[1].total_amount, 2380);
        assert_eq!(records[1].status, "registered");
    }

    #[test]
    fn receipts_map_gross_and_retention() {
        let raw: ReceiptsEnvelope = serde_json::from_value(json!({
            "receipts": [{"folio": 7, "issuer_rut": "12345678-5", "gross_amount": 100000,
                          "retention_amount": 13750, "net_amount": 86250, "status": "vigente"}]
        }))
        .unwrap();
        let records = receipt_records(Uuid::nil(), period(), raw.receipts);
        assert_eq!(records[0].total_amount, 100000);
        assert_eq!(records[0].tax_amount, 13750);
        assert_eq!(records[0].net_amount, 86250);
        assert_eq!(records[0].document_type, RECEIPT_DOCUMENT_TYPE);
        assert_eq!(records[0].family, DocumentFamily::Receipt);
    }

    #[test]
    fn daily_totals_get_synthetic_folios() {
        let days = vec![DailyTotal {
            date: "2024-10-01".into(),
            document_count: 12,
            net_amount: 0,
            tax_amount: 0,
            exempt_amount: 0,
            total_amount: 4500,
        }];
        let records = daily_records(Uuid::nil(), DocumentFamily::Sale, period(), "39", days).unwrap();
        assert_eq!(records[0].folio, "DAY-20241001");
        assert_eq!(records[0].granularity, Granularity::Daily);

        let bad = vec![DailyTotal {
            date: "yesterday".into(),
            document_count: 0,
            net_amount: 0,
            tax_amount: 0,
            exempt_amount: 0,
            total_amount: 0,
        }];
        assert!(daily_records(Uuid::nil(), DocumentFamily::Sale, period(), "39", bad).is_err());
    }

    #[test]
    fn forms_keep_missing_internal_id_as_none() {
        let raw: FormsEnvelope = serde_json::from_value(json!({
            "forms": [
                {"folio": 9001, "period": "2024-09", "internal_id": "", "status": "vigente", "amount": "150.000"},
                {"folio": "9002", "period": "202408", "internal_id": 55}
            ]
        }))
        .unwrap();
        let records = form_records(Uuid::nil(), "F29", raw.forms).unwrap();
        assert_eq!(records[0].period, SyncPeriod::new(2024, 9).unwrap());
        assert_eq!(records[0].internal_id, None);
        assert_eq!(records[0].amount, Some(150_000));
        assert_eq!(records[1].internal_id.as_deref(), Some("55"));
    }
}
