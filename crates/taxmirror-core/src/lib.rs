//! Core domain model for the tax portal mirror.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "taxmirror-core";

/// Synthetic folio prefix for monthly aggregate rows.
pub const AGGREGATE_FOLIO_PREFIX: &str = "AGG";
/// Synthetic folio prefix for daily breakdown rows.
pub const DAILY_FOLIO_PREFIX: &str = "DAY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid period code {0:?}, expected YYYYMM")]
    InvalidPeriod(String),
    #[error("unknown {kind} {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Portal login for one taxpayer. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalCredentials {
    pub rut: String,
    pub password: String,
}

impl fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("rut", &self.rut)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }
}

/// One authenticated relationship between a local entity and the portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub credentials: PortalCredentials,
    #[serde(default)]
    pub cookies: Option<Vec<Cookie>>,
    #[serde(default)]
    pub cookies_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Session {
    pub fn new(entity_id: Uuid, credentials: PortalCredentials) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            credentials,
            cookies: None,
            cookies_updated_at: None,
            last_accessed_at: None,
            active: true,
        }
    }
}

/// A (year, month) portal reporting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncPeriod {
    pub year: i32,
    pub month: u32,
}

impl SyncPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Portal period code, e.g. `202410`.
    pub fn code(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl fmt::Display for SyncPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for SyncPeriod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ModelError::InvalidPeriod(s.to_string());
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = s[..4].parse().map_err(|_| invalid())?;
        let month: u32 = s[4..].parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFamily {
    Purchase,
    Sale,
    Receipt,
}

impl DocumentFamily {
    /// Sync order within one period.
    pub const ALL: [DocumentFamily; 3] = [Self::Purchase, Self::Sale, Self::Receipt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Sale => "sale",
            Self::Receipt => "receipt",
        }
    }

    /// How a counterparty seen in this family is classified.
    pub fn contact_kind(&self) -> ContactKind {
        match self {
            Self::Purchase | Self::Receipt => ContactKind::Provider,
            Self::Sale => ContactKind::Client,
        }
    }
}

impl fmt::Display for DocumentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFamily {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "sale" => Ok(Self::Sale),
            "receipt" => Ok(Self::Receipt),
            other => Err(ModelError::UnknownVariant {
                kind: "document family",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Detail,
    Daily,
    MonthlyAggregate,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Daily => "daily",
            Self::MonthlyAggregate => "monthly_aggregate",
        }
    }
}

impl FromStr for Granularity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detail" => Ok(Self::Detail),
            "daily" => Ok(Self::Daily),
            "monthly_aggregate" => Ok(Self::MonthlyAggregate),
            other => Err(ModelError::UnknownVariant {
                kind: "granularity",
                value: other.to_string(),
            }),
        }
    }
}

/// Natural key of a persisted document. `counterparty_key` is the normalized
/// counterparty RUT for purchases and empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub entity_id: Uuid,
    pub family: DocumentFamily,
    pub document_type: String,
    pub folio: String,
    pub counterparty_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub entity_id: Uuid,
    pub family: DocumentFamily,
    pub document_type: String,
    pub folio: String,
    pub period: SyncPeriod,
    pub granularity: Granularity,
    pub issue_date: Option<NaiveDate>,
    pub counterparty_rut: Option<String>,
    pub counterparty_name: Option<String>,
    pub net_amount: i64,
    pub tax_amount: i64,
    pub exempt_amount: i64,
    pub total_amount: i64,
    pub status: String,
    pub extra_data: JsonValue,
    pub contact_id: Option<Uuid>,
}

impl DocumentRecord {
    pub fn key(&self) -> DocumentKey {
        let counterparty_key = match self.family {
            DocumentFamily::Purchase => self
                .counterparty_rut
                .as_deref()
                .and_then(normalize_rut)
                .unwrap_or_default(),
            DocumentFamily::Sale | DocumentFamily::Receipt => String::new(),
        };
        DocumentKey {
            entity_id: self.entity_id,
            family: self.family,
            document_type: self.document_type.clone(),
            folio: self.folio.clone(),
            counterparty_key,
        }
    }
}

/// Folio of the single monthly aggregate row for a document type. The entity is
/// already part of the natural key, so period and type make it unique.
pub fn aggregate_folio(period: SyncPeriod, document_type: &str) -> String {
    format!("{AGGREGATE_FOLIO_PREFIX}-{}-{document_type}", period.code())
}

pub fn daily_folio(date: NaiveDate) -> String {
    format!("{DAILY_FOLIO_PREFIX}-{}", date.format("%Y%m%d"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Provider,
    Client,
    Both,
}

impl ContactKind {
    /// Classification only widens: a differing observation always yields `Both`.
    pub fn widen(self, observed: ContactKind) -> ContactKind {
        if self == observed {
            self
        } else {
            ContactKind::Both
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Client => "client",
            Self::Both => "both",
        }
    }
}

impl FromStr for ContactKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider" => Ok(Self::Provider),
            "client" => Ok(Self::Client),
            "both" => Ok(Self::Both),
            other => Err(ModelError::UnknownVariant {
                kind: "contact kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub rut: String,
    pub name: Option<String>,
    pub kind: ContactKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Pending,
    Downloaded,
    Error,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
        }
    }
}

impl FromStr for ArtifactState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloaded" => Ok(Self::Downloaded),
            "error" => Ok(Self::Error),
            other => Err(ModelError::UnknownVariant {
                kind: "artifact state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormKey {
    pub entity_id: Uuid,
    pub form_code: String,
    pub folio: String,
}

/// One submitted tax form (e.g. a monthly F29) and the state of its PDF artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormArtifactRecord {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub form_code: String,
    pub folio: String,
    /// Portal-internal id needed to request the artifact. Never cleared once set.
    pub internal_id: Option<String>,
    pub period: SyncPeriod,
    pub status: String,
    pub amount: Option<i64>,
    pub storage_ref: Option<String>,
    pub download_state: ArtifactState,
    pub last_error: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub extracted: Option<JsonValue>,
}

impl FormArtifactRecord {
    pub fn listed(
        entity_id: Uuid,
        form_code: impl Into<String>,
        folio: impl Into<String>,
        period: SyncPeriod,
        internal_id: Option<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            form_code: form_code.into(),
            folio: folio.into(),
            internal_id,
            period,
            status: status.into(),
            amount: None,
            storage_ref: None,
            download_state: ArtifactState::Pending,
            last_error: None,
            downloaded_at: None,
            extracted: None,
        }
    }

    pub fn key(&self) -> FormKey {
        FormKey {
            entity_id: self.entity_id,
            form_code: self.form_code.clone(),
            folio: self.folio.clone(),
        }
    }
}

/// Normalize a RUT to `<digits>-<check digit>` with no dots, no leading zeros and
/// an uppercase `K`. Returns `None` when the input cannot be a RUT.
pub fn normalize_rut(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '.' | ' ' | '\t'))
        .collect::<String>()
        .to_ascii_uppercase();

    let (body, dv) = match cleaned.split_once('-') {
        Some((body, dv)) => (body.to_string(), dv.to_string()),
        None if cleaned.len() > 1 => {
            let (body, dv) = cleaned.split_at(cleaned.len() - 1);
            (body.to_string(), dv.to_string())
        }
        None => return None,
    };

    let body = body.trim_start_matches('0');
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut dv_chars = dv.chars();
    let dv = match (dv_chars.next(), dv_chars.next()) {
        (Some(c), None) if c.is_ascii_digit() || c == 'K' => c,
        _ => return None,
    };
    Some(format!("{body}-{dv}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(folio: &str, rut: Option<&str>) -> DocumentRecord {
        DocumentRecord {
            entity_id: Uuid::nil(),
            family: DocumentFamily::Purchase,
            document_type: "33".into(),
            folio: folio.into(),
            period: SyncPeriod::new(2024, 10).unwrap(),
            granularity: Granularity::Detail,
            issue_date: None,
            counterparty_rut: rut.map(str::to_string),
            counterparty_name: None,
            net_amount: 0,
            tax_amount: 0,
            exempt_amount: 0,
            total_amount: 0,
            status: "registered".into(),
            extra_data: JsonValue::Null,
            contact_id: None,
        }
    }

    #[test]
    fn rut_normalization_strips_formatting() {
        assert_eq!(normalize_rut("76.123.456-k").as_deref(), Some("76123456-K"));
        assert_eq!(normalize_rut("761234560").as_deref(), Some("76123456-0"));
        assert_eq!(normalize_rut("0012345678-9").as_deref(), Some("12345678-9"));
        assert_eq!(normalize_rut(""), None);
        assert_eq!(normalize_rut("abc-1"), None);
        assert_eq!(normalize_rut("12345-XY"), None);
    }

    #[test]
    fn contact_kind_only_widens() {
        assert_eq!(ContactKind::Provider.widen(ContactKind::Provider), ContactKind::Provider);
        assert_eq!(ContactKind::Provider.widen(ContactKind::Client), ContactKind::Both);
        assert_eq!(ContactKind::Both.widen(ContactKind::Client), ContactKind::Both);
        assert_eq!(ContactKind::Client.widen(ContactKind::Both), ContactKind::Both);
    }

    #[test]
    fn period_codes_round_trip_and_reject_garbage() {
        let period: SyncPeriod = "202410".parse().unwrap();
        assert_eq!(period, SyncPeriod::new(2024, 10).unwrap());
        assert_eq!(period.code(), "202410");
        assert!("202413".parse::<SyncPeriod>().is_err());
        assert!("2024-1".parse::<SyncPeriod>().is_err());
        assert_eq!(
            SyncPeriod::new(2024, 1).unwrap().previous(),
            SyncPeriod::new(2023, 12).unwrap()
        );
    }

    #[test]
    fn purchase_key_includes_normalized_counterparty() {
        let a = purchase("100", Some("76.123.456-K"));
        let b = purchase("100", Some("76123456-k"));
        let c = purchase("100", Some("11.111.111-1"));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());

        let mut sale = purchase("100", Some("11.111.111-1"));
        sale.family = DocumentFamily::Sale;
        assert_eq!(sale.key().counterparty_key, "");
    }

    #[test]
    fn synthetic_folios_are_deterministic() {
        let period = SyncPeriod::new(2024, 10).unwrap();
        assert_eq!(aggregate_folio(period, "35"), "AGG-202410-35");
        assert_eq!(
            daily_folio(NaiveDate::from_ymd_opt(2024, 10, 3).unwrap()),
            "DAY-20241003"
        );
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = PortalCredentials {
            rut: "76123456-K".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
