//! Surface of the opaque, blocking portal automation client.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use taxmirror_core::{Cookie, DocumentFamily, PortalCredentials, SyncPeriod};

use crate::PortalError;

/// One logical extraction against the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortalRequest {
    ContributorInfo,
    Summary {
        family: DocumentFamily,
        period: SyncPeriod,
    },
    Documents {
        family: DocumentFamily,
        period: SyncPeriod,
        document_type: String,
    },
    DailyTotals {
        family: DocumentFamily,
        period: SyncPeriod,
        document_type: String,
    },
    Receipts {
        period: SyncPeriod,
    },
    FormList {
        form_code: String,
        year: i32,
    },
    FormArtifact {
        form_code: String,
        folio: String,
        internal_id: String,
    },
}

impl PortalRequest {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ContributorInfo => "contributor_info",
            Self::Summary { .. } => "summary",
            Self::Documents { .. } => "documents",
            Self::DailyTotals { .. } => "daily_totals",
            Self::Receipts { .. } => "receipts",
            Self::FormList { .. } => "form_list",
            Self::FormArtifact { .. } => "form_artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortalPayload {
    Json(JsonValue),
    Binary { bytes: Vec<u8>, content_type: String },
}

impl PortalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Binary { .. } => "binary",
        }
    }
}

/// Failure classes reported explicitly by automation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    SessionExpired,
    Extraction,
    Unavailable,
}

impl FailureKind {
    pub fn into_error(self, message: String) -> PortalError {
        match self {
            Self::Authentication => PortalError::Authentication(message),
            Self::SessionExpired => PortalError::SessionExpired(message),
            Self::Extraction => PortalError::Extraction(message),
            Self::Unavailable => PortalError::Unavailable(message),
        }
    }
}

/// Result of one data call plus the jar the client held when the call ended,
/// whether or not the call succeeded.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<PortalPayload, PortalError>,
    pub cookies: Vec<Cookie>,
}

/// Blocking client that drives the portal. Implementations may sleep, render
/// pages or wait on the network; callers run them on the blocking pool.
pub trait PortalAutomation: Send + Sync + 'static {
    fn login(&self, credentials: &PortalCredentials) -> Result<Vec<Cookie>, PortalError>;

    fn is_session_valid(&self, cookies: &[Cookie]) -> Result<bool, PortalError>;

    fn execute(&self, request: &PortalRequest, cookies: &[Cookie]) -> CallOutcome;
}
