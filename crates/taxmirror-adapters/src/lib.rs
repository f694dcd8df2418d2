//! Portal adapter, payload parsing and automation clients.

pub mod adapter;
pub mod automation;
pub mod fixture;
pub mod granularity;
pub mod parser;
pub mod sidecar;

use taxmirror_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub use adapter::{with_auth_recovery, PortalAdapter, DEFAULT_MIN_COOKIES};
pub use automation::{CallOutcome, FailureKind, PortalAutomation, PortalPayload, PortalRequest};
pub use fixture::FixtureAutomation;
pub use granularity::{ExtractionPlan, GranularityPolicy};
pub use parser::{ContributorInfo, ParseError, ParsedPayload, SummaryEntry};
pub use sidecar::SidecarAutomation;

pub const CRATE_NAME: &str = "taxmirror-adapters";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal authentication failed: {0}")]
    Authentication(String),
    #[error("portal session expired: {0}")]
    SessionExpired(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("portal automation unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error(transparent)]
    Store(StoreError),
}

impl PortalError {
    /// Failures that a fresh login may fix.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::SessionExpired(_))
    }
}

impl From<ParseError> for PortalError {
    fn from(err: ParseError) -> Self {
        Self::Extraction(err.to_string())
    }
}
