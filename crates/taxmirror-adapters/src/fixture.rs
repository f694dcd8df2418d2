//! Offline automation that replays recorded portal responses.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use taxmirror_core::{Cookie, PortalCredentials};

use crate::automation::{CallOutcome, FailureKind, PortalAutomation, PortalPayload, PortalRequest};
use crate::PortalError;

#[derive(Debug, Clone, Deserialize)]
struct FixtureError {
    kind: FailureKind,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureEntry {
    request: PortalRequest,
    #[serde(default)]
    payload: Option<JsonValue>,
    /// Binary body read from a file next to the bundle.
    #[serde(default)]
    file: Option<String>,
    /// Binary body given inline, e.g. an HTML error page.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    error: Option<FixtureError>,
}

#[derive(Debug, Deserialize)]
struct FixtureBundle {
    #[serde(default)]
    login_cookies: Vec<Cookie>,
    #[serde(default)]
    reject_password: Option<String>,
    responses: Vec<FixtureEntry>,
}

#[derive(Debug, Clone)]
enum Reply {
    Payload(PortalPayload),
    Failure(FailureKind, String),
}

#[derive(Debug)]
pub struct FixtureAutomation {
    login_cookies: Vec<Cookie>,
    reject_password: Option<String>,
    replies: Vec<(PortalRequest, Reply)>,
    calls: AtomicUsize,
}

impl FixtureAutomation {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let bundle: FixtureBundle =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_bundle(bundle, base)
    }

    pub fn from_json(text: &str, base_dir: impl AsRef<Path>) -> Result<Self> {
        let bundle: FixtureBundle = serde_json::from_str(text).context("parsing fixture bundle")?;
        Self::from_bundle(bundle, base_dir.as_ref())
    }

    fn from_bundle(bundle: FixtureBundle, base_dir: &Path) -> Result<Self> {
        let mut replies = Vec::with_capacity(bundle.responses.len());
        for entry in bundle.responses {
            let label = entry.request.label();
            let content_type = entry
                .content_type
                .clone()
                .unwrap_or_else(|| "application/pdf".to_string());
            let reply = match (entry.payload, entry.file, entry.text, entry.error) {
                (Some(payload), None, None, None) => Reply::Payload(PortalPayload::Json(payload)),
                (None, Some(file), None, None) => {
                    let file_path = base_dir.join(&file);
                    let bytes = fs::read(&file_path)
                        .with_context(|| format!("reading fixture artifact {}", file_path.display()))?;
                    Reply::Payload(PortalPayload::Binary { bytes, content_type })
                }
                (None, None, Some(text), None) => Reply::Payload(PortalPayload::Binary {
                    bytes: text.into_bytes(),
                    content_type,
                }),
                (None, None, None, Some(error)) => Reply::Failure(error.kind, error.message),
                _ => bail!("fixture for {label} must set exactly one of payload, file, text or error"),
            };
            replies.push((entry.request, reply));
        }
        Ok(Self {
            login_cookies: bundle.login_cookies,
            reject_password: bundle.reject_password,
            replies,
            calls: AtomicUsize::new(0),
        })
    }

    /// Data calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PortalAutomation for FixtureAutomation {
    fn login(&self, credentials: &PortalCredentials) -> Result<Vec<Cookie>, PortalError> {
        if self.reject_password.as_deref() == Some(credentials.password.as_str()) {
            return Err(PortalError::Authentication("invalid credentials".into()));
        }
        Ok(self.login_cookies.clone())
    }

    fn is_session_valid(&self, cookies: &[Cookie]) -> Result<bool, PortalError> {
        Ok(!cookies.is_empty())
    }

    fn execute(&self, request: &PortalRequest, cookies: &[Cookie]) -> CallOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.replies.iter().find(|(recorded, _)| recorded == request) {
            Some((_, Reply::Payload(payload))) => Ok(payload.clone()),
            Some((_, Reply::Failure(kind, message))) => Err(kind.into_error(message.clone())),
            None => Err(PortalError::Extraction(format!(
                "no recorded response for {} request",
                request.label()
            ))),
        };
        CallOutcome {
            result,
            cookies: cookies.to_vec(),
        }
    }
}
