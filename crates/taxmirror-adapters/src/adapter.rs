//! Bridges the blocking automation client into async callers and keeps the
//! stored cookie jar in step with every call.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use taxmirror_core::{Cookie, PortalCredentials};
use taxmirror_storage::CredentialStore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::automation::{PortalAutomation, PortalPayload, PortalRequest};
use crate::parser::ParsedPayload;
use crate::PortalError;

/// Jars smaller than this are treated as a logged-out session.
pub const DEFAULT_MIN_COOKIES: usize = 3;

/// Run `op` once; on an authentication failure run it exactly once more with a
/// forced fresh login. Other failures are returned as-is.
pub async fn with_auth_recovery<T, F, Fut>(label: &str, mut op: F) -> Result<T, PortalError>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = Result<T, PortalError>>,
{
    match op(false).await {
        Err(err) if err.is_auth() => {
            warn!(request = label, error = %err, "authentication failed, retrying with fresh login");
            op(true).await
        }
        other => other,
    }
}

struct BlockingCall {
    result: Result<PortalPayload, PortalError>,
    cookies: Option<Vec<Cookie>>,
    completed_at: DateTime<Utc>,
}

fn needs_login(automation: &dyn PortalAutomation, jar: Option<&[Cookie]>, min_cookies: usize) -> bool {
    match jar {
        None => true,
        Some(cookies) if cookies.len() < min_cookies => true,
        Some(cookies) => match automation.is_session_valid(cookies) {
            Ok(valid) => !valid,
            Err(err) => {
                debug!(error = %err, "session probe failed, logging in");
                true
            }
        },
    }
}

fn run_blocking(
    automation: &dyn PortalAutomation,
    credentials: &PortalCredentials,
    jar: Option<Vec<Cookie>>,
    request: &PortalRequest,
    force_login: bool,
    min_cookies: usize,
) -> BlockingCall {
    let jar = if force_login { None } else { jar };
    let jar = if needs_login(automation, jar.as_deref(), min_cookies) {
        match automation.login(credentials) {
            Ok(fresh) => fresh,
            Err(err) => {
                return BlockingCall {
                    result: Err(err),
                    cookies: None,
                    completed_at: Utc::now(),
                }
            }
        }
    } else {
        jar.unwrap_or_default()
    };
    let outcome = automation.execute(request, &jar);
    BlockingCall {
        result: outcome.result,
        cookies: Some(outcome.cookies),
        completed_at: Utc::now(),
    }
}

#[derive(Clone)]
pub struct PortalAdapter {
    automation: Arc<dyn PortalAutomation>,
    credentials: Arc<dyn CredentialStore>,
    min_cookies: usize,
}

impl PortalAdapter {
    pub fn new(automation: Arc<dyn PortalAutomation>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            automation,
            credentials,
            min_cookies: DEFAULT_MIN_COOKIES,
        }
    }

    pub fn with_min_cookies(mut self, min_cookies: usize) -> Self {
        self.min_cookies = min_cookies;
        self
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// One portal call. The jar observed when the call ends is persisted before
    /// returning, on success and on failure alike.
    pub async fn call(
        &self,
        session_id: Uuid,
        request: &PortalRequest,
        force_login: bool,
    ) -> Result<PortalPayload, PortalError> {
        let span = info_span!(
            "portal_call",
            %session_id,
            request = request.label(),
            force_login
        );
        self.call_inner(session_id, request.clone(), force_login)
            .instrument(span)
            .await
    }

    async fn call_inner(
        &self,
        session_id: Uuid,
        request: PortalRequest,
        force_login: bool,
    ) -> Result<PortalPayload, PortalError> {
        let session = self.credentials.get(session_id).await.map_err(|err| {
            if err.is_not_found() {
                PortalError::SessionNotFound(session_id)
            } else {
                PortalError::Store(err)
            }
        })?;
        if !session.active {
            return Err(PortalError::SessionNotFound(session_id));
        }

        let automation = Arc::clone(&self.automation);
        let min_cookies = self.min_cookies;
        let credentials = session.credentials;
        let jar = session.cookies;
        let call = tokio::task::spawn_blocking(move || {
            run_blocking(automation.as_ref(), &credentials, jar, &request, force_login, min_cookies)
        })
        .await
        .map_err(|err| PortalError::Unavailable(format!("automation worker failed: {err}")))?;

        if let Some(cookies) = &call.cookies {
            self.credentials
                .put(session_id, cookies, call.completed_at)
                .await
                .map_err(PortalError::Store)?;
            debug!(cookies = cookies.len(), "cookie jar captured");
        }
        call.result
    }

    /// [`call`](Self::call) under the auth-recovery policy.
    pub async fn fetch(&self, session_id: Uuid, request: &PortalRequest) -> Result<PortalPayload, PortalError> {
        with_auth_recovery(request.label(), |force| self.call(session_id, request, force)).await
    }

    /// Fetch and validate into a typed payload.
    pub async fn fetch_parsed(
        &self,
        session_id: Uuid,
        request: &PortalRequest,
    ) -> Result<ParsedPayload, PortalError> {
        let payload = self.fetch(session_id, request).await?;
        let parsed = ParsedPayload::decode(request, payload)?;
        info!(%session_id, request = request.label(), payload = parsed.kind(), "portal payload parsed");
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;
    use taxmirror_core::{DocumentFamily, Session, SyncPeriod};
    use taxmirror_storage::MemoryCredentialStore;

    use crate::automation::CallOutcome;

    /// Rotates the jar on every call and fails with the scripted errors first.
    struct ScriptedAutomation {
        logins: AtomicUsize,
        calls: AtomicUsize,
        probes_valid: bool,
        failures: Mutex<Vec<PortalError>>,
    }

    impl ScriptedAutomation {
        fn new(probes_valid: bool, failures: Vec<PortalError>) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                probes_valid,
                failures: Mutex::new(failures),
            }
        }

        fn jar(tag: &str) -> Vec<Cookie> {
            ["TOKEN", "CSESSIONID", "NETSCAPE_LIVEWIRE"]
                .iter()
                .map(|name| Cookie::new(*name, format!("{name}-{tag}"), "portal.example"))
                .collect()
        }
    }

    impl PortalAutomation for ScriptedAutomation {
        fn login(&self, _credentials: &PortalCredentials) -> Result<Vec<Cookie>, PortalError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(Self::jar(&format!("login{n}")))
        }

        fn is_session_valid(&self, _cookies: &[Cookie]) -> Result<bool, PortalError> {
            Ok(self.probes_valid)
        }

        fn execute(&self, _request: &PortalRequest, _cookies: &[Cookie]) -> CallOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            let result = if failures.is_empty() {
                Ok(PortalPayload::Json(json!({"entries": []})))
            } else {
                Err(failures.remove(0))
            };
            CallOutcome {
                result,
                cookies: Self::jar(&format!("call{n}")),
            }
        }
    }

    fn setup(automation: ScriptedAutomation) -> (Arc<ScriptedAutomation>, Arc<MemoryCredentialStore>, PortalAdapter, Session) {
        let session = Session::new(
            Uuid::new_v4(),
            PortalCredentials {
                rut: "76123456-K".into(),
                password: "pw".into(),
            },
        );
        let automation = Arc::new(automation);
        let store = Arc::new(MemoryCredentialStore::with_sessions([session.clone()]));
        let adapter = PortalAdapter::new(automation.clone(), store.clone());
        (automation, store, adapter, session)
    }

    fn summary() -> PortalRequest {
        PortalRequest::Summary {
            family: DocumentFamily::Sale,
            period: SyncPeriod::new(2024, 10).unwrap(),
        }
    }

    #[tokio::test]
    async fn stored_jar_tracks_the_last_call() {
        let (automation, store, adapter, session) = setup(ScriptedAutomation::new(true, vec![]));
        for _ in 0..3 {
            adapter.fetch(session.id, &summary()).await.expect("fetch");
        }
        let stored = store.get(session.id).await.unwrap();
        assert_eq!(stored.cookies, Some(ScriptedAutomation::jar("call2")));
        // First call logs in; the rotated jars are reused afterwards.
        assert_eq!(automation.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_probe_forces_login() {
        let (automation, _store, adapter, session) = setup(ScriptedAutomation::new(false, vec![]));
        adapter.fetch(session.id, &summary()).await.unwrap();
        adapter.fetch(session.id, &summary()).await.unwrap();
        assert_eq!(automation.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_session_is_retried_once_with_fresh_login() {
        let (automation, _store, adapter, session) = setup(ScriptedAutomation::new(
            true,
            vec![PortalError::SessionExpired("redirected to login".into())],
        ));
        adapter.fetch(session.id, &summary()).await.expect("recovered");
        assert_eq!(automation.calls.load(Ordering::SeqCst), 2);
        assert_eq!(automation.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_auth_failure_is_surfaced() {
        let (automation, store, adapter, session) = setup(ScriptedAutomation::new(
            true,
            vec![
                PortalError::Authentication("bad password".into()),
                PortalError::Authentication("bad password".into()),
                PortalError::Authentication("never reached".into()),
            ],
        ));
        let err = adapter.fetch(session.id, &summary()).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(automation.calls.load(Ordering::SeqCst), 2);
        // The jar from the failed call is still persisted.
        assert_eq!(
            store.get(session.id).await.unwrap().cookies,
            Some(ScriptedAutomation::jar("call1"))
        );
    }

    #[tokio::test]
    async fn extraction_errors_are_not_retried() {
        let (automation, _store, adapter, session) = setup(ScriptedAutomation::new(
            true,
            vec![PortalError::Extraction("table not found".into())],
        ));
        let err = adapter.fetch(session.id, &summary()).await.unwrap_err();
        assert!(matches!(err, PortalError::Extraction(_)));
        assert_eq!(automation.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_reported_as_such() {
        let (_automation, _store, adapter, _session) = setup(ScriptedAutomation::new(true, vec![]));
        let missing = Uuid::new_v4();
        let err = adapter.fetch(missing, &summary()).await.unwrap_err();
        assert!(matches!(err, PortalError::SessionNotFound(id) if id == missing));
    }
}
