//! Automation client that talks to a headless-browser sidecar over HTTP.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use taxmirror_core::{Cookie, PortalCredentials};
use tracing::debug;

use crate::automation::{CallOutcome, FailureKind, PortalAutomation, PortalPayload, PortalRequest};
use crate::PortalError;

/// Header carrying the jar on binary responses, as a JSON array.
pub const COOKIES_HEADER: &str = "x-portal-cookies";

/// An error plus the jar the sidecar reported with it, if any.
type Failure = (PortalError, Option<Vec<Cookie>>);

#[derive(Debug, Deserialize)]
struct SidecarErrorBody {
    kind: FailureKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cookies: Option<Vec<Cookie>>,
}

impl SidecarErrorBody {
    fn into_error(self) -> PortalError {
        self.kind.into_error(self.message)
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    rut: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct JarBody {
    cookies: Vec<Cookie>,
}

#[derive(Serialize)]
struct ValidateBody<'a> {
    cookies: &'a [Cookie],
}

#[derive(Deserialize)]
struct ValidateResponse {
    valid: bool,
}

#[derive(Serialize)]
struct ExtractBody<'a> {
    request: &'a PortalRequest,
    cookies: &'a [Cookie],
}

#[derive(Deserialize)]
struct ExtractResponse {
    payload: JsonValue,
    #[serde(default)]
    cookies: Option<Vec<Cookie>>,
}

#[derive(Debug)]
pub struct SidecarAutomation {
    base_url: String,
    timeout: Duration,
    client: OnceLock<Client>,
}

impl SidecarAutomation {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: OnceLock::new(),
        }
    }

    /// Built on first use, which is always on a blocking worker.
    fn client(&self) -> Result<&Client, PortalError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| PortalError::Unavailable(format!("building sidecar client: {err}")))?;
        Ok(self.client.get_or_init(|| built))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, PortalError> {
        let url = self.url(path);
        self.client()?
            .post(&url)
            .json(body)
            .send()
            .map_err(|err| PortalError::Unavailable(format!("POST {url}: {err}")))
    }

    fn error_from(response: Response) -> Failure {
        let status = response.status();
        match response.json::<SidecarErrorBody>() {
            Ok(body) => {
                let cookies = body.cookies.clone();
                (body.into_error(), cookies)
            }
            Err(_) if status.is_server_error() => {
                (PortalError::Unavailable(format!("sidecar returned {status}")), None)
            }
            Err(_) => (PortalError::Extraction(format!("sidecar returned {status}")), None),
        }
    }

    fn extract(
        &self,
        request: &PortalRequest,
        cookies: &[Cookie],
    ) -> Result<(PortalPayload, Option<Vec<Cookie>>), Failure> {
        let response = self
            .post("extract", &ExtractBody { request, cookies })
            .map_err(|err| (err, None))?;
        if !response.status().is_success() {
            return Err(Self::error_from(response));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        if content_type.starts_with("application/json") {
            let body: ExtractResponse = response
                .json()
                .map_err(|err| (PortalError::Extraction(format!("decoding sidecar response: {err}")), None))?;
            return Ok((PortalPayload::Json(body.payload), body.cookies));
        }

        let jar = response
            .headers()
            .get(COOKIES_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| serde_json::from_str::<Vec<Cookie>>(raw).ok());
        let bytes = response
            .bytes()
            .map_err(|err| (PortalError::Unavailable(format!("reading artifact body: {err}")), jar.clone()))?;
        Ok((
            PortalPayload::Binary {
                bytes: bytes.to_vec(),
                content_type,
            },
            jar,
        ))
    }
}

impl PortalAutomation for SidecarAutomation {
    fn login(&self, credentials: &PortalCredentials) -> Result<Vec<Cookie>, PortalError> {
        let response = self.post(
            "login",
            &LoginBody {
                rut: &credentials.rut,
                password: &credentials.password,
            },
        )?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).0);
        }
        let body: JarBody = response
            .json()
            .map_err(|err| PortalError::Authentication(format!("decoding login response: {err}")))?;
        debug!(cookies = body.cookies.len(), "sidecar login succeeded");
        Ok(body.cookies)
    }

    fn is_session_valid(&self, cookies: &[Cookie]) -> Result<bool, PortalError> {
        let response = self.post("session/validate", &ValidateBody { cookies })?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).0);
        }
        let body: ValidateResponse = response
            .json()
            .map_err(|err| PortalError::Extraction(format!("decoding validity probe: {err}")))?;
        Ok(body.valid)
    }

    fn execute(&self, request: &PortalRequest, cookies: &[Cookie]) -> CallOutcome {
        match self.extract(request, cookies) {
            Ok((payload, jar)) => CallOutcome {
                result: Ok(payload),
                cookies: jar.unwrap_or_else(|| cookies.to_vec()),
            },
            Err((err, jar)) => CallOutcome {
                result: Err(err),
                cookies: jar.unwrap_or_else(|| cookies.to_vec()),
            },
        }
    }
}
