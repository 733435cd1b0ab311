// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the Sqreen backend API.
//!
//! Each method performs exactly one request. Retrying is the caller's job
//! (see [`crate::retry`]); session state lives in the scheduler. Every
//! failure is returned as a [`ContextError`] rooted in a [`BackendError`] and
//! annotated with the endpoint it came from.

use crate::api::{
    AppBeatRequest, AppBeatResponse, AppLoginRequest, AppLoginResponse, BatchRequest, Endpoint,
    APP_BEAT, APP_LOGIN, APP_LOGOUT, BATCH, HEADER_APP_NAME, HEADER_SESSION, HEADER_TOKEN,
};
use crate::buffer::EventBatch;
use crate::config::AgentConfig;
use crate::errors::{self, ContextError};
use crate::transport::build_client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Failure of a single backend exchange.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection, timeout or body transfer failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend reported a temporary condition (5xx, 408, 429).
    #[error("transient backend error: status {0}")]
    Retryable(u16),
    /// Credentials or session were rejected (401, 403).
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// Any other non-success status.
    #[error("request rejected: status {0}")]
    Rejected(u16),
    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),
    #[error("http client configuration error: {0}")]
    ClientConfig(String),
}

impl BackendError {
    /// Whether trying the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transport(_) | BackendError::Retryable(_))
    }
}

impl From<BackendError> for ContextError {
    fn from(err: BackendError) -> Self {
        ContextError::new(err)
    }
}

/// Classifier for the retry controller: retryable only for transient backend errors.
pub fn is_retryable(err: &ContextError) -> bool {
    err.downcast_root::<BackendError>()
        .is_some_and(BackendError::is_retryable)
}

/// Whether the backend refused the credentials or session of the request.
pub fn is_unauthorized(err: &ContextError) -> bool {
    matches!(
        err.downcast_root::<BackendError>(),
        Some(BackendError::Unauthorized(_))
    )
}

/// Maps HTTP status codes to the backend error taxonomy.
fn classify_status(status: StatusCode) -> Result<(), BackendError> {
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BackendError::Unauthorized(code));
    }
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(BackendError::Retryable(code));
    }
    Err(BackendError::Rejected(code))
}

/// Tags a failure with the endpoint it happened on.
fn annotate(endpoint: &Endpoint, err: BackendError) -> ContextError {
    let err = errors::with_info(
        err,
        [
            ("endpoint", endpoint.name),
            ("method", endpoint.method.as_str()),
            ("path", endpoint.path),
        ],
    );
    errors::wrap(err, format!("{} request failed", endpoint.name))
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, BackendError> {
    HeaderValue::from_str(value).map_err(|_| BackendError::InvalidHeader(name))
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = ["x-api-key", "x-session-key"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}

/// Client bound to one backend base URL. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &AgentConfig) -> Result<Self, BackendError> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)?;
        Ok(Self::with_client(client, &config.base_url))
    }

    /// Uses an already configured reqwest client.
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticates the agent and opens a session.
    pub async fn login(
        &self,
        request: &AppLoginRequest,
        token: &str,
        app_name: &str,
    ) -> Result<AppLoginResponse, ContextError> {
        let result: Result<AppLoginResponse, BackendError> = async {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_TOKEN, header_value(HEADER_TOKEN, token)?);
            headers.insert(HEADER_APP_NAME, header_value(HEADER_APP_NAME, app_name)?);
            self.exchange(&APP_LOGIN, headers, Some(request)).await
        }
        .await;
        result.map_err(|e| annotate(&APP_LOGIN, e))
    }

    /// Keeps the session alive.
    pub async fn heartbeat(
        &self,
        request: &AppBeatRequest,
        session_key: &str,
    ) -> Result<AppBeatResponse, ContextError> {
        let result: Result<AppBeatResponse, BackendError> = async {
            let headers = session_headers(session_key)?;
            self.exchange(&APP_BEAT, headers, Some(request)).await
        }
        .await;
        result.map_err(|e| annotate(&APP_BEAT, e))
    }

    /// Uploads one batch of events.
    pub async fn batch(&self, batch: &EventBatch, session_key: &str) -> Result<(), ContextError> {
        let result: Result<(), BackendError> = async {
            let headers = session_headers(session_key)?;
            let body = BatchRequest::from(batch);
            self.send(&BATCH, headers, Some(&body)).await.map(|_| ())
        }
        .await;
        result.map_err(|e| annotate(&BATCH, e))
    }

    /// Closes the session. Never retried: the session ends either way.
    pub async fn logout(&self, session_key: &str) -> Result<(), ContextError> {
        let result: Result<(), BackendError> = async {
            let headers = session_headers(session_key)?;
            self.send::<()>(&APP_LOGOUT, headers, None).await.map(|_| ())
        }
        .await;
        result.map_err(|e| annotate(&APP_LOGOUT, e))
    }

    /// Sends the request and decodes the JSON response body.
    async fn exchange<Req, Res>(
        &self,
        endpoint: &Endpoint,
        headers: HeaderMap,
        body: Option<&Req>,
    ) -> Result<Res, BackendError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let bytes = self.send(endpoint, headers, body).await?;
        serde_json::from_slice(&bytes).map_err(BackendError::Decode)
    }

    /// Attaches headers and body, sends the request and classifies the status.
    async fn send<Req>(
        &self,
        endpoint: &Endpoint,
        mut headers: HeaderMap,
        body: Option<&Req>,
    ) -> Result<Vec<u8>, BackendError>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint.path);
        let body = body
            .map(|body| serde_json::to_vec(body).map_err(BackendError::Encode))
            .transpose()?;
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        debug!(
            endpoint = endpoint.name,
            method = %endpoint.method,
            url = %url,
            headers = ?redact_headers(&headers),
            body_len = body.as_ref().map_or(0, Vec::len),
            "backend HTTP request"
        );

        let builder = self
            .client
            .request(endpoint.method.clone(), &url)
            .headers(headers);
        let builder = match body {
            Some(bytes) => builder.body(bytes),
            None => builder,
        };
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        debug!(
            endpoint = endpoint.name,
            status = %status,
            content_length = bytes.len(),
            "backend HTTP response"
        );
        if !status.is_success() {
            debug!(
                endpoint = endpoint.name,
                body = %String::from_utf8_lossy(&bytes),
                "backend error response body"
            );
        }

        classify_status(status)?;
        Ok(bytes.to_vec())
    }
}

fn session_headers(session_key: &str) -> Result<HeaderMap, BackendError> {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_SESSION, header_value(HEADER_SESSION, session_key)?);
    Ok(headers)
}
