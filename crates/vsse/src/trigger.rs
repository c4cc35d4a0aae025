//! Trigger requests: the POST that starts server-side work whose results
//! stream back over the shared SSE connection.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, header::CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    error::{TransportError, TransportResult},
    types::RequestId,
};

/// Header carrying the correlation id on trigger requests.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// A fully resolved trigger request.
#[derive(Clone, Debug)]
pub struct TriggerRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Value,
    pub request_id: RequestId,
    pub timeout: Duration,
}

impl TriggerRequest {
    /// The body as sent: object bodies get a `requestId` field, other JSON
    /// values are sent unchanged.
    pub fn body_with_request_id(&self) -> Value {
        let mut body = self.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert(
                "requestId".to_string(),
                Value::String(self.request_id.as_str().to_string()),
            );
        }
        body
    }
}

/// Sends trigger requests.
///
/// The default implementation is [`HttpTrigger`]; tests and embedders can
/// substitute their own.
#[async_trait]
pub trait TriggerTransport: Send + Sync + fmt::Debug + 'static {
    /// Deliver the request. A non-2xx response is an error.
    async fn send(&self, request: TriggerRequest) -> TransportResult<()>;
}

/// [`TriggerTransport`] over a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpTrigger {
    client: reqwest::Client,
}

impl HttpTrigger {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a trigger with its own client configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the HTTP client cannot be built.
    pub fn from_config(config: &ClientConfig) -> TransportResult<Self> {
        build_http_client(config).map(Self::new)
    }
}

#[async_trait]
impl TriggerTransport for HttpTrigger {
    async fn send(&self, request: TriggerRequest) -> TransportResult<()> {
        let body = request.body_with_request_id();
        let mut headers = request.headers;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let id_value = HeaderValue::from_str(request.request_id.as_str())
            .map_err(|e| TransportError::invalid_header(REQUEST_ID_HEADER.as_str(), e))?;
        headers.insert(REQUEST_ID_HEADER, id_value);

        debug!(url = %request.url, request_id = %request.request_id, "Sending trigger request");

        let response = self
            .client
            .post(request.url.clone())
            .headers(headers)
            .timeout(request.timeout)
            .body(serde_json::to_vec(&body)?)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::timeout(request.timeout)
                } else {
                    TransportError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                url = %request.url,
                request_id = %request.request_id,
                status = status.as_u16(),
                "Trigger request rejected"
            );
            return Err(TransportError::api(status, body));
        }
        Ok(())
    }
}

/// Build the HTTP client shared by the SSE handshake and trigger requests.
///
/// `sse_with_credentials` enables the cookie store so session cookies set by
/// one request are sent with the next.
///
/// # Errors
///
/// Returns [`TransportError::Config`] if the client cannot be built.
pub fn build_http_client(config: &ClientConfig) -> TransportResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .cookie_store(config.sse_with_credentials)
        .build()
        .map_err(|e| TransportError::config(format!("Failed to build HTTP client: {e}")))
}
