//! User-facing client API.
//!
//! [`SseClient`] owns the configuration, the pending request store and the
//! handle to the connection driver. It is cheap to clone and can be shared
//! across tasks; the driver shuts down when the last clone is dropped.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    config::{ClientConfig, ConfigUpdate},
    connection::{ConnectionDriver, ConnectionState, DriverCommand, Shared},
    correlator::Subscription,
    error::{TransportError, TransportResult},
    headers::compose_headers,
    trigger::{HttpTrigger, TriggerRequest, TriggerTransport, build_http_client},
    types::ListenEvent,
};

/// Per-call options for [`SseClient::post_and_listen_with`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PostOptions {
    /// Headers for this trigger request only. They take precedence over the
    /// configured headers and the bearer token.
    pub headers: BTreeMap<String, String>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl PostOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resilient SSE client correlating trigger requests with streamed events.
///
/// Every [`post_and_listen`](Self::post_and_listen) call registers a callback
/// under a fresh [`RequestId`](crate::RequestId), sends the trigger request
/// and makes sure the shared stream is connecting or open. Events whose `requestId` matches are
/// delivered to that callback in arrival order.
///
/// # Example
///
/// ```rust,ignore
/// let client = SseClient::new(
///     ClientConfig::new("https://api.example.com/sse/authenticated").token(jwt),
/// )?;
///
/// let sub = client
///     .post_and_listen("/api/chat", &json!({ "prompt": "hello" }), |event| {
///         println!("{} {}: {}", event.phase, event.event_type, event.payload);
///     })
///     .await?;
///
/// // Later
/// sub.unsubscribe();
/// client.close().await;
/// ```
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<Shared>,
    /// Custom trigger transport; `None` uses [`HttpTrigger`] on the shared
    /// HTTP client so cookies flow between triggers and the stream.
    trigger: Option<Arc<dyn TriggerTransport>>,
    driver: Mutex<Option<mpsc::Sender<DriverCommand>>>,
    closed: AtomicBool,
}

impl SseClient {
    /// Create a client. No connection is made until the first request or an
    /// explicit [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> TransportResult<Self> {
        Self::build(config, None)
    }

    /// Create a client that sends trigger requests through `trigger`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the HTTP client cannot be built.
    pub fn with_trigger<T: TriggerTransport>(config: ClientConfig, trigger: T) -> TransportResult<Self> {
        Self::build(config, Some(Arc::new(trigger)))
    }

    fn build(config: ClientConfig, trigger: Option<Arc<dyn TriggerTransport>>) -> TransportResult<Self> {
        let http = build_http_client(&config)?;
        debug!(url = %config.url, "SSE client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                shared: Arc::new(Shared::new(config, http)),
                trigger,
                driver: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send a trigger request and listen for its streamed events.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Config`] if the configuration is incomplete (no url)
    /// - [`TransportError::InvalidUrl`] if the stream or trigger url is malformed
    /// - [`TransportError::ConnectionClosed`] after [`close`](Self::close)
    /// - any error from the trigger request itself, in which case the request
    ///   is unsubscribed before returning
    pub async fn post_and_listen<B, F>(&self, path: &str, body: &B, callback: F) -> TransportResult<Subscription>
    where
        B: Serialize + ?Sized,
        F: Fn(ListenEvent) + Send + Sync + 'static,
    {
        self.post_and_listen_with(path, body, PostOptions::default(), callback)
            .await
    }

    /// [`post_and_listen`](Self::post_and_listen) with per-call options.
    ///
    /// # Errors
    ///
    /// See [`post_and_listen`](Self::post_and_listen).
    pub async fn post_and_listen_with<B, F>(
        &self,
        path: &str,
        body: &B,
        options: PostOptions,
        callback: F,
    ) -> TransportResult<Subscription>
    where
        B: Serialize + ?Sized,
        F: Fn(ListenEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;

        let config = self.config();
        config.validate().map_err(TransportError::config)?;
        config.stream_url()?;
        let url = config.trigger_url(path)?;
        let headers = compose_headers(&config.sse_headers, config.token.as_deref(), Some(&options.headers))?;
        let body = serde_json::to_value(body)?;

        let subscription = self.inner.shared.store.register(callback)?;
        let request = TriggerRequest {
            url,
            headers,
            body,
            request_id: subscription.request_id().clone(),
            timeout: options.timeout.unwrap_or(config.request_timeout),
        };

        if let Err(err) = self.ensure_connected() {
            subscription.unsubscribe();
            return Err(err);
        }

        if let Err(err) = self.trigger().send(request).await {
            warn!(request_id = %subscription.request_id(), error = %err, "Trigger request failed");
            subscription.unsubscribe();
            return Err(err);
        }

        info!(request_id = %subscription.request_id(), path, "Listening for request events");
        Ok(subscription)
    }

    fn trigger(&self) -> Arc<dyn TriggerTransport> {
        match &self.inner.trigger {
            Some(trigger) => Arc::clone(trigger),
            None => Arc::new(HttpTrigger::new(self.inner.shared.http.read().clone())),
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Merge `update` into the configuration.
    ///
    /// Connection-affecting changes are used from the next (re)connect on;
    /// an open stream keeps its handshake headers unless the update was made
    /// with [`ConfigUpdate::apply_immediately`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the merged configuration is
    /// invalid or the HTTP client cannot be rebuilt. The configuration is left
    /// unchanged in that case.
    pub async fn update_config(&self, update: ConfigUpdate) -> TransportResult<()> {
        if update.url.as_deref() == Some("") {
            return Err(TransportError::config("URL cannot be empty"));
        }

        {
            let mut config = self.inner.shared.config.write();
            let updated = update.apply_to(&config);
            updated.validate_settings().map_err(TransportError::config)?;
            if updated.sse_with_credentials != config.sse_with_credentials {
                *self.inner.shared.http.write() = build_http_client(&updated)?;
            }
            *config = updated;
        }

        info!(
            affects_connection = update.affects_connection(),
            reconnect_now = update.reconnect_now,
            "Configuration updated"
        );

        if update.reconnect_now && !matches!(self.state(), ConnectionState::Idle | ConnectionState::Closed) {
            self.reconnect("configuration updated").await?;
        }
        Ok(())
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> ClientConfig {
        self.inner.shared.config.read().clone()
    }

    // ========================================================================
    // Connection control
    // ========================================================================

    /// Start connecting without sending a request.
    ///
    /// # Errors
    ///
    /// Fails like [`post_and_listen`](Self::post_and_listen) on configuration
    /// errors or after [`close`](Self::close).
    pub async fn connect(&self) -> TransportResult<()> {
        self.ensure_open()?;
        let config = self.config();
        config.validate().map_err(TransportError::config)?;
        config.stream_url()?;
        self.ensure_connected()
    }

    /// Drop the current stream and connect again immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] after [`close`](Self::close).
    pub async fn reconnect(&self, reason: &str) -> TransportResult<()> {
        let cmd_tx = self.driver()?;
        cmd_tx
            .send(DriverCommand::Reconnect {
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| driver_gone())
    }

    /// Tear down the connection. Every pending request receives a final
    /// `cancelled` event; no callback fires after this returns.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let cmd_tx = {
            let mut driver = self.inner.driver.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            driver.take()
        };

        if let Some(cmd_tx) = cmd_tx {
            let (reply_tx, reply_rx) = oneshot::channel();
            if cmd_tx.send(DriverCommand::Close { reply_tx }).await.is_ok() && reply_rx.await.is_ok() {
                return;
            }
        }

        let cancelled = self.inner.shared.close();
        info!(cancelled, "SSE client closed");
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Watch connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state_tx.subscribe()
    }

    /// Number of requests still awaiting events.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.store.len()
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::connection_closed(Some(
                "client has been closed".to_string(),
            )));
        }
        Ok(())
    }

    /// The running driver's command sender, spawning the driver if needed.
    fn driver(&self) -> TransportResult<mpsc::Sender<DriverCommand>> {
        let mut driver = self.inner.driver.lock();
        self.ensure_open()?;
        if let Some(cmd_tx) = driver.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(cmd_tx.clone());
        }

        let capacity = self.inner.shared.config.read().command_channel_capacity;
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(ConnectionDriver::new(Arc::clone(&self.inner.shared), cmd_rx).run());
        *driver = Some(cmd_tx.clone());
        Ok(cmd_tx)
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        match self.driver()?.try_send(DriverCommand::Connect) {
            // A full queue already holds a command that leaves Idle.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(driver_gone()),
        }
    }
}

fn driver_gone() -> TransportError {
    TransportError::connection_closed(Some("SSE background task shut down".to_string()))
}

impl fmt::Debug for SseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseClient")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
