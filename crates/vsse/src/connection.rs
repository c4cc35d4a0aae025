//! Connection manager: the background task that owns the SSE transport.
//!
//! One [`ConnectionDriver`] runs per client. It connects on demand, streams
//! frames into the [`PendingRequestStore`], supervises liveness with the
//! [`HeartbeatMonitor`], and reconnects with [`BackoffPolicy`] delays. The
//! facade talks to it only through [`DriverCommand`]s and observes it through
//! a [`watch`] channel of [`ConnectionState`].

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use http::{
    HeaderName, HeaderValue,
    header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE},
};
use parking_lot::RwLock;
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    correlator::PendingRequestStore,
    error::{TransportError, TransportResult},
    headers::compose_headers,
    heartbeat::{HeartbeatMonitor, HeartbeatStatus},
    reconnect::{BackoffPolicy, BackoffState},
    sse::{EventStream, EventStreamError, SseDecoder, SseEvent, SseFrame},
    types::{EventKind, StreamFrame, event_type, phase},
};

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Connection state machine states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the next request or `connect()` starts one.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Streaming events.
    Open,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// Torn down; will not reconnect.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if the connection is actively streaming.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` if the connection is in a terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting({attempt})"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Control commands sent from the facade to the driver.
#[derive(Debug)]
pub enum DriverCommand {
    /// Leave Idle. Ignored while a connection is open or being attempted.
    Connect,
    /// Drop the current transport and connect again without delay.
    Reconnect {
        /// Human-readable reason for the reconnection request.
        reason: String,
    },
    /// Tear down and cancel all pending requests.
    Close {
        /// Signalled once teardown is complete.
        reply_tx: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the facade and the driver.
///
/// The driver only reads `config` and `http`; it snapshots them at the start
/// of every connection attempt, which is what makes config updates apply on
/// the next (re)connect.
pub(crate) struct Shared {
    pub(crate) config: RwLock<ClientConfig>,
    pub(crate) http: RwLock<reqwest::Client>,
    pub(crate) store: Arc<PendingRequestStore>,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig, http: reqwest::Client) -> Self {
        let store = Arc::new(PendingRequestStore::new(config.max_pending_requests));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            config: RwLock::new(config),
            http: RwLock::new(http),
            store,
            state_tx,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Cancel everything still pending and mark the connection closed.
    pub(crate) fn close(&self) -> usize {
        self.set_state(ConnectionState::Closed);
        self.store
            .fail_all(phase::CANCELLED, event_type::CLOSED, serde_json::Value::Null)
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Internal: establish a single HTTP connection and return an EventStream
// ---------------------------------------------------------------------------

type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Open one SSE connection.
///
/// Sends the composed headers plus `Accept`, `Cache-Control` and, when
/// resuming, `Last-Event-ID`. Validates status and Content-Type before
/// wrapping the body in an [`EventStream`] whose decoder starts from
/// `last_event_id`.
pub(crate) async fn establish_sse_connection(
    client: &reqwest::Client,
    config: &ClientConfig,
    last_event_id: &str,
) -> TransportResult<EventStream<ByteStream>> {
    let url = config.stream_url()?;
    let mut headers = compose_headers(&config.sse_headers, config.token.as_deref(), None)?;
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    // Last-Event-ID for resumption.
    if !last_event_id.is_empty()
        && let Ok(value) = HeaderValue::from_str(last_event_id)
    {
        headers.insert(LAST_EVENT_ID, value);
    }

    let request = client.get(url).headers(headers).send();
    let response = tokio::time::timeout(config.connect_timeout, request)
        .await
        .map_err(|_| TransportError::timeout(config.connect_timeout))?
        .map_err(TransportError::Http)?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::sse_invalid_status(status));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("text/event-stream") {
        return Err(TransportError::sse_invalid_content_type(content_type));
    }

    let decoder = SseDecoder::new()
        .with_max_size(config.max_event_size)
        .with_last_event_id(last_event_id);
    Ok(EventStream::with_decoder(response.bytes_stream().boxed(), decoder))
}

/// Classify an event by name.
pub(crate) fn classify_event(config: &ClientConfig, event: &SseEvent) -> EventKind {
    if event.event == config.event_name {
        EventKind::Correlated
    } else if config.heartbeat_event_names.iter().any(|n| *n == event.event) {
        EventKind::Heartbeat
    } else {
        EventKind::Other
    }
}

// ---------------------------------------------------------------------------
// Internal: background driver
// ---------------------------------------------------------------------------

/// What the driver does next.
enum Step {
    Idle,
    Connect,
    Retry(TransportError),
    Close(Option<oneshot::Sender<()>>),
}

/// Why an open session ended.
enum SessionEnd {
    Failed(TransportError),
    Reconnect(String),
    Idle,
    Close(Option<oneshot::Sender<()>>),
}

/// The long-lived task driving the connection state machine.
pub(crate) struct ConnectionDriver {
    shared: Arc<Shared>,
    cmd_rx: mpsc::Receiver<DriverCommand>,
    rng: StdRng,
    backoff: BackoffState,
    // Empty when there is nothing to resume from.
    last_event_id: String,
    server_retry: Option<Duration>,
}

impl ConnectionDriver {
    pub(crate) fn new(shared: Arc<Shared>, cmd_rx: mpsc::Receiver<DriverCommand>) -> Self {
        Self::with_rng(shared, cmd_rx, StdRng::from_os_rng())
    }

    /// Create a driver with an explicit jitter source.
    pub(crate) fn with_rng(
        shared: Arc<Shared>,
        cmd_rx: mpsc::Receiver<DriverCommand>,
        rng: StdRng,
    ) -> Self {
        Self {
            shared,
            cmd_rx,
            rng,
            backoff: BackoffState::default(),
            last_event_id: String::new(),
            server_retry: None,
        }
    }

    /// Run until closed.
    pub(crate) async fn run(mut self) {
        debug!("Connection driver started");
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Connect => self.connect().await,
                Step::Retry(err) => self.retry(err).await,
                Step::Close(reply_tx) => {
                    let cancelled = self.shared.close();
                    info!(cancelled, "SSE connection closed");
                    if let Some(reply_tx) = reply_tx {
                        let _ = reply_tx.send(());
                    }
                    return;
                }
            };
        }
    }

    fn config(&self) -> ClientConfig {
        self.shared.config.read().clone()
    }

    // --- Idle ---

    async fn idle(&mut self) -> Step {
        self.shared.set_state(ConnectionState::Idle);
        match self.cmd_rx.recv().await {
            Some(DriverCommand::Connect | DriverCommand::Reconnect { .. }) => Step::Connect,
            Some(DriverCommand::Close { reply_tx }) => Step::Close(Some(reply_tx)),
            None => Step::Close(None),
        }
    }

    // --- Connecting ---

    async fn connect(&mut self) -> Step {
        self.shared.set_state(ConnectionState::Connecting);
        let config = self.config();
        let client = self.shared.http.read().clone();
        info!(url = %config.url, attempt = self.backoff.attempt, "SSE connecting");

        let last_event_id = self.last_event_id.clone();

        let result = {
            let handshake = establish_sse_connection(&client, &config, &last_event_id);
            tokio::pin!(handshake);

            loop {
                tokio::select! {
                    biased;

                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(DriverCommand::Connect) => {}
                        Some(DriverCommand::Reconnect { reason }) => {
                            info!(reason = %reason, "Restarting SSE handshake");
                            return Step::Connect;
                        }
                        Some(DriverCommand::Close { reply_tx }) => return Step::Close(Some(reply_tx)),
                        None => return Step::Close(None),
                    },

                    result = &mut handshake => break result,
                }
            }
        };

        match result {
            Ok(stream) => {
                info!(url = %config.url, "SSE connection established");
                self.backoff = BackoffPolicy::new(config.reconnect_backoff).reset();
                self.server_retry = None;
                match self.stream(&config, stream).await {
                    SessionEnd::Failed(err) => Step::Retry(err),
                    SessionEnd::Reconnect(reason) => {
                        warn!(reason = %reason, "SSE reconnect requested");
                        Step::Connect
                    }
                    SessionEnd::Idle => Step::Idle,
                    SessionEnd::Close(reply_tx) => Step::Close(reply_tx),
                }
            }
            Err(err) => {
                error!(url = %config.url, error = %err, "SSE connection failed");
                Step::Retry(err)
            }
        }
    }

    // --- Open ---

    async fn stream(&mut self, config: &ClientConfig, mut events: EventStream<ByteStream>) -> SessionEnd {
        self.shared.set_state(ConnectionState::Open);

        let mut heartbeat = HeartbeatMonitor::new(
            config.with_heartbeat,
            config.expected_ping_interval,
            config.heartbeat_tolerance(),
        );
        heartbeat.arm(now());
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.shared.store.is_empty() {
                idle_since.get_or_insert_with(now);
            } else {
                idle_since = None;
            }
            let idle_deadline = idle_since
                .filter(|_| config.idle_disconnect)
                .map(|since| since + config.idle_timeout);

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(DriverCommand::Connect) => {}
                    Some(DriverCommand::Reconnect { reason }) => return SessionEnd::Reconnect(reason),
                    Some(DriverCommand::Close { reply_tx }) => {
                        info!("SSE connection closing (requested)");
                        return SessionEnd::Close(Some(reply_tx));
                    }
                    None => return SessionEnd::Close(None),
                },

                item = events.next() => {
                    if events.last_event_id() != self.last_event_id {
                        self.last_event_id = events.last_event_id().to_string();
                    }
                    match item {
                        Some(Ok(frame)) => {
                            heartbeat.record_activity(now());
                            self.handle_frame(config, frame);
                        }
                        Some(Err(EventStreamError::Utf8(err))) => {
                            heartbeat.record_activity(now());
                            warn!(error = %err, "Skipping SSE line that is not valid UTF-8");
                        }
                        Some(Err(EventStreamError::TooLarge { limit })) => {
                            error!(limit, "SSE line or event too large");
                            return SessionEnd::Failed(TransportError::parse(format!(
                                "SSE line or event exceeds {limit} bytes"
                            )));
                        }
                        Some(Err(EventStreamError::Transport(err))) => {
                            error!(error = %err, "SSE stream error");
                            return SessionEnd::Failed(TransportError::Http(err));
                        }
                        None => {
                            warn!("SSE stream ended");
                            return SessionEnd::Failed(TransportError::sse_stream_ended());
                        }
                    }
                },

                () = sleep_until(heartbeat.deadline()) => {
                    if let HeartbeatStatus::Stalled { silence } = heartbeat.check(now()) {
                        warn!(
                            silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                            "SSE heartbeat stalled"
                        );
                        return SessionEnd::Failed(TransportError::stalled(silence));
                    }
                }

                () = sleep_until(idle_deadline) => {
                    if self.shared.store.is_empty() {
                        info!(
                            idle_ms = u64::try_from(config.idle_timeout.as_millis()).unwrap_or(u64::MAX),
                            "No pending requests, disconnecting"
                        );
                        return SessionEnd::Idle;
                    }
                    idle_since = None;
                }
            }
        }
    }

    fn handle_frame(&mut self, config: &ClientConfig, frame: SseFrame) {
        match frame {
            SseFrame::Comment(comment) => {
                debug!(comment = %comment, "SSE comment received");
            }
            SseFrame::Retry(retry) => {
                debug!(
                    retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX),
                    "Server set reconnect delay"
                );
                self.server_retry = Some(retry);
            }
            SseFrame::Event(event) => {
                let kind = classify_event(config, &event);
                debug!(
                    event_type = %event.event,
                    id = %event.id,
                    kind = %kind,
                    "SSE event received",
                );
                if kind != EventKind::Correlated {
                    return;
                }

                match StreamFrame::from_data(&event.data) {
                    Ok(frame) => {
                        let terminal = config.is_terminal_phase(&frame.phase);
                        self.shared.store.dispatch(frame, terminal);
                    }
                    Err(err) => {
                        let err = TransportError::parse(err.to_string());
                        warn!(error = %err, "Dropping malformed SSE frame");
                    }
                }
            }
        }
    }

    // --- Reconnecting ---

    async fn retry(&mut self, err: TransportError) -> Step {
        let config = self.config();
        let policy = BackoffPolicy::new(config.reconnect_backoff);

        let exhausted = config
            .reconnect_max_attempts
            .is_some_and(|max| self.backoff.attempt >= max);
        if exhausted || !err.is_retryable() {
            let attempts = self.backoff.attempt.saturating_add(1);
            let err = TransportError::retries_exhausted(attempts, &err);
            error!(attempts, error = %err, "Giving up on SSE connection");
            let failed = self.shared.store.fail_all(
                phase::ERROR,
                event_type::TRANSPORT_ERROR,
                json!({ "message": err.to_string(), "attempts": attempts }),
            );
            debug!(failed, "Failed pending requests");
            self.backoff = policy.reset();
            self.server_retry = None;
            return Step::Idle;
        }

        let (delay, next) = match self.server_retry {
            Some(retry) => policy.server_delay(self.backoff, retry),
            None => policy.next_delay(self.backoff, &mut self.rng),
        };
        self.backoff = next;
        self.shared.set_state(ConnectionState::Reconnecting {
            attempt: next.attempt,
        });
        warn!(
            attempt = next.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "SSE reconnecting after backoff"
        );

        let wake = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(DriverCommand::Connect) => {}
                    Some(DriverCommand::Reconnect { reason }) => {
                        info!(reason = %reason, "Skipping backoff delay");
                        return Step::Connect;
                    }
                    Some(DriverCommand::Close { reply_tx }) => return Step::Close(Some(reply_tx)),
                    None => return Step::Close(None),
                },

                () = tokio::time::sleep_until(wake) => return Step::Connect,
            }
        }
    }
}

/// The current time on tokio's clock, so paused-time tests drive deadlines.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
