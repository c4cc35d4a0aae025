//! Client configuration.
//!
//! [`ClientConfig`] is an explicit, typed record: everything the client needs
//! (tokens, headers, urls) is passed in here or through
//! [`ConfigUpdate`], never looked up from ambient process state.
//!
//! When loaded from JSON the keys are camelCase, durations are milliseconds,
//! and unknown keys are rejected.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{TransportError, TransportResult};

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Reconnect backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(rename = "baseMs", with = "duration_ms")]
    pub base: Duration,
    /// Upper bound for any delay, jitter included.
    #[serde(rename = "maxMs", with = "duration_ms")]
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Random spread as a fraction of the computed delay (0.0–1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Validate the backoff parameters.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max < self.base {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Configuration for an [`SseClient`](crate::SseClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    /// SSE endpoint URL.
    pub url: String,
    /// Origin trigger paths are resolved against. Defaults to `url`.
    pub base_url: Option<String>,
    /// SSE event name that carries correlated frames.
    pub event_name: String,
    /// Bearer token sent as `Authorization` on the stream and triggers.
    pub token: Option<String>,
    /// Additional headers for every SSE connection and trigger request.
    pub sse_headers: BTreeMap<String, String>,
    /// Keep and resend cookies across connections and triggers.
    pub sse_with_credentials: bool,
    /// How long an open stream with nothing pending stays connected.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Disconnect to idle after `idle_timeout` without pending requests.
    pub idle_disconnect: bool,
    /// Expected interval between server pings.
    #[serde(with = "duration_ms")]
    pub expected_ping_interval: Duration,
    /// Supervise the stream with the heartbeat monitor.
    pub with_heartbeat: bool,
    /// Reconnect backoff parameters.
    pub reconnect_backoff: BackoffConfig,
    /// Maximum consecutive failed attempts before giving up (None = infinite).
    pub reconnect_max_attempts: Option<u32>,
    /// Timeout for the SSE handshake.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Timeout for trigger requests.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Phases that complete a request after delivery.
    pub terminal_phases: Vec<String>,
    /// Event names treated as heartbeat pings.
    pub heartbeat_event_names: Vec<String>,
    /// Maximum number of requests awaiting events.
    pub max_pending_requests: usize,
    /// Capacity of the driver command channel.
    pub command_channel_capacity: usize,
    /// Largest line or event (in bytes) accepted from the stream. Anything
    /// bigger fails the session, which then reconnects.
    pub max_event_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_url: None,
            event_name: "message".to_string(),
            token: None,
            sse_headers: BTreeMap::new(),
            sse_with_credentials: false,
            idle_timeout: Duration::from_secs(30),
            idle_disconnect: true,
            expected_ping_interval: Duration::from_secs(15),
            with_heartbeat: true,
            reconnect_backoff: BackoffConfig::default(),
            reconnect_max_attempts: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            terminal_phases: vec!["end".to_string(), "error".to_string()],
            heartbeat_event_names: vec!["ping".to_string(), "heartbeat".to_string()],
            max_pending_requests: 1024,
            command_channel_capacity: 64,
            max_event_size: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with the given SSE URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from JSON. Unknown keys are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the document does not match the
    /// configuration schema.
    pub fn from_json_str(json: &str) -> TransportResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| TransportError::config(format!("Invalid client configuration: {e}")))
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Add a single SSE header.
    #[must_use]
    pub fn sse_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.sse_headers.insert(name.into(), value.into());
        self
    }

    /// Replace the SSE header map.
    #[must_use]
    pub fn sse_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.sse_headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    #[must_use]
    pub fn sse_with_credentials(mut self, enabled: bool) -> Self {
        self.sse_with_credentials = enabled;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn idle_disconnect(mut self, enabled: bool) -> Self {
        self.idle_disconnect = enabled;
        self
    }

    #[must_use]
    pub fn expected_ping_interval(mut self, interval: Duration) -> Self {
        self.expected_ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.with_heartbeat = enabled;
        self
    }

    #[must_use]
    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn terminal_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_phases = phases.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn heartbeat_event_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.heartbeat_event_names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn max_event_size(mut self, bytes: usize) -> Self {
        self.max_event_size = bytes;
        self
    }

    /// Whether `phase` completes a request.
    pub fn is_terminal_phase(&self, phase: &str) -> bool {
        self.terminal_phases.iter().any(|p| p == phase)
    }

    /// Tolerance added to the ping interval before a stall is declared.
    ///
    /// Half the ping interval, never more than `idle_timeout`.
    pub fn heartbeat_tolerance(&self) -> Duration {
        (self.expected_ping_interval / 2).min(self.idle_timeout)
    }

    /// The absolute SSE endpoint.
    ///
    /// A relative `url` (`/sse?userId=alice`) is resolved against
    /// `base_url`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Config`] when `url` is empty,
    /// [`TransportError::InvalidUrl`] when it cannot be resolved.
    pub fn stream_url(&self) -> TransportResult<Url> {
        if self.url.is_empty() {
            return Err(TransportError::config("URL cannot be empty"));
        }
        match Url::parse(&self.url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_deref().ok_or_else(|| {
                    TransportError::invalid_url(
                        &self.url,
                        "relative URL requires base_url to be configured",
                    )
                })?;
                Url::parse(base)
                    .and_then(|base| base.join(&self.url))
                    .map_err(|e| TransportError::invalid_url(&self.url, e))
            }
            Err(e) => Err(TransportError::invalid_url(&self.url, e)),
        }
    }

    /// Resolve a trigger path against `base_url`, or the stream url's origin.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidUrl`] when the path cannot be resolved.
    pub fn trigger_url(&self, path: &str) -> TransportResult<Url> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        let base = match self.base_url.as_deref() {
            Some(base) => Url::parse(base).map_err(|e| TransportError::invalid_url(base, e))?,
            None => self.stream_url()?,
        };
        base.join(path)
            .map_err(|e| TransportError::invalid_url(path, e))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        self.validate_settings()
    }

    /// Validate everything except the presence of `url`, which may still be
    /// supplied later through [`ConfigUpdate::url`].
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate_settings(&self) -> Result<(), String> {
        if self.event_name.is_empty() {
            return Err("Event name cannot be empty".to_string());
        }
        self.reconnect_backoff.validate()?;
        if self.with_heartbeat && self.expected_ping_interval.is_zero() {
            return Err("Expected ping interval must be > 0 when heartbeat is enabled".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.max_event_size == 0 {
            return Err("Max event size must be > 0".to_string());
        }
        Ok(())
    }
}

/// A partial configuration change applied by
/// [`SseClient::update_config`](crate::SseClient::update_config).
///
/// Fields left unset keep their prior values. `sse_headers` replaces the
/// whole header map; use `merge_sse_headers` to change individual keys.
/// Connection-affecting changes (url, token, headers, credentials) are picked
/// up by the next (re)connect; an open stream is not patched unless
/// [`apply_immediately`](ConfigUpdate::apply_immediately) is set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigUpdate {
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub event_name: Option<String>,
    pub token: Option<Option<String>>,
    pub sse_headers: Option<BTreeMap<String, String>>,
    pub merge_sse_headers: Option<BTreeMap<String, String>>,
    pub sse_with_credentials: Option<bool>,
    pub idle_timeout: Option<Duration>,
    pub expected_ping_interval: Option<Duration>,
    pub with_heartbeat: Option<bool>,
    pub reconnect_backoff: Option<BackoffConfig>,
    pub reconnect_max_attempts: Option<Option<u32>>,
    pub reconnect_now: bool,
}

impl ConfigUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Some(token.into()));
        self
    }

    /// Remove the bearer token.
    #[must_use]
    pub fn clear_token(mut self) -> Self {
        self.token = Some(None);
        self
    }

    /// Replace the SSE header map wholesale.
    #[must_use]
    pub fn sse_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.sse_headers = Some(
            headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Merge individual keys into the SSE header map.
    ///
    /// Keys match case-insensitively; a merged key replaces any existing
    /// spelling of the same header.
    #[must_use]
    pub fn merge_sse_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.merge_sse_headers = Some(
            headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn sse_with_credentials(mut self, enabled: bool) -> Self {
        self.sse_with_credentials = Some(enabled);
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn expected_ping_interval(mut self, interval: Duration) -> Self {
        self.expected_ping_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.with_heartbeat = Some(enabled);
        self
    }

    #[must_use]
    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect_backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    /// Force a reconnect so the change applies to the live stream.
    #[must_use]
    pub fn apply_immediately(mut self) -> Self {
        self.reconnect_now = true;
        self
    }

    /// Whether this update changes what the SSE handshake sends.
    pub fn affects_connection(&self) -> bool {
        self.url.is_some()
            || self.token.is_some()
            || self.sse_headers.is_some()
            || self.merge_sse_headers.is_some()
            || self.sse_with_credentials.is_some()
    }

    /// Produce the merged configuration. `base` is left untouched.
    pub fn apply_to(&self, base: &ClientConfig) -> ClientConfig {
        let mut config = base.clone();
        if let Some(url) = &self.url {
            config.url.clone_from(url);
        }
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if let Some(name) = &self.event_name {
            config.event_name.clone_from(name);
        }
        if let Some(token) = &self.token {
            config.token.clone_from(token);
        }
        if let Some(headers) = &self.sse_headers {
            config.sse_headers.clone_from(headers);
        }
        if let Some(headers) = &self.merge_sse_headers {
            for (name, value) in headers {
                config
                    .sse_headers
                    .retain(|existing, _| !existing.eq_ignore_ascii_case(name));
                config.sse_headers.insert(name.clone(), value.clone());
            }
        }
        if let Some(enabled) = self.sse_with_credentials {
            config.sse_with_credentials = enabled;
        }
        if let Some(timeout) = self.idle_timeout {
            config.idle_timeout = timeout;
        }
        if let Some(interval) = self.expected_ping_interval {
            config.expected_ping_interval = interval;
        }
        if let Some(enabled) = self.with_heartbeat {
            config.with_heartbeat = enabled;
        }
        if let Some(backoff) = self.reconnect_backoff {
            config.reconnect_backoff = backoff;
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            config.reconnect_max_attempts = attempts;
        }
        config
    }
}
