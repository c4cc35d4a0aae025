//! # vsse
//!
//! Resilient Server-Sent Events client that correlates outbound trigger
//! requests with the events streamed back over one shared connection.
//!
//! ## Features
//!
//! - **Request Correlation**: every trigger request gets a fresh id; events
//!   carrying that id are routed to the request's callback in arrival order
//! - **Reconnection**: exponential backoff with jitter, `Last-Event-ID`
//!   resumption and server `retry:` directives
//! - **Heartbeat Supervision**: a silent stream is torn down and reconnected
//! - **Explicit Configuration**: tokens and headers come only from
//!   [`ClientConfig`] and [`ConfigUpdate`]
//!
//! ## Architecture
//!
//! ```text
//!  SseClient ──register──▶ PendingRequestStore ◀──dispatch── ConnectionDriver
//!      │                                                          │
//!      ├──TriggerTransport (POST + requestId)                     ├── HeartbeatMonitor
//!      └──DriverCommand (mpsc) ──────────────────────────────────▶├── BackoffPolicy
//!                                                                 └── EventStream (text/event-stream)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use vsse::{ClientConfig, SseClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://api.example.com/sse?userId=alice")
//!         .event_name("notify")
//!         .token("jwt")
//!         .sse_header("X-Client-Version", "1.0.0");
//!     let client = SseClient::new(config)?;
//!
//!     let subscription = client
//!         .post_and_listen("/api/chat", &json!({ "prompt": "hello" }), |event| {
//!             println!("[{}] {}: {}", event.phase, event.event_type, event.payload);
//!         })
//!         .await?;
//!
//!     // Use the client...
//!     subscription.unsubscribe();
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod headers;
pub mod heartbeat;
pub mod reconnect;
pub mod sse;
pub mod trigger;
pub mod types;

// Re-export commonly used types
pub use client::{PostOptions, SseClient};
pub use config::{BackoffConfig, ClientConfig, ConfigUpdate};
pub use connection::ConnectionState;
pub use correlator::{DispatchOutcome, ListenCallback, PendingRequestStore, Subscription};
pub use error::{TransportError, TransportResult};
pub use headers::compose_headers;
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus};
pub use reconnect::{BackoffPolicy, BackoffState};
pub use trigger::{HttpTrigger, TriggerRequest, TriggerTransport};
pub use types::{EventKind, ListenEvent, RequestId, StreamFrame};
