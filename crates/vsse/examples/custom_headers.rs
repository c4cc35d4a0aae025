//! Authenticated SSE listening with custom headers.
//!
//! ```sh
//! SSE_URL=https://api.example.com/sse/authenticated \
//! SSE_TOKEN=... RUST_LOG=vsse=debug cargo run --example custom_headers
//! ```
//!
//! The token and url are read here, in the binary, and passed to the client
//! explicitly.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vsse::{BackoffConfig, ClientConfig, ConfigUpdate, PostOptions, SseClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::var("SSE_URL").unwrap_or_else(|_| "http://localhost:3000/sse/authenticated".to_string());
    let token = std::env::var("SSE_TOKEN").ok();

    let mut config = ClientConfig::new(url)
        .event_name("notify")
        .sse_header("X-API-Key", "your-api-key")
        .sse_header("X-Client-Version", "1.0.0")
        .sse_with_credentials(true)
        .idle_timeout(Duration::from_secs(60))
        .expected_ping_interval(Duration::from_secs(10))
        .reconnect_backoff(BackoffConfig {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 1.5,
            jitter: 0.2,
        });
    if let Some(token) = token {
        config = config.token(token);
    }

    let client = SseClient::new(config)?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let subscription = client
        .post_and_listen_with(
            "/api/chat",
            &json!({ "prompt": "Summarize today's tickets" }),
            PostOptions::new().header("X-Trace-Id", "example-trace"),
            move |event| {
                info!(
                    request_id = %event.request_id,
                    phase = %event.phase,
                    event_type = %event.event_type,
                    payload = %event.payload,
                    "Event"
                );
                if matches!(event.phase.as_str(), "end" | "error" | "cancelled") {
                    let _ = done_tx.send(());
                }
            },
        )
        .await?;
    info!(request_id = %subscription.request_id(), "Request sent");

    // Rotate a header; it is sent from the next reconnect on.
    client
        .update_config(ConfigUpdate::new().merge_sse_headers([("X-Client-Version", "1.0.1")]))
        .await?;

    tokio::select! {
        _ = done_rx.recv() => info!("Request finished"),
        _ = tokio::time::sleep(Duration::from_secs(120)) => {
            info!("Giving up waiting");
            subscription.unsubscribe();
        }
    }

    client.close().await;
    Ok(())
}
