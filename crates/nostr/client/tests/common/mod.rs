//! Shared helpers for relay integration tests.

#![allow(dead_code)]

use nostr_client::{BackoffConfig, ClientConfig, RelayEndpoint};
use nostr_core::{Event, UnsignedEvent, finalize_unsigned};
use std::sync::Once;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Client config with short timings suitable for tests.
pub fn test_config() -> ClientConfig {
    init_tracing();
    ClientConfig {
        relays: Vec::new(),
        connect_timeout_ms: 2_000,
        ping_interval_ms: 1_000,
        idle_timeout_ms: 5_000,
        supervisor_interval_ms: 100,
        reconnect_backoff: BackoffConfig {
            initial_ms: 50,
            max_ms: 200,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn endpoint(url: &str) -> RelayEndpoint {
    RelayEndpoint::parse(url).unwrap()
}

/// An endpoint nothing listens on.
pub async fn dead_endpoint() -> RelayEndpoint {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    endpoint(&format!("ws://127.0.0.1:{}", port))
}

pub fn event(kind: u16, created_at: u64, content: &str) -> Event {
    finalize_unsigned(
        UnsignedEvent {
            pubkey: "a".repeat(64),
            created_at,
            kind,
            tags: vec![],
            content: content.to_string(),
        },
        "f".repeat(128),
    )
    .unwrap()
}
