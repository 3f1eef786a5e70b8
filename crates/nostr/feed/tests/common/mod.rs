//! Shared helpers for feed integration tests.

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

pub fn client_config() -> ClientConfig {
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

pub fn pubkey(n: u64) -> String {
    format!("{:064x}", n)
}

pub fn make(pubkey: &str, kind: u16, created_at: u64, tags: Vec<Vec<String>>, content: &str) -> Event {
    finalize_unsigned(
        UnsignedEvent {
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags,
            content: content.to_string(),
        },
        "f".repeat(128),
    )
    .unwrap()
}

pub fn like(author: &str, target: &Event, created_at: u64) -> Event {
    make(
        author,
        7,
        created_at,
        vec![
            vec!["e".to_string(), target.id.clone()],
            vec!["p".to_string(), target.pubkey.clone()],
        ],
        "+",
    )
}
