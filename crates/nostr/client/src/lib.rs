//! Multi-relay Nostr client.
//!
//! This crate provides:
//! - Normalized relay endpoints and client configuration
//! - Message parsing and encoding (NIP-01 relay protocol)
//! - One WebSocket connection per relay with keep-alive and idle detection
//! - A connection pool with a reconnect supervisor
//! - An ordered dispatch queue shared by all connections
//! - A subscription registry replayed on every (re)connect
//! - An event bus carrying de-duplicated relay output
//! - `testing::MockRelay`, an in-process relay for tests (`testing` feature)
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{BusEvent, ClientConfig, Filter, RelayPool};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let config = ClientConfig::default();
//!     let pool = RelayPool::new(config.clone())?;
//!     let mut events = pool.subscribe_events();
//!
//!     pool.connect(&config.endpoints());
//!     pool.spawn_supervisor();
//!     pool.subscribe("pictures", vec![Filter::new().kinds([20]).limit(50)]);
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             BusEvent::Event { event, .. } => println!("Received event: {}", event.id),
//!             BusEvent::AllEose { subscription_id } => {
//!                 println!("Got all stored events for {}", subscription_id);
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod pool;
pub mod recovery;
pub mod relay;
pub mod sequencer;
pub mod subscription;
#[cfg(feature = "testing")]
pub mod testing;

pub use bus::{BusEvent, EventBus};
pub use config::{BackoffConfig, ClientConfig, ConfigError, DEFAULT_RELAYS};
pub use endpoint::{RelayEndpoint, parse_endpoints};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, FilterSet, MessageError, RelayMessage};
pub use pool::{RelayPool, aggregate_status};
pub use recovery::ReconnectBackoff;
pub use relay::{ConnectionSettings, ConnectionStatus, RelayConnection};
pub use sequencer::{Inbound, Sequencer, SequencerHandle};
pub use subscription::{Subscription, SubscriptionRegistry, generate_subscription_id};
