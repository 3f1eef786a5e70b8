//! Aggregated Nostr feed.
//!
//! Events from every relay in a [`nostr_client::RelayPool`] are merged into a
//! [`FeedCache`]: posts are stored once per id, profiles and follow lists keep
//! their latest version, and reactions are counted once per reaction id.
//! [`FeedService`] keeps the cache fed, fetches missing profiles and reactions
//! in coalesced batches, and republishes a sorted view on every change.
//!
//! ```rust,no_run
//! use nostr_client::{ClientConfig, RelayPool};
//! use nostr_feed::{FeedConfig, FeedService};
//!
//! # async fn run() -> nostr_feed::Result<()> {
//! let client = ClientConfig::default();
//! let pool = RelayPool::new(client.clone())?;
//! pool.connect(&client.endpoints());
//!
//! let feed = FeedService::start(pool, FeedConfig::default())?;
//! feed.subscribe_posts(Some(50));
//!
//! let mut view = feed.watch();
//! while view.changed().await.is_ok() {
//!     let posts = view.borrow_and_update().clone();
//!     if let Some(top) = posts.first() {
//!         println!("{}: {}", top.display_name(), top.event.content);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod post;
pub mod rank;
pub mod service;
pub mod sources;

pub use batch::BatchQueue;
pub use cache::{ApplyOutcome, Evicted, FeedCache, ReactionRecord};
pub use config::{AppConfig, FeedConfig, load_config};
pub use error::{FeedError, Result};
pub use post::AggregatedPost;
pub use rank::{SortPolicy, sort_posts, trending_score};
pub use service::{FEED_SUBSCRIPTION_ID, FeedService, FeedView, REACTIONS_SUBSCRIPTION_ID};
pub use sources::{
    HttpProfileSource, ProfileSource, ReactionSource, RelayProfileSource, RelayReactionSource,
};
