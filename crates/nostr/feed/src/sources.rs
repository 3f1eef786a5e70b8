//! Where missing profiles and reactions are fetched from.

use crate::error::{FeedError, Result};
use async_trait::async_trait;
use nostr_client::{Filter, RelayPool};
use nostr_core::{Event, KIND_METADATA, KIND_REACTION};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Batch lookup of kind 0 profile events.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch profile events for `pubkeys`. Authors without a profile are
    /// simply absent from the result.
    async fn fetch_profiles(&self, pubkeys: &[String]) -> Result<Vec<Event>>;
}

/// Batch lookup of kind 7 reactions.
#[async_trait]
pub trait ReactionSource: Send + Sync {
    /// Fetch reactions referencing any of `post_ids`.
    async fn fetch_reactions(&self, post_ids: &[String]) -> Result<Vec<Event>>;
}

fn ensure_reachable(pool: &RelayPool) -> Result<()> {
    if pool.status().is_active() {
        Ok(())
    } else {
        Err(FeedError::Unavailable("no relay connected".to_string()))
    }
}

/// Profiles from the pool's relays.
pub struct RelayProfileSource {
    pool: Arc<RelayPool>,
    timeout: Duration,
}

impl RelayProfileSource {
    pub fn new(pool: Arc<RelayPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl ProfileSource for RelayProfileSource {
    async fn fetch_profiles(&self, pubkeys: &[String]) -> Result<Vec<Event>> {
        ensure_reachable(&self.pool)?;
        let filter = Filter::new()
            .kinds([KIND_METADATA])
            .authors(pubkeys.iter().cloned());
        Ok(self.pool.query(vec![filter], self.timeout).await)
    }
}

/// Reactions from the pool's relays.
pub struct RelayReactionSource {
    pool: Arc<RelayPool>,
    timeout: Duration,
}

impl RelayReactionSource {
    pub fn new(pool: Arc<RelayPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl ReactionSource for RelayReactionSource {
    async fn fetch_reactions(&self, post_ids: &[String]) -> Result<Vec<Event>> {
        ensure_reachable(&self.pool)?;
        let filter = Filter::new()
            .kinds([KIND_REACTION])
            .event_refs(post_ids.iter().cloned());
        Ok(self.pool.query(vec![filter], self.timeout).await)
    }
}

/// Profiles from an HTTP metadata service.
///
/// The request body is a JSON array of pubkeys; the response is a JSON array
/// of kind 0 events. Events for pubkeys that were not requested are dropped.
pub struct HttpProfileSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProfileSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), url, timeout)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    async fn request(&self, pubkeys: &[String]) -> reqwest::Result<String> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(pubkeys)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn fetch_profiles(&self, pubkeys: &[String]) -> Result<Vec<Event>> {
        let body = match self.request(pubkeys).await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => {
                warn!("Metadata request to {} timed out", self.url);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let events: Vec<Event> =
            serde_json::from_str(&body).map_err(|e| FeedError::Decode(e.to_string()))?;

        let wanted: HashSet<&str> = pubkeys.iter().map(String::as_str).collect();
        let total = events.len();
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| e.kind == KIND_METADATA && wanted.contains(e.pubkey.as_str()))
            .collect();
        if events.len() < total {
            debug!(
                "Dropped {} unexpected events from {}",
                total - events.len(),
                self.url
            );
        }
        Ok(events)
    }
}
