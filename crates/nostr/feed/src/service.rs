//! Feed service
//!
//! Runs the aggregation cache against a relay pool:
//! - one task consumes the event bus and applies events from the feed's own
//!   subscriptions to the cache
//! - new posts queue their author (if no profile is cached) and their id for
//!   batched profile and reaction fetches
//! - one task per batch queue runs fetches and applies the results
//! - after every reaction batch, a standing reaction subscription is re-sent
//!   for the cached post ids so likes published later are counted live
//!
//! The cache is shared behind a mutex. The sorted view is republished on a
//! `watch` channel after every change, while the lock is still held, so
//! subscribers never see views out of order.

use crate::batch::BatchQueue;
use crate::cache::{ApplyOutcome, FeedCache};
use crate::config::FeedConfig;
use crate::error::Result;
use crate::post::AggregatedPost;
use crate::rank::SortPolicy;
use crate::sources::{
    HttpProfileSource, ProfileSource, ReactionSource, RelayProfileSource, RelayReactionSource,
};
use nostr_client::{BusEvent, Filter, RelayPool};
use nostr_core::{Event, KIND_REACTION, unix_now};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The feed subscription id used on every relay.
pub const FEED_SUBSCRIPTION_ID: &str = "feed";

/// Live reactions to cached posts.
pub const REACTIONS_SUBSCRIPTION_ID: &str = "feed-reactions";

pub type FeedView = Arc<Vec<AggregatedPost>>;

struct Shared {
    config: FeedConfig,
    pool: Arc<RelayPool>,
    /// Unix time the service started; live reactions are requested from here
    started_at: u64,
    sort: RwLock<SortPolicy>,
    cache: Mutex<FeedCache>,
    view: watch::Sender<FeedView>,
    profiles: BatchQueue,
    reactions: BatchQueue,
}

impl Shared {
    fn apply(&self, event: &Event) -> ApplyOutcome {
        let mut cache = self.cache.lock();
        let outcome = cache.apply(event);
        self.track(&cache, &outcome);
        if outcome.changes_view() {
            self.publish_view(&cache);
        }
        outcome
    }

    /// Apply fetched events, republishing once.
    fn apply_batch(&self, events: &[Event]) -> usize {
        let mut cache = self.cache.lock();
        let mut changed = 0;
        for event in events {
            let outcome = cache.apply(event);
            self.track(&cache, &outcome);
            if outcome.changes_view() {
                changed += 1;
            }
        }
        if changed > 0 {
            self.publish_view(&cache);
        }
        changed
    }

    /// Queue lookups for a new post and forget the ones of an evicted post.
    fn track(&self, cache: &FeedCache, outcome: &ApplyOutcome) {
        let ApplyOutcome::PostAdded {
            id,
            author,
            evicted,
        } = outcome
        else {
            return;
        };
        if !cache.has_profile(author) {
            self.profiles.push(author.clone());
        }
        self.reactions.push(id.clone());
        if let Some(evicted) = evicted {
            self.reactions.forget(&evicted.id);
            if evicted.author_gone {
                self.profiles.forget(&evicted.author);
            }
        }
    }

    fn publish_view(&self, cache: &FeedCache) {
        let view = cache.view(
            *self.sort.read(),
            self.config.trending_half_life_hours,
            unix_now(),
        );
        self.view.send_replace(Arc::new(view));
    }

    /// Point the standing reaction subscription at the cached posts. Does
    /// nothing while the feed itself is not subscribed.
    fn watch_reactions(&self) {
        if !self.pool.registry().contains(FEED_SUBSCRIPTION_ID) {
            return;
        }
        let ids = self.cache.lock().post_ids();
        if ids.is_empty() {
            self.pool.unsubscribe(REACTIONS_SUBSCRIPTION_ID);
            return;
        }
        debug!("Watching reactions to {} posts", ids.len());
        let filter = Filter::new()
            .kinds([KIND_REACTION])
            .event_refs(ids)
            .since(self.started_at);
        self.pool.subscribe(REACTIONS_SUBSCRIPTION_ID, vec![filter]);
    }
}

/// Aggregated feed over a relay pool.
pub struct FeedService {
    pool: Arc<RelayPool>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedService {
    /// Start the service with profile and reaction lookups going to the
    /// pool's relays, or to `metadataServiceUrl` for profiles when set.
    pub fn start(pool: Arc<RelayPool>, config: FeedConfig) -> Result<Self> {
        let timeout = config.fetch_timeout();
        let profiles: Arc<dyn ProfileSource> = match &config.metadata_service_url {
            Some(url) => Arc::new(HttpProfileSource::new(url.clone(), timeout)),
            None => Arc::new(RelayProfileSource::new(Arc::clone(&pool), timeout)),
        };
        let reactions = Arc::new(RelayReactionSource::new(Arc::clone(&pool), timeout));
        Self::with_sources(pool, config, profiles, reactions)
    }

    pub fn with_sources(
        pool: Arc<RelayPool>,
        config: FeedConfig,
        profile_source: Arc<dyn ProfileSource>,
        reaction_source: Arc<dyn ReactionSource>,
    ) -> Result<Self> {
        config.validate()?;
        let (profiles, profiles_rx) = BatchQueue::new("profiles", config.coalesce_window());
        let (reactions, reactions_rx) = BatchQueue::new("reactions", config.coalesce_window());
        let (view, _) = watch::channel(Arc::new(Vec::new()));

        let shared = Arc::new(Shared {
            sort: RwLock::new(config.sort),
            cache: Mutex::new(FeedCache::new(&config)),
            config,
            pool: Arc::clone(&pool),
            started_at: unix_now(),
            view,
            profiles,
            reactions,
        });

        let tasks = vec![
            tokio::spawn(consume_bus(pool.subscribe_events(), Arc::clone(&shared))),
            tokio::spawn(fetch_profiles(
                profiles_rx,
                profile_source,
                Arc::clone(&shared),
            )),
            tokio::spawn(fetch_reactions(
                reactions_rx,
                reaction_source,
                Arc::clone(&shared),
            )),
        ];

        Ok(Self {
            pool,
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Subscribe to the configured post kinds on every relay.
    pub fn subscribe_posts(&self, limit: Option<u64>) -> usize {
        let mut filter = Filter::new().kinds(self.shared.config.post_kinds.iter().copied());
        if let Some(limit) = limit {
            filter = filter.limit(limit);
        }
        self.subscribe(vec![filter])
    }

    /// Replace the feed subscription's filters.
    pub fn subscribe(&self, filters: Vec<Filter>) -> usize {
        info!("Subscribing feed with {} filters", filters.len());
        self.pool.subscribe(FEED_SUBSCRIPTION_ID, filters)
    }

    /// Apply one event directly, bypassing the relays.
    pub fn ingest(&self, event: &Event) -> ApplyOutcome {
        self.shared.apply(event)
    }

    /// Current sorted view.
    pub fn view(&self) -> FeedView {
        Arc::clone(&self.shared.view.borrow())
    }

    /// Receiver notified on every view change.
    pub fn watch(&self) -> watch::Receiver<FeedView> {
        self.shared.view.subscribe()
    }

    pub fn sort(&self) -> SortPolicy {
        *self.shared.sort.read()
    }

    /// Change the sort policy and republish the view.
    pub fn set_sort(&self, policy: SortPolicy) {
        *self.shared.sort.write() = policy;
        let cache = self.shared.cache.lock();
        self.shared.publish_view(&cache);
    }

    pub fn post(&self, id: &str) -> Option<AggregatedPost> {
        self.shared.cache.lock().post(id)
    }

    pub fn len(&self) -> usize {
        self.shared.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.cache.lock().is_empty()
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Close the feed subscriptions and stop background tasks.
    pub fn stop(&self) {
        self.pool.unsubscribe(FEED_SUBSCRIPTION_ID);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pool.unsubscribe(REACTIONS_SUBSCRIPTION_ID);
    }
}

impl Drop for FeedService {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn consume_bus(mut rx: tokio::sync::broadcast::Receiver<BusEvent>, shared: Arc<Shared>) {
    loop {
        match rx.recv().await {
            // Lookup results arrive through `apply_batch`; other callers'
            // subscriptions are not part of the feed
            Ok(BusEvent::Event {
                subscription_id,
                event,
                ..
            }) if subscription_id == FEED_SUBSCRIPTION_ID
                || subscription_id == REACTIONS_SUBSCRIPTION_ID =>
            {
                shared.apply(&event);
            }
            Ok(BusEvent::AllEose { subscription_id }) if subscription_id == FEED_SUBSCRIPTION_ID => {
                debug!(
                    "Feed backlog complete, {} posts cached",
                    shared.cache.lock().len()
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Feed lagged behind the event bus, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Feed bus consumer stopped");
}

async fn fetch_profiles(
    mut batches: mpsc::UnboundedReceiver<Vec<String>>,
    source: Arc<dyn ProfileSource>,
    shared: Arc<Shared>,
) {
    while let Some(batch) = batches.recv().await {
        match source.fetch_profiles(&batch).await {
            Ok(events) => {
                let changed = shared.apply_batch(&events);
                debug!(
                    "Fetched {} profiles for {} authors ({} changed)",
                    events.len(),
                    batch.len(),
                    changed
                );
                shared.profiles.complete(&batch);
            }
            Err(e) => {
                warn!("Profile fetch for {} authors failed: {}", batch.len(), e);
                shared.profiles.release(&batch);
            }
        }
    }
}

async fn fetch_reactions(
    mut batches: mpsc::UnboundedReceiver<Vec<String>>,
    source: Arc<dyn ReactionSource>,
    shared: Arc<Shared>,
) {
    while let Some(batch) = batches.recv().await {
        match source.fetch_reactions(&batch).await {
            Ok(events) => {
                let changed = shared.apply_batch(&events);
                debug!(
                    "Fetched {} reactions for {} posts ({} counted)",
                    events.len(),
                    batch.len(),
                    changed
                );
                shared.reactions.complete(&batch);
            }
            Err(e) => {
                warn!("Reaction fetch for {} posts failed: {}", batch.len(), e);
                shared.reactions.release(&batch);
            }
        }
        shared.watch_reactions();
    }
}
