//! Aggregation cache
//!
//! Merges events delivered by any number of relays into one store:
//! - posts keyed by event id, insert-if-absent
//! - profiles and follow lists keyed by author, last write wins by `created_at`
//! - reactions keyed by reaction id, each counted at most once
//!
//! Posts are capped at `maxPosts`, oldest evicted first. Reactions to posts
//! that are not cached are held as orphans, capped at the same size, and
//! dropped once they are older than every cached post of a full cache.
//!
//! The cache is a synchronous state machine. Every input goes through
//! [`FeedCache::apply`], and the aggregated view is built on demand by
//! joining posts with the current profile and reaction state, so a profile
//! change is visible on every post by that author.

use crate::config::FeedConfig;
use crate::post::AggregatedPost;
use crate::rank::{SortPolicy, sort_posts};
use nostr_core::{
    ContactList, Event, KIND_CONTACTS, KIND_METADATA, KIND_REACTION, ProfileMetadata,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Result of applying one event to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First time this post was seen
    PostAdded {
        id: String,
        author: String,
        /// Post pushed out to make room
        evicted: Option<Evicted>,
    },
    /// A newer profile replaced the cached one
    ProfileUpdated { author: String },
    /// A newer follow list replaced the cached one
    FollowsUpdated { owner: String },
    /// A new like was counted for `target` (which may not be cached yet)
    ReactionCounted { target: String },
    /// A new reaction was recorded but does not count as a like
    ReactionRecorded,
    /// Already applied
    Duplicate,
    /// Older than what is cached
    Stale,
    /// Kind not handled by the feed
    Ignored,
    /// Event could not be parsed; nothing changed
    Invalid(String),
}

impl ApplyOutcome {
    /// Whether the aggregated view may have changed.
    pub fn changes_view(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::PostAdded { .. }
                | ApplyOutcome::ProfileUpdated { .. }
                | ApplyOutcome::ReactionCounted { .. }
        )
    }
}

/// A post removed to keep the cache within `maxPosts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub id: String,
    pub author: String,
    /// No cached post by `author` remains
    pub author_gone: bool,
}

/// Reaction bookkeeping, used for dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub target: String,
    pub author: String,
    pub created_at: u64,
    pub is_like: bool,
}

/// Latest value of a replaceable entity.
#[derive(Debug, Clone)]
struct Latest<T> {
    created_at: u64,
    event_id: String,
    value: T,
}

enum Replace {
    Same,
    Older,
    Newer,
}

fn compare<T>(current: Option<&Latest<T>>, event: &Event) -> Replace {
    let Some(current) = current else {
        return Replace::Newer;
    };
    if current.event_id == event.id {
        return Replace::Same;
    }
    // Equal timestamps keep the lowest id
    if event.created_at > current.created_at
        || (event.created_at == current.created_at && event.id < current.event_id)
    {
        Replace::Newer
    } else {
        Replace::Older
    }
}

/// Merged state of everything the feed has received.
#[derive(Debug)]
pub struct FeedCache {
    viewer: Option<String>,
    post_kinds: HashSet<u16>,
    max_posts: usize,
    /// Posts by id
    posts: HashMap<String, Event>,
    /// (created_at, id) of every post, oldest first
    by_time: BTreeSet<(u64, String)>,
    /// Post ids by author
    by_author: HashMap<String, HashSet<String>>,
    profiles: HashMap<String, Latest<ProfileMetadata>>,
    follows: HashMap<String, Latest<ContactList>>,
    /// Every reaction applied, by reaction id
    reactions: HashMap<String, ReactionRecord>,
    /// Reaction ids by target post id
    reactions_by_target: HashMap<String, Vec<String>>,
    /// (created_at, reaction id) of reactions whose target is not cached
    orphans: BTreeSet<(u64, String)>,
    likes: HashMap<String, u64>,
    /// Targets the viewer has liked
    viewer_likes: HashSet<String>,
}

impl FeedCache {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            viewer: config.viewer_pubkey.as_ref().map(|p| p.to_lowercase()),
            post_kinds: config.post_kinds.iter().copied().collect(),
            max_posts: config.max_posts.max(1),
            posts: HashMap::new(),
            by_time: BTreeSet::new(),
            by_author: HashMap::new(),
            profiles: HashMap::new(),
            follows: HashMap::new(),
            reactions: HashMap::new(),
            reactions_by_target: HashMap::new(),
            orphans: BTreeSet::new(),
            likes: HashMap::new(),
            viewer_likes: HashSet::new(),
        }
    }

    /// Merge one event.
    pub fn apply(&mut self, event: &Event) -> ApplyOutcome {
        let outcome = match event.kind {
            KIND_METADATA => self.apply_profile(event),
            KIND_CONTACTS => self.apply_follows(event),
            KIND_REACTION => self.apply_reaction(event),
            kind if self.post_kinds.contains(&kind) => self.apply_post(event),
            _ => ApplyOutcome::Ignored,
        };
        if let ApplyOutcome::Invalid(reason) = &outcome {
            debug!("Skipping event {} (kind {}): {}", event.id, event.kind, reason);
        } else {
            trace!("Applied event {}: {:?}", event.id, outcome);
        }
        outcome
    }

    fn apply_post(&mut self, event: &Event) -> ApplyOutcome {
        if self.posts.contains_key(&event.id) {
            return ApplyOutcome::Duplicate;
        }

        self.posts.insert(event.id.clone(), event.clone());
        self.by_time.insert((event.created_at, event.id.clone()));
        self.by_author
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event.id.clone());
        // Reactions that were waiting for this post
        for reaction_id in self.reactions_by_target.get(&event.id).into_iter().flatten() {
            if let Some(record) = self.reactions.get(reaction_id) {
                self.orphans.remove(&(record.created_at, reaction_id.clone()));
            }
        }

        let mut evicted = None;
        if self.posts.len() > self.max_posts
            && let Some((_, oldest)) = self.by_time.first().cloned()
        {
            evicted = self.evict(&oldest);
            self.prune_orphans();
            if oldest == event.id {
                return ApplyOutcome::Stale;
            }
        }

        ApplyOutcome::PostAdded {
            id: event.id.clone(),
            author: event.pubkey.clone(),
            evicted,
        }
    }

    fn evict(&mut self, id: &str) -> Option<Evicted> {
        let event = self.posts.remove(id)?;
        self.by_time.remove(&(event.created_at, event.id.clone()));
        let mut author_gone = true;
        if let Some(ids) = self.by_author.get_mut(&event.pubkey) {
            ids.remove(id);
            author_gone = ids.is_empty();
            if author_gone {
                self.by_author.remove(&event.pubkey);
            }
        }
        for reaction_id in self.reactions_by_target.remove(id).unwrap_or_default() {
            self.reactions.remove(&reaction_id);
        }
        self.likes.remove(id);
        self.viewer_likes.remove(id);
        trace!("Evicted post {}", id);
        Some(Evicted {
            id: event.id,
            author: event.pubkey,
            author_gone,
        })
    }

    fn is_full(&self) -> bool {
        self.posts.len() >= self.max_posts
    }

    fn oldest_post_time(&self) -> Option<u64> {
        self.by_time.first().map(|(created_at, _)| *created_at)
    }

    /// Drop orphans a full cache could no longer take the target of.
    fn prune_orphans(&mut self) {
        let Some(oldest) = self.oldest_post_time().filter(|_| self.is_full()) else {
            return;
        };
        while let Some((created_at, reaction_id)) = self.orphans.first().cloned()
            && created_at < oldest
        {
            self.remove_reaction(&reaction_id);
        }
    }

    fn remove_reaction(&mut self, reaction_id: &str) {
        let Some(record) = self.reactions.remove(reaction_id) else {
            return;
        };
        self.orphans.remove(&(record.created_at, reaction_id.to_string()));
        if let Some(ids) = self.reactions_by_target.get_mut(&record.target) {
            ids.retain(|id| id != reaction_id);
            if ids.is_empty() {
                self.reactions_by_target.remove(&record.target);
            }
        }
        if !record.is_like {
            return;
        }
        if let Some(count) = self.likes.get_mut(&record.target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.likes.remove(&record.target);
            }
        }
        if self.viewer.as_deref() == Some(record.author.as_str()) {
            let still_liked = self
                .reactions_by_target
                .get(&record.target)
                .into_iter()
                .flatten()
                .filter_map(|id| self.reactions.get(id))
                .any(|other| other.is_like && Some(other.author.as_str()) == self.viewer.as_deref());
            if !still_liked {
                self.viewer_likes.remove(&record.target);
            }
        }
        trace!("Dropped reaction {}", reaction_id);
    }

    fn apply_profile(&mut self, event: &Event) -> ApplyOutcome {
        match compare(self.profiles.get(&event.pubkey), event) {
            Replace::Same => return ApplyOutcome::Duplicate,
            Replace::Older => return ApplyOutcome::Stale,
            Replace::Newer => {}
        }
        let metadata = match ProfileMetadata::from_event(event) {
            Ok(metadata) => metadata,
            Err(e) => return ApplyOutcome::Invalid(e.to_string()),
        };
        self.profiles.insert(
            event.pubkey.clone(),
            Latest {
                created_at: event.created_at,
                event_id: event.id.clone(),
                value: metadata,
            },
        );
        ApplyOutcome::ProfileUpdated {
            author: event.pubkey.clone(),
        }
    }

    fn apply_follows(&mut self, event: &Event) -> ApplyOutcome {
        match compare(self.follows.get(&event.pubkey), event) {
            Replace::Same => return ApplyOutcome::Duplicate,
            Replace::Older => return ApplyOutcome::Stale,
            Replace::Newer => {}
        }
        let list = match ContactList::from_event(event) {
            Ok(list) => list,
            Err(e) => return ApplyOutcome::Invalid(e.to_string()),
        };
        self.follows.insert(
            event.pubkey.clone(),
            Latest {
                created_at: event.created_at,
                event_id: event.id.clone(),
                value: list,
            },
        );
        ApplyOutcome::FollowsUpdated {
            owner: event.pubkey.clone(),
        }
    }

    fn apply_reaction(&mut self, event: &Event) -> ApplyOutcome {
        if self.reactions.contains_key(&event.id) {
            return ApplyOutcome::Duplicate;
        }
        // The reacted-to event is the last `e` tag
        let Some(target) = event.last_tag_value("e") else {
            return ApplyOutcome::Invalid("reaction without e tag".to_string());
        };
        let target = target.to_string();
        let is_like = event.content.trim() != "-";
        let orphan = !self.posts.contains_key(&target);
        if orphan
            && self.is_full()
            && self.oldest_post_time().is_some_and(|oldest| event.created_at < oldest)
        {
            return ApplyOutcome::Stale;
        }

        self.reactions.insert(
            event.id.clone(),
            ReactionRecord {
                target: target.clone(),
                author: event.pubkey.clone(),
                created_at: event.created_at,
                is_like,
            },
        );
        self.reactions_by_target
            .entry(target.clone())
            .or_default()
            .push(event.id.clone());
        if is_like {
            *self.likes.entry(target.clone()).or_insert(0) += 1;
            if self.viewer.as_deref() == Some(event.pubkey.as_str()) {
                self.viewer_likes.insert(target.clone());
            }
        }

        if orphan {
            self.orphans.insert((event.created_at, event.id.clone()));
            if self.orphans.len() > self.max_posts
                && let Some((_, dropped)) = self.orphans.first().cloned()
            {
                self.remove_reaction(&dropped);
                if dropped == event.id {
                    return ApplyOutcome::Stale;
                }
            }
        }

        if is_like {
            ApplyOutcome::ReactionCounted { target }
        } else {
            ApplyOutcome::ReactionRecorded
        }
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn contains_post(&self, id: &str) -> bool {
        self.posts.contains_key(id)
    }

    pub fn has_profile(&self, pubkey: &str) -> bool {
        self.profiles.contains_key(pubkey)
    }

    pub fn profile(&self, pubkey: &str) -> Option<&ProfileMetadata> {
        self.profiles.get(pubkey).map(|p| &p.value)
    }

    /// `created_at` of the cached profile for `pubkey`.
    pub fn profile_created_at(&self, pubkey: &str) -> Option<u64> {
        self.profiles.get(pubkey).map(|p| p.created_at)
    }

    pub fn follows(&self, pubkey: &str) -> Option<&ContactList> {
        self.follows.get(pubkey).map(|f| &f.value)
    }

    pub fn reaction(&self, id: &str) -> Option<&ReactionRecord> {
        self.reactions.get(id)
    }

    /// Reactions held for posts that are not cached.
    pub fn orphan_reactions(&self) -> usize {
        self.orphans.len()
    }

    /// Ids of every cached post, newest first.
    pub fn post_ids(&self) -> Vec<String> {
        self.by_time.iter().rev().map(|(_, id)| id.clone()).collect()
    }

    pub fn like_count(&self, id: &str) -> u64 {
        self.likes.get(id).copied().unwrap_or(0)
    }

    /// Authors of cached posts that have no profile yet.
    pub fn missing_profiles(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .by_author
            .keys()
            .filter(|author| !self.profiles.contains_key(*author))
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    /// Ids of cached posts by `author`.
    pub fn posts_by(&self, author: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .by_author
            .get(author)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn post(&self, id: &str) -> Option<AggregatedPost> {
        self.posts.get(id).map(|event| self.aggregate(event))
    }

    fn aggregate(&self, event: &Event) -> AggregatedPost {
        AggregatedPost {
            event: event.clone(),
            author: self.profile(&event.pubkey).cloned(),
            like_count: self.like_count(&event.id),
            liked_by_viewer: self.viewer_likes.contains(&event.id),
        }
    }

    /// Every cached post, sorted by `policy` as of unix time `now`.
    pub fn view(&self, policy: SortPolicy, half_life_hours: f64, now: u64) -> Vec<AggregatedPost> {
        let mut posts: Vec<AggregatedPost> =
            self.posts.values().map(|event| self.aggregate(event)).collect();
        sort_posts(&mut posts, policy, half_life_hours, now);
        posts
    }
}
