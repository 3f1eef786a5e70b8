//! Feed read model

use nostr_core::{Event, ProfileMetadata};
use serde::Serialize;

/// A post as shown in the feed: the source event with its resolved author
/// profile and merged reaction counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPost {
    pub event: Event,
    pub author: Option<ProfileMetadata>,
    pub like_count: u64,
    pub liked_by_viewer: bool,
}

impl AggregatedPost {
    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn created_at(&self) -> u64 {
        self.event.created_at
    }

    /// Author name for display, falling back to a shortened pubkey.
    pub fn display_name(&self) -> String {
        self.author
            .as_ref()
            .and_then(|p| p.best_name())
            .map(str::to_string)
            .unwrap_or_else(|| short_key(&self.event.pubkey))
    }
}

fn short_key(pubkey: &str) -> String {
    if pubkey.len() > 12 {
        format!("{}…{}", &pubkey[..8], &pubkey[pubkey.len() - 4..])
    } else {
        pubkey.to_string()
    }
}
