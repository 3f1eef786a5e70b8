//! Feed ordering.
//!
//! Trending uses recency-weighted popularity:
//!
//! ```text
//! score = (likes + 1) / (1 + age_hours / half_life_hours)
//! ```
//!
//! Ties fall back to chronological order so the view is stable between
//! recomputations.

use crate::post::AggregatedPost;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortPolicy {
    /// Most recent first
    #[default]
    Chronological,
    Trending,
}

impl fmt::Display for SortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortPolicy::Chronological => write!(f, "chronological"),
            SortPolicy::Trending => write!(f, "trending"),
        }
    }
}

impl FromStr for SortPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chronological" | "latest" => Ok(SortPolicy::Chronological),
            "trending" => Ok(SortPolicy::Trending),
            other => Err(format!("unknown sort policy: {}", other)),
        }
    }
}

/// Trending score. Negative ages (clock skew) count as zero.
pub fn trending_score(like_count: u64, age_hours: f64, half_life_hours: f64) -> f64 {
    let age = age_hours.max(0.0);
    (like_count as f64 + 1.0) / (1.0 + age / half_life_hours)
}

fn age_hours(created_at: u64, now: u64) -> f64 {
    (now as f64 - created_at as f64) / 3600.0
}

fn chronological(a: &AggregatedPost, b: &AggregatedPost) -> Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| a.id().cmp(b.id()))
}

/// Sort `posts` in place according to `policy` as of unix time `now`.
pub fn sort_posts(posts: &mut [AggregatedPost], policy: SortPolicy, half_life_hours: f64, now: u64) {
    match policy {
        SortPolicy::Chronological => posts.sort_by(chronological),
        SortPolicy::Trending => {
            let score = |p: &AggregatedPost| {
                trending_score(p.like_count, age_hours(p.created_at(), now), half_life_hours)
            };
            posts.sort_by(|a, b| {
                score(b)
                    .partial_cmp(&score(a))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| chronological(a, b))
            });
        }
    }
}
