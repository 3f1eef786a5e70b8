//! Kind 0 profile metadata.
//!
//! The event content is a JSON object. Unknown fields are ignored, and fields
//! with the wrong type make the whole event unusable.

use crate::Event;
use crate::nip01::KIND_METADATA;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid event kind: expected 0, got {0}")]
    InvalidKind(u16),

    #[error("invalid metadata content: {0}")]
    InvalidContent(#[from] serde_json::Error),
}

/// Profile metadata published by an author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl ProfileMetadata {
    pub fn from_event(event: &Event) -> Result<Self, ProfileError> {
        if event.kind != KIND_METADATA {
            return Err(ProfileError::InvalidKind(event.kind));
        }
        Ok(serde_json::from_str(&event.content)?)
    }

    /// Best name to show for this profile, preferring `display_name`.
    pub fn best_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.name.as_deref().filter(|s| !s.is_empty()))
    }
}
