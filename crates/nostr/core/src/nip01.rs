//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing
//! - Event id computation and verification
//! - Reassembly of an event from a bare signature returned by a remote signer
//! - Kind classification (regular, replaceable, ephemeral, addressable)
//!
//! Schnorr signature verification is out of scope here: events are assumed to
//! be verified by a trusted library before they reach this crate, and only the
//! content-addressed id is checked.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signer error: {0}")]
    Signer(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_REACTION: u16 = 7;
pub const KIND_PICTURE: u16 = 20;

/// Classify an event kind.
pub fn classify_kind(kind: u16) -> KindClassification {
    match kind {
        0 | 3 => KindClassification::Replaceable,
        10000..=19999 => KindClassification::Replaceable,
        20000..=29999 => KindClassification::Ephemeral,
        30000..=39999 => KindClassification::Addressable,
        _ => KindClassification::Regular,
    }
}

/// Whether only the newest event per (author, kind) is meaningful.
pub fn is_replaceable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Replaceable
}

impl Event {
    /// The unsigned part of this event, i.e. everything that is hashed.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that `id` is the canonical hash of the event body.
    pub fn has_valid_id(&self) -> bool {
        match compute_event_id(&self.unsigned()) {
            Ok(id) => id == self.id,
            Err(_) => false,
        }
    }

    /// Values of every tag named `name` (second element of the tag array).
    pub fn tag_values<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// First value of the tag named `name`.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).next()
    }

    /// Last value of the tag named `name`.
    pub fn last_tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).last()
    }

    pub fn classification(&self) -> KindClassification {
        classify_kind(self.kind)
    }
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, EventError> {
    if !validate_unsigned_event(event) {
        return Err(EventError::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id (lowercase hex sha256 of the canonical serialization).
pub fn compute_event_id(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = serialize_event(event)?;
    let hash = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(hash))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_lower_hex(&event.pubkey, 64)
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Reassemble a signed event from its unsigned body and a bare signature.
///
/// Remote signers may hand back only the 64-byte Schnorr signature. The id is
/// recomputed from the canonical serialization so the result is identical to
/// what a local signer would have produced.
pub fn reconstruct_event(unsigned: &UnsignedEvent, signature: &str) -> Result<Event, EventError> {
    let signature = signature.trim().to_lowercase();
    if !is_lower_hex(&signature, 128) {
        return Err(EventError::InvalidSignature(format!(
            "expected 128 hex characters, got {}",
            signature.len()
        )));
    }

    Ok(Event {
        id: compute_event_id(unsigned)?,
        pubkey: unsigned.pubkey.clone(),
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags.clone(),
        content: unsigned.content.clone(),
        sig: signature,
    })
}

/// Build an event with a correct id and an opaque signature.
///
/// The signature is not checked; this is meant for callers whose signing is
/// delegated elsewhere, and for fixtures.
pub fn finalize_unsigned(unsigned: UnsignedEvent, sig: impl Into<String>) -> Result<Event, EventError> {
    let id = compute_event_id(&unsigned)?;
    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: sig.into(),
    })
}
