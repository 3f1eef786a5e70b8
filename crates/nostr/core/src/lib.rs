//! Nostr event model shared by the relay client and the feed.
//!
//! - [`nip01`]: event structure, canonical serialization, ids, kinds
//! - [`nip02`]: follow lists
//! - [`profile`]: kind 0 profile metadata
//! - [`signer`]: external signer interface

pub mod nip01;
pub mod nip02;
pub mod profile;
pub mod signer;

pub use nip01::{
    Event, EventError, KIND_CONTACTS, KIND_METADATA, KIND_PICTURE, KIND_REACTION,
    KIND_SHORT_TEXT_NOTE, KindClassification, UnsignedEvent, classify_kind, compute_event_id,
    finalize_unsigned, is_replaceable_kind, reconstruct_event, serialize_event,
    validate_unsigned_event,
};
pub use nip02::{Contact, ContactList, Nip02Error};
pub use profile::{ProfileError, ProfileMetadata};
pub use signer::{EventSigner, SignerResponse, sign_with};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
