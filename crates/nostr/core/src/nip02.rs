//! NIP-02: Follow List
//!
//! Kind 3 events list followed profiles as `p` tags. The list is replaceable:
//! only the newest event per author is meaningful.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/02.md>

use crate::Event;
use crate::nip01::KIND_CONTACTS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during NIP-02 operations
#[derive(Debug, Error)]
pub enum Nip02Error {
    #[error("invalid event kind: expected 3, got {0}")]
    InvalidKind(u16),

    #[error("invalid p-tag format: {0}")]
    InvalidPTag(String),
}

/// A single contact in a follow list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The public key of the followed profile (32-byte hex)
    pub pubkey: String,

    /// Optional relay URL where this profile can be found
    pub relay_url: Option<String>,

    /// Optional local petname for this contact
    pub petname: Option<String>,
}

impl Contact {
    /// Parse a contact from a p-tag array
    pub fn from_tag(tag: &[String]) -> Result<Self, Nip02Error> {
        if tag.len() < 2 || tag[0] != "p" {
            return Err(Nip02Error::InvalidPTag(format!("{:?}", tag)));
        }

        let pubkey = tag[1].to_lowercase();
        if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Nip02Error::InvalidPTag(format!(
                "pubkey must be 64-character hex, got: {}",
                tag[1]
            )));
        }

        let non_empty = |idx: usize| tag.get(idx).filter(|s| !s.is_empty()).cloned();

        Ok(Self {
            pubkey,
            relay_url: non_empty(2),
            petname: non_empty(3),
        })
    }
}

/// Follow list parsed from a kind 3 event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactList {
    /// Author of the list
    pub owner: String,
    /// `created_at` of the source event, used for last-write-wins merges
    pub created_at: u64,
    pub contacts: Vec<Contact>,
}

impl ContactList {
    /// Build a contact list from a kind 3 event.
    ///
    /// Malformed `p` tags are skipped; duplicate pubkeys keep their first entry.
    pub fn from_event(event: &Event) -> Result<Self, Nip02Error> {
        if event.kind != KIND_CONTACTS {
            return Err(Nip02Error::InvalidKind(event.kind));
        }

        let mut seen = HashSet::new();
        let mut contacts = Vec::new();
        for tag in event.tags.iter().filter(|t| t.first().is_some_and(|n| n == "p")) {
            match Contact::from_tag(tag) {
                Ok(contact) => {
                    if seen.insert(contact.pubkey.clone()) {
                        contacts.push(contact);
                    }
                }
                Err(e) => debug!("Skipping contact in list {}: {}", event.id, e),
            }
        }

        Ok(Self {
            owner: event.pubkey.clone(),
            created_at: event.created_at,
            contacts,
        })
    }

    /// Check if a public key is in the contact list
    pub fn contains(&self, pubkey: &str) -> bool {
        self.contacts.iter().any(|c| c.pubkey == pubkey)
    }

    /// Get all public keys in the contact list
    pub fn pubkeys(&self) -> Vec<String> {
        self.contacts.iter().map(|c| c.pubkey.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UnsignedEvent, finalize_unsigned};

    fn contact_event(tags: Vec<Vec<String>>) -> Event {
        finalize_unsigned(
            UnsignedEvent {
                pubkey: "f".repeat(64),
                created_at: 1234567890,
                kind: KIND_CONTACTS,
                tags,
                content: String::new(),
            },
            "sig",
        )
        .unwrap()
    }

    fn p(values: &[&str]) -> Vec<String> {
        let mut tag = vec!["p".to_string()];
        tag.extend(values.iter().map(|v| v.to_string()));
        tag
    }

    #[test]
    fn test_contact_from_tag() {
        let pubkey = "b".repeat(64);
        let contact = Contact::from_tag(&p(&[&pubkey, "wss://relay.com", "alice"])).unwrap();
        assert_eq!(contact.pubkey, pubkey);
        assert_eq!(contact.relay_url.as_deref(), Some("wss://relay.com"));
        assert_eq!(contact.petname.as_deref(), Some("alice"));

        let bare = Contact::from_tag(&p(&[&pubkey, ""])).unwrap();
        assert!(bare.relay_url.is_none());
        assert!(bare.petname.is_none());
    }

    #[test]
    fn test_contact_from_tag_invalid() {
        assert!(Contact::from_tag(&p(&["short"])).is_err());
        assert!(Contact::from_tag(&["e".to_string(), "a".repeat(64)]).is_err());
        assert!(Contact::from_tag(&p(&[])).is_err());
    }

    #[test]
    fn test_contact_list_skips_bad_tags() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let event = contact_event(vec![
            p(&[&a]),
            p(&["not-a-key"]),
            vec!["t".to_string(), "ignored".to_string()],
            p(&[&b, "wss://relay.com"]),
            p(&[&a]),
        ]);

        let list = ContactList::from_event(&event).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&a));
        assert!(list.contains(&b));
        assert_eq!(list.owner, "f".repeat(64));
        assert_eq!(list.created_at, 1234567890);
    }

    #[test]
    fn test_contact_list_wrong_kind() {
        let mut event = contact_event(vec![]);
        event.kind = 1;
        assert!(matches!(
            ContactList::from_event(&event),
            Err(Nip02Error::InvalidKind(1))
        ));
    }
}
