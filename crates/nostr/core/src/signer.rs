//! External signer interface.
//!
//! Keys live outside this process (an Android signer app, a bunker, a hardware
//! device). A signer either returns the complete signed event or only the
//! signature, depending on how it was asked to reply. Both shapes are folded
//! into a signed [`Event`] here, independent of the transport used to reach
//! the signer.

use crate::Event;
use crate::nip01::{EventError, UnsignedEvent, compute_event_id, reconstruct_event};
use async_trait::async_trait;

/// Reply from an external signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerResponse {
    /// The signer returned the full signed event
    Signed(Event),
    /// The signer returned only the hex signature
    Signature(String),
    /// The user or the signer refused the request
    Rejected(String),
}

impl SignerResponse {
    /// Turn the reply into a signed event for `unsigned`.
    ///
    /// A returned event must carry the id of `unsigned`; a signer that altered
    /// the content is treated as an error.
    pub fn into_event(self, unsigned: &UnsignedEvent) -> Result<Event, EventError> {
        match self {
            SignerResponse::Signed(event) => {
                let expected = compute_event_id(unsigned)?;
                if event.id != expected || !event.has_valid_id() {
                    return Err(EventError::Signer(format!(
                        "signer returned event {} but {} was requested",
                        event.id, expected
                    )));
                }
                Ok(event)
            }
            SignerResponse::Signature(sig) => reconstruct_event(unsigned, &sig),
            SignerResponse::Rejected(reason) => Err(EventError::Signer(reason)),
        }
    }
}

/// A key holder that signs on our behalf.
#[async_trait]
pub trait EventSigner: Send + Sync {
    /// Hex public key of the signing identity.
    fn public_key(&self) -> String;

    /// Ask the signer to sign `unsigned`.
    async fn sign(&self, unsigned: &UnsignedEvent) -> Result<SignerResponse, EventError>;
}

/// Sign `unsigned` through `signer` and return the finished event.
pub async fn sign_with(signer: &dyn EventSigner, unsigned: &UnsignedEvent) -> Result<Event, EventError> {
    signer.sign(unsigned).await?.into_event(unsigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize_unsigned;

    struct SignatureOnlySigner;

    #[async_trait]
    impl EventSigner for SignatureOnlySigner {
        fn public_key(&self) -> String {
            "a".repeat(64)
        }

        async fn sign(&self, _unsigned: &UnsignedEvent) -> Result<SignerResponse, EventError> {
            Ok(SignerResponse::Signature("d".repeat(128)))
        }
    }

    fn unsigned() -> UnsignedEvent {
        UnsignedEvent {
            pubkey: "a".repeat(64),
            created_at: 42,
            kind: 1,
            tags: vec![],
            content: "signed elsewhere".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sign_with_signature_only_signer() {
        let event = sign_with(&SignatureOnlySigner, &unsigned()).await.unwrap();
        assert_eq!(event.sig, "d".repeat(128));
        assert!(event.has_valid_id());
    }

    #[test]
    fn test_signed_response_is_checked() {
        let good = finalize_unsigned(unsigned(), "e".repeat(128)).unwrap();
        assert!(SignerResponse::Signed(good.clone()).into_event(&unsigned()).is_ok());

        let mut other = unsigned();
        other.content = "something else".to_string();
        let wrong = finalize_unsigned(other, "e".repeat(128)).unwrap();
        assert!(SignerResponse::Signed(wrong).into_event(&unsigned()).is_err());
    }

    #[test]
    fn test_rejected_response() {
        let result = SignerResponse::Rejected("user declined".to_string()).into_event(&unsigned());
        assert!(matches!(result, Err(EventError::Signer(msg)) if msg == "user declined"));
    }
}
