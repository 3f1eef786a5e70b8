//! Event bus
//!
//! Broadcast channel carrying decoded, de-duplicated relay output to any
//! number of consumers. Slow consumers lag (and are told so by
//! `RecvError::Lagged`); publishing never blocks.

use crate::endpoint::RelayEndpoint;
use crate::relay::ConnectionStatus;
use nostr_core::Event;
use tokio::sync::broadcast;
use tracing::trace;

/// Something that happened on one of the pool's relays.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A relay connection changed state
    Status {
        relay: RelayEndpoint,
        status: ConnectionStatus,
    },
    /// A new event for a subscription
    Event {
        relay: RelayEndpoint,
        subscription_id: String,
        event: Event,
    },
    /// One relay finished sending stored events for a subscription
    Eose {
        relay: RelayEndpoint,
        subscription_id: String,
    },
    /// Every relay the subscription was sent to has sent EOSE (or closed it)
    AllEose { subscription_id: String },
    /// Relay acknowledgement of a published event
    Ok {
        relay: RelayEndpoint,
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        relay: RelayEndpoint,
        message: String,
    },
    /// The relay refused or ended a subscription
    Closed {
        relay: RelayEndpoint,
        subscription_id: String,
        message: String,
    },
}

impl BusEvent {
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            BusEvent::Event {
                subscription_id, ..
            }
            | BusEvent::Eose {
                subscription_id, ..
            }
            | BusEvent::AllEose { subscription_id }
            | BusEvent::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: BusEvent) {
        if self.sender.send(event).is_err() {
            trace!("Bus event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
