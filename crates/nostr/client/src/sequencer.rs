//! Ordered dispatch of inbound relay traffic.
//!
//! Every connection's receive loop pushes raw frames (and its own status
//! changes) into one unbounded queue. A single consumer task decodes and
//! dispatches them to the [`EventBus`] strictly in arrival order, so an EOSE
//! can never overtake the events it bounds.

use crate::bus::{BusEvent, EventBus};
use crate::config::ClientConfig;
use crate::endpoint::RelayEndpoint;
use crate::message::RelayMessage;
use crate::relay::ConnectionStatus;
use crate::subscription::SubscriptionRegistry;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Item queued by a relay connection.
#[derive(Debug, Clone)]
pub enum Inbound {
    Frame { relay: RelayEndpoint, raw: String },
    Status {
        relay: RelayEndpoint,
        /// [`RelayConnection::instance`](crate::relay::RelayConnection::instance)
        /// that reported the change
        instance: u64,
        status: ConnectionStatus,
    },
}

/// Producer side of the queue, cloned into every connection.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl SequencerHandle {
    /// Enqueue a raw text frame. Returns false once the consumer is gone.
    pub fn push_frame(&self, relay: &RelayEndpoint, raw: impl Into<String>) -> bool {
        self.tx
            .send(Inbound::Frame {
                relay: relay.clone(),
                raw: raw.into(),
            })
            .is_ok()
    }

    pub fn push_status(&self, relay: &RelayEndpoint, instance: u64, status: ConnectionStatus) -> bool {
        self.tx
            .send(Inbound::Status {
                relay: relay.clone(),
                instance,
                status,
            })
            .is_ok()
    }
}

/// Bounded FIFO set of recently seen (subscription id, event id) pairs.
#[derive(Debug)]
struct SeenSet {
    capacity: usize,
    order: VecDeque<(String, String)>,
    members: HashSet<(String, String)>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns true if the pair was not seen before.
    fn insert(&mut self, subscription_id: &str, event_id: &str) -> bool {
        let key = (subscription_id.to_string(), event_id.to_string());
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        true
    }
}

/// Single consumer of the inbound queue.
pub struct Sequencer {
    bus: EventBus,
    registry: Arc<SubscriptionRegistry>,
    verify_event_ids: bool,
    seen: SeenSet,
}

impl Sequencer {
    pub fn new(bus: EventBus, registry: Arc<SubscriptionRegistry>, config: &ClientConfig) -> Self {
        Self {
            bus,
            registry,
            verify_event_ids: config.verify_event_ids,
            seen: SeenSet::new(config.dedup_capacity),
        }
    }

    /// Start the consumer task. It runs until every handle is dropped.
    pub fn spawn(mut self) -> (SequencerHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                self.dispatch(inbound);
            }
            debug!("Sequencer queue closed");
        });
        (SequencerHandle { tx }, task)
    }

    /// Decode and dispatch one queued item.
    pub fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame { relay, raw } => match RelayMessage::from_json(&raw) {
                Ok(message) => self.dispatch_message(relay, message),
                Err(e) => warn!("Dropping malformed frame from {}: {}", relay, e),
            },
            Inbound::Status {
                relay,
                instance,
                status,
            } => {
                if status.is_terminal() {
                    for subscription_id in self.registry.relay_gone(&relay, instance) {
                        self.bus.publish(BusEvent::AllEose { subscription_id });
                    }
                }
                self.bus.publish(BusEvent::Status { relay, status });
            }
        }
    }

    fn dispatch_message(&mut self, relay: RelayEndpoint, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if self.verify_event_ids && !event.has_valid_id() {
                    warn!("Dropping event {} from {}: id does not match content", event.id, relay);
                    return;
                }
                if !self.seen.insert(&subscription_id, &event.id) {
                    trace!("Duplicate event {} on {} from {}", event.id, subscription_id, relay);
                    return;
                }
                self.bus.publish(BusEvent::Event {
                    relay,
                    subscription_id,
                    event,
                });
            }
            RelayMessage::Eose { subscription_id } => {
                let complete = self.registry.mark_eose(&subscription_id, &relay);
                self.bus.publish(BusEvent::Eose {
                    relay,
                    subscription_id: subscription_id.clone(),
                });
                if complete {
                    self.bus.publish(BusEvent::AllEose { subscription_id });
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                debug!("Relay {} closed subscription {}: {}", relay, subscription_id, message);
                let complete = self.registry.relay_closed(&subscription_id, &relay);
                self.bus.publish(BusEvent::Closed {
                    relay,
                    subscription_id: subscription_id.clone(),
                    message,
                });
                if complete {
                    self.bus.publish(BusEvent::AllEose { subscription_id });
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if !accepted {
                    debug!("Relay {} rejected {}: {}", relay, event_id, message);
                }
                self.bus.publish(BusEvent::Ok {
                    relay,
                    event_id,
                    accepted,
                    message,
                });
            }
            RelayMessage::Notice { message } => {
                debug!("NOTICE from {}: {}", relay, message);
                self.bus.publish(BusEvent::Notice { relay, message });
            }
            RelayMessage::Auth { .. } => {
                debug!("Ignoring AUTH challenge from {}", relay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Filter;
    use nostr_core::{Event, UnsignedEvent, finalize_unsigned};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn relay(name: &str) -> RelayEndpoint {
        RelayEndpoint::parse(&format!("wss://{}.example", name)).unwrap()
    }

    fn note(created_at: u64) -> Event {
        finalize_unsigned(
            UnsignedEvent {
                pubkey: "a".repeat(64),
                created_at,
                kind: 1,
                tags: vec![],
                content: format!("note {}", created_at),
            },
            "f".repeat(128),
        )
        .unwrap()
    }

    fn event_frame(sub: &str, event: &Event) -> String {
        serde_json::json!(["EVENT", sub, event]).to_string()
    }

    fn setup(verify: bool) -> (Sequencer, EventBus, Arc<SubscriptionRegistry>) {
        let bus = EventBus::new(64);
        let registry = Arc::new(SubscriptionRegistry::new());
        let config = ClientConfig {
            verify_event_ids: verify,
            dedup_capacity: 2,
            ..Default::default()
        };
        (
            Sequencer::new(bus.clone(), registry.clone(), &config),
            bus,
            registry,
        )
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_arrival_order() {
        let (sequencer, bus, registry) = setup(true);
        registry.subscribe("sub", Filter::new(), None);
        registry.mark_sent("sub", &relay("a"), 7);
        let mut rx = bus.subscribe();
        let (handle, _task) = sequencer.spawn();

        let a = note(1);
        let b = note(2);
        let producer = {
            let handle = handle.clone();
            let frames = vec![event_frame("sub", &a), event_frame("sub", &b)];
            tokio::spawn(async move {
                for frame in frames {
                    handle.push_frame(&relay("a"), frame);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                handle.push_frame(&relay("a"), r#"["EOSE","sub"]"#);
            })
        };
        producer.await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                BusEvent::Event { event, .. } => seen.push(event.id),
                BusEvent::Eose { .. } => seen.push("EOSE".to_string()),
                BusEvent::AllEose { .. } => seen.push("ALL".to_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![a.id, b.id, "EOSE".to_string(), "ALL".to_string()]);
    }

    #[test]
    fn test_malformed_frames_do_not_stop_dispatch() {
        let (mut sequencer, bus, _registry) = setup(true);
        let mut rx = bus.subscribe();

        for raw in ["garbage", "[]", r#"["WHAT","x"]"#, r#"["EVENT","s",{"id":1}]"#] {
            sequencer.dispatch(Inbound::Frame {
                relay: relay("a"),
                raw: raw.to_string(),
            });
        }
        sequencer.dispatch(Inbound::Frame {
            relay: relay("a"),
            raw: r#"["NOTICE","still here"]"#.to_string(),
        });

        assert!(matches!(rx.try_recv(), Ok(BusEvent::Notice { message, .. }) if message == "still here"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_duplicates_and_bad_ids_dropped() {
        let (mut sequencer, bus, _registry) = setup(true);
        let mut rx = bus.subscribe();
        let event = note(1);
        let mut forged = note(2);
        forged.content = "tampered".to_string();

        for (name, e) in [("a", &event), ("b", &event), ("a", &forged)] {
            sequencer.dispatch(Inbound::Frame {
                relay: relay(name),
                raw: event_frame("sub", e),
            });
        }
        // Same event on another subscription is delivered
        sequencer.dispatch(Inbound::Frame {
            relay: relay("a"),
            raw: event_frame("other", &event),
        });

        let mut delivered = Vec::new();
        while let Ok(BusEvent::Event {
            subscription_id, ..
        }) = rx.try_recv()
        {
            delivered.push(subscription_id);
        }
        assert_eq!(delivered, vec!["sub".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_seen_set_is_bounded() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("s", "1"));
        assert!(seen.insert("s", "2"));
        assert!(!seen.insert("s", "1"));
        assert!(seen.insert("s", "3"));
        // "1" was evicted
        assert!(seen.insert("s", "1"));
        assert_eq!(seen.order.len(), 2);
    }

    #[test]
    fn test_terminal_status_completes_waiting_subscriptions() {
        let (mut sequencer, bus, registry) = setup(true);
        registry.subscribe("sub", Filter::new(), None);
        registry.mark_sent("sub", &relay("a"), 7);
        let mut rx = bus.subscribe();

        sequencer.dispatch(Inbound::Status {
            relay: relay("a"),
            instance: 7,
            status: ConnectionStatus::Error("refused".to_string()),
        });

        assert!(matches!(rx.try_recv(), Ok(BusEvent::AllEose { subscription_id }) if subscription_id == "sub"));
        assert!(matches!(rx.try_recv(), Ok(BusEvent::Status { status: ConnectionStatus::Error(_), .. })));
    }

    #[test]
    fn test_frames_for_unknown_subscription_still_dispatched() {
        let (mut sequencer, bus, _registry) = setup(false);
        let mut rx = bus.subscribe();
        sequencer.dispatch(Inbound::Frame {
            relay: relay("a"),
            raw: r#"["EOSE","gone"]"#.to_string(),
        });
        assert!(matches!(rx.try_recv(), Ok(BusEvent::Eose { subscription_id, .. }) if subscription_id == "gone"));
        assert!(rx.try_recv().is_err());
    }
}
