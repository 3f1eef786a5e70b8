//! Subscription registry.
//!
//! Source of truth for active subscriptions. Relay connections read it when
//! they reach `Connected` and replay every subscription that applies to them,
//! so filters always reflect the latest `subscribe` call.

use crate::endpoint::RelayEndpoint;
use crate::message::{ClientMessage, FilterSet};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Generate a random subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// An active subscription and its per-relay EOSE bookkeeping.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: FilterSet,
    /// Relays the subscription is restricted to; `None` means every relay
    pub scope: Option<HashSet<RelayEndpoint>>,
    /// Relays the current REQ was sent to, with the connection instance
    relays: HashMap<RelayEndpoint, u64>,
    /// Relays that have sent EOSE for the current REQ
    eose: HashSet<RelayEndpoint>,
    all_eose: bool,
}

impl Subscription {
    fn new(id: String, filters: FilterSet, scope: Option<HashSet<RelayEndpoint>>) -> Self {
        Self {
            id,
            filters,
            scope,
            relays: HashMap::new(),
            eose: HashSet::new(),
            all_eose: false,
        }
    }

    pub fn applies_to(&self, endpoint: &RelayEndpoint) -> bool {
        self.scope.as_ref().is_none_or(|scope| scope.contains(endpoint))
    }

    pub fn req(&self) -> ClientMessage {
        ClientMessage::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        }
    }

    pub fn sent_to(&self) -> impl Iterator<Item = &RelayEndpoint> {
        self.relays.keys()
    }

    pub fn is_all_eose(&self) -> bool {
        self.all_eose
    }

    /// Flip to all-EOSE once every relay that got the REQ has answered.
    /// Returns true only on the transition.
    fn update_all_eose(&mut self) -> bool {
        if self.all_eose || self.relays.is_empty() {
            return false;
        }
        if self.relays.keys().all(|r| self.eose.contains(r)) {
            self.all_eose = true;
            return true;
        }
        false
    }
}

/// Concurrent map of subscription id to [`Subscription`].
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subscription and return the REQ frame to send.
    ///
    /// Replacing resets EOSE tracking, since relays answer the new REQ from
    /// scratch.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filters: impl Into<FilterSet>,
        scope: Option<Vec<RelayEndpoint>>,
    ) -> ClientMessage {
        let id = id.into();
        let subscription = Subscription::new(
            id.clone(),
            filters.into(),
            scope.map(|relays| relays.into_iter().collect()),
        );
        let req = subscription.req();
        self.subscriptions.insert(id, subscription);
        req
    }

    /// Remove a subscription, returning it so its relays can be sent CLOSE.
    pub fn remove(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.remove(id).map(|(_, sub)| sub)
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.get(id).map(|sub| sub.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// REQ frames for every subscription that applies to `endpoint`, built
    /// from the filters as they are right now.
    pub fn replay_for(&self, endpoint: &RelayEndpoint) -> Vec<ClientMessage> {
        self.subscriptions
            .iter()
            .filter(|sub| sub.applies_to(endpoint))
            .map(|sub| sub.req())
            .collect()
    }

    /// Whether `id` should be sent to `endpoint`.
    pub fn applies_to(&self, id: &str, endpoint: &RelayEndpoint) -> bool {
        self.subscriptions
            .get(id)
            .is_some_and(|sub| sub.applies_to(endpoint))
    }

    /// Record that the current REQ for `id` went out on connection
    /// `instance` to `endpoint`.
    pub fn mark_sent(&self, id: &str, endpoint: &RelayEndpoint, instance: u64) {
        if let Some(mut sub) = self.subscriptions.get_mut(id) {
            sub.relays.insert(endpoint.clone(), instance);
            sub.eose.remove(endpoint);
            sub.all_eose = false;
        }
    }

    /// Record EOSE from `endpoint`. Returns true when this completes the
    /// subscription across all relays. EOSE from a relay the current REQ was
    /// not sent to is ignored.
    pub fn mark_eose(&self, id: &str, endpoint: &RelayEndpoint) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(mut sub) if sub.relays.contains_key(endpoint) => {
                sub.eose.insert(endpoint.clone());
                sub.update_all_eose()
            }
            _ => false,
        }
    }

    /// A relay sent CLOSED for `id`; stop waiting on it.
    /// Returns true when the remaining relays have all sent EOSE.
    pub fn relay_closed(&self, id: &str, endpoint: &RelayEndpoint) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(mut sub) => Self::drop_relay(&mut sub, endpoint, None),
            None => false,
        }
    }

    /// Connection `instance` to `endpoint` ended. Returns ids of subscriptions
    /// that are now complete because they were only waiting on it. REQs sent
    /// on a newer connection to the same endpoint are left alone.
    pub fn relay_gone(&self, endpoint: &RelayEndpoint, instance: u64) -> Vec<String> {
        let mut completed = Vec::new();
        for mut sub in self.subscriptions.iter_mut() {
            if Self::drop_relay(&mut sub, endpoint, Some(instance)) {
                completed.push(sub.id.clone());
            }
        }
        completed
    }

    fn drop_relay(sub: &mut Subscription, endpoint: &RelayEndpoint, instance: Option<u64>) -> bool {
        match sub.relays.get(endpoint) {
            Some(sent_on) if instance.is_none_or(|i| i == *sent_on) => {
                sub.relays.remove(endpoint);
            }
            _ => return false,
        }
        sub.eose.remove(endpoint);
        if sub.relays.is_empty() {
            // Nothing left to wait for
            let newly = !sub.all_eose;
            sub.all_eose = true;
            return newly;
        }
        sub.update_all_eose()
    }
}
