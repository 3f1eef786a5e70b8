//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns the desired endpoint set and at most one live
//! [`RelayConnection`] per endpoint. Connection attempts that end are removed
//! from the live set; the supervisor (or an explicit [`RelayPool::reconnect`])
//! creates a fresh instance later. Aggregate status is always derived from
//! the per-relay statuses, never stored.

use crate::bus::{BusEvent, EventBus};
use crate::config::ClientConfig;
use crate::endpoint::RelayEndpoint;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, FilterSet};
use crate::recovery::ReconnectBackoff;
use crate::relay::{ConnectionSettings, ConnectionStatus, RelayConnection};
use crate::sequencer::{Sequencer, SequencerHandle};
use crate::subscription::{SubscriptionRegistry, generate_subscription_id};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nostr_core::{Event, EventSigner, UnsignedEvent, sign_with};
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Combine per-relay statuses into one.
///
/// `Connected` if any relay is, else `Connecting` if any is, else `Error` if
/// every relay failed, else `Disconnected`.
pub fn aggregate_status<'a>(statuses: impl IntoIterator<Item = &'a ConnectionStatus>) -> ConnectionStatus {
    let mut any = false;
    let mut connecting = false;
    let mut all_error = true;
    let mut last_error = None;

    for status in statuses {
        any = true;
        match status {
            ConnectionStatus::Connected => return ConnectionStatus::Connected,
            ConnectionStatus::Connecting => {
                connecting = true;
                all_error = false;
            }
            ConnectionStatus::Disconnected => all_error = false,
            ConnectionStatus::Error(reason) => last_error = Some(reason.clone()),
        }
    }

    if connecting {
        ConnectionStatus::Connecting
    } else if any && all_error {
        ConnectionStatus::Error(last_error.unwrap_or_default())
    } else {
        ConnectionStatus::Disconnected
    }
}

/// A pool of Nostr relay connections.
pub struct RelayPool {
    config: ClientConfig,
    settings: ConnectionSettings,
    bus: EventBus,
    registry: Arc<SubscriptionRegistry>,
    sequencer: SequencerHandle,
    /// Endpoints the pool should keep connected
    desired: RwLock<BTreeSet<RelayEndpoint>>,
    /// Live connection instance per endpoint
    connections: DashMap<RelayEndpoint, Arc<RelayConnection>>,
    /// Status of the most recent instance, kept after it is removed
    last_status: DashMap<RelayEndpoint, ConnectionStatus>,
    backoff: ReconnectBackoff,
}

impl RelayPool {
    /// Create a pool and start its dispatch task. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let bus = EventBus::new(config.bus_capacity);
        let registry = Arc::new(SubscriptionRegistry::new());
        let (sequencer, _task) = Sequencer::new(bus.clone(), registry.clone(), &config).spawn();

        Ok(Arc::new(Self {
            settings: ConnectionSettings::from(&config),
            backoff: ReconnectBackoff::new(config.reconnect_backoff.clone()),
            config,
            bus,
            registry,
            sequencer,
            desired: RwLock::new(BTreeSet::new()),
            connections: DashMap::new(),
            last_status: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Receive everything dispatched by this pool.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // ---------------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------------

    /// Add `endpoints` to the desired set and start connecting to them.
    /// Returns immediately; progress is reported on the bus.
    pub fn connect(self: &Arc<Self>, endpoints: &[RelayEndpoint]) {
        {
            let mut desired = self.desired.write();
            desired.extend(endpoints.iter().cloned());
        }
        for endpoint in endpoints {
            self.spawn_connection(endpoint);
        }
    }

    /// Close every connection and forget the desired set.
    pub fn disconnect(&self) {
        self.desired.write().clear();
        let endpoints: Vec<RelayEndpoint> =
            self.connections.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            self.close_endpoint(&endpoint);
        }
        info!("Disconnected from all relays");
    }

    /// Close one relay and stop trying to reconnect it.
    pub fn disconnect_one(&self, endpoint: &RelayEndpoint) {
        self.desired.write().remove(endpoint);
        self.close_endpoint(endpoint);
    }

    fn close_endpoint(&self, endpoint: &RelayEndpoint) {
        self.backoff.forget(endpoint);
        if let Some((_, conn)) = self.connections.remove(endpoint) {
            conn.close("client disconnect");
            self.last_status
                .insert(endpoint.clone(), ConnectionStatus::Disconnected);
        }
    }

    /// Start a new connection for every endpoint that is neither connected
    /// nor connecting. `None` means every desired endpoint. Ignores backoff.
    ///
    /// Returns the endpoints a new attempt was started for.
    pub fn reconnect(self: &Arc<Self>, endpoints: Option<&[RelayEndpoint]>) -> Vec<RelayEndpoint> {
        let targets: Vec<RelayEndpoint> = match endpoints {
            Some(list) => {
                self.desired.write().extend(list.iter().cloned());
                list.to_vec()
            }
            None => self.desired.read().iter().cloned().collect(),
        };

        targets
            .into_iter()
            .filter(|endpoint| !self.is_active(endpoint))
            .inspect(|endpoint| {
                self.spawn_connection(endpoint);
            })
            .collect()
    }

    /// One supervisor pass: reconnect desired endpoints that are down and
    /// whose backoff delay has elapsed.
    pub fn supervise(self: &Arc<Self>) -> Vec<RelayEndpoint> {
        let due: Vec<RelayEndpoint> = self
            .desired
            .read()
            .iter()
            .filter(|endpoint| !self.is_active(endpoint) && self.backoff.is_ready(endpoint))
            .cloned()
            .collect();

        for endpoint in &due {
            debug!(
                "Supervisor reconnecting {} (failures: {})",
                endpoint,
                self.backoff.failures(endpoint)
            );
            self.spawn_connection(endpoint);
        }
        due
    }

    /// Run [`RelayPool::supervise`] every `supervisorIntervalMs` until the
    /// pool is dropped.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.supervisor_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.supervise();
            }
            debug!("Supervisor stopped");
        })
    }

    /// Connect `endpoint` if needed and wait up to `wait` for it to be
    /// `Connected`.
    pub async fn ensure_connected(self: &Arc<Self>, endpoint: &RelayEndpoint, wait: Duration) -> bool {
        self.desired.write().insert(endpoint.clone());
        let conn = self.spawn_connection(endpoint);
        conn.wait_connected(wait).await
    }

    fn is_active(&self, endpoint: &RelayEndpoint) -> bool {
        self.connections
            .get(endpoint)
            .is_some_and(|conn| conn.status().is_active())
    }

    /// Return the live active instance for `endpoint`, or start a new one.
    fn spawn_connection(self: &Arc<Self>, endpoint: &RelayEndpoint) -> Arc<RelayConnection> {
        let conn = match self.connections.entry(endpoint.clone()) {
            Entry::Occupied(entry) if entry.get().status().is_active() => {
                return Arc::clone(entry.get());
            }
            entry => {
                let conn = RelayConnection::new(
                    endpoint.clone(),
                    self.settings,
                    self.sequencer.clone(),
                    self.registry.clone(),
                );
                entry.insert(Arc::clone(&conn));
                conn
            }
        };
        self.last_status
            .insert(endpoint.clone(), ConnectionStatus::Connecting);

        let weak = Arc::downgrade(self);
        let watched = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut status_rx = watched.watch_status();
            if let Err(e) = watched.connect().await {
                warn!("Failed to connect to {}: {}", watched.endpoint(), e);
            }
            loop {
                let status = status_rx.borrow_and_update().clone();
                let terminal = status.is_terminal();
                if !Self::observe(&weak, &watched, status) || terminal {
                    break;
                }
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        conn
    }

    /// Apply a status change of `conn` to the pool. Returns false if the pool
    /// is gone.
    fn observe(weak: &Weak<Self>, conn: &Arc<RelayConnection>, status: ConnectionStatus) -> bool {
        let Some(pool) = weak.upgrade() else {
            return false;
        };
        let endpoint = conn.endpoint();
        let current = pool
            .connections
            .get(endpoint)
            .is_some_and(|live| live.instance() == conn.instance());
        if !current {
            // Superseded or explicitly closed
            return true;
        }

        pool.last_status.insert(endpoint.clone(), status.clone());
        match &status {
            ConnectionStatus::Connected => pool.backoff.record_success(endpoint),
            ConnectionStatus::Connecting => {}
            ConnectionStatus::Disconnected | ConnectionStatus::Error(_) => {
                pool.connections
                    .remove_if(endpoint, |_, live| live.instance() == conn.instance());
                if pool.desired.read().contains(endpoint) {
                    let delay = pool.backoff.record_failure(endpoint);
                    info!("Relay {} is {}; next retry in {:?}", endpoint, status, delay);
                } else {
                    pool.backoff.forget(endpoint);
                }
            }
        }
        true
    }

    /// Endpoints whose live connection is `Connected`.
    pub fn connected_endpoints(&self) -> Vec<RelayEndpoint> {
        let mut endpoints: Vec<RelayEndpoint> = self
            .connections
            .iter()
            .filter(|entry| entry.value().status().is_connected())
            .map(|entry| entry.key().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    fn connected(&self) -> Vec<Arc<RelayConnection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().status().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Status of every desired endpoint.
    pub fn statuses(&self) -> Vec<(RelayEndpoint, ConnectionStatus)> {
        self.desired
            .read()
            .iter()
            .map(|endpoint| {
                let status = match self.connections.get(endpoint) {
                    Some(conn) => conn.status(),
                    None => self
                        .last_status
                        .get(endpoint)
                        .map(|s| s.value().clone())
                        .unwrap_or(ConnectionStatus::Disconnected),
                };
                (endpoint.clone(), status)
            })
            .collect()
    }

    pub fn status(&self) -> ConnectionStatus {
        let statuses = self.statuses();
        aggregate_status(statuses.iter().map(|(_, status)| status))
    }

    // ---------------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------------

    /// Send `event` to every connected relay without waiting for `OK`.
    /// Returns true if at least one relay took the frame.
    pub fn publish(&self, event: &Event) -> bool {
        self.publish_count(event) > 0
    }

    fn publish_count(&self, event: &Event) -> usize {
        let frame = ClientMessage::Event(event.clone());
        let sent = self
            .connected()
            .iter()
            .filter(|conn| conn.send(&frame))
            .count();
        if sent == 0 {
            warn!("Event {} was not sent to any relay", event.id);
        } else {
            debug!("Event {} sent to {} relays", event.id, sent);
        }
        sent
    }

    /// Like [`RelayPool::publish`], but total failure is an error.
    pub fn try_publish(&self, event: &Event) -> Result<usize> {
        match self.publish_count(event) {
            0 => Err(ClientError::PublishFailed(format!(
                "no connected relay accepted {}",
                event.id
            ))),
            sent => Ok(sent),
        }
    }

    /// Sign through `signer`, then publish.
    pub async fn sign_and_publish(
        &self,
        signer: &dyn EventSigner,
        unsigned: &UnsignedEvent,
    ) -> Result<Event> {
        let event = sign_with(signer, unsigned).await?;
        self.try_publish(&event)?;
        Ok(event)
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Register (or replace) subscription `id` and send it to every connected
    /// relay. Relays that connect later get it on replay.
    ///
    /// Returns the number of relays the REQ was sent to.
    pub fn subscribe(&self, id: impl Into<String>, filters: Vec<Filter>) -> usize {
        self.subscribe_with(id.into(), FilterSet::Typed(filters), None)
    }

    /// Subscribe with filter objects passed through verbatim, optionally
    /// restricted to `endpoints`.
    pub fn subscribe_raw(
        &self,
        id: impl Into<String>,
        filters: Vec<Value>,
        endpoints: Option<Vec<RelayEndpoint>>,
    ) -> usize {
        self.subscribe_with(id.into(), FilterSet::Raw(filters), endpoints)
    }

    fn subscribe_with(
        &self,
        id: String,
        filters: FilterSet,
        scope: Option<Vec<RelayEndpoint>>,
    ) -> usize {
        let req = self.registry.subscribe(id.clone(), filters, scope);
        let targets: Vec<Arc<RelayConnection>> = self
            .connected()
            .into_iter()
            .filter(|conn| self.registry.applies_to(&id, conn.endpoint()))
            .collect();

        // Mark first so an early EOSE cannot complete the subscription
        // before every target is counted
        for conn in &targets {
            self.registry
                .mark_sent(&id, conn.endpoint(), conn.instance());
        }
        let mut sent = 0;
        for conn in &targets {
            if conn.send(&req) {
                sent += 1;
            } else {
                self.registry.relay_closed(&id, conn.endpoint());
            }
        }
        debug!("Subscription {} sent to {} relays", id, sent);
        sent
    }

    /// Drop subscription `id` and send CLOSE to connected relays.
    /// Returns false if it was not registered.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let Some(subscription) = self.registry.remove(id) else {
            return false;
        };
        let close = ClientMessage::Close {
            subscription_id: id.to_string(),
        };
        for conn in self.connected() {
            if subscription.applies_to(conn.endpoint()) {
                conn.send(&close);
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // One-shot requests
    // ---------------------------------------------------------------------

    /// Fetch stored events matching `filters`: subscribe, collect until every
    /// relay sent EOSE or `wait` elapses, unsubscribe. Events are unique by id.
    pub async fn query(&self, filters: Vec<Filter>, wait: Duration) -> Vec<Event> {
        self.collect_events(FilterSet::Typed(filters), None, wait).await
    }

    /// NIP-50 full-text search on `endpoints` (or every relay).
    pub async fn search(
        &self,
        text: &str,
        kinds: &[u16],
        endpoints: Option<Vec<RelayEndpoint>>,
        wait: Duration,
    ) -> Vec<Event> {
        let mut filter = json!({ "search": text, "limit": 100 });
        if !kinds.is_empty() {
            filter["kinds"] = json!(kinds);
        }
        self.collect_events(FilterSet::Raw(vec![filter]), endpoints, wait)
            .await
    }

    async fn collect_events(
        &self,
        filters: FilterSet,
        scope: Option<Vec<RelayEndpoint>>,
        wait: Duration,
    ) -> Vec<Event> {
        if !self.status().is_active() {
            debug!("Query skipped, no relay connected or connecting");
            return Vec::new();
        }

        let id = format!("q-{}", generate_subscription_id());
        // Subscribe to the bus before the REQ goes out
        let mut rx = self.bus.subscribe();
        self.subscribe_with(id.clone(), filters, scope);

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Query {} timed out with {} events", id, events.len());
                    break;
                }
                received = rx.recv() => match received {
                    Ok(BusEvent::Event { subscription_id, event, .. }) if subscription_id == id => {
                        if seen.insert(event.id.clone()) {
                            events.push(event);
                        }
                    }
                    Ok(BusEvent::AllEose { subscription_id }) if subscription_id == id => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Query {} lagged, skipped {} bus events", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.unsubscribe(&id);
        events
    }
}
