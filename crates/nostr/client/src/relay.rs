//! Single relay connection management
//!
//! A [`RelayConnection`] is one connection attempt to one relay. It moves
//! `Connecting -> Connected -> Disconnected | Error` exactly once; the two last
//! states are terminal and a reconnect always builds a fresh instance. Inbound
//! frames and status changes go to the [`SequencerHandle`]; nothing is
//! decoded here.

use crate::config::ClientConfig;
use crate::endpoint::RelayEndpoint;
use crate::error::{ClientError, Result};
use crate::message::ClientMessage;
use crate::sequencer::SequencerHandle;
use crate::subscription::SubscriptionRegistry;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Closed cleanly, by either side
    Disconnected,
    /// Failed; the reason is kept for display
    Error(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Connecting or connected.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Timing knobs for a single connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

enum Outbound {
    Frame(String),
    Close(String),
}

/// Relay connection
pub struct RelayConnection {
    instance: u64,
    endpoint: RelayEndpoint,
    settings: ConnectionSettings,
    status: watch::Sender<ConnectionStatus>,
    /// Present only while the socket task runs
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    created_at: SystemTime,
    last_activity: Mutex<Instant>,
    sequencer: SequencerHandle,
    registry: Arc<SubscriptionRegistry>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("instance", &self.instance)
            .field("endpoint", &self.endpoint)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl RelayConnection {
    pub fn new(
        endpoint: RelayEndpoint,
        settings: ConnectionSettings,
        sequencer: SequencerHandle,
        registry: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Arc::new(Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            endpoint,
            settings,
            status,
            outbound: Mutex::new(None),
            created_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            sequencer,
            registry,
        })
    }

    /// Perform the handshake, replay subscriptions and start the socket task.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.status() {
            ConnectionStatus::Connecting => {}
            ConnectionStatus::Connected => return Err(ClientError::AlreadyConnected),
            terminal => {
                return Err(ClientError::Connection(format!(
                    "connection to {} already ended ({})",
                    self.endpoint, terminal
                )));
            }
        }

        info!("Connecting to relay: {}", self.endpoint);
        let connect_start = Instant::now();
        let mut ws_stream = match timeout(
            self.settings.connect_timeout,
            connect_async(self.endpoint.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.set_status(ConnectionStatus::Error(e.to_string()));
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                self.set_status(ConnectionStatus::Error("connect timeout".to_string()));
                return Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    self.settings.connect_timeout
                )));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.touch();

        // close() may have run during the handshake
        if !self.set_status(ConnectionStatus::Connected) {
            self.outbound.lock().take();
            let _ = ws_stream.close(None).await;
            return Err(ClientError::Connection(format!(
                "connection to {} closed during handshake",
                self.endpoint
            )));
        }
        info!(
            "Connected to relay: {} (took {:?})",
            self.endpoint,
            connect_start.elapsed()
        );

        self.replay_subscriptions();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let final_status = this.run_socket(ws_stream, rx).await;
            this.outbound.lock().take();
            this.set_status(final_status);
        });

        Ok(())
    }

    fn replay_subscriptions(&self) {
        let frames = self.registry.replay_for(&self.endpoint);
        if frames.is_empty() {
            return;
        }
        debug!("Replaying {} subscriptions to {}", frames.len(), self.endpoint);
        for frame in frames {
            if let Some(id) = frame.subscription_id() {
                self.registry.mark_sent(id, &self.endpoint, self.instance);
            }
            self.send(&frame);
        }
    }

    async fn run_socket(
        &self,
        ws_stream: WsStream,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> ConnectionStatus {
        let (mut sink, mut stream) = ws_stream.split();
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!("Send to {} failed: {}", self.endpoint, e);
                            return ConnectionStatus::Error(e.to_string());
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        debug!("Closing {}: {}", self.endpoint, reason);
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        return ConnectionStatus::Disconnected;
                    }
                    None => {
                        let _ = sink.close().await;
                        return ConnectionStatus::Disconnected;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.touch();
                        if !self.sequencer.push_frame(&self.endpoint, text.as_str()) {
                            return ConnectionStatus::Error("dispatcher stopped".to_string());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.touch();
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return ConnectionStatus::Error(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Relay {} closed connection", self.endpoint);
                        return ConnectionStatus::Disconnected;
                    }
                    Some(Ok(_)) => self.touch(),
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", self.endpoint, e);
                        return ConnectionStatus::Error(e.to_string());
                    }
                    None => return ConnectionStatus::Disconnected,
                },
                _ = ping.tick() => {
                    if self.last_activity.lock().elapsed() >= self.settings.idle_timeout {
                        warn!("No traffic from {} for {:?}", self.endpoint, self.settings.idle_timeout);
                        let _ = sink.close().await;
                        return ConnectionStatus::Error("idle timeout".to_string());
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        return ConnectionStatus::Error(e.to_string());
                    }
                }
            }
        }
    }

    /// Move to `status` unless already terminal. Returns whether it changed.
    fn set_status(&self, status: ConnectionStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.is_terminal() || *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            debug!("Relay {} is now {}", self.endpoint, status);
            self.sequencer
                .push_status(&self.endpoint, self.instance, status);
        }
        changed
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Queue a frame for sending. Returns false if not connected.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if !self.status().is_connected() {
            return false;
        }
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode frame for {}: {}", self.endpoint, e);
                return false;
            }
        };
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(Outbound::Frame(text)).is_ok(),
            None => false,
        }
    }

    /// Close the connection. Frames queued before the call are still sent.
    pub fn close(&self, reason: &str) {
        let sent = match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(Outbound::Close(reason.to_string())).is_ok(),
            None => false,
        };
        if !sent {
            // Still handshaking, or the socket task already ended
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Wait until the handshake resolves or `wait` elapses. Returns true if
    /// the connection ended up `Connected`.
    pub async fn wait_connected(&self, wait: Duration) -> bool {
        let mut rx = self.watch_status();
        match timeout(wait, rx.wait_for(|s| *s != ConnectionStatus::Connecting)).await {
            Ok(Ok(status)) => status.is_connected(),
            _ => false,
        }
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    /// Identifies this attempt among all instances for the same endpoint.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time of the last inbound frame (or of the handshake).
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}
