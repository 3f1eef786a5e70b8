//! In-process relay for tests and local development.
//!
//! [`MockRelay`] listens on `127.0.0.1:0`, stores published events, answers
//! `REQ` with matching stored events followed by `EOSE`, and records every
//! inbound text frame. Open subscriptions receive [`MockRelay::broadcast`]
//! events live. Connections can be dropped on demand, or left hanging with
//! [`MockRelay::set_silent`], to exercise reconnect paths.

use crate::message::Filter;
use futures::{SinkExt, StreamExt};
use nostr_core::Event;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::debug;

#[derive(Debug, Default)]
struct MockState {
    stored: Mutex<Vec<Event>>,
    received: Mutex<Vec<String>>,
    frame_delay: Mutex<Duration>,
    /// Frames sent verbatim after the stored events, before EOSE
    injected: Mutex<Vec<String>>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
    pings: AtomicUsize,
    /// New connections are accepted but never read from or written to
    silent: AtomicBool,
}

/// A scripted relay server.
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<MockState>,
    drop_tx: broadcast::Sender<()>,
    live_tx: broadcast::Sender<Event>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        let (drop_tx, _) = broadcast::channel(4);
        let (live_tx, _) = broadcast::channel(256);

        let task = {
            let state = Arc::clone(&state);
            let drop_tx = drop_tx.clone();
            let live_tx = live_tx.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    let drop_rx = drop_tx.subscribe();
                    let live_rx = live_tx.subscribe();
                    tokio::spawn(serve(stream, state, drop_rx, live_rx));
                }
            })
        };

        Ok(Self {
            addr,
            state,
            drop_tx,
            live_tx,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make `events` available to future REQs.
    pub fn store(&self, events: impl IntoIterator<Item = Event>) {
        self.state.stored.lock().extend(events);
    }

    /// Store `event` and push it to every open subscription it matches.
    pub fn broadcast(&self, event: Event) {
        self.state.stored.lock().push(event.clone());
        let _ = self.live_tx.send(event);
    }

    /// While set, new connections complete the handshake and then go quiet:
    /// no frames are read, no pings are answered.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// WebSocket pings received and answered.
    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Delay between frames sent in answer to a REQ.
    pub fn set_frame_delay(&self, delay: Duration) {
        *self.state.frame_delay.lock() = delay;
    }

    /// Send `raw` in answer to every REQ, after the stored events.
    pub fn inject(&self, raw: impl Into<String>) {
        self.state.injected.lock().push(raw.into());
    }

    /// Every text frame received so far, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    /// Received frames of type `kind` (`"REQ"`, `"CLOSE"`, `"EVENT"`).
    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter(|frame| frame.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    /// Currently open connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections accepted since start.
    pub fn accepted_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Close every open connection.
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// Poll `check` every 10ms until it holds or `wait` elapses.
    pub async fn wait_until(&self, wait: Duration, check: impl Fn(&MockRelay) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.drop_tx.send(());
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<MockState>,
    mut drop_rx: broadcast::Receiver<()>,
    mut live_rx: broadcast::Receiver<Event>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.accepted.fetch_add(1, Ordering::SeqCst);
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = ws.split();

    if state.silent.load(Ordering::SeqCst) {
        let _ = drop_rx.recv().await;
        state.connections.fetch_sub(1, Ordering::SeqCst);
        debug!("Silent mock relay connection closed");
        return;
    }

    // Open subscriptions on this connection
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();
    loop {
        tokio::select! {
            _ = drop_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            live = live_rx.recv() => match live {
                Ok(event) => {
                    for (sub_id, filters) in &subscriptions {
                        if filters.is_empty() || filters.iter().any(|f| f.matches(&event)) {
                            let frame = json!(["EVENT", sub_id, event]).to_string();
                            let _ = sink.send(Message::Text(frame.into())).await;
                        }
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_string();
                    state.received.lock().push(text.clone());
                    for reply in respond(&state, &text, &mut subscriptions) {
                        let delay = *state.frame_delay.lock();
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
    debug!("Mock relay connection closed");
}

fn respond(
    state: &MockState,
    text: &str,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
) -> Vec<String> {
    let Ok(frame) = serde_json::from_str::<Vec<Value>>(text) else {
        return vec![json!(["NOTICE", "invalid frame"]).to_string()];
    };
    match frame.first().and_then(Value::as_str) {
        Some("REQ") => {
            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                return Vec::new();
            };
            let filters: Vec<Filter> = frame[2..]
                .iter()
                .filter_map(|f| serde_json::from_value(f.clone()).ok())
                .collect();
            let limit = filters
                .iter()
                .filter_map(|f| f.limit)
                .max()
                .map_or(usize::MAX, |l| l as usize);

            let mut replies: Vec<String> = state
                .stored
                .lock()
                .iter()
                .filter(|event| filters.is_empty() || filters.iter().any(|f| f.matches(event)))
                .take(limit)
                .map(|event| json!(["EVENT", sub_id, event]).to_string())
                .collect();
            replies.extend(state.injected.lock().iter().cloned());
            replies.push(json!(["EOSE", sub_id]).to_string());
            subscriptions.insert(sub_id.to_string(), filters);
            replies
        }
        Some("CLOSE") => {
            if let Some(sub_id) = frame.get(1).and_then(Value::as_str) {
                subscriptions.remove(sub_id);
            }
            Vec::new()
        }
        Some("EVENT") => match frame.get(1).cloned().map(serde_json::from_value::<Event>) {
            Some(Ok(event)) => {
                let id = event.id.clone();
                state.stored.lock().push(event);
                vec![json!(["OK", id, true, ""]).to_string()]
            }
            _ => vec![json!(["NOTICE", "invalid event"]).to_string()],
        },
        _ => Vec::new(),
    }
}
