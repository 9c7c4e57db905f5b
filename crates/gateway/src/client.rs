//! Real-time client state and registry.
//!
//! Uses lock-free DashMap; the WebSocket layer registers and unregisters
//! clients, the relay only iterates and sends.

use crate::error::Result;
use crate::protocol::ServerEvent;
use axum::extract::ws::{Message, Utf8Bytes};
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
/// Roughly 2.5 seconds of state frames at 100 Hz.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the client's socket writer. Bounded so a slow client cannot
    /// grow memory without limit.
    pub tx: mpsc::Sender<Message>,
    /// Timestamp when client connected.
    pub connected_at: i64,
    /// Timestamp of last ping/pong seen.
    pub last_ping: AtomicI64,
}

impl ClientState {
    /// Create a new client state.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Serialize and queue an event for this client.
    /// Non-blocking: fails if the client's buffer is full.
    pub fn send<T: Serialize>(&self, event: &ServerEvent<'_, T>) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.tx.try_send(Message::Text(json.into()))?;
        Ok(())
    }

    /// Try to queue a pre-serialized message.
    /// Returns true if queued, false if the buffer is full or the client is gone.
    pub fn try_send_raw(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    /// Whether no ping or pong was seen for longer than `max_idle`.
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        Utc::now().timestamp_millis() - self.last_ping_time() > max_idle.as_millis() as i64
    }

    /// Time since the client connected.
    pub fn session_duration(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.connected_at;
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

/// Lock-free registry of connected clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    /// Unregister a client.
    pub fn unregister(&self, client_id: &ClientId) {
        if self.clients.remove(client_id).is_some() {
            info!("Client {} unregistered", client_id);
        }
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue the same pre-serialized text to every client.
    ///
    /// Never waits on a client: a full buffer drops this delivery for that
    /// client only. Returns the number of clients the message was queued for.
    pub fn broadcast_text(&self, text: Utf8Bytes) -> usize {
        // Snapshot so no shard lock is held while sending.
        let clients: Vec<Arc<ClientState>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();

        let mut delivered = 0;
        for client in clients {
            if client.try_send_raw(Message::Text(text.clone())) {
                delivered += 1;
            } else {
                debug!("Dropped broadcast for client {} (buffer full or closed)", client.id);
                counter!("gateway_dropped_deliveries_total").increment(1);
            }
        }
        delivered
    }

    /// Serialize an event once and broadcast it to every client.
    pub fn broadcast<T: Serialize>(&self, event: &ServerEvent<'_, T>) -> usize {
        if self.clients.is_empty() {
            return 0;
        }

        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize broadcast event {}: {}", event.event, e);
                return 0;
            }
        };

        self.broadcast_text(json.into())
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect(registry: &ClientRegistry, buffer: usize) -> (Arc<ClientState>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        let client = Arc::new(ClientState::new(tx));
        registry.register(client.clone());
        (client, rx)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_owned(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    #[test]
    fn test_register_unregister() {
        let registry = ClientRegistry::new();
        let (client, _rx) = connect(&registry, 4);
        assert_eq!(registry.client_count(), 1);

        registry.unregister(&client.id);
        registry.unregister(&client.id);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_broadcast_delivers_identical_payload() {
        let registry = ClientRegistry::new();
        let mut receivers: Vec<_> = (0..3).map(|_| connect(&registry, 4).1).collect();

        let data = json!({"mode": 1.0, "yk": 0.5});
        let delivered = registry.broadcast(&ServerEvent::new("aeropendulo_state", &data));
        assert_eq!(delivered, 3);

        let payloads: Vec<String> = receivers
            .iter_mut()
            .map(|rx| text(rx.try_recv().unwrap()))
            .collect();
        assert!(payloads.iter().all(|p| p == &payloads[0]));

        let parsed: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(parsed["event"], "aeropendulo_state");
        assert_eq!(parsed["data"], data);
    }

    #[test]
    fn test_slow_client_does_not_block_others() {
        let registry = ClientRegistry::new();
        let (_slow, _slow_rx) = connect(&registry, 1);
        let (_fast, mut fast_rx) = connect(&registry, 8);

        let event = ServerEvent::new("aeropendulo_state", &1);
        assert_eq!(registry.broadcast(&event), 2);
        // Slow client's single slot is now full.
        assert_eq!(registry.broadcast(&event), 1);
        assert_eq!(registry.broadcast(&event), 1);

        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn test_broadcast_without_clients() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.broadcast(&ServerEvent::new("x", &0)), 0);
    }

    #[test]
    fn test_client_send_and_ping() {
        let registry = ClientRegistry::new();
        let (client, mut rx) = connect(&registry, 1);

        client.send(&ServerEvent::new("pong", &())).unwrap();
        assert!(client.send(&ServerEvent::new("pong", &())).is_err());
        assert!(text(rx.try_recv().unwrap()).contains("\"pong\""));

        let before = client.last_ping_time();
        client.update_ping();
        assert!(client.last_ping_time() >= before);
    }

    #[test]
    fn test_idle_detection() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientState::new(tx);
        assert!(!client.is_idle(Duration::from_secs(60)));

        // Last seen two minutes ago.
        client
            .last_ping
            .store(Utc::now().timestamp_millis() - 120_000, Ordering::Relaxed);
        assert!(client.is_idle(Duration::from_secs(60)));

        client.update_ping();
        assert!(!client.is_idle(Duration::from_secs(60)));
        assert!(client.session_duration() < Duration::from_secs(60));
    }
}
