use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use refine_core::ids::SessionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client.
///
/// Every field a session worker touches is interior-mutable, so the registry
/// hands out plain `Arc<Client>` and event fan-out never awaits a lock. A
/// connection follows at most one session at a time; subscribing again
/// replaces the previous session.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    subscribed: Mutex<Option<SessionId>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            subscribed: Mutex::new(None),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn follows(&self, session_id: &SessionId) -> bool {
        self.subscribed.lock().as_ref() == Some(session_id)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its ID + outbound receiver.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a client by ID.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.mark_disconnected();
        }
    }

    /// Point a client at a session's progress events, replacing any previous
    /// subscription. Returns false for unknown clients.
    pub fn subscribe(&self, client_id: &ClientId, session_id: SessionId) -> bool {
        match self.clients.get(client_id) {
            Some(client) => {
                *client.subscribed.lock() = Some(session_id);
                true
            }
            None => false,
        }
    }

    /// Send a message to a specific client. Messages are dropped when the
    /// client's queue is full; processing never blocks on a slow reader.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver a message to every connected client following a session.
    pub fn broadcast_to_session(&self, session_id: &SessionId, message: &str) {
        for entry in self.clients.iter() {
            let client = entry.value();
            if client.is_connected() && client.follows(session_id) {
                let _ = client.tx.try_send(message.to_string());
            }
        }
    }

    /// All client IDs following a session.
    pub fn clients_for_session(&self, session_id: &SessionId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.value().follows(session_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(client_id = %id, "Cleaned up dead client");
        }
        removed
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle
/// with a heartbeat.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client = registry.get(&client_id);

    // Writer task: forward queued messages to the socket + periodic ping
    let writer_client = client.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(c) = writer_client {
            c.mark_disconnected();
        }
    });

    // Reader task: forward inbound messages to the RPC processor, track pongs
    let reader_cid = client_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(c) = &client {
                        c.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pings automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed = removed, "Dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn registry_register_and_unregister() {
        let registry = ClientRegistry::new(32);
        assert!(registry.clients.is_empty());

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.clients.len(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.clients.len(), 1);

        registry.unregister(&id2);
        assert!(registry.clients.is_empty());
    }

    #[test]
    fn registry_subscribe() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let session_id = SessionId::new();

        assert!(registry.subscribe(&id, session_id.clone()));

        let clients = registry.clients_for_session(&session_id);
        assert_eq!(clients, vec![id]);
    }

    #[test]
    fn resubscribe_replaces_previous_session() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let first = SessionId::new();
        let second = SessionId::new();

        assert!(registry.subscribe(&id, first.clone()));
        assert!(registry.subscribe(&id, second.clone()));

        assert!(registry.clients_for_session(&first).is_empty());
        assert_eq!(registry.clients_for_session(&second), vec![id]);
    }

    #[test]
    fn subscribe_unknown_client_is_false() {
        let registry = ClientRegistry::new(32);
        assert!(!registry.subscribe(&ClientId::new(), SessionId::new()));
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let registry = ClientRegistry::new(32);
        let (id1, mut rx1) = registry.register();
        let (id2, mut rx2) = registry.register();
        let (_id3, mut rx3) = registry.register();

        let session = SessionId::new();
        assert!(registry.subscribe(&id1, session.clone()));
        assert!(registry.subscribe(&id2, session.clone()));

        registry.broadcast_to_session(&session, "hello");

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "test message".into()));
        assert_eq!(rx.try_recv().unwrap(), "test message");
    }

    #[test]
    fn send_to_nonexistent_client() {
        let registry = ClientRegistry::new(32);
        assert!(!registry.send_to(&ClientId::new(), "test".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2); // tiny queue
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "msg1".into()));
        assert!(registry.send_to(&id, "msg2".into()));

        // Queue is full, this one is dropped
        assert!(!registry.send_to(&id, "msg3".into()));
    }

    #[test]
    fn client_pong_tracking() {
        let (tx, _rx) = mpsc::channel(1);
        let client = Client::new(ClientId::new(), tx);
        assert!(client.is_alive());

        client.record_pong();
        assert!(client.is_alive());
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();

        registry
            .get(&id)
            .unwrap()
            .last_pong
            .store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert!(registry.clients.is_empty());
    }
}
