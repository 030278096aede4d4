//! Connection state and registry management.
//!
//! Every WebSocket connection gets a [`SessionHandle`]: the shared, thread-safe
//! part of a session that the registry, the writer task and the shutdown path
//! all need. Frames for a client go through its [`Outbox`].

use crate::protocol::ServerMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Item queued for a client's WebSocket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Sending half of a client's outgoing frame queue.
///
/// Unbounded so that fan-out under a publisher lock never waits on a slow
/// client.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a text frame. Returns false once the writer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Frame(text)).is_ok()
    }

    /// Serialize and queue a gateway message.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.to_frame() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("Failed to serialize outbound message: {}", e);
                false
            }
        }
    }

    /// Ask the writer to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Shared state of one client connection.
pub struct SessionHandle {
    remote_addr: String,
    connection_id: OnceLock<String>,
    state: AtomicU8,
    close_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            remote_addr: remote_addr.into(),
            connection_id: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            close_tx,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Engine-assigned connection id, once connected.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.get().map(String::as_str)
    }

    /// Connection id, or the remote address before one is assigned.
    pub fn label(&self) -> &str {
        self.connection_id().unwrap_or(&self.remote_addr)
    }

    pub fn set_connection_id(&self, id: String) {
        if self.connection_id.set(id).is_err() {
            warn!("Connection id for {} assigned twice", self.remote_addr);
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `Closing`. Only one caller ever wins; later calls return false.
    pub fn begin_close(&self) -> bool {
        [SessionState::Open, SessionState::Connecting].into_iter().any(|from| {
            self.state
                .compare_exchange(
                    from as u8,
                    SessionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Ask the connection task to tear the session down.
    pub fn request_close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn close_requested(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

/// Registry of open connections keyed by connection id.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connected session. Returns false if the id is already taken.
    pub fn register(&self, handle: Arc<SessionHandle>) -> bool {
        let Some(id) = handle.connection_id() else {
            warn!("Refusing to register {} without a connection id", handle.remote_addr());
            return false;
        };
        match self.connections.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Connection id {} is already registered", id);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                info!("Connection {} registered ({})", id, handle.remote_addr());
                true
            }
        }
    }

    /// Remove a session, but only if the entry under its id is this session.
    pub fn unregister(&self, handle: &Arc<SessionHandle>) -> bool {
        let Some(id) = handle.connection_id() else {
            return false;
        };
        let removed = self
            .connections
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            info!("Connection {} unregistered", id);
        } else {
            debug!("Connection {} was not registered by this session", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.connections.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    /// Ask every registered session to close.
    pub fn close_all(&self) -> usize {
        let handles = self.handles();
        for handle in &handles {
            handle.request_close();
        }
        handles.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
