use std::{net::SocketAddr, sync::Arc, time::Instant};

use {
    axum::http::{HeaderMap, Uri},
    serde_json::Value,
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

use crate::frame;

// ── Lifecycle ────────────────────────────────────────────────────────────────

/// Where a socket connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Waiting on the registry's auth check (`force_auth` only).
    AuthCheck,
    Listening,
    /// Failed the auth check. Terminal.
    Rejected,
    Disconnected,
}

/// What the peer presented when it opened the connection.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub headers: HeaderMap,
    pub uri: Uri,
    pub remote_addr: Option<SocketAddr>,
}

impl Handshake {
    /// First value of a query parameter on the upgrade URI.
    pub fn query(&self, key: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// A peer connected to the socket registry.
#[derive(Debug)]
pub struct SocketConnection {
    id: String,
    handshake: Handshake,
    /// Serialized frames for this connection's write loop.
    sender: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    state: watch::Sender<ConnectionState>,
    connected_at: Instant,
}

impl SocketConnection {
    /// Create a connection in the `Connecting` state. The receiver yields the
    /// frames queued by [`emit`](Self::emit), for whatever drives the transport.
    pub fn new(handshake: Handshake) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sender, outbound) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            handshake,
            sender,
            shutdown: CancellationToken::new(),
            state,
            connected_at: Instant::now(),
        });
        (conn, outbound)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Send an event to the peer. Returns false once the connection is gone.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.sender.send(frame::encode(event, args)).is_ok()
    }

    /// Close the connection. Idempotent.
    pub fn disconnect(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        debug!(conn_id = %self.id, "disconnecting socket");
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Rejected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
        self.shutdown.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
