//! Socket handler registry.
//!
//! Handlers are keyed by event name. Connections arrive through a WebSocket
//! upgrade binding the registry installs on a [`RestServer`]; with
//! `force_auth` they must pass the auth check before any of their events are
//! dispatched.

use std::{collections::HashMap, fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Instant};

use {
    async_trait::async_trait,
    axum::extract::{ConnectInfo, FromRequestParts, Request, WebSocketUpgrade},
    futures::future::BoxFuture,
    serde_json::Value,
    switchyard_plugins::HandlerSink,
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    auth::{AuthCheckFn, GetUserFn, User},
    connection::{ConnectionState, Handshake, SocketConnection},
    error::RestError,
    rest::{Reply, RestHandler, RestMethod, RestServer},
    ws,
};

pub const DEFAULT_SOCKET_PATH: &str = "/socket";

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Everything a socket handler gets for one event.
#[derive(Debug, Clone)]
pub struct SocketContext {
    /// The sender; reply with [`SocketConnection::emit`].
    pub conn: Arc<SocketConnection>,
    pub user: Option<User>,
    pub args: Vec<Value>,
}

pub type SocketFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

pub type SocketRunFn = Box<dyn Fn(SocketContext) -> SocketFuture + Send + Sync>;

/// A handler for one event name.
pub struct SocketHandler {
    event: String,
    send_user: bool,
    run: SocketRunFn,
}

impl SocketHandler {
    pub fn new<F, Fut>(event: impl Into<String>, run: F) -> Self
    where
        F: Fn(SocketContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            event: event.into(),
            send_user: false,
            run: Box::new(move |ctx| -> SocketFuture { Box::pin(run(ctx)) }),
        }
    }

    pub fn with_send_user(mut self, send_user: bool) -> Self {
        self.send_user = send_user;
        self
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn sends_user(&self) -> bool {
        self.send_user
    }

    /// Run the handler body directly, bypassing the registry.
    pub async fn call(&self, ctx: SocketContext) -> anyhow::Result<Value> {
        (self.run)(ctx).await
    }
}

impl fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandler")
            .field("event", &self.event)
            .field("send_user", &self.send_user)
            .finish_non_exhaustive()
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

pub struct SocketServerOptions<'a> {
    /// Server whose port (and TLS material) the socket endpoint shares.
    pub server: &'a RestServer,
    pub path: String,
    pub get_user: Option<GetUserFn<SocketConnection>>,
    /// Require `auth_check` to pass before a connection starts listening.
    pub force_auth: bool,
    pub auth_check: Option<AuthCheckFn>,
}

impl<'a> SocketServerOptions<'a> {
    pub fn new(server: &'a RestServer) -> Self {
        Self {
            server,
            path: DEFAULT_SOCKET_PATH.into(),
            get_user: None,
            force_auth: false,
            auth_check: None,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// The catch-all listener attached to an authorized connection.
struct SocketListener {
    conn: Arc<SocketConnection>,
    attached_at: Instant,
}

struct SocketRegistry {
    handlers: RwLock<HashMap<String, Arc<SocketHandler>>>,
    /// Keyed by connection id.
    listeners: RwLock<HashMap<String, SocketListener>>,
    get_user: RwLock<Option<GetUserFn<SocketConnection>>>,
    force_auth: bool,
    auth_check: Option<AuthCheckFn>,
    path: String,
}

/// The socket registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<SocketRegistry>,
}

impl SocketServer {
    /// Create the registry and install its upgrade endpoint (`GET <path>`) on
    /// `options.server`.
    pub async fn new(options: SocketServerOptions<'_>) -> Result<Self, RestError> {
        let server = Self::detached(
            options.path,
            options.get_user,
            options.force_auth,
            options.auth_check,
        );
        options.server.add_handler(server.upgrade_handler()).await?;
        info!(
            path = %server.inner.path,
            force_auth = server.inner.force_auth,
            "socket endpoint installed"
        );
        Ok(server)
    }

    fn detached(
        path: String,
        get_user: Option<GetUserFn<SocketConnection>>,
        force_auth: bool,
        auth_check: Option<AuthCheckFn>,
    ) -> Self {
        Self {
            inner: Arc::new(SocketRegistry {
                handlers: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                get_user: RwLock::new(get_user),
                force_auth,
                auth_check,
                path,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    fn upgrade_handler(&self) -> Arc<RestHandler> {
        let registry = Arc::downgrade(&self.inner);
        let handler = RestHandler::new(RestMethod::Get, self.inner.path.clone(), move |req: Request, _user| {
            let registry = registry.clone();
            async move {
                let Some(inner) = registry.upgrade() else {
                    return Ok(Reply::next(req));
                };
                let (mut parts, _body) = req.into_parts();
                let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                    Ok(upgrade) => upgrade,
                    Err(rejection) => return Ok(Reply::respond(rejection)),
                };
                let remote_addr = parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                let handshake = Handshake {
                    headers: parts.headers,
                    uri: parts.uri,
                    remote_addr,
                };
                let server = SocketServer { inner };
                Ok(Reply::respond(upgrade.on_upgrade(move |socket| {
                    ws::handle_connection(socket, server, handshake)
                })))
            }
        });
        Arc::new(handler)
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Run the connection gate. Returns whether the connection is listening.
    pub async fn socket_connect(&self, conn: &Arc<SocketConnection>) -> bool {
        info!(
            conn_id = %conn.id(),
            remote = ?conn.handshake().remote_addr,
            "socket connected"
        );
        if self.inner.force_auth && !self.authorize(conn).await {
            conn.set_state(ConnectionState::Rejected);
            self.socket_disconnect(conn).await;
            return false;
        }
        self.listen_to_socket(conn).await
    }

    async fn authorize(&self, conn: &Arc<SocketConnection>) -> bool {
        conn.set_state(ConnectionState::AuthCheck);
        let Some(check) = &self.inner.auth_check else {
            warn!(conn_id = %conn.id(), "force_auth without an auth check, rejecting socket");
            return false;
        };
        match check(conn.as_ref()).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(conn_id = %conn.id(), "socket failed auth check");
                false
            },
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "socket auth check errored");
                false
            },
        }
    }

    /// Attach the catch-all listener. Attaching twice is a no-op. Returns
    /// false for a connection that is already gone.
    pub async fn listen_to_socket(&self, conn: &Arc<SocketConnection>) -> bool {
        if conn.is_disconnected() {
            return false;
        }
        let mut listeners = self.inner.listeners.write().await;
        if listeners.contains_key(conn.id()) {
            return true;
        }
        listeners.insert(conn.id().to_string(), SocketListener {
            conn: Arc::clone(conn),
            attached_at: Instant::now(),
        });
        conn.set_state(ConnectionState::Listening);
        debug!(conn_id = %conn.id(), "socket listening");
        true
    }

    /// Drop the connection's listener and close it.
    pub async fn socket_disconnect(&self, conn: &SocketConnection) {
        let listener = self.inner.listeners.write().await.remove(conn.id());
        conn.disconnect();
        if let Some(listener) = listener {
            info!(
                conn_id = %conn.id(),
                listened = ?listener.attached_at.elapsed(),
                connected = ?conn.connected_at().elapsed(),
                "socket disconnected"
            );
        }
    }

    pub async fn is_listening(&self, conn_id: &str) -> bool {
        self.inner.listeners.read().await.contains_key(conn_id)
    }

    /// Connections currently listening.
    pub async fn connection_count(&self) -> usize {
        self.inner.listeners.read().await.len()
    }

    /// Send an event to every listening connection. Returns how many took it.
    pub async fn broadcast(&self, event: &str, args: &[Value]) -> usize {
        let listeners = self.inner.listeners.read().await;
        listeners
            .values()
            .filter(|listener| listener.conn.emit(event, args))
            .count()
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Run the handler for `event`, if any. `None` means the event was
    /// dropped: no handler, or a failing `get_user` or `run` (logged).
    pub async fn handle_socket(
        &self,
        conn: &Arc<SocketConnection>,
        event: &str,
        args: Vec<Value>,
    ) -> Option<Value> {
        let (handler, ctx) = self.prepare(conn, event, args).await?;
        finish(event, conn.id(), handler.call(ctx).await)
    }

    /// Look up the handler and resolve the user, everything short of running
    /// the handler body.
    async fn prepare(
        &self,
        conn: &Arc<SocketConnection>,
        event: &str,
        args: Vec<Value>,
    ) -> Option<(Arc<SocketHandler>, SocketContext)> {
        let handler = self.inner.handlers.read().await.get(event).cloned();
        let Some(handler) = handler else {
            debug!(conn_id = %conn.id(), event, "no handler for event");
            return None;
        };

        let user = if handler.sends_user() {
            let resolver = self.inner.get_user.read().await.clone();
            match resolver {
                Some(resolve) => match resolve(conn.as_ref()).await {
                    Ok(user) => user,
                    Err(e) => {
                        warn!(conn_id = %conn.id(), event, error = %e, "socket get_user failed");
                        return None;
                    },
                },
                None => None,
            }
        } else {
            None
        };

        let ctx = SocketContext {
            conn: Arc::clone(conn),
            user,
            args,
        };
        Some((handler, ctx))
    }

    /// Start the handler for a decoded frame, if the connection is listening.
    ///
    /// The handler is invoked before this returns, so calling `dispatch` once
    /// per frame starts handlers in arrival order. The returned future runs
    /// the rest of the handler body; the connection loop polls these side by
    /// side, so they only interleave where a handler awaits.
    pub(crate) async fn dispatch(
        &self,
        conn: &Arc<SocketConnection>,
        event: String,
        args: Vec<Value>,
    ) -> Option<BoxFuture<'static, ()>> {
        if !self.is_listening(conn.id()).await {
            debug!(conn_id = %conn.id(), event = %event, "connection not listening, dropping event");
            return None;
        }
        let (handler, ctx) = self.prepare(conn, &event, args).await?;
        let running = (handler.run)(ctx);
        let conn_id = conn.id().to_string();
        Some(Box::pin(async move {
            if let Some(value) = finish(&event, &conn_id, running.await) {
                debug!(conn_id = %conn_id, event = %event, result = %value, "socket event handled");
            }
        }))
    }

    // ── Handler management ───────────────────────────────────────────────────

    /// Register `handler` for its event, returning the handler it replaced.
    pub async fn add_handler(&self, handler: Arc<SocketHandler>) -> Option<Arc<SocketHandler>> {
        let event = handler.event().to_string();
        let replaced = self.inner.handlers.write().await.insert(event.clone(), handler);
        if replaced.is_some() {
            debug!(event = %event, "replaced socket handler");
        } else {
            debug!(event = %event, "added socket handler");
        }
        replaced
    }

    /// Remove whatever handler is registered for `handler`'s event.
    pub async fn remove_handler(&self, handler: &SocketHandler) -> Option<Arc<SocketHandler>> {
        self.remove_handler_by_event(handler.event()).await
    }

    pub async fn remove_handler_by_event(&self, event: &str) -> Option<Arc<SocketHandler>> {
        let removed = self.inner.handlers.write().await.remove(event);
        if removed.is_some() {
            debug!(event, "removed socket handler");
        }
        removed
    }

    pub async fn set_get_user(&self, get_user: GetUserFn<SocketConnection>) {
        *self.inner.get_user.write().await = Some(get_user);
    }

    /// Registered event names, sorted.
    pub async fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.inner.handlers.read().await.keys().cloned().collect();
        events.sort();
        events
    }
}

fn finish(event: &str, conn_id: &str, result: anyhow::Result<Value>) -> Option<Value> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(conn_id, event, error = %e, "socket handler failed");
            None
        },
    }
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("path", &self.inner.path)
            .field("force_auth", &self.inner.force_auth)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HandlerSink<Arc<SocketHandler>> for SocketServer {
    async fn add_handler(&self, handler: Arc<SocketHandler>) -> anyhow::Result<()> {
        SocketServer::add_handler(self, handler).await;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use {
        super::*,
        crate::{
            auth::{auth_check_fn, get_user_fn},
            rest::RestServerOptions,
        },
        axum::{
            body::Body,
            http::{StatusCode, header},
        },
        futures::{StreamExt, stream::FuturesUnordered},
        serde_json::json,
        tower::ServiceExt,
    };

    fn registry(force_auth: bool, auth_check: Option<AuthCheckFn>) -> SocketServer {
        SocketServer::detached(DEFAULT_SOCKET_PATH.into(), None, force_auth, auth_check)
    }

    fn connection() -> Arc<SocketConnection> {
        SocketConnection::new(Handshake::default()).0
    }

    /// A handler that records the args of each call.
    fn recording(event: &str) -> (Arc<SocketHandler>, Arc<Mutex<Vec<Vec<Value>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = SocketHandler::new(event, move |ctx: SocketContext| {
            sink.lock().unwrap().push(ctx.args.clone());
            async move { Ok(Value::Array(ctx.args)) }
        });
        (Arc::new(handler), seen)
    }

    #[tokio::test]
    async fn echo_sees_args_and_noop_reaches_nothing() {
        let server = registry(false, None);
        let (echo, seen) = recording("echo");
        server.add_handler(echo).await;

        let conn = connection();
        assert!(server.socket_connect(&conn).await);
        assert_eq!(conn.state(), ConnectionState::Listening);

        let result = server.handle_socket(&conn, "echo", vec![json!(1), json!(2)]).await;
        assert_eq!(result, Some(json!([1, 2])));
        assert_eq!(server.handle_socket(&conn, "noop", vec![]).await, None);
        assert_eq!(*seen.lock().unwrap(), vec![vec![json!(1), json!(2)]]);
    }

    #[tokio::test]
    async fn second_handler_for_event_replaces_first() {
        let server = registry(false, None);
        let (first, first_seen) = recording("evt");
        let (second, second_seen) = recording("evt");
        assert!(server.add_handler(first).await.is_none());
        assert!(server.add_handler(second).await.is_some());

        server.handle_socket(&connection(), "evt", vec![json!("x")]).await;
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
        assert_eq!(server.events().await, vec!["evt".to_string()]);
    }

    #[tokio::test]
    async fn removal_is_by_event() {
        let server = registry(false, None);
        let (registered, _) = recording("evt");
        let (other, _) = recording("evt");
        server.add_handler(registered).await;

        assert!(server.remove_handler(&other).await.is_some());
        assert!(server.remove_handler_by_event("evt").await.is_none());
        assert_eq!(server.handle_socket(&connection(), "evt", vec![]).await, None);
    }

    #[tokio::test]
    async fn failed_auth_disconnects_and_drops_events() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        let deny = auth_check_fn(move |_conn: &SocketConnection| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        });
        let server = registry(true, Some(deny));
        let (echo, seen) = recording("echo");
        server.add_handler(echo).await;

        let conn = connection();
        assert!(!server.socket_connect(&conn).await);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Rejected);
        assert!(conn.is_disconnected());
        assert!(!server.is_listening(conn.id()).await);
        assert_eq!(server.connection_count().await, 0);

        assert!(server.dispatch(&conn, "echo".into(), vec![json!(1)]).await.is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auth_errors_and_missing_check_reject() {
        let erroring = auth_check_fn(|_conn: &SocketConnection| async {
            Err(anyhow::anyhow!("auth backend down"))
        });
        let conn = connection();
        assert!(!registry(true, Some(erroring)).socket_connect(&conn).await);
        assert_eq!(conn.state(), ConnectionState::Rejected);

        let conn = connection();
        assert!(!registry(true, None).socket_connect(&conn).await);
        assert!(conn.is_disconnected());
    }

    #[tokio::test]
    async fn passing_auth_starts_listening_once() {
        let allow = auth_check_fn(|_conn: &SocketConnection| async { Ok(true) });
        let server = registry(true, Some(allow));
        let conn = connection();
        let mut states = conn.subscribe();

        assert!(server.socket_connect(&conn).await);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Listening);
        assert!(server.listen_to_socket(&conn).await);
        assert_eq!(server.connection_count().await, 1);

        server.socket_disconnect(&conn).await;
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!server.listen_to_socket(&conn).await);
    }

    #[tokio::test]
    async fn send_user_gets_current_resolver() {
        let server = registry(false, None);
        let whoami = SocketHandler::new("whoami", |ctx: SocketContext| async move {
            Ok(ctx.user.unwrap_or(Value::Null))
        })
        .with_send_user(true);
        server.add_handler(Arc::new(whoami)).await;
        let conn = connection();

        assert_eq!(server.handle_socket(&conn, "whoami", vec![]).await, Some(Value::Null));

        server
            .set_get_user(get_user_fn(|conn: &SocketConnection| {
                let id = conn.id().to_string();
                async move { Ok(Some(json!({ "conn": id }))) }
            }))
            .await;
        assert_eq!(
            server.handle_socket(&conn, "whoami", vec![]).await,
            Some(json!({ "conn": conn.id() }))
        );

        server
            .set_get_user(get_user_fn(|_: &SocketConnection| async {
                Err(anyhow::anyhow!("no session"))
            }))
            .await;
        assert_eq!(server.handle_socket(&conn, "whoami", vec![]).await, None);
    }

    #[tokio::test]
    async fn failing_handler_is_dropped() {
        let server = registry(false, None);
        let broken = SocketHandler::new("broken", |_ctx| async { Err(anyhow::anyhow!("boom")) });
        server.add_handler(Arc::new(broken)).await;
        assert_eq!(server.handle_socket(&connection(), "broken", vec![]).await, None);
    }

    #[tokio::test]
    async fn dispatched_handlers_interleave_at_awaits() {
        let server = registry(false, None);
        let (release, gate) = tokio::sync::watch::channel(false);
        let slow = SocketHandler::new("slow", move |_ctx| {
            let mut gate = gate.clone();
            async move {
                gate.wait_for(|open| *open).await?;
                Ok::<_, anyhow::Error>(json!("slow"))
            }
        });
        let fast = SocketHandler::new("fast", move |ctx: SocketContext| async move {
            ctx.conn.emit("fast-done", &[]);
            Ok(Value::Null)
        });
        server.add_handler(Arc::new(slow)).await;
        server.add_handler(Arc::new(fast)).await;

        let (conn, mut outbound) = SocketConnection::new(Handshake::default());
        server.listen_to_socket(&conn).await;
        let mut running = FuturesUnordered::new();
        running.push(server.dispatch(&conn, "slow".into(), vec![]).await.unwrap());
        running.push(server.dispatch(&conn, "fast".into(), vec![]).await.unwrap());

        // Only the fast one can finish while the slow one waits on its gate.
        assert!(running.next().await.is_some());
        assert_eq!(outbound.try_recv().unwrap(), r#"["fast-done"]"#);
        release.send(true).unwrap();
        assert!(running.next().await.is_some());
        assert!(running.next().await.is_none());
    }

    #[tokio::test]
    async fn dispatch_starts_handlers_in_arrival_order() {
        let server = registry(false, None);
        let started = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&started);
        let numbered = SocketHandler::new("n", move |ctx: SocketContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(ctx.args[0].clone());
                tokio::task::yield_now().await;
                Ok(Value::Null)
            }
        });
        server.add_handler(Arc::new(numbered)).await;

        let conn = connection();
        server.listen_to_socket(&conn).await;
        let mut running = FuturesUnordered::new();
        for i in 0..200 {
            running.push(server.dispatch(&conn, "n".into(), vec![json!(i)]).await.unwrap());
            if i % 7 == 0 {
                running.next().await;
            }
        }
        while running.next().await.is_some() {}

        let expected: Vec<Value> = (0..200).map(|i| json!(i)).collect();
        assert_eq!(*started.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn broadcast_reaches_listening_connections() {
        let server = registry(false, None);
        let (a, mut a_out) = SocketConnection::new(Handshake::default());
        let (b, mut b_out) = SocketConnection::new(Handshake::default());
        server.listen_to_socket(&a).await;
        server.listen_to_socket(&b).await;
        server.socket_disconnect(&b).await;

        assert_eq!(server.broadcast("tick", &[json!(1)]).await, 1);
        assert_eq!(a_out.try_recv().unwrap(), r#"["tick",1]"#);
        assert!(b_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn installs_upgrade_binding_on_rest_server() {
        let rest = RestServer::new(RestServerOptions::default());
        let socket = SocketServer::new(SocketServerOptions {
            path: "/ws".into(),
            ..SocketServerOptions::new(&rest)
        })
        .await
        .unwrap();
        assert_eq!(socket.path(), "/ws");

        let handlers = rest.handlers().await;
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].path(), "/ws");
        assert_eq!(handlers[0].method(), RestMethod::Get);

        // A plain GET is not an upgrade.
        let req = Request::builder()
            .uri("/ws")
            .header(header::HOST, "localhost")
            .body(Body::empty())
            .unwrap();
        let response = rest.router().oneshot(req).await.unwrap();
        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
    }
}
