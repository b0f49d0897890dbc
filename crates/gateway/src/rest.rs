//! REST handler registry.
//!
//! Every handler added gets exactly one *binding*: a one-route axum
//! [`Router`] for its `(path, method)`. Bindings are append-only; the server's
//! fallback walks them in registration order, and a binding whose handler is
//! no longer live (or whose handler yields [`Reply::Next`]) hands the request
//! on to the next one. Path matching is entirely axum's.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    str::FromStr,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    axum::{
        Router,
        extract::{Request, State},
        http::{StatusCode, request::Parts},
        response::{IntoResponse, Response},
        routing::{MethodFilter, MethodRouter, any, on},
    },
    serde::{Deserialize, Serialize},
    switchyard_plugins::HandlerSink,
    tokio::sync::RwLock,
    tower::ServiceExt,
    tracing::{debug, info, warn},
};

use crate::{
    auth::{GetUserFn, User},
    error::{HandlerError, RestError},
    server::{self, ServerHandle, Transport},
};

// ── Methods ──────────────────────────────────────────────────────────────────

/// HTTP method a handler is bound to. `All` matches every method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum RestMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
    Connect,
    Trace,
    All,
}

impl RestMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Patch => "patch",
            Self::Options => "options",
            Self::Head => "head",
            Self::Connect => "connect",
            Self::Trace => "trace",
            Self::All => "all",
        }
    }

    fn filter(self) -> Option<MethodFilter> {
        Some(match self {
            Self::Get => MethodFilter::GET,
            Self::Post => MethodFilter::POST,
            Self::Put => MethodFilter::PUT,
            Self::Delete => MethodFilter::DELETE,
            Self::Patch => MethodFilter::PATCH,
            Self::Options => MethodFilter::OPTIONS,
            Self::Head => MethodFilter::HEAD,
            Self::Connect => MethodFilter::CONNECT,
            Self::Trace => MethodFilter::TRACE,
            Self::All => return None,
        })
    }
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for RestMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "get" => Self::Get,
            "post" => Self::Post,
            "put" => Self::Put,
            "delete" => Self::Delete,
            "patch" => Self::Patch,
            "options" => Self::Options,
            "head" => Self::Head,
            "connect" => Self::Connect,
            "trace" => Self::Trace,
            "all" | "*" => Self::All,
            _ => return Err(format!("unknown HTTP method: {s}")),
        })
    }
}

impl TryFrom<String> for RestMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// What a handler did with the request.
#[derive(Debug)]
pub enum Reply {
    /// Answer the request.
    Respond(Response),
    /// Decline it; the next binding (or the 404 fallback) gets the request.
    Next(Request),
}

impl Reply {
    pub fn respond(response: impl IntoResponse) -> Self {
        Self::Respond(response.into_response())
    }

    pub fn next(request: Request) -> Self {
        Self::Next(request)
    }
}

pub type RestFuture = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send>>;

/// A boxed async REST handler body.
pub type RestRunFn = Box<dyn Fn(Request, Option<User>) -> RestFuture + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// An HTTP handler. Identity is the constructed value: clones of the same
/// `Arc<RestHandler>` are one handler, two handlers built with the same path
/// and method are two.
pub struct RestHandler {
    id: u64,
    path: String,
    method: RestMethod,
    send_user: bool,
    run: RestRunFn,
}

impl RestHandler {
    pub fn new<F, Fut>(method: RestMethod, path: impl Into<String>, run: F) -> Self
    where
        F: Fn(Request, Option<User>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            method,
            send_user: false,
            run: Box::new(move |req, user| -> RestFuture { Box::pin(run(req, user)) }),
        }
    }

    /// Resolve the user through the registry's `get_user` before each call.
    pub fn with_send_user(mut self, send_user: bool) -> Self {
        self.send_user = send_user;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> RestMethod {
        self.method
    }

    pub fn sends_user(&self) -> bool {
        self.send_user
    }
}

impl fmt::Debug for RestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestHandler")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("send_user", &self.send_user)
            .finish_non_exhaustive()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

struct Binding {
    handler_id: u64,
    router: Router,
}

pub(crate) struct RestRegistry {
    /// Live set, keyed by handler identity.
    live: RwLock<HashMap<u64, Arc<RestHandler>>>,
    /// Append-only; a binding outlives its handler's removal.
    bindings: RwLock<Vec<Binding>>,
    get_user: RwLock<Option<GetUserFn<Parts>>>,
}

impl RestRegistry {
    fn new(get_user: Option<GetUserFn<Parts>>) -> Arc<Self> {
        Arc::new(Self {
            live: RwLock::new(HashMap::new()),
            bindings: RwLock::new(Vec::new()),
            get_user: RwLock::new(get_user),
        })
    }

    async fn add_handler(self: &Arc<Self>, handler: Arc<RestHandler>) -> Result<(), RestError> {
        let path = route_path(handler.path())?;
        {
            let mut bindings = self.bindings.write().await;
            if bindings.iter().any(|b| b.handler_id == handler.id()) {
                debug!(method = %handler.method(), path = %handler.path(), "handler already bound, restoring");
            } else {
                bindings.push(Binding {
                    handler_id: handler.id(),
                    router: bind(Arc::downgrade(self), Arc::clone(&handler), &path),
                });
                debug!(method = %handler.method(), path = %handler.path(), "bound handler");
            }
        }
        self.live.write().await.insert(handler.id(), handler);
        Ok(())
    }

    async fn remove_handler(&self, handler: &RestHandler) -> bool {
        let removed = self.live.write().await.remove(&handler.id()).is_some();
        if removed {
            debug!(method = %handler.method(), path = %handler.path(), "removed handler");
        }
        removed
    }

    async fn is_live(&self, id: u64) -> bool {
        self.live.read().await.contains_key(&id)
    }

    /// Run one handler for a request its binding matched.
    async fn invoke(&self, handler: &RestHandler, req: Request) -> Response {
        if !self.is_live(handler.id()).await {
            debug!(method = %handler.method(), path = %handler.path(), "handler removed, falling through");
            return fall_through(req);
        }

        let (req, user) = if handler.sends_user() {
            let (parts, body) = req.into_parts();
            let resolver = self.get_user.read().await.clone();
            let user = match resolver {
                Some(resolve) => match resolve(&parts).await {
                    Ok(user) => user,
                    Err(e) => return error_response(handler, HandlerError::Internal(e)),
                },
                None => None,
            };
            (Request::from_parts(parts, body), user)
        } else {
            (req, None)
        };
        self.run(handler, req, user).await
    }

    async fn run(&self, handler: &RestHandler, req: Request, user: Option<User>) -> Response {
        match (handler.run)(req, user).await {
            Ok(Reply::Respond(response)) => response,
            Ok(Reply::Next(req)) => fall_through(req),
            Err(e) => error_response(handler, e),
        }
    }

    /// The server's fallback: offer the request to each binding in turn.
    async fn dispatch(&self, req: Request) -> Response {
        let routers: Vec<Router> = self
            .bindings
            .read()
            .await
            .iter()
            .map(|b| b.router.clone())
            .collect();

        // Bindings add route extensions; each one sees the request as it arrived.
        let pristine = req.extensions().clone();
        let mut req = req;
        for router in routers {
            let response = match router.oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
            match take_passed(&response) {
                Some(mut passed) => {
                    *passed.extensions_mut() = pristine.clone();
                    req = passed;
                },
                None => return response,
            }
        }
        not_found(&req)
    }
}

fn bind(registry: Weak<RestRegistry>, handler: Arc<RestHandler>, path: &str) -> Router {
    let method = handler.method();
    let invoke = move |req: Request| {
        let registry = registry.clone();
        let handler = Arc::clone(&handler);
        async move {
            match registry.upgrade() {
                Some(registry) => registry.invoke(&handler, req).await,
                None => fall_through(req),
            }
        }
    };
    let route: MethodRouter = match method.filter() {
        Some(filter) => on(filter, invoke),
        None => any(invoke),
    };
    Router::new()
        .route(path, route.fallback(pass))
        .fallback(pass)
}

/// Rewrite Express-style `:param` and `*rest` segments into axum syntax.
/// Anything the router could not parse is rejected here rather than at
/// `Router::route`, which panics on it.
fn route_path(path: &str) -> Result<String, RestError> {
    let invalid = |reason| RestError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }

    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    let mut names = HashSet::new();
    let mut out = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        let (name, wildcard) = if let Some(inner) = segment.strip_prefix('{') {
            let Some(inner) = inner.strip_suffix('}') else {
                return Err(invalid("unclosed '{'"));
            };
            match inner.strip_prefix('*') {
                Some(name) => (name, true),
                None => (inner, false),
            }
        } else if let Some(name) = segment.strip_prefix(':') {
            (name, false)
        } else if let Some(name) = segment.strip_prefix('*') {
            (if name.is_empty() { "wildcard" } else { name }, true)
        } else {
            if segment.contains(['{', '}']) {
                return Err(invalid("braces must enclose a whole segment"));
            }
            out.push((*segment).to_string());
            continue;
        };

        if !is_param_name(name) {
            return Err(invalid("parameter names are letters, digits and '_'"));
        }
        if wildcard && i != last {
            return Err(invalid("wildcard must be the last segment"));
        }
        if !names.insert(name) {
            return Err(invalid("duplicate parameter name"));
        }
        out.push(if wildcard {
            format!("{{*{name}}}")
        } else {
            format!("{{{name}}}")
        });
    }
    Ok(out.join("/"))
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Fall-through plumbing ────────────────────────────────────────────────────

/// Carries a declined request back out of a binding's router.
#[derive(Clone)]
struct Passed(Arc<Mutex<Option<Request>>>);

fn fall_through(req: Request) -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    response
        .extensions_mut()
        .insert(Passed(Arc::new(Mutex::new(Some(req)))));
    response
}

async fn pass(req: Request) -> Response {
    fall_through(req)
}

fn take_passed(response: &Response) -> Option<Request> {
    let passed = response.extensions().get::<Passed>()?;
    passed.0.lock().ok()?.take()
}

fn not_found(req: &Request) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("Cannot {} {}", req.method(), req.uri().path()),
    )
        .into_response()
}

fn error_response(handler: &RestHandler, err: HandlerError) -> Response {
    warn!(
        method = %handler.method(),
        path = %handler.path(),
        status = %err.status_code(),
        error = %err,
        "handler error"
    );
    err.into_response()
}

pub(crate) async fn dispatch_fallback(
    State(registry): State<Arc<RestRegistry>>,
    req: Request,
) -> Response {
    registry.dispatch(req).await
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Options for [`RestServer`]. Supplying both `key` and `cert` (PEM text)
/// selects TLS.
#[derive(Clone)]
pub struct RestServerOptions {
    pub bind: String,
    pub port: u16,
    pub key: Option<String>,
    pub cert: Option<String>,
    pub get_user: Option<GetUserFn<Parts>>,
}

impl Default for RestServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 0,
            key: None,
            cert: None,
            get_user: None,
        }
    }
}

impl fmt::Debug for RestServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestServerOptions")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("tls", &(self.key.is_some() && self.cert.is_some()))
            .field("get_user", &self.get_user.is_some())
            .finish()
    }
}

/// The REST registry and the web server it owns.
pub struct RestServer {
    registry: Arc<RestRegistry>,
    transport: Transport,
    server: OnceLock<ServerHandle>,
}

impl RestServer {
    /// Build the registry without binding a socket.
    pub fn new(options: RestServerOptions) -> Self {
        let transport = Transport::from_options(&options);
        Self {
            registry: RestRegistry::new(options.get_user),
            transport,
            server: OnceLock::new(),
        }
    }

    /// Build the registry and start serving it.
    pub async fn start(options: RestServerOptions) -> Result<Self, RestError> {
        let server = Self::new(options);
        server.listen().await?;
        Ok(server)
    }

    /// Bind and serve in a background task. Only one listener per server.
    pub async fn listen(&self) -> Result<SocketAddr, RestError> {
        if let Some(handle) = self.server.get() {
            return Err(RestError::AlreadyListening(handle.local_addr));
        }
        let handle = server::serve(self.router(), &self.transport).await?;
        let addr = handle.local_addr;
        if let Err(handle) = self.server.set(handle) {
            handle.shutdown();
            return Err(RestError::AlreadyListening(addr));
        }
        let handlers = self.registry.live.read().await.len();
        info!(
            addr = %addr,
            secure = self.transport.is_secure(),
            handlers,
            "rest server listening"
        );
        Ok(addr)
    }

    /// The app: fallback dispatcher behind CORS, tracing and panic layers.
    pub fn router(&self) -> Router {
        server::build_app(Arc::clone(&self.registry))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.get().map(|handle| handle.local_addr)
    }

    /// Whether the serve task is up (it stops after [`shutdown`](Self::shutdown)).
    pub fn is_listening(&self) -> bool {
        self.server.get().is_some_and(ServerHandle::is_running)
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Stop accepting connections and let in-flight requests finish.
    pub fn shutdown(&self) {
        if let Some(handle) = self.server.get() {
            handle.shutdown();
        }
    }

    /// Make `handler` live. A handler that was added before keeps its
    /// first binding rather than gaining a second one.
    pub async fn add_handler(&self, handler: Arc<RestHandler>) -> Result<(), RestError> {
        self.registry.add_handler(handler).await
    }

    /// Take `handler` out of the live set. Its binding stays installed and
    /// falls through from now on. Returns whether it was live.
    pub async fn remove_handler(&self, handler: &RestHandler) -> bool {
        self.registry.remove_handler(handler).await
    }

    /// Replace the resolver used by every `send_user` handler from the next
    /// request on.
    pub async fn set_get_user(&self, get_user: GetUserFn<Parts>) {
        *self.registry.get_user.write().await = Some(get_user);
    }

    /// Live handlers, in no particular order.
    pub async fn handlers(&self) -> Vec<Arc<RestHandler>> {
        self.registry.live.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl HandlerSink<Arc<RestHandler>> for RestServer {
    async fn add_handler(&self, handler: Arc<RestHandler>) -> anyhow::Result<()> {
        RestServer::add_handler(self, handler).await?;
        Ok(())
    }
}
