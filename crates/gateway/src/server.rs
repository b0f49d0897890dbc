use std::{net::SocketAddr, sync::Arc};

use {
    axum::{Router, extract::Request},
    tokio::{net::TcpListener, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{
    error::RestError,
    rest::{RestRegistry, RestServerOptions, dispatch_fallback},
};

// ── Transport ────────────────────────────────────────────────────────────────

/// How a [`RestServer`](crate::RestServer) accepts connections.
#[derive(Clone)]
pub(crate) struct Transport {
    addr: String,
    cert: Option<String>,
    key: Option<String>,
}

impl Transport {
    pub(crate) fn from_options(options: &RestServerOptions) -> Self {
        Self {
            addr: format!("{}:{}", options.bind, options.port),
            cert: options.cert.clone(),
            key: options.key.clone(),
        }
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// A running server task.
pub(crate) struct ServerHandle {
    pub(crate) local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

// ── App ──────────────────────────────────────────────────────────────────────

/// Build the app (shared between serving and tests): every request goes to
/// the registry's dispatcher.
pub(crate) fn build_app(registry: Arc<RestRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .fallback(dispatch_fallback)
        .with_state(registry)
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            tracing::debug_span!("request", method = %req.method(), path = %req.uri().path())
        }))
        .layer(CatchPanicLayer::new())
}

// ── Serving ──────────────────────────────────────────────────────────────────

pub(crate) async fn serve(app: Router, transport: &Transport) -> Result<ServerHandle, RestError> {
    let tls = match (&transport.cert, &transport.key) {
        (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
        (None, None) => None,
        _ => return Err(RestError::IncompleteTls),
    };

    let bind_error = |source| RestError::Bind {
        addr: transport.addr.clone(),
        source,
    };
    let listener = TcpListener::bind(&transport.addr).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    let shutdown = CancellationToken::new();

    let task = match tls {
        None => serve_plain(listener, app, shutdown.clone()),
        Some((cert, key)) => serve_tls(listener, app, cert, key, shutdown.clone()).await?,
    };

    Ok(ServerHandle {
        local_addr,
        shutdown,
        task,
    })
}

fn serve_plain(listener: TcpListener, app: Router, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        match result {
            Ok(()) => info!("rest server stopped"),
            Err(e) => warn!(error = %e, "rest server exited"),
        }
    })
}

#[cfg(feature = "tls")]
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    cert: &str,
    key: &str,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, RestError> {
    use axum_server::{Handle, tls_rustls::RustlsConfig};

    // Several providers may be compiled in; pick ring once per process.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = RustlsConfig::from_pem(cert.as_bytes().to_vec(), key.as_bytes().to_vec())
        .await
        .map_err(RestError::Tls)?;
    let listener = listener.into_std().map_err(RestError::Tls)?;

    let handle = Handle::new();
    let stopper = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stopper.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    Ok(tokio::spawn(async move {
        let result = axum_server::from_tcp_rustls(listener, config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await;
        match result {
            Ok(()) => info!("rest server stopped"),
            Err(e) => warn!(error = %e, "rest server exited"),
        }
    }))
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(
    _listener: TcpListener,
    _app: Router,
    _cert: &str,
    _key: &str,
    _shutdown: CancellationToken,
) -> Result<JoinHandle<()>, RestError> {
    Err(RestError::TlsUnavailable)
}

// ── Banner ───────────────────────────────────────────────────────────────────

/// Log a boxed startup banner.
pub fn log_banner(lines: &[String]) {
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn transport(cert: Option<&str>, key: Option<&str>) -> Transport {
        Transport::from_options(&RestServerOptions {
            cert: cert.map(str::to_string),
            key: key.map(str::to_string),
            ..Default::default()
        })
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(!transport(None, None).is_secure());
        assert!(!transport(Some("cert"), None).is_secure());
        assert!(transport(Some("cert"), Some("key")).is_secure());
        assert_eq!(transport(None, None).addr, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn half_tls_config_is_rejected() {
        let err = serve(Router::new(), &transport(None, Some("key")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RestError::IncompleteTls));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let transport = Transport {
            addr: "not-an-address".into(),
            cert: None,
            key: None,
        };
        let err = serve(Router::new(), &transport).await.err().unwrap();
        assert!(matches!(err, RestError::Bind { .. }));
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn bad_pem_is_a_tls_error() {
        let err = serve(Router::new(), &transport(Some("not a cert"), Some("not a key")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RestError::Tls(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_the_listener() {
        let handle = serve(Router::new(), &transport(None, None)).await.unwrap();
        let addr = handle.local_addr;
        assert!(handle.is_running());
        handle.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.task)
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
