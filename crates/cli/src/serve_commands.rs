use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    clap::Args,
    switchyard_config::SwitchyardConfig,
    switchyard_gateway::{
        RestServer, RestServerOptions, SocketServer, SocketServerOptions, builtin,
        server::log_banner, token_auth_check, token_user,
    },
    switchyard_plugins::{HandlerSink, ImportReport, PluginCatalog},
    tracing::{info, warn},
};

/// Shared secret for `force_auth` sockets and `send_user` REST handlers.
const TOKEN_ENV: &str = "SWITCHYARD_TOKEN";

#[derive(Args)]
pub struct ServeArgs {
    /// Config file (default: discover switchyard.{toml,yaml,yml,json}).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override `server.bind`.
    #[arg(long)]
    bind: Option<String>,
    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

pub async fn serve(args: ServeArgs) -> Result<()> {
    let config = load(&args)?;
    let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());

    let (cert, key) = match &config.server.tls {
        Some(tls) => (Some(read_pem(&tls.cert)?), Some(read_pem(&tls.key)?)),
        None => (None, None),
    };
    let rest = RestServer::new(RestServerOptions {
        bind: config.server.bind.clone(),
        port: config.server.port,
        key,
        cert,
        get_user: token.clone().map(token_user),
    });

    let socket = if config.socket.enabled {
        if config.socket.force_auth && token.is_none() {
            warn!("socket.force_auth is set but {TOKEN_ENV} is not; every socket will be rejected");
        }
        let socket = SocketServer::new(SocketServerOptions {
            path: config.socket.path.clone(),
            force_auth: config.socket.force_auth,
            auth_check: token.clone().map(token_auth_check),
            ..SocketServerOptions::new(&rest)
        })
        .await?;
        Some(socket)
    } else {
        None
    };

    let addr = rest.listen().await?;

    let mut failures = 0;
    if let Some(dir) = &config.plugins.rest_dir {
        failures += import_logged(dir, &builtin::rest_catalog(), &rest).await;
    }
    if let (Some(dir), Some(socket)) = (&config.plugins.socket_dir, &socket) {
        failures += import_logged(dir, &builtin::socket_catalog(), socket).await;
    }

    let scheme = if rest.is_secure() { "https" } else { "http" };
    let mut lines = vec![
        format!("switchyard v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {scheme}://{addr}"),
        format!("{} rest handlers", rest.handlers().await.len()),
    ];
    if let Some(socket) = &socket {
        lines.push(format!(
            "socket at {} ({} events{})",
            socket.path(),
            socket.events().await.len(),
            if config.socket.force_auth { ", auth required" } else { "" }
        ));
    }
    if failures > 0 {
        lines.push(format!("{failures} plugin(s) failed to load"));
    }
    log_banner(&lines);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    rest.shutdown();
    Ok(())
}

fn load(args: &ServeArgs) -> Result<SwitchyardConfig> {
    let mut config = match &args.config {
        Some(path) => switchyard_config::load_config(path)?,
        None => switchyard_config::discover_and_load(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Import `dir`, logging each failure. Returns the failure count.
async fn import_logged<H, S>(dir: &Path, catalog: &PluginCatalog<H>, sink: &S) -> usize
where
    H: Send + 'static,
    S: HandlerSink<H>,
{
    match switchyard_plugins::import(dir, catalog, sink).await {
        Ok(ImportReport { loaded, failures }) => {
            for failure in &failures {
                warn!(dir = %dir.display(), "{failure}");
            }
            info!(dir = %dir.display(), loaded, failed = failures.len(), "plugins imported");
            failures.len()
        },
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "plugin directory not imported");
            1
        },
    }
}
