//! Config schema types (server, socket transport, plugin directories).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub server: ServerConfig,
    pub socket: SocketConfig,
    pub plugins: PluginsConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// When set, the server terminates TLS with these PEM files.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            tls: None,
        }
    }
}

/// PEM certificate and private key paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Event socket settings. The socket transport shares the HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub enabled: bool,
    /// Upgrade endpoint path.
    pub path: String,
    /// Reject connections that fail the auth check before any event is dispatched.
    pub force_auth: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/socket".into(),
            force_auth: false,
        }
    }
}

/// Plugin manifest directories, scanned once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub rest_dir: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
}

impl SwitchyardConfig {
    /// `bind:port` for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}
