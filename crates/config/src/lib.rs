//! Configuration for the switchyard host: schema, discovery and loading.
//!
//! Files may be TOML, YAML or JSON. `${ENV_VAR}` placeholders are substituted
//! before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{ConfigError, discover_and_load, find_config_file, load_config},
    schema::{PluginsConfig, ServerConfig, SocketConfig, SwitchyardConfig, TlsConfig},
};
