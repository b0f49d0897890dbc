//! Gateway: dynamic REST and WebSocket handler registries on one axum server.
//!
//! Lifecycle:
//! 1. Build a [`RestServer`] (optionally with TLS material and a user resolver)
//! 2. Attach a [`SocketServer`], which installs its upgrade endpoint on it
//! 3. Add handlers directly or import plugin directories with the
//!    [`builtin`] catalogs
//! 4. Listen; handlers can be added and removed while serving

pub mod auth;
pub mod builtin;
pub mod connection;
pub mod error;
pub mod frame;
pub mod rest;
pub mod server;
pub mod socket;
mod ws;

pub use {
    auth::{AuthCheckFn, GetUserFn, User, auth_check_fn, get_user_fn, token_auth_check, token_user},
    connection::{ConnectionState, Handshake, SocketConnection},
    error::{HandlerError, RestError},
    rest::{Reply, RestHandler, RestMethod, RestServer, RestServerOptions},
    socket::{SocketContext, SocketHandler, SocketServer, SocketServerOptions},
};
