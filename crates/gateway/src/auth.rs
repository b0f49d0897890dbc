//! User resolution and connection auth callbacks.
//!
//! Both registries take these as injected callbacks; credential checks live
//! with the application. The token helpers at the bottom cover the common
//! shared-secret case.

use std::{future::Future, pin::Pin, sync::Arc};

use {
    axum::http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    serde_json::json,
};

use crate::connection::SocketConnection;

// ── Types ────────────────────────────────────────────────────────────────────

/// The resolved, authenticated user handed to `send_user` handlers.
pub type User = serde_json::Value;

pub type UserFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<User>>> + Send>>;

/// Resolves the user for a request (`T = Parts`) or a connection
/// (`T = SocketConnection`).
pub type GetUserFn<T> = Arc<dyn Fn(&T) -> UserFuture + Send + Sync>;

pub type AuthFuture = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>>;

/// Decides whether a new socket connection may proceed to listening.
pub type AuthCheckFn = Arc<dyn Fn(&SocketConnection) -> AuthFuture + Send + Sync>;

/// Box a user resolver. The closure borrows its input synchronously and
/// returns an owned future.
pub fn get_user_fn<T, F, Fut>(f: F) -> GetUserFn<T>
where
    T: 'static,
    F: Fn(&T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<User>>> + Send + 'static,
{
    Arc::new(move |target: &T| -> UserFuture { Box::pin(f(target)) })
}

/// Box a connection auth check.
pub fn auth_check_fn<F, Fut>(f: F) -> AuthCheckFn
where
    F: Fn(&SocketConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |conn: &SocketConnection| -> AuthFuture { Box::pin(f(conn)) })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Extract `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

// ── Shared-token auth ────────────────────────────────────────────────────────

/// Accept connections presenting `expected` as a bearer token or as the
/// `token` query parameter of the upgrade request.
pub fn token_auth_check(expected: impl Into<String>) -> AuthCheckFn {
    let expected: Arc<str> = Arc::from(expected.into());
    auth_check_fn(move |conn: &SocketConnection| {
        let handshake = conn.handshake();
        let ok = bearer_token(&handshake.headers)
            .map(str::to_string)
            .or_else(|| handshake.query("token"))
            .is_some_and(|given| safe_equal(&given, &expected));
        async move { Ok(ok) }
    })
}

/// Resolve a request carrying `expected` as bearer token to a token user;
/// anything else resolves to no user.
pub fn token_user(expected: impl Into<String>) -> GetUserFn<Parts> {
    let expected: Arc<str> = Arc::from(expected.into());
    get_user_fn(move |parts: &Parts| {
        let user = bearer_token(&parts.headers)
            .filter(|given| safe_equal(given, &expected))
            .map(|_| json!({ "method": "token" }));
        async move { Ok(user) }
    })
}
