//! Handler factories manifests can name out of the box.
//!
//! ```toml
//! handler = "static"
//!
//! [params]
//! path = "/ping"
//! body = "pong"
//! ```

use std::sync::Arc;

use {
    anyhow::Context,
    axum::{
        Json,
        body::to_bytes,
        extract::Request,
        http::StatusCode,
        response::IntoResponse,
    },
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::{Value, json},
    switchyard_plugins::PluginCatalog,
};

use crate::{
    error::HandlerError,
    rest::{Reply, RestHandler, RestMethod},
    socket::{SocketContext, SocketHandler},
};

/// Largest request body the `echo` handler will read.
const ECHO_BODY_LIMIT: usize = 2 * 1024 * 1024;

fn params<T: DeserializeOwned>(params: &Value) -> anyhow::Result<T> {
    let params = if params.is_null() {
        json!({})
    } else {
        params.clone()
    };
    serde_json::from_value(params).context("invalid params")
}

// ── REST ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StaticParams {
    path: String,
    #[serde(default = "default_get")]
    method: RestMethod,
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    send_user: bool,
}

#[derive(Debug, Deserialize)]
struct RestEchoParams {
    path: String,
    #[serde(default = "default_post")]
    method: RestMethod,
    #[serde(default)]
    send_user: bool,
}

fn default_get() -> RestMethod {
    RestMethod::Get
}

fn default_post() -> RestMethod {
    RestMethod::Post
}

fn default_status() -> u16 {
    200
}

fn static_handler(raw: &Value) -> anyhow::Result<Arc<RestHandler>> {
    let p: StaticParams = params(raw)?;
    let status = StatusCode::from_u16(p.status)
        .with_context(|| format!("invalid status code {}", p.status))?;
    let body = Arc::new(p.body);
    let handler = RestHandler::new(p.method, p.path, move |_req, _user| {
        let body = Arc::clone(&body);
        async move {
            let response = match body.as_ref() {
                Value::String(text) => (status, text.clone()).into_response(),
                other => (status, Json(other.clone())).into_response(),
            };
            Ok(Reply::Respond(response))
        }
    });
    Ok(Arc::new(handler.with_send_user(p.send_user)))
}

fn rest_echo_handler(raw: &Value) -> anyhow::Result<Arc<RestHandler>> {
    let p: RestEchoParams = params(raw)?;
    let handler = RestHandler::new(p.method, p.path, |req: Request, user| async move {
        let bytes = to_bytes(req.into_body(), ECHO_BODY_LIMIT)
            .await
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| HandlerError::bad_request(format!("invalid JSON body: {e}")))?
        };
        Ok::<_, HandlerError>(Reply::respond(Json(json!({ "body": body, "user": user }))))
    });
    Ok(Arc::new(handler.with_send_user(p.send_user)))
}

/// `static` and `echo`.
pub fn rest_catalog() -> PluginCatalog<Arc<RestHandler>> {
    PluginCatalog::new()
        .with("static", static_handler)
        .with("echo", rest_echo_handler)
}

// ── Socket ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SocketEchoParams {
    #[serde(default = "default_echo_event")]
    event: String,
    #[serde(default)]
    send_user: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyParams {
    event: String,
    reply_event: String,
    #[serde(default)]
    send_user: bool,
}

fn default_echo_event() -> String {
    "echo".into()
}

fn socket_echo_handler(raw: &Value) -> anyhow::Result<Arc<SocketHandler>> {
    let p: SocketEchoParams = params(raw)?;
    let handler = SocketHandler::new(p.event, |ctx: SocketContext| async move {
        Ok(Value::Array(ctx.args))
    });
    Ok(Arc::new(handler.with_send_user(p.send_user)))
}

fn reply_handler(raw: &Value) -> anyhow::Result<Arc<SocketHandler>> {
    let p: ReplyParams = params(raw)?;
    anyhow::ensure!(!p.reply_event.is_empty(), "reply_event must not be empty");
    let reply_event: Arc<str> = Arc::from(p.reply_event);
    let handler = SocketHandler::new(p.event, move |ctx: SocketContext| {
        let reply_event = Arc::clone(&reply_event);
        async move {
            ctx.conn.emit(&reply_event, &ctx.args);
            Ok(Value::Null)
        }
    });
    Ok(Arc::new(handler.with_send_user(p.send_user)))
}

/// `echo` and `reply`.
pub fn socket_catalog() -> PluginCatalog<Arc<SocketHandler>> {
    PluginCatalog::new()
        .with("echo", socket_echo_handler)
        .with("reply", reply_handler)
}
