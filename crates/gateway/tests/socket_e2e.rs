#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, Stream, StreamExt},
    serde_json::{Value, json},
    switchyard_gateway::{
        RestServer, RestServerOptions, SocketContext, SocketHandler, SocketServer,
        SocketServerOptions, builtin, token_auth_check,
    },
    tokio::sync::mpsc,
    tokio_tungstenite::{
        connect_async,
        tungstenite::{Error as WsError, Message},
    },
};

async fn serve(force_auth: bool) -> (RestServer, SocketServer, SocketAddr) {
    let rest = RestServer::new(RestServerOptions::default());
    let socket = SocketServer::new(SocketServerOptions {
        force_auth,
        auth_check: Some(token_auth_check("letmein")),
        ..SocketServerOptions::new(&rest)
    })
    .await
    .unwrap();
    let addr = rest.listen().await.unwrap();
    (rest, socket, addr)
}

/// The next text frame, or `None` once the server closes (or goes quiet).
async fn next_text<S>(ws: &mut S) -> Option<String>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.ok()?? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {},
        }
    }
}

async fn wait_for_count(socket: &SocketServer, expected: usize) -> bool {
    for _ in 0..100 {
        if socket.connection_count().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn echo_args_reach_the_handler() {
    let (rest, socket, addr) = serve(false).await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    socket
        .add_handler(Arc::new(SocketHandler::new("echo", move |ctx: SocketContext| {
            let _ = seen_tx.send(ctx.args.clone());
            async move {
                ctx.conn.emit("echoed", &ctx.args);
                Ok(Value::Array(ctx.args))
            }
        })))
        .await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/socket")).await.unwrap();
    assert!(wait_for_count(&socket, 1).await);

    ws.send(Message::text("not a frame")).await.unwrap();
    ws.send(Message::text(r#"["noop", 1]"#)).await.unwrap();
    ws.send(Message::text(r#"["echo", 1, 2]"#)).await.unwrap();

    assert_eq!(next_text(&mut ws).await.as_deref(), Some(r#"["echoed",1,2]"#));
    assert_eq!(seen_rx.recv().await, Some(vec![json!(1), json!(2)]));
    assert!(seen_rx.try_recv().is_err());

    ws.close(None).await.unwrap();
    assert!(wait_for_count(&socket, 0).await);
    rest.shutdown();
}

#[tokio::test]
async fn forced_auth_gates_connections() {
    let (rest, socket, addr) = serve(true).await;
    socket
        .add_handler(Arc::new(SocketHandler::new("echo", |ctx: SocketContext| async move {
            ctx.conn.emit("echo", &ctx.args);
            Ok(Value::Null)
        })))
        .await;

    let (mut denied, _) = connect_async(format!("ws://{addr}/socket?token=wrong")).await.unwrap();
    let _ = denied.send(Message::text(r#"["echo", 1]"#)).await;
    assert_eq!(next_text(&mut denied).await, None);
    assert_eq!(socket.connection_count().await, 0);

    let (mut allowed, _) = connect_async(format!("ws://{addr}/socket?token=letmein"))
        .await
        .unwrap();
    allowed.send(Message::text(r#"["echo", "ok"]"#)).await.unwrap();
    assert_eq!(next_text(&mut allowed).await.as_deref(), Some(r#"["echo","ok"]"#));
    assert_eq!(socket.connection_count().await, 1);
    rest.shutdown();
}

#[tokio::test]
async fn imported_reply_handler_answers() {
    let plugins = tempfile::tempdir().unwrap();
    std::fs::write(
        plugins.path().join("hello.yaml"),
        "handler: reply\nparams:\n  event: hello\n  reply_event: hi\n",
    )
    .unwrap();

    let (rest, socket, addr) = serve(false).await;
    let report = switchyard_plugins::import(plugins.path(), &builtin::socket_catalog(), &socket)
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(socket.events().await, vec!["hello".to_string()]);

    let (mut ws, _) = connect_async(format!("ws://{addr}/socket")).await.unwrap();
    ws.send(Message::text(r#"["hello", "there"]"#)).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some(r#"["hi","there"]"#));

    socket.remove_handler_by_event("hello").await;
    ws.send(Message::text(r#"["hello", "again"]"#)).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(quiet.is_err());
    rest.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_connection_starts_handlers_in_arrival_order() {
    const EVENTS: u64 = 1000;
    let (rest, socket, addr) = serve(false).await;
    let started = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = Arc::clone(&started);
    socket
        .add_handler(Arc::new(SocketHandler::new("n", move |ctx: SocketContext| {
            let log = Arc::clone(&log);
            async move {
                let n = ctx.args[0].as_u64().unwrap_or(u64::MAX);
                let count = {
                    let mut log = log.lock().unwrap();
                    log.push(n);
                    log.len() as u64
                };
                tokio::task::yield_now().await;
                if count == EVENTS {
                    ctx.conn.emit("done", &[]);
                }
                Ok(Value::Null)
            }
        })))
        .await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/socket")).await.unwrap();
    for i in 0..EVENTS {
        ws.feed(Message::text(format!(r#"["n", {i}]"#))).await.unwrap();
    }
    ws.flush().await.unwrap();

    assert_eq!(next_text(&mut ws).await.as_deref(), Some(r#"["done"]"#));
    let started = started.lock().unwrap().clone();
    assert_eq!(started, (0..EVENTS).collect::<Vec<_>>());
    rest.shutdown();
}
