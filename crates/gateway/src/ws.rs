use std::future::Future;

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{
        SinkExt, StreamExt,
        future::BoxFuture,
        stream::FuturesUnordered,
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    connection::{Handshake, SocketConnection},
    frame,
    socket::SocketServer,
};

type Running = FuturesUnordered<BoxFuture<'static, ()>>;

/// Drive one upgraded WebSocket: gate it through the registry, then pump
/// frames until either side closes.
///
/// Handlers are started one frame at a time, in arrival order, and polled
/// together on this task.
pub(crate) async fn handle_connection(socket: WebSocket, server: SocketServer, handshake: Handshake) {
    let (conn, outbound) = SocketConnection::new(handshake);
    let (ws_tx, mut ws_rx) = socket.split();

    let write_task = tokio::spawn(write_loop(ws_tx, outbound, conn.shutdown_token()));
    let mut running = Running::new();

    if server.socket_connect(&conn).await {
        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                Some(()) = running.next(), if !running.is_empty() => continue,
                () = conn.closed() => break,
            };
            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id(), error = %e, "socket read error");
                    break;
                },
                None => break,
            };
            match msg {
                Message::Text(text) => match frame::decode(text.as_str()) {
                    Ok((event, args)) => {
                        let started =
                            alongside(server.dispatch(&conn, event, args), &mut running).await;
                        if let Some(handler) = started {
                            running.push(handler);
                        }
                    },
                    Err(e) => warn!(conn_id = %conn.id(), error = %e, "malformed socket frame"),
                },
                Message::Close(_) => break,
                // Pings are answered by axum; binary frames carry no events.
                _ => {},
            }
        }
    }

    server.socket_disconnect(&conn).await;
    // Handlers already started run to completion; their emits are dropped.
    while running.next().await.is_some() {}
    if let Err(e) = write_task.await {
        warn!(conn_id = %conn.id(), error = %e, "socket write task failed");
    }
}

/// Await `fut` while still polling the handlers already running.
async fn alongside<F: Future>(fut: F, running: &mut Running) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            Some(()) = running.next(), if !running.is_empty() => {},
        }
    }
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            },
            () = shutdown.cancelled() => break,
        }
    }
    // Flush what was queued before the close.
    while let Ok(frame) = outbound.try_recv() {
        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
