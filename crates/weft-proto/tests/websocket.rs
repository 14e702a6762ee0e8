// SPDX-License-Identifier: MIT OR Apache-2.0
//! Connection tests against a real WebSocket server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::routing::any;
use axum::Router;
use serde_json::{json, Value as Json};
use weft_proto::{CommandDispatcher, Connection, Disconnect, ProtoError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Recording {
    commands: Mutex<Vec<(String, Vec<Json>)>>,
}

#[async_trait]
impl CommandDispatcher for Recording {
    async fn dispatch(&self, request: &str, params: Vec<Json>) -> Result<(), ProtoError> {
        self.commands
            .lock()
            .unwrap()
            .push((request.to_string(), params));
        Ok(())
    }
}

async fn serve<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/agent",
        any(move |ws: WebSocketUpgrade| {
            let handler = handler.clone();
            async move { ws.on_upgrade(handler) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://127.0.0.1:{}/agent", addr.port());
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    stream
}

// ---------------------------------------------------------------------------
// Session + command dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_frame_is_stored_and_commands_dispatch() {
    let addr = serve(|mut socket: WebSocket| async move {
        socket
            .send(WsMessage::Text(r#"[0, "S-1"]"#.into()))
            .await
            .unwrap();
        socket
            .send(WsMessage::Text(
                r#"[1, {"request": "execute", "params": [42, "repo", "add", []]}]"#.into(),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = socket.send(WsMessage::Close(None)).await;
    })
    .await;

    let dispatcher = Arc::new(Recording {
        commands: Mutex::new(Vec::new()),
    });
    let connection = Connection::new(dispatcher.clone());
    let disconnect = connection.run(connect(addr).await).await.unwrap();

    assert_eq!(disconnect, Disconnect::Dropped);
    assert_eq!(connection.session_id(), Some("S-1".into()));
    let commands = dispatcher.commands.lock().unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].0, "execute");
    assert_eq!(commands[0].1[0], json!(42));
}

// ---------------------------------------------------------------------------
// Request correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requests_correlate_success_and_error() {
    let addr = serve(|mut socket: WebSocket| async move {
        // Echo a success for the first request, an error for the second.
        for round in 0..2 {
            let Some(Ok(WsMessage::Text(text))) = socket.recv().await else {
                return;
            };
            let body: Json = serde_json::from_str(&text).unwrap();
            let id = body["id"].as_u64().unwrap();
            let reply = if round == 0 {
                json!([2, id, {"ok": true}])
            } else {
                json!([3, id, "not_recognised"])
            };
            socket
                .send(WsMessage::Text(reply.to_string().into()))
                .await
                .unwrap();
        }
    })
    .await;

    let connection = Arc::new(Connection::new(Arc::new(Recording {
        commands: Mutex::new(Vec::new()),
    })));
    let runner = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.run(connect(addr).await).await })
    };

    let ok = connection.request("get_result", vec![json!(5)]).await.unwrap();
    assert_eq!(ok, json!({"ok": true}));

    let err = connection.request("get_result", vec![json!(6)]).await;
    match err {
        Err(ProtoError::Remote(error)) => assert_eq!(error, json!("not_recognised")),
        other => panic!("expected remote error, got {other:?}"),
    }

    runner.abort();
}

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_reasons_classify() {
    for (code, reason, expected) in [
        (1000u16, "session_invalid", Disconnect::SessionInvalid),
        (4001, "", Disconnect::SessionInvalid),
        (
            1000,
            "project_not_found",
            Disconnect::Fatal("project_not_found".into()),
        ),
        (
            1000,
            "environment_not_found",
            Disconnect::Fatal("environment_not_found".into()),
        ),
    ] {
        let reason = reason.to_string();
        let addr = serve(move |mut socket: WebSocket| {
            let reason = reason.clone();
            async move {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
            }
        })
        .await;

        let connection = Connection::new(Arc::new(Recording {
            commands: Mutex::new(Vec::new()),
        }));
        let disconnect = connection.run(connect(addr).await).await.unwrap();
        assert_eq!(disconnect, expected);
    }
}
