// SPDX-License-Identifier: MIT OR Apache-2.0
//! The duplex connection: dual receive/send loops over one WebSocket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::frame::{ClientFrame, ServerFrame};
use crate::queue::OutboundQueue;
use crate::{Disconnect, ProtoError};

// ---------------------------------------------------------------------------
// CommandDispatcher
// ---------------------------------------------------------------------------

/// Handles server commands (`[1, …]` frames).
///
/// Dispatch failures are logged and the frame dropped; the connection stays
/// up.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Handle one command.
    async fn dispatch(&self, request: &str, params: Vec<Json>) -> Result<(), ProtoError>;
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct State {
    session_id: Option<String>,
    last_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Json, ProtoError>>>,
}

/// A server connection.
///
/// The connection object outlives individual sockets: `run` drives one
/// socket until it drops, while the outbound queue, session identity, and
/// pending requests carry across reconnects (until [`reset`](Self::reset)).
pub struct Connection {
    dispatcher: Arc<dyn CommandDispatcher>,
    queue: OutboundQueue,
    state: Mutex<State>,
}

impl Connection {
    /// A connection dispatching commands to `dispatcher`.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            dispatcher,
            queue: OutboundQueue::new(),
            state: Mutex::new(State {
                session_id: None,
                last_id: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// The current session identity, when one has been announced.
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    /// Number of frames waiting to be sent.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a fire-and-forget notification.
    pub fn notify(&self, request: &str, params: Vec<Json>) {
        self.queue.push(ClientFrame::notification(request, params));
    }

    /// Enqueue a correlated request and wait for the server's response.
    ///
    /// Errors with [`ProtoError::Abandoned`] if the session is reset before
    /// a response arrives, and with [`ProtoError::Remote`] when the server
    /// answers with an error frame.
    pub async fn request(&self, request: &str, params: Vec<Json>) -> Result<Json, ProtoError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock().unwrap();
            state.last_id += 1;
            let id = state.last_id;
            state.pending.insert(id, tx);
            id
        };
        self.queue.push(ClientFrame::request(request, params, id));
        rx.await.map_err(|_| ProtoError::Abandoned)?
    }

    /// Drop the session identity, pending requests, and queued frames.
    ///
    /// Call after a `session_invalid` close; in-flight callers observe
    /// [`ProtoError::Abandoned`].
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.session_id = None;
        state.last_id = 0;
        state.pending.clear();
        self.queue.clear();
    }

    /// Drive one socket until it closes or fails.
    ///
    /// A clean close returns its classification; a transport failure leaves
    /// the unsent queue head in place and surfaces the error.
    pub async fn run<S>(&self, socket: S) -> Result<Disconnect, ProtoError>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        let send = async {
            loop {
                let frame = self.queue.peek().await;
                match sink.send(Message::text(frame.encode())).await {
                    // Committed only after the socket accepted the frame;
                    // on failure it stays at the queue head.
                    Ok(()) => self.queue.commit(),
                    Err(err) => return ProtoError::Transport(err),
                }
            }
        };

        let recv = async {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => self.handle_frame(text.as_str()).await,
                    Ok(Message::Close(frame)) => return Ok(classify(frame)),
                    Ok(_) => {}
                    Err(err) => return Err(ProtoError::Transport(err)),
                }
            }
            Ok(Disconnect::Dropped)
        };

        tokio::select! {
            err = send => Err(err),
            disconnect = recv => disconnect,
        }
    }

    async fn handle_frame(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "weft_proto", %err, "dropping malformed frame");
                return;
            }
        };
        match frame {
            ServerFrame::Session { session_id } => {
                debug!(target: "weft_proto", %session_id, "session announced");
                self.state.lock().unwrap().session_id = Some(session_id);
            }
            ServerFrame::Command { request, params } => {
                if let Err(err) = self.dispatcher.dispatch(&request, params).await {
                    warn!(target: "weft_proto", %request, %err, "dropping command");
                }
            }
            ServerFrame::Response { id, result } => self.complete(id, Ok(result)),
            ServerFrame::ResponseError { id, error } => {
                self.complete(id, Err(ProtoError::Remote(error)))
            }
        }
    }

    fn complete(&self, id: u64, result: Result<Json, ProtoError>) {
        let sender = self.state.lock().unwrap().pending.remove(&id);
        match sender {
            // The caller may have given up; a dead receiver is fine.
            Some(sender) => drop(sender.send(result)),
            None => warn!(target: "weft_proto", id, "response for unknown request"),
        }
    }
}

fn classify(frame: Option<CloseFrame>) -> Disconnect {
    let Some(frame) = frame else {
        return Disconnect::Dropped;
    };
    let code: u16 = frame.code.into();
    let reason = frame.reason.as_str();
    // 4001 predates the named close reasons.
    if code == 4001 || reason == "session_invalid" {
        return Disconnect::SessionInvalid;
    }
    match reason {
        "project_not_found" | "environment_not_found" => Disconnect::Fatal(reason.to_string()),
        _ => Disconnect::Dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn close_classification() {
        let close = |code: u16, reason: &str| {
            classify(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            }))
        };
        assert_eq!(close(1000, "session_invalid"), Disconnect::SessionInvalid);
        assert_eq!(close(4001, ""), Disconnect::SessionInvalid);
        assert_eq!(
            close(1000, "project_not_found"),
            Disconnect::Fatal("project_not_found".into())
        );
        assert_eq!(
            close(1000, "environment_not_found"),
            Disconnect::Fatal("environment_not_found".into())
        );
        assert_eq!(close(1000, "going away"), Disconnect::Dropped);
        assert_eq!(classify(None), Disconnect::Dropped);
    }
}
