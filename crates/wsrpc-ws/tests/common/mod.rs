//! In-memory socket for driving `WsClient` without a network.
//!
//! Every connect attempt shows up on the [`MockServer`] as a [`Dial`] that
//! the test accepts or refuses. An accepted dial yields a [`MockPeer`]
//! playing the server side of one connection; dropping it drops the
//! connection without a close frame.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use wsrpc_core::error::TransportError;
use wsrpc_ws::{CloseInfo, Connector, Inbound, Outbound, Socket, WsClient, WsConfig};

// ─── Connector ────────────────────────────────────────────────────────────────

struct MockConnector {
    dials: mpsc::UnboundedSender<Dial>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &WsConfig) -> Result<Socket, TransportError> {
        let (reply, answer) = oneshot::channel();
        self.dials
            .unbounded_send(Dial { reply })
            .map_err(|_| TransportError::WebSocket("mock server gone".into()))?;
        answer
            .await
            .map_err(|_| TransportError::WebSocket("dial dropped".into()))?
    }
}

/// Build a client whose sockets come from the returned server.
pub fn client(config: WsConfig) -> (WsClient, MockServer) {
    let (tx, rx) = mpsc::unbounded();
    let client = WsClient::with_connector(config, Arc::new(MockConnector { dials: tx }))
        .expect("valid config");
    (client, MockServer { dials: rx })
}

// ─── Server side ──────────────────────────────────────────────────────────────

pub struct MockServer {
    dials: mpsc::UnboundedReceiver<Dial>,
}

impl MockServer {
    pub async fn next_dial(&mut self) -> Dial {
        self.dials.next().await.expect("client task stopped")
    }

    /// A dial that has already arrived, if any.
    pub fn try_next_dial(&mut self) -> Option<Dial> {
        self.dials.try_recv().ok()
    }
}

/// One connect attempt waiting for an answer.
pub struct Dial {
    reply: oneshot::Sender<Result<Socket, TransportError>>,
}

impl Dial {
    pub fn accept(self) -> MockPeer {
        let (out_tx, out_rx) = mpsc::unbounded::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded::<Inbound>();
        let sink = out_tx.sink_map_err(|e| TransportError::WebSocket(e.to_string()));
        let _ = self.reply.send(Ok(Socket::new(sink, in_rx)));
        MockPeer {
            outbound: out_rx,
            inbound: in_tx,
        }
    }

    pub fn refuse(self, reason: &str) {
        let _ = self
            .reply
            .send(Err(TransportError::WebSocket(reason.to_string())));
    }
}

/// Server end of one accepted connection.
pub struct MockPeer {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MockPeer {
    /// Next frame the client wrote.
    pub async fn recv(&mut self) -> Outbound {
        self.outbound.next().await.expect("client dropped the socket")
    }

    pub async fn recv_text(&mut self) -> String {
        match self.recv().await {
            Outbound::Text(text) => text,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv_text().await).expect("client wrote invalid JSON")
    }

    /// A frame already written, without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// `true` once the client has let go of its end of the socket.
    pub async fn client_gone(&mut self) -> bool {
        while self.outbound.next().await.is_some() {}
        true
    }

    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.unbounded_send(Inbound::Text(text.into()));
    }

    /// Answer `request` with `result`.
    pub fn reply(&self, request: &Value, result: Value) {
        let response = serde_json::json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
        self.push(response.to_string());
    }

    pub fn close(&self, code: u16, reason: &str, clean: bool) {
        let _ = self
            .inbound
            .unbounded_send(Inbound::Closed(CloseInfo::new(code, reason, clean)));
    }

    pub fn error(&self, message: &str) {
        let _ = self
            .inbound
            .unbounded_send(Inbound::Error(TransportError::WebSocket(message.to_string())));
    }
}
