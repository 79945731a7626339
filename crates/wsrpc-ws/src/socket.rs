//! Socket seam: the byte-level WebSocket as a black box.
//!
//! The connection manager only sees text frames going out and
//! text/error/close events coming in. [`TungsteniteConnector`] is the
//! production implementation; anything that can produce a [`Socket`] can
//! stand in for it.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use wsrpc_core::error::TransportError;

use crate::config::WsConfig;

/// How a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// A close handshake completed (as opposed to the connection dropping).
    pub clean: bool,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;

    pub fn new(code: u16, reason: impl Into<String>, clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            clean,
        }
    }

    /// Connection lost without a close handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL, reason, false)
    }

    /// Only a clean close with code 1000 counts as normal; anything else
    /// is eligible for reconnect.
    pub fn is_normal(&self) -> bool {
        self.code == Self::NORMAL && self.clean
    }
}

/// Frames written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Events read from the socket.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Error(TransportError),
    Closed(CloseInfo),
}

pub type SocketSink = Pin<Box<dyn Sink<Outbound, Error = TransportError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

/// One live connection. A stream that ends without `Inbound::Closed` is
/// treated as an abnormal close.
pub struct Socket {
    pub sink: SocketSink,
    pub stream: SocketStream,
}

impl Socket {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Outbound, Error = TransportError> + Send + 'static,
        R: Stream<Item = Inbound> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Opens sockets. Called once per connect and once per reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &WsConfig) -> Result<Socket, TransportError>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, config: &WsConfig) -> Result<Socket, TransportError> {
        let request = config.handshake_request()?;
        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|out: Outbound| future::ready(Ok::<_, TransportError>(to_message(out))));
        let stream = stream.filter_map(|item| future::ready(from_message(item)));
        Ok(Socket::new(sink, stream))
    }
}

fn to_message(out: Outbound) -> Message {
    match out {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_message(item: Result<Message, tungstenite::Error>) -> Option<Inbound> {
    match item {
        Ok(Message::Text(text)) => Some(Inbound::Text(text.to_string())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Inbound::Text(text)),
            Err(_) => {
                tracing::debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(frame)) => Some(Inbound::Closed(match frame {
            Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.to_string(), true),
            None => CloseInfo::new(CloseInfo::NO_STATUS, "", true),
        })),
        Ok(_) => None,
        Err(e) => Some(Inbound::Error(TransportError::WebSocket(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_classification() {
        assert!(CloseInfo::new(1000, "bye", true).is_normal());
        assert!(!CloseInfo::new(1000, "bye", false).is_normal());
        assert!(!CloseInfo::new(1001, "going away", true).is_normal());
        assert!(!CloseInfo::abnormal("dropped").is_normal());
    }

    #[test]
    fn outbound_close_carries_code_and_reason() {
        match to_message(Outbound::Close {
            code: 4000,
            reason: "done".into(),
        }) {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                assert_eq!(frame.reason, "done");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn inbound_mapping() {
        assert!(matches!(
            from_message(Ok(Message::Text("{}".into()))),
            Some(Inbound::Text(t)) if t == "{}"
        ));
        assert!(matches!(
            from_message(Ok(Message::Binary(b"[]".to_vec().into()))),
            Some(Inbound::Text(t)) if t == "[]"
        ));
        assert!(from_message(Ok(Message::Binary(vec![0xff, 0xfe].into()))).is_none());
        assert!(from_message(Ok(Message::Ping(vec![1].into()))).is_none());
        assert!(matches!(
            from_message(Ok(Message::Close(None))),
            Some(Inbound::Closed(info)) if info.code == CloseInfo::NO_STATUS && info.clean
        ));
        assert!(matches!(
            from_message(Err(tungstenite::Error::ConnectionClosed)),
            Some(Inbound::Error(TransportError::WebSocket(_)))
        ));
    }
}
