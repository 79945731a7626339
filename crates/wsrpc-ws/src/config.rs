//! Connection options.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use url::Url;

use wsrpc_core::error::TransportError;
use wsrpc_core::policy::ReconnectConfig;

use crate::framing::DEFAULT_FRAME_TIMEOUT;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// `ws://` or `wss://` endpoint. `user:pass@` userinfo becomes a Basic
    /// `Authorization` header and is not sent as part of the URL.
    pub url: String,
    /// Per-request response deadline, armed when the request is written.
    pub timeout: Option<Duration>,
    /// Behaviour after an abnormal close.
    pub reconnect: ReconnectConfig,
    /// Extra handshake headers. A derived Basic auth header wins over an
    /// `authorization` entry here.
    pub headers: Vec<(String, String)>,
    /// Sub-protocol sent as `Sec-WebSocket-Protocol`.
    pub protocol: Option<String>,
    /// How long a partial frame may wait for the rest of its data.
    pub frame_timeout: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: None,
            reconnect: ReconnectConfig::default(),
            headers: Vec::new(),
            protocol: None,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reconnect after a fixed `delay`, forever.
    pub fn with_auto_reconnect(self, delay: Duration) -> Self {
        self.with_reconnect(ReconnectConfig::fixed(delay))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Parse the URL, splitting off any credentials.
    pub fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let mut url = Url::parse(&self.url).map_err(|e| {
            TransportError::InvalidConfig(format!("invalid URL {:?}: {e}", self.url))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported scheme {:?}, expected ws or wss",
                url.scheme()
            )));
        }

        let authorization = if url.username().is_empty() {
            None
        } else {
            let user = decode_userinfo(url.username())?;
            let pass = decode_userinfo(url.password().unwrap_or_default())?;
            Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
        };
        // Cannot fail for ws/wss URLs, which always have a host.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Endpoint { url, authorization })
    }

    /// URL safe to log: credentials removed.
    pub fn redacted_url(&self) -> String {
        self.endpoint()
            .map(|e| e.url.to_string())
            .unwrap_or_else(|_| self.url.clone())
    }

    /// Build the client handshake request with all configured headers.
    pub fn handshake_request(&self) -> Result<Request, TransportError> {
        let endpoint = self.endpoint()?;
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidConfig(format!("header {name:?}: {e}")))?;
            headers.insert(name, header_value(value)?);
        }
        if let Some(auth) = &endpoint.authorization {
            headers.insert(header::AUTHORIZATION, header_value(auth)?);
        }
        if let Some(protocol) = &self.protocol {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, header_value(protocol)?);
        }
        Ok(request)
    }
}

/// A parsed endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// URL without userinfo.
    pub url: Url,
    /// `Basic ...` value derived from the userinfo, if present.
    pub authorization: Option<String>,
}

fn decode_userinfo(raw: &str) -> Result<String, TransportError> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| TransportError::InvalidConfig(format!("URL credentials: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidConfig(format!("header value: {e}")))
}
