//! WebSocket JSON-RPC client with request correlation, send queueing and
//! auto-reconnect.
//!
//! A background task owns the socket and every piece of mutable state
//! (connection state, send queue, request registry, frame buffer). The
//! [`WsClient`] handle only talks to it through a command channel, so no
//! field is ever touched from two tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use wsrpc_core::error::TransportError;
use wsrpc_core::policy::ReconnectPolicy;
use wsrpc_core::request::{JsonRpcRequest, JsonRpcResponse, RpcMessage, RpcPayload};
use wsrpc_core::transport::{HealthStatus, RpcTransport};

use crate::config::WsConfig;
use crate::events::{Channel, EventBus, EventStream, SubscriptionHandle, TransportEvent};
use crate::framing::FrameAssembler;
use crate::queue::SendQueue;
use crate::registry::{PendingRequest, RequestRegistry, ResponseSender};
use crate::socket::{CloseInfo, Connector, Inbound, Outbound, Socket, TungsteniteConnector};
use crate::subscriptions::{SubscriptionId, SubscriptionRegistry};

/// How long to wait for the server to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Command sent from callers to the background task.
enum Command {
    Connect,
    Disconnect { code: u16, reason: String },
    Send { payload: RpcPayload, tx: ResponseSender },
    Reset,
}

/// WebSocket JSON-RPC client.
///
/// Created in [`ConnectionState::Disconnected`]; call [`WsClient::connect`]
/// (or build with [`WsClient::connect_to`]). Dropping the client closes the
/// socket and fails outstanding requests with [`TransportError::Shutdown`].
pub struct WsClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    bus: EventBus,
    subscriptions: SubscriptionRegistry,
    next_id: AtomicU64,
}

impl WsClient {
    /// Build a client backed by `tokio-tungstenite`. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: WsConfig) -> Result<Self, TransportError> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    /// Build a client that opens its sockets through `connector`.
    pub fn with_connector(
        config: WsConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        let url = config.endpoint()?.url.to_string();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let bus = EventBus::new();

        let task = ConnectionTask::new(config, connector, state_tx, bus.clone());
        tokio::spawn(task.run(cmd_rx));

        Ok(Self {
            url,
            cmd_tx,
            state_rx,
            bus,
            subscriptions: SubscriptionRegistry::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Build a client and start connecting immediately.
    pub fn connect_to(config: WsConfig) -> Result<Self, TransportError> {
        let client = Self::new(config)?;
        client.connect()?;
        Ok(client)
    }

    /// Start connecting. Ignored unless disconnected or waiting to reconnect
    /// (in which case the reconnect happens now).
    pub fn connect(&self) -> Result<(), TransportError> {
        self.command(Command::Connect)
    }

    /// Connect and wait until the socket is open.
    ///
    /// Fails with the close that ended the attempt if the client gives up
    /// and returns to `Disconnected` instead.
    pub async fn connect_and_wait(&self) -> Result<(), TransportError> {
        let mut closes = self.bus.subscribe(Channel::Close);
        let mut state_rx = self.state_rx.clone();
        if *state_rx.borrow_and_update() == ConnectionState::Open {
            return Ok(());
        }
        self.connect()?;

        loop {
            state_rx.changed().await.map_err(|_| TransportError::Shutdown)?;
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Disconnected => {
                    let mut last = None;
                    while let Some(event) = closes.try_recv() {
                        if let TransportEvent::Close(info) = event {
                            last = Some(info);
                        }
                    }
                    let info = last.unwrap_or_else(|| CloseInfo::abnormal("connect failed"));
                    return Err(TransportError::ConnectionClosed {
                        code: info.code,
                        reason: info.reason,
                    });
                }
                _ => {}
            }
        }
    }

    /// Close the connection with `code` and `reason`. No reconnect follows.
    pub fn disconnect(&self, code: u16, reason: impl Into<String>) -> Result<(), TransportError> {
        self.command(Command::Disconnect {
            code,
            reason: reason.into(),
        })
    }

    /// Fail every queued and in-flight request with [`TransportError::Reset`],
    /// drop any partial frame and every event subscriber. The socket stays up.
    ///
    /// Push subscriptions are forgotten too, since their streams end with the
    /// subscribers.
    pub fn reset(&self) -> Result<(), TransportError> {
        self.command(Command::Reset)?;
        let forgotten = self.subscriptions.clear();
        if forgotten > 0 {
            tracing::debug!(forgotten, "push subscriptions dropped on reset");
        }
        Ok(())
    }

    /// Send one request or a batch and wait for the correlated response.
    ///
    /// Written immediately when open, queued while connecting or
    /// reconnecting, rejected with [`TransportError::NotConnected`] otherwise.
    pub async fn send(&self, payload: impl Into<RpcPayload>) -> Result<RpcMessage, TransportError> {
        self.dispatch(payload.into()).await
    }

    /// Call `method` with a client-assigned id and return its `result`.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        self.send(req)
            .await?
            .into_response()?
            .into_result()
            .map_err(TransportError::Rpc)
    }

    /// Listen on one event bus channel.
    pub fn subscribe(&self, channel: Channel) -> EventStream {
        self.bus.subscribe(channel)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Open a server push subscription with `eth_subscribe`.
    ///
    /// Notifications that arrive before the subscription id is known are
    /// carried over into the returned stream.
    pub async fn subscribe_to(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, EventStream), TransportError> {
        let early = self.bus.subscribe(Channel::Data);
        let call_params = std::iter::once(Value::String(kind.to_string()))
            .chain(params.iter().cloned())
            .collect();
        let id: String = serde_json::from_value(self.request("eth_subscribe", call_params).await?)?;

        let stream = self.bus.transfer(early, Channel::Subscription(id.clone()), |event| {
            matches!(event, TransportEvent::Data(msg) if msg.subscription_id() == Some(id.as_str()))
        });
        let sub_id = SubscriptionId(id);
        tracing::debug!(id = %sub_id, kind, "subscribed");
        self.subscriptions
            .register(sub_id.clone(), kind.to_string(), params);
        Ok((sub_id, stream))
    }

    /// Cancel a push subscription with `eth_unsubscribe`. Returns the
    /// server's answer.
    pub async fn unsubscribe_from(&self, id: &SubscriptionId) -> Result<bool, TransportError> {
        let result = self
            .request("eth_unsubscribe", vec![Value::String(id.0.clone())])
            .await?;
        self.subscriptions.remove(id);
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Push subscriptions opened through [`WsClient::subscribe_to`].
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), TransportError> {
        let mut state_rx = self.state_rx.clone();
        state_rx
            .wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Shutdown)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Always `true`: the server can push over the open socket.
    pub fn supports_subscriptions(&self) -> bool {
        true
    }

    /// The endpoint with credentials removed.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command(&self, cmd: Command) -> Result<(), TransportError> {
        self.cmd_tx.send(cmd).map_err(|_| TransportError::Shutdown)
    }

    async fn dispatch(&self, payload: RpcPayload) -> Result<RpcMessage, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Send { payload, tx })?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RpcTransport for WsClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.dispatch(req.into()).await?.into_response()
    }

    /// One batch frame; the responses come back as one array.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.dispatch(reqs.into()).await?.into_responses())
    }

    fn health(&self) -> HealthStatus {
        match self.state() {
            ConnectionState::Open => HealthStatus::Healthy,
            ConnectionState::Connecting | ConnectionState::Reconnecting => HealthStatus::Degraded,
            ConnectionState::Closing | ConnectionState::Disconnected => HealthStatus::Unhealthy,
        }
    }

    fn supports_subscriptions(&self) -> bool {
        true
    }

    fn url(&self) -> &str {
        &self.url
    }
}

type Dial = BoxFuture<'static, Result<Socket, TransportError>>;

/// Background task that owns the WebSocket connection.
struct ConnectionTask {
    config: WsConfig,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    url: String,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    bus: EventBus,
    frames: FrameAssembler,
    registry: RequestRegistry,
    queue: SendQueue,
    socket: Option<Socket>,
    dialing: Option<Dial>,
    /// Reconnect timer while `Reconnecting`, close-handshake timer while `Closing`.
    wake_at: Option<Instant>,
    attempts: u32,
}

impl ConnectionTask {
    fn new(
        config: WsConfig,
        connector: Arc<dyn Connector>,
        state_tx: watch::Sender<ConnectionState>,
        bus: EventBus,
    ) -> Self {
        Self {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            url: config.redacted_url(),
            frames: FrameAssembler::new(config.frame_timeout),
            config,
            connector,
            state: ConnectionState::Disconnected,
            state_tx,
            bus,
            registry: RequestRegistry::new(),
            queue: SendQueue::new(),
            socket: None,
            dialing: None,
            wake_at: None,
            attempts: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let frame_deadline = self.frames.deadline();
            let request_deadline =
                earliest(self.registry.next_deadline(), self.queue.next_deadline());
            let wake_at = self.wake_at;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                result = dialed(&mut self.dialing) => {
                    self.dialing = None;
                    self.on_dialed(result).await;
                }
                inbound = next_inbound(&mut self.socket) => self.on_inbound(inbound),
                _ = sleep_until(wake_at) => self.on_wake(),
                _ = sleep_until(frame_deadline) => {
                    if let Some(err) = self.frames.expire(Instant::now()) {
                        self.publish_error(err);
                    }
                }
                _ = sleep_until(request_deadline) => {
                    let now = Instant::now();
                    self.registry.expire(now);
                    self.queue.expire(now);
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect { code, reason } => self.disconnect(code, reason).await,
            Command::Send { payload, tx } => self.send(payload, tx).await,
            Command::Reset => self.reset(),
        }
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempts = 0;
                self.dial();
            }
            ConnectionState::Reconnecting => {
                self.wake_at = None;
                self.dial();
            }
            state => tracing::debug!(%state, "connect ignored"),
        }
    }

    fn dial(&mut self) {
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.url, attempt = self.attempts, "connecting via WebSocket");
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        self.dialing = Some(async move { connector.connect(&config).await }.boxed());
    }

    async fn on_dialed(&mut self, dialed: Result<Socket, TransportError>) {
        match dialed {
            Ok(socket) => {
                tracing::info!(url = %self.url, "WebSocket connected");
                self.socket = Some(socket);
                self.attempts = 0;
                self.set_state(ConnectionState::Open);
                self.flush().await;
                self.bus.publish(&Channel::Open, TransportEvent::Open);
            }
            Err(err) => {
                tracing::warn!(url = %self.url, error = %err, "WebSocket connect failed");
                let reason = err.to_string();
                self.publish_error(err);
                self.on_close(CloseInfo::abnormal(reason));
            }
        }
    }

    async fn send(&mut self, payload: RpcPayload, tx: ResponseSender) {
        let Some(id) = payload.correlation_id().cloned() else {
            let _ = tx.send(Err(TransportError::InvalidRequest(
                "payload has no usable id".into(),
            )));
            return;
        };
        let request = PendingRequest::new(id, payload, tx);
        match self.state {
            ConnectionState::Open => self.write(request).await,
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.queue.enqueue(request);
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {
                request.resolve(Err(TransportError::NotConnected));
            }
        }
    }

    async fn flush(&mut self) {
        self.queue.expire(Instant::now());
        let queued = self.queue.flush();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "flushing send queue");
        }
        for request in queued {
            if request.is_abandoned() {
                tracing::trace!(id = %request.id, "skipping abandoned request");
                continue;
            }
            self.write(request).await;
        }
    }

    /// Register `request` and put it on the wire.
    async fn write(&mut self, request: PendingRequest) {
        let text = match request.payload.to_text() {
            Ok(text) => text,
            Err(err) => return request.resolve(Err(err)),
        };
        let id = request.id.clone();
        let method = request.payload.method().to_owned();
        if let Err(request) = self.registry.register(request, self.config.timeout) {
            return request.resolve(Err(TransportError::InvalidRequest(format!(
                "id {id} is already in flight"
            ))));
        }

        let Some(socket) = self.socket.as_mut() else {
            self.registry.fail(&id, TransportError::NotConnected);
            return;
        };
        tracing::trace!(%id, method = %method, "writing request");
        if let Err(err) = socket.sink.send(Outbound::Text(text)).await {
            tracing::warn!(%id, error = %err, "WebSocket write failed");
            self.registry.fail(&id, err);
        }
    }

    fn on_inbound(&mut self, inbound: Option<Inbound>) {
        match inbound {
            Some(Inbound::Text(text)) => {
                for frame in self.frames.ingest(&text) {
                    match frame {
                        Ok(message) => self.route(message),
                        Err(err) => {
                            tracing::warn!(error = %err, "discarding malformed inbound data");
                            self.publish_error(err);
                        }
                    }
                }
            }
            Some(Inbound::Error(err)) => {
                tracing::warn!(error = %err, "WS receive error");
                self.publish_error(err);
            }
            Some(Inbound::Closed(info)) => self.on_close(info),
            None => self.on_close(CloseInfo::abnormal("connection lost")),
        }
    }

    fn route(&mut self, message: RpcMessage) {
        let Some(message) = self.registry.complete(message) else {
            return;
        };
        if !message.is_notification() {
            tracing::debug!(id = ?message.correlation_id(), "dropping unmatched response");
            return;
        }
        match message.subscription_id() {
            Some(id) => {
                let channels = [Channel::Subscription(id.to_owned()), Channel::Data];
                self.bus.publish_all(&channels, TransportEvent::Data(message));
            }
            None => {
                self.bus.publish(&Channel::Data, TransportEvent::Data(message));
            }
        }
    }

    fn on_close(&mut self, info: CloseInfo) {
        self.socket = None;
        self.dialing = None;
        self.wake_at = None;
        self.frames.clear();
        tracing::info!(
            code = info.code,
            reason = %info.reason,
            clean = info.clean,
            "WebSocket closed"
        );

        if self.state == ConnectionState::Closing || info.is_normal() {
            return self.finish(info);
        }

        self.attempts += 1;
        let Some(delay) = self.policy.next_delay(self.attempts) else {
            if self.policy.config.auto_reconnect {
                tracing::warn!(attempts = self.attempts - 1, "giving up reconnecting");
            }
            return self.finish(info);
        };

        let in_flight = self.registry.drain();
        if !in_flight.is_empty() {
            tracing::debug!(count = in_flight.len(), "requeueing in-flight requests");
        }
        self.queue.requeue_front(in_flight);
        self.set_state(ConnectionState::Reconnecting);
        self.bus.publish(&Channel::Close, TransportEvent::Close(info));
        tracing::warn!(
            url = %self.url,
            attempt = self.attempts,
            "WS disconnected, reconnecting in {delay:?}"
        );
        self.wake_at = Some(Instant::now() + delay);
    }

    /// Settle in `Disconnected`, failing everything still waiting.
    fn finish(&mut self, info: CloseInfo) {
        self.socket = None;
        self.dialing = None;
        self.wake_at = None;
        self.frames.clear();
        self.set_state(ConnectionState::Disconnected);

        let error = || TransportError::ConnectionClosed {
            code: info.code,
            reason: info.reason.clone(),
        };
        let queued = self.queue.fail_all(error);
        let in_flight = self.registry.fail_all(error);
        if queued + in_flight > 0 {
            tracing::debug!(queued, in_flight, "failed pending requests on close");
        }
        self.bus.publish(&Channel::Close, TransportEvent::Close(info));
    }

    fn on_wake(&mut self) {
        self.wake_at = None;
        match self.state {
            ConnectionState::Reconnecting => self.dial(),
            ConnectionState::Closing => {
                tracing::warn!("close handshake timed out");
                self.finish(CloseInfo::abnormal("close handshake timed out"));
            }
            _ => {}
        }
    }

    async fn disconnect(&mut self, code: u16, reason: String) {
        match self.state {
            ConnectionState::Open => {
                self.set_state(ConnectionState::Closing);
                let sent = match self.socket.as_mut() {
                    Some(socket) => {
                        let frame = Outbound::Close {
                            code,
                            reason: reason.clone(),
                        };
                        socket.sink.send(frame).await
                    }
                    None => Err(TransportError::NotConnected),
                };
                match sent {
                    Ok(()) => self.wake_at = Some(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT),
                    Err(err) => {
                        tracing::debug!(error = %err, "close frame not sent");
                        self.on_close(CloseInfo::new(code, reason, false));
                    }
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.finish(CloseInfo::new(code, reason, true));
            }
            state => tracing::debug!(%state, "disconnect ignored"),
        }
    }

    fn reset(&mut self) {
        let queued = self.queue.fail_all(|| TransportError::Reset);
        let in_flight = self.registry.fail_all(|| TransportError::Reset);
        self.frames.clear();
        self.bus.clear();
        tracing::info!(queued, in_flight, "transport reset");
    }

    async fn shutdown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let close = async {
                let frame = Outbound::Close {
                    code: CloseInfo::NORMAL,
                    reason: "client dropped".into(),
                };
                socket.sink.send(frame).await?;
                socket.sink.close().await?;
                Ok::<_, TransportError>(())
            };
            match time::timeout(CLOSE_HANDSHAKE_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "close on shutdown failed"),
                Err(_) => tracing::debug!("close on shutdown timed out"),
            }
        }
        self.queue.fail_all(|| TransportError::Shutdown);
        self.registry.fail_all(|| TransportError::Shutdown);
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(url = %self.url, "connection task stopped");
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "connection state");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn publish_error(&self, err: TransportError) {
        self.bus
            .publish(&Channel::Error, TransportEvent::Error(Arc::new(err)));
    }
}

async fn dialed(dialing: &mut Option<Dial>) -> Result<Socket, TransportError> {
    match dialing {
        Some(dial) => dial.await,
        None => future::pending().await,
    }
}

/// Next socket event; `None` once the stream has ended.
async fn next_inbound(socket: &mut Option<Socket>) -> Option<Inbound> {
    match socket {
        Some(socket) => socket.stream.next().await,
        None => future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
