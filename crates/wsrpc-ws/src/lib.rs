//! wsrpc-ws: JSON-RPC over a persistent WebSocket.
//!
//! # Features
//! - Frame reassembly for coalesced or split inbound frames
//! - Request/response correlation by id, with per-request timeouts
//! - FIFO send queue while connecting, flushed on open
//! - Fixed-delay auto-reconnect after an abnormal close
//! - Event bus for lifecycle events and server pushes
//! - Push subscriptions (eth_subscribe / eth_unsubscribe)

pub mod client;
pub mod config;
pub mod events;
pub mod framing;
pub mod queue;
pub mod registry;
pub mod socket;
pub mod subscriptions;

pub use client::{ConnectionState, WsClient};
pub use config::WsConfig;
pub use events::{Channel, EventBus, EventStream, SubscriptionHandle, TransportEvent};
pub use framing::FrameAssembler;
pub use socket::{CloseInfo, Connector, Inbound, Outbound, Socket, TungsteniteConnector};
pub use subscriptions::{SubscriptionId, SubscriptionRegistry};
