//! wsrpc-core: foundation traits and types for wsrpc.
//!
//! # Overview
//!
//! wsrpc is a JSON-RPC 2.0 client transport for persistent WebSocket
//! connections. The core crate defines:
//!
//! - [`RpcTransport`]: the async trait request-shaping layers call into
//! - [`JsonRpcRequest`] / [`RpcPayload`]: outbound wire types
//! - [`JsonRpcMessage`] / [`RpcMessage`]: inbound frames (responses and pushes)
//! - [`TransportError`]: structured error type
//! - [`HealthStatus`]: transport liveness
//! - [`policy`] module: reconnect policy

pub mod error;
pub mod policy;
pub mod request;
pub mod transport;

pub use error::TransportError;
pub use policy::{ReconnectConfig, ReconnectPolicy};
pub use request::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RpcId, RpcMessage, RpcParam,
    RpcPayload,
};
pub use transport::{HealthStatus, RpcTransport};
