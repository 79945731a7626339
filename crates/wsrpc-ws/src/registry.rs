//! Request registry: in-flight requests keyed by correlation id.
//!
//! Every entry owns a single-fire `oneshot` sink. Removing the entry from
//! the map is the only way to reach the sink, so completion, timeout and
//! connection failure can never both fire for the same request.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use wsrpc_core::error::TransportError;
use wsrpc_core::request::{RpcId, RpcMessage, RpcPayload};

/// Sink a caller awaits for its response.
pub type ResponseSender = oneshot::Sender<Result<RpcMessage, TransportError>>;

/// A request owned either by the send queue (not yet written) or by the
/// registry (written, awaiting a response).
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RpcId,
    pub payload: RpcPayload,
    pub enqueued_at: Instant,
    /// Armed when the request is first written; survives a requeue.
    pub deadline: Option<Instant>,
    timeout: Option<Duration>,
    sink: ResponseSender,
}

impl PendingRequest {
    pub fn new(id: RpcId, payload: RpcPayload, sink: ResponseSender) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Instant::now(),
            deadline: None,
            timeout: None,
            sink,
        }
    }

    /// The caller stopped waiting (its future was dropped).
    pub fn is_abandoned(&self) -> bool {
        self.sink.is_closed()
    }

    /// Whether the armed deadline is at or before `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Resolve with the timeout error for the duration that was armed.
    pub fn time_out(self) {
        let ms = self.timeout.unwrap_or_default().as_millis() as u64;
        tracing::debug!(id = %self.id, ms, "request timed out");
        self.resolve(Err(TransportError::Timeout { ms }));
    }

    /// Deliver the terminal outcome. Consumes the request, so it fires once.
    pub fn resolve(self, outcome: Result<RpcMessage, TransportError>) {
        if self.sink.send(outcome).is_err() {
            tracing::trace!(id = %self.id, "caller gone before completion");
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    request: PendingRequest,
}

/// Correlation-id keyed map of requests already written to the socket.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<RpcId, Entry>,
    next_seq: u64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a written request, arming `timeout` unless a deadline is
    /// already set. Hands the request back if its id is already in flight.
    pub fn register(
        &mut self,
        mut request: PendingRequest,
        timeout: Option<Duration>,
    ) -> Result<(), PendingRequest> {
        if self.pending.contains_key(&request.id) {
            return Err(request);
        }
        if request.deadline.is_none() {
            request.timeout = timeout;
            request.deadline = timeout.map(|t| Instant::now() + t);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(request.id.clone(), Entry { seq, request });
        Ok(())
    }

    /// Deliver `message` to the request it answers.
    ///
    /// Returns the message back when no pending request claims it, so the
    /// caller can route it elsewhere.
    pub fn complete(&mut self, message: RpcMessage) -> Option<RpcMessage> {
        let Some(entry) = message
            .correlation_id()
            .and_then(|id| self.pending.remove(id))
        else {
            return Some(message);
        };
        tracing::trace!(
            id = %entry.request.id,
            elapsed_ms = entry.request.enqueued_at.elapsed().as_millis() as u64,
            "request completed"
        );
        entry.request.resolve(Ok(message));
        None
    }

    /// Fail one request. Returns `false` if `id` was not pending.
    pub fn fail(&mut self, id: &RpcId, error: TransportError) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                entry.request.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request, returning how many were failed.
    pub fn fail_all(&mut self, mut error: impl FnMut() -> TransportError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for request in drained {
            request.resolve(Err(error()));
        }
        count
    }

    /// Remove every pending request in the order they were registered.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        let mut entries: Vec<Entry> = self.pending.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.request).collect()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|e| e.request.deadline).min()
    }

    /// Fail every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<RpcId> = self
            .pending
            .iter()
            .filter(|(_, e)| e.request.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                entry.request.time_out();
            }
        }
        expired.len()
    }

    pub fn contains(&self, id: &RpcId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
