//! Send queue: requests issued while the socket is not yet writable.

use std::collections::VecDeque;

use tokio::time::Instant;
use wsrpc_core::error::TransportError;

use crate::registry::PendingRequest;

/// Opaque handle identifying one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// FIFO of requests waiting for the connection to open.
#[derive(Debug, Default)]
pub struct SendQueue {
    items: VecDeque<(QueueHandle, PendingRequest)>,
    next_handle: u64,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request; it will be written after everything already queued.
    pub fn enqueue(&mut self, request: PendingRequest) -> QueueHandle {
        let handle = self.next_handle();
        tracing::trace!(%handle, id = %request.id, "queued until open");
        self.items.push_back((handle, request));
        handle
    }

    /// Put previously written requests back ahead of everything queued,
    /// keeping their relative order.
    pub fn requeue_front(&mut self, requests: Vec<PendingRequest>) {
        for request in requests.into_iter().rev() {
            let handle = self.next_handle();
            self.items.push_front((handle, request));
        }
    }

    /// Take every queued request in enqueue order.
    pub fn flush(&mut self) -> Vec<PendingRequest> {
        self.items.drain(..).map(|(_, request)| request).collect()
    }

    /// Fail every queued request and empty the queue.
    pub fn fail_all(&mut self, mut error: impl FnMut() -> TransportError) -> usize {
        let drained = self.flush();
        let count = drained.len();
        for request in drained {
            request.resolve(Err(error()));
        }
        count
    }

    /// Earliest deadline among requeued requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.items.iter().filter_map(|(_, r)| r.deadline).min()
    }

    /// Time out every queued request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.items.len();
        let (expired, kept) = self
            .items
            .drain(..)
            .partition::<VecDeque<_>, _>(|(_, r)| r.is_expired(now));
        self.items = kept;
        for (_, request) in expired {
            request.time_out();
        }
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn next_handle(&mut self) -> QueueHandle {
        let handle = QueueHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use wsrpc_core::request::{JsonRpcRequest, RpcId, RpcPayload};

    fn request(id: u64) -> PendingRequest {
        let (tx, _rx) = oneshot::channel();
        let payload = RpcPayload::from(JsonRpcRequest::new(id, "m", vec![]));
        PendingRequest::new(RpcId::Number(id), payload, tx)
    }

    fn ids(requests: Vec<PendingRequest>) -> Vec<RpcId> {
        requests.into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn flush_is_fifo() {
        let mut q = SendQueue::new();
        let a = q.enqueue(request(1));
        let b = q.enqueue(request(2));
        q.enqueue(request(3));
        assert_ne!(a, b);
        assert_eq!(q.len(), 3);

        let out = ids(q.flush());
        assert_eq!(out, vec![RpcId::Number(1), RpcId::Number(2), RpcId::Number(3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn requeued_requests_go_first_in_order() {
        let mut q = SendQueue::new();
        q.enqueue(request(10));
        q.requeue_front(vec![request(1), request(2)]);
        let out = ids(q.flush());
        assert_eq!(out, vec![RpcId::Number(1), RpcId::Number(2), RpcId::Number(10)]);
    }

    #[test]
    fn requeued_deadline_expires_in_the_queue() {
        let mut q = SendQueue::new();
        let (tx, mut rx) = oneshot::channel();
        let payload = RpcPayload::from(JsonRpcRequest::new(1, "m", vec![]));
        let mut registry = crate::registry::RequestRegistry::new();
        registry
            .register(
                PendingRequest::new(RpcId::Number(1), payload, tx),
                Some(std::time::Duration::from_millis(50)),
            )
            .unwrap();
        q.requeue_front(registry.drain());
        q.enqueue(request(2));

        let deadline = q.next_deadline().unwrap();
        assert_eq!(q.expire(deadline - std::time::Duration::from_millis(1)), 0);
        assert_eq!(q.expire(deadline), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TransportError::Timeout { ms: 50 })
        ));
        assert_eq!(ids(q.flush()), vec![RpcId::Number(2)]);
        assert!(q.next_deadline().is_none());
    }

    #[test]
    fn fail_all_notifies_and_empties() {
        let mut q = SendQueue::new();
        let (tx, mut rx) = oneshot::channel();
        let payload = RpcPayload::from(JsonRpcRequest::new(4, "m", vec![]));
        q.enqueue(PendingRequest::new(RpcId::Number(4), payload, tx));
        q.enqueue(request(5));

        assert_eq!(q.fail_all(|| TransportError::ConnectionClosed {
            code: 1006,
            reason: "gone".into(),
        }), 2);
        assert!(q.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TransportError::ConnectionClosed { code: 1006, .. })
        ));
    }
}
