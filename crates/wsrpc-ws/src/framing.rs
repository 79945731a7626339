//! Frame assembler: turns raw text chunks into whole JSON-RPC frames.
//!
//! The socket may coalesce several frames into one chunk or split one frame
//! across chunks. Values are delimited structurally with `serde_json`'s
//! streaming deserializer, so a `}{` inside a string never splits a frame.
//! A truncated tail is kept and prefixed to the next chunk; if no
//! continuation arrives before the frame timeout the tail is dropped and a
//! framing error is reported.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use wsrpc_core::error::TransportError;
use wsrpc_core::request::RpcMessage;

/// How long a partial frame may wait for its continuation.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on buffered partial data before it is treated as garbage.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Reassembles frames across chunk boundaries.
#[derive(Debug)]
pub struct FrameAssembler {
    timeout: Duration,
    last_chunk: Option<String>,
    deadline: Option<Instant>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_TIMEOUT)
    }
}

impl FrameAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_chunk: None,
            deadline: None,
        }
    }

    /// Feed one inbound chunk; returns every frame completed by it, in order.
    ///
    /// Unrecoverable garbage is reported inline as `TransportError::Framing`
    /// and skipped up to the next `{` or `[`.
    pub fn ingest(&mut self, chunk: &str) -> Vec<Result<RpcMessage, TransportError>> {
        let mut buf = self.last_chunk.take().unwrap_or_default();
        buf.push_str(chunk);

        let mut out = Vec::new();
        let mut garbage: Option<(usize, usize, String)> = None;
        let mut pos = 0;

        while pos < buf.len() {
            let rest = &buf[pos..];
            let mut values = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            match values.next() {
                None => pos = buf.len(),
                Some(Ok(value)) => {
                    let consumed = values.byte_offset();
                    if let Some(err) = flush_garbage(&buf, garbage.take()) {
                        out.push(Err(err));
                    }
                    out.push(into_message(value, &rest[..consumed]));
                    pos += consumed;
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    let skip = resync_offset(rest);
                    garbage = match garbage {
                        Some((start, _, reason)) => Some((start, pos + skip, reason)),
                        None => Some((pos, pos + skip, err.to_string())),
                    };
                    pos += skip;
                }
            }
        }

        if let Some(err) = flush_garbage(&buf, garbage) {
            out.push(Err(err));
        }

        let tail = &buf[pos..];
        if tail.trim().is_empty() {
            self.clear();
        } else if tail.len() > MAX_PENDING_BYTES {
            tracing::warn!(bytes = tail.len(), "partial frame exceeds buffer limit, dropping");
            out.push(Err(TransportError::framing(
                "partial frame exceeds buffer limit",
                preview(tail),
            )));
            self.clear();
        } else {
            tracing::trace!(bytes = tail.len(), "buffering partial frame");
            self.last_chunk = Some(tail.to_owned());
            self.deadline = Some(Instant::now() + self.timeout);
        }

        out
    }

    /// When the buffered tail expires, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The buffered partial frame, if any.
    pub fn pending(&self) -> Option<&str> {
        self.last_chunk.as_deref()
    }

    /// Drop the buffered tail once its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<TransportError> {
        if self.deadline.map_or(true, |deadline| now < deadline) {
            return None;
        }
        let tail = self.last_chunk.take().unwrap_or_default();
        self.deadline = None;
        tracing::warn!(bytes = tail.len(), "partial frame timed out");
        Some(TransportError::framing("incomplete frame timed out", tail))
    }

    /// Forget any buffered data and cancel the timer.
    pub fn clear(&mut self) {
        self.last_chunk = None;
        self.deadline = None;
    }
}

fn into_message(value: Value, raw: &str) -> Result<RpcMessage, TransportError> {
    match value {
        Value::Object(_) | Value::Array(_) => serde_json::from_value(value)
            .map_err(|e| TransportError::framing(e.to_string(), preview(raw))),
        _ => Err(TransportError::framing(
            "top-level value is not a JSON-RPC object or batch",
            preview(raw),
        )),
    }
}

/// Offset of the next plausible frame start after the first character.
fn resync_offset(rest: &str) -> usize {
    rest.char_indices()
        .skip(1)
        .find(|(_, c)| matches!(c, '{' | '['))
        .map_or(rest.len(), |(i, _)| i)
}

fn flush_garbage(buf: &str, garbage: Option<(usize, usize, String)>) -> Option<TransportError> {
    let (start, end, reason) = garbage?;
    let discarded = &buf[start..end];
    tracing::warn!(bytes = discarded.len(), %reason, "discarding unparsable data");
    Some(TransportError::framing(reason, preview(discarded)))
}

fn preview(text: &str) -> String {
    const MAX: usize = 256;
    match text.char_indices().nth(MAX) {
        Some((i, _)) => format!("{}...", &text[..i]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsrpc_core::request::RpcId;

    fn ok(results: Vec<Result<RpcMessage, TransportError>>) -> Vec<RpcMessage> {
        results
            .into_iter()
            .map(|r| r.expect("unexpected framing error"))
            .collect()
    }

    fn ids(messages: &[RpcMessage]) -> Vec<RpcId> {
        messages
            .iter()
            .map(|m| m.correlation_id().cloned().unwrap_or(RpcId::Null))
            .collect()
    }

    #[test]
    fn single_frame() {
        let mut fa = FrameAssembler::default();
        let out = ok(fa.ingest(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#));
        assert_eq!(ids(&out), vec![RpcId::Number(1)]);
        assert!(fa.pending().is_none());
        assert!(fa.deadline().is_none());
    }

    #[test]
    fn splits_all_four_boundary_patterns() {
        let text = concat!(
            r#"{"jsonrpc":"2.0","id":1,"result":1}"#,
            r#"{"jsonrpc":"2.0","id":2,"result":2}"#,
            "\n",
            r#"[{"jsonrpc":"2.0","id":3,"result":3}]"#,
            r#"{"jsonrpc":"2.0","id":4,"result":4}"#,
            "\r",
            r#"[{"jsonrpc":"2.0","id":5,"result":5}]"#,
            r#"[{"jsonrpc":"2.0","id":6,"result":6}]"#,
        );
        let mut fa = FrameAssembler::default();
        let out = ok(fa.ingest(text));
        assert_eq!(ids(&out), (1..=6).map(RpcId::Number).collect::<Vec<_>>());
        assert!(matches!(out[2], RpcMessage::Batch(_)));
    }

    #[test]
    fn braces_inside_strings_do_not_split() {
        let mut fa = FrameAssembler::default();
        let out = ok(fa.ingest(r#"{"jsonrpc":"2.0","id":9,"result":"}{ \"}[{\" ]["}"#));
        assert_eq!(out.len(), 1);
        match &out[0] {
            RpcMessage::Single(m) => assert_eq!(m.result.as_ref().unwrap(), r#"}{ "}[{" ]["#),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fragmented_frame_is_reassembled_once() {
        let frame = r#"{"jsonrpc":"2.0","id":42,"result":{"hash":"0xabc"}}"#;
        let (head, tail) = frame.split_at(17);
        let mut fa = FrameAssembler::default();

        assert!(fa.ingest(head).is_empty());
        assert_eq!(fa.pending(), Some(head));
        assert!(fa.deadline().is_some());

        let out = ok(fa.ingest(tail));
        assert_eq!(ids(&out), vec![RpcId::Number(42)]);
        assert!(fa.pending().is_none());
        assert!(fa.deadline().is_none());
    }

    #[test]
    fn split_across_three_chunks_with_trailing_frame() {
        let mut fa = FrameAssembler::default();
        assert!(fa.ingest(r#"{"jsonrpc":"2.0","#).is_empty());
        assert!(fa.ingest(r#""id":1,"resu"#).is_empty());
        let out = ok(fa.ingest(r#"lt":true}{"jsonrpc":"2.0","id":2,"result":false}"#));
        assert_eq!(ids(&out), vec![RpcId::Number(1), RpcId::Number(2)]);
    }

    #[test]
    fn complete_frame_followed_by_partial() {
        let mut fa = FrameAssembler::default();
        let out = ok(fa.ingest(r#"{"jsonrpc":"2.0","id":1,"result":1}{"jsonrpc":"#));
        assert_eq!(out.len(), 1);
        assert_eq!(fa.pending(), Some(r#"{"jsonrpc":"#));
    }

    #[test]
    fn whitespace_only_chunk_yields_nothing() {
        let mut fa = FrameAssembler::default();
        assert!(fa.ingest("  \r\n ").is_empty());
        assert!(fa.pending().is_none());
    }

    #[test]
    fn garbage_is_reported_once_and_skipped() {
        let mut fa = FrameAssembler::default();
        let out = fa.ingest(r#"nonsense, more nonsense {"jsonrpc":"2.0","id":3,"result":3}"#);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(TransportError::Framing { .. })));
        let msg = out.into_iter().nth(1).unwrap().unwrap();
        assert_eq!(msg.correlation_id(), Some(&RpcId::Number(3)));
        assert!(fa.pending().is_none());
    }

    #[test]
    fn scalar_top_level_value_is_a_framing_error() {
        let mut fa = FrameAssembler::default();
        let out = fa.ingest(r#""just a string""#);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(TransportError::Framing { .. })));
    }

    #[test]
    fn expire_before_deadline_is_a_no_op() {
        let mut fa = FrameAssembler::new(Duration::from_secs(15));
        fa.ingest(r#"{"jsonrpc":"2.0","id":1"#);
        let deadline = fa.deadline().unwrap();
        assert!(fa.expire(deadline - Duration::from_millis(1)).is_none());
        assert!(fa.pending().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_tail_times_out_once() {
        let mut fa = FrameAssembler::default();
        fa.ingest(r#"{"jsonrpc":"2.0","id":7,"res"#);

        tokio::time::advance(DEFAULT_FRAME_TIMEOUT).await;
        let err = fa.expire(Instant::now()).expect("framing error");
        match err {
            TransportError::Framing { discarded, .. } => {
                assert_eq!(discarded, r#"{"jsonrpc":"2.0","id":7,"res"#)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(fa.pending().is_none());
        assert!(fa.deadline().is_none());
        assert!(fa.expire(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_data_restarts_the_timer() {
        let mut fa = FrameAssembler::new(Duration::from_secs(15));
        fa.ingest(r#"{"jsonrpc":"2.0","#);
        let first = fa.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        fa.ingest(r#""id":1,"#);
        let second = fa.deadline().unwrap();
        assert!(second > first);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(fa.expire(Instant::now()).is_none());
        let out = ok(fa.ingest(r#""result":null}"#));
        assert_eq!(ids(&out), vec![RpcId::Number(1)]);
    }
}
