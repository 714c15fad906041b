//! Incremental decoder for `text/event-stream` bodies.
//!
//! Frames end at a blank line. Each frame is decoded as UTF-8 on its own, so
//! a corrupted frame is dropped without losing its neighbours even when they
//! arrived in the same network chunk.

use crate::error::GatewayError;
use bytes::{Buf, BytesMut};
use futures_util::{Stream, StreamExt};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

impl UpstreamEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: "message".to_string(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// A reconnection hint with no payload.
    pub fn is_retry_hint(&self) -> bool {
        self.retry.is_some() && self.data.is_empty()
    }
}

/// Frames larger than this are dropped instead of buffered.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already searched for the end of the current frame.
    scanned: usize,
    /// Start of the line under the cursor; `None` when its head was discarded.
    line_start: Option<usize>,
    /// Set while skipping the tail of an oversized frame.
    discarding: bool,
    max_frame_bytes: usize,
    eof: bool,
    dropped: u64,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            line_start: Some(0),
            discarding: false,
            max_frame_bytes,
            eof: false,
            dropped: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Marks the input as complete so a trailing unterminated frame is emitted.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Bytes held for the frame in progress.
    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn next_event(&mut self) -> Option<UpstreamEvent> {
        loop {
            let (content_end, consumed) = match self.scan() {
                Some(split) => split,
                None if self.eof && !self.buf.is_empty() => (self.buf.len(), self.buf.len()),
                None => {
                    if !self.discarding && self.buf.len() > self.max_frame_bytes {
                        self.drop_frame(GatewayError::Parse(format!(
                            "frame exceeds {} bytes",
                            self.max_frame_bytes
                        )));
                        self.discarding = true;
                    }
                    if self.discarding {
                        self.discard_scanned();
                    }
                    return None;
                }
            };
            let frame = self.buf.split_to(consumed);
            self.scanned = 0;
            self.line_start = Some(0);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let content = &frame[..content_end];
            if content.len() > self.max_frame_bytes {
                self.drop_frame(GatewayError::Parse(format!(
                    "frame of {} bytes exceeds {} bytes",
                    content.len(),
                    self.max_frame_bytes
                )));
                continue;
            }
            let text = match std::str::from_utf8(content) {
                Ok(text) => text,
                Err(err) => {
                    self.drop_frame(GatewayError::Parse(format!("invalid utf-8: {err}")));
                    continue;
                }
            };
            if let Some(event) = parse_frame(text) {
                return Some(event);
            }
        }
    }

    /// Resumes the search for a blank line where the previous call stopped.
    /// Returns `(content_end, consumed)` for the frame it terminates.
    fn scan(&mut self) -> Option<(usize, usize)> {
        let buf = &self.buf[..];
        let mut i = self.scanned;
        let found = loop {
            if i >= buf.len() {
                break None;
            }
            let term = match buf[i] {
                b'\n' => 1,
                b'\r' if i + 1 < buf.len() => {
                    if buf[i + 1] == b'\n' {
                        2
                    } else {
                        1
                    }
                }
                b'\r' if self.eof => 1,
                // a lone trailing `\r` may be the first half of `\r\n`
                b'\r' => break None,
                _ => {
                    i += 1;
                    continue;
                }
            };
            if self.line_start == Some(i) {
                break Some((i, i + term));
            }
            i += term;
            self.line_start = Some(i);
        };
        self.scanned = i;
        found
    }

    /// Releases the scanned bytes of a frame that is being skipped.
    fn discard_scanned(&mut self) {
        self.line_start = match self.line_start {
            Some(start) if start == self.scanned => Some(0),
            _ => None,
        };
        self.buf.advance(self.scanned);
        self.scanned = 0;
    }

    fn drop_frame(&mut self, err: GatewayError) {
        self.dropped += 1;
        metrics::counter!("chatrelay_frames_dropped_total").increment(1);
        tracing::warn!(error = %err, "dropping sse frame");
    }
}

fn parse_frame(text: &str) -> Option<UpstreamEvent> {
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id: Option<String> = None;
    let mut retry: Option<Duration> = None;

    for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        if line.starts_with(':') {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" if !value.contains('\0') => id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }

    if data.is_empty() && retry.is_none() {
        return None;
    }
    Some(UpstreamEvent {
        event: event
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
        retry,
    })
}

/// Adapts a byte stream into a stream of parsed events. Transport errors are
/// passed through and end the stream.
pub fn sse_events<S, B, E>(upstream: S) -> impl Stream<Item = Result<UpstreamEvent, E>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Buf + Send,
    E: Send + 'static,
{
    let state = (Box::pin(upstream), SseDecoder::new(), false);
    futures_util::stream::unfold(state, |(mut upstream, mut decoder, mut done)| async move {
        loop {
            if let Some(event) = decoder.next_event() {
                return Some((Ok(event), (upstream, decoder, done)));
            }
            if done {
                return None;
            }
            match upstream.next().await {
                Some(Ok(mut chunk)) => {
                    while chunk.has_remaining() {
                        let part = chunk.chunk();
                        let len = part.len();
                        decoder.feed(part);
                        chunk.advance(len);
                    }
                }
                Some(Err(err)) => {
                    decoder = SseDecoder::new();
                    return Some((Err(err), (upstream, decoder, true)));
                }
                None => {
                    decoder.finish();
                    done = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{SseDecoder, UpstreamEvent, sse_events};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn drain(decoder: &mut SseDecoder) -> Vec<UpstreamEvent> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"event: message\nda");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"ta: {\"answer\":\"hi\"}\n");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"\ndata: second\r\n\r\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, r#"{"answer":"hi"}"#);
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn joins_multiline_data_and_ignores_comments() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b": keep-alive\n\nevent: ping\nid: 7\ndata:a\ndata: b\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "ping");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn surfaces_retry_hints_without_payload() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"retry: 3000\n\nretry: soon\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_retry_hint());
        assert_eq!(events[0].retry, Some(Duration::from_millis(3000)));
    }

    #[test]
    fn drops_invalid_utf8_frame_and_keeps_neighbours() {
        let mut decoder = SseDecoder::new();
        let mut bytes = b"data: {\"answer\":\"a\"}\n\ndata: ".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, 0x80]);
        bytes.extend_from_slice(b"\n\ndata: {\"answer\":\"b\"}\n\n");
        decoder.feed(&bytes);
        let events = drain(&mut decoder);
        assert_eq!(
            events.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(),
            vec![r#"{"answer":"a"}"#, r#"{"answer":"b"}"#]
        );
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn lone_carriage_return_waits_for_more_input() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: x\r");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"\n\r\n");
        assert_eq!(drain(&mut decoder).len(), 1);
    }

    #[test]
    fn flushes_trailing_frame_at_end_of_input() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: tail");
        assert!(decoder.next_event().is_none());
        decoder.finish();
        assert_eq!(decoder.next_event().unwrap().data, "tail");
        assert!(decoder.next_event().is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_events_then_error() {
        let chunks: Vec<Result<Bytes, &'static str>> = vec![
            Ok(Bytes::from_static(b"data: one\n\ndata: t")),
            Ok(Bytes::from_static(b"wo\n\n")),
            Err("connection reset"),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let events: Vec<_> = sse_events(futures_util::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap().data, "one");
        assert_eq!(events[1].as_ref().unwrap().data, "two");
        assert_eq!(events[2].as_ref().unwrap_err(), &"connection reset");
    }

    #[test]
    fn oversized_frame_is_dropped_and_memory_released() {
        let mut decoder = SseDecoder::with_max_frame_bytes(64);
        decoder.feed(b"data: {\"answer\":\"a\"}\n\ndata: ");
        assert_eq!(decoder.next_event().unwrap().data, r#"{"answer":"a"}"#);
        for _ in 0..100 {
            decoder.feed(&[b'x'; 16]);
            assert!(decoder.next_event().is_none());
            assert!(decoder.buffered_bytes() <= 80);
        }
        assert_eq!(decoder.dropped_frames(), 1);

        decoder.feed(b"\n\ndata: {\"answer\":\"b\"}\n\n");
        let events = drain(&mut decoder);
        assert_eq!(
            events.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(),
            vec![r#"{"answer":"b"}"#]
        );
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn oversized_frame_tail_split_across_line_ends() {
        let mut decoder = SseDecoder::with_max_frame_bytes(8);
        decoder.feed(b"data: 0123456789\r");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"\ndata: more\r");
        assert!(decoder.next_event().is_none());
        decoder.feed(b"\n\r\ndata: ok\n\n");
        assert_eq!(drain(&mut decoder).len(), 1);
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn byte_at_a_time_input_scans_each_byte_once() {
        let frame = format!("data: {}\n\n", "y".repeat(4096));
        let mut decoder = SseDecoder::new();
        for byte in frame.as_bytes() {
            decoder.feed(std::slice::from_ref(byte));
            if let Some(event) = decoder.next_event() {
                assert_eq!(event.data.len(), 4096);
                assert_eq!(decoder.buffered_bytes(), 0);
                return;
            }
            assert_eq!(decoder.scanned, decoder.buffered_bytes());
        }
        panic!("frame was never completed");
    }
}
