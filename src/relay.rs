//! Batching relay between a parsed upstream event stream and the caller.
//!
//! One spawned task per session owns the buffer, the timers and the upstream
//! stream. Output goes through a bounded channel so a slow caller applies
//! backpressure to the upstream read. Dropping the response body cancels the
//! session token, which the task observes at every await point.

use crate::chat::RelayChunk;
use crate::config::RelayPolicy;
use crate::error::{AppError, GatewayError};
use crate::providers::{Interpretation, ProviderAdapter};
use crate::sse::UpstreamEvent;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;
use uuid::Uuid;

/// Caller-supplied extraction that replaces the adapter's chunk mapping.
pub type Extractor = Arc<dyn Fn(&UpstreamEvent) -> Option<RelayChunk> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Buffering,
    Flushing,
    Closed,
    TimedOut,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    IdleTimeout,
    UpstreamError,
    Cancelled,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::IdleTimeout => "idle_timeout",
            Self::UpstreamError => "upstream_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamFormat {
    /// `event: start`, one `data:` line per serialized chunk, `event: done`.
    EventStream,
    /// One `{"chunks":[...]}` line per flushed batch.
    NdJson,
    /// Upstream `data:` payloads forwarded verbatim inside start/done framing.
    Passthrough,
}

#[derive(Serialize)]
struct Batch<'a> {
    chunks: &'a [RelayChunk],
}

impl DownstreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventStream => "sse",
            Self::NdJson => "ndjson",
            Self::Passthrough => "passthrough",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::EventStream | Self::Passthrough => "text/event-stream",
            Self::NdJson => "application/x-ndjson",
        }
    }

    fn start(&self, session_id: Uuid) -> Option<Bytes> {
        match self {
            Self::NdJson => None,
            Self::EventStream | Self::Passthrough => Some(Bytes::from(format!(
                "event: start\ndata: {{\"session_id\":\"{session_id}\"}}\n\n"
            ))),
        }
    }

    fn batch(&self, chunks: &[RelayChunk]) -> Bytes {
        let mut out = String::new();
        match self {
            Self::NdJson => {
                out = serde_json::to_string(&Batch { chunks }).unwrap_or_default();
                out.push('\n');
            }
            Self::EventStream => {
                for chunk in chunks {
                    let json = serde_json::to_string(chunk).unwrap_or_default();
                    push_data(&mut out, &json);
                }
            }
            Self::Passthrough => {
                for chunk in chunks {
                    push_data(&mut out, &chunk.raw);
                }
            }
        }
        Bytes::from(out)
    }

    fn done(&self) -> Option<Bytes> {
        match self {
            Self::NdJson => None,
            Self::EventStream | Self::Passthrough => {
                Some(Bytes::from_static(b"event: done\ndata: [DONE]\n\n"))
            }
        }
    }

    fn error(&self, err: &AppError) -> Bytes {
        let envelope = err.envelope().to_string();
        match self {
            Self::NdJson => Bytes::from(format!("{envelope}\n")),
            Self::EventStream | Self::Passthrough => {
                Bytes::from(format!("event: error\ndata: {envelope}\n\n"))
            }
        }
    }
}

fn push_data(out: &mut String, payload: &str) {
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
}

/// `start + after`, saturating to a far-future instant for huge configured durations.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + Duration::from_secs(FAR_FUTURE_SECS))
}

const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

fn chunk_size(chunk: &RelayChunk) -> usize {
    serde_json::to_vec(chunk)
        .map(|v| v.len())
        .unwrap_or(0)
        .max(chunk.raw.len())
}

/// Ordered chunk buffer with a byte threshold.
#[derive(Debug)]
pub struct RelayBuffer {
    chunks: Vec<RelayChunk>,
    bytes: usize,
    max_bytes: usize,
}

impl RelayBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Appends a chunk; returns true once the buffered size reaches the threshold.
    pub fn push(&mut self, chunk: RelayChunk) -> bool {
        self.bytes += chunk_size(&chunk);
        self.chunks.push(chunk);
        self.bytes >= self.max_bytes
    }

    pub fn take(&mut self) -> Vec<RelayChunk> {
        self.bytes = 0;
        std::mem::take(&mut self.chunks)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }
}

/// Response body fed by a relay session. Dropping it cancels the session.
pub struct RelayBody {
    session_id: Uuid,
    inner: ReceiverStream<Bytes>,
    _guard: DropGuard,
}

impl RelayBody {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|item| item.map(Ok))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub reason: CloseReason,
    pub terminal_state: RelayState,
    pub flushes: u64,
    pub chunks: u64,
}

pub struct Relay {
    adapter: &'static dyn ProviderAdapter,
    format: DownstreamFormat,
    policy: RelayPolicy,
    extractor: Option<Extractor>,
}

impl Relay {
    pub fn new(
        adapter: &'static dyn ProviderAdapter,
        format: DownstreamFormat,
        policy: RelayPolicy,
    ) -> Self {
        Self {
            adapter,
            format,
            policy,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Starts the session task and returns the body it writes into.
    pub fn spawn<S, E>(self, events: S) -> (RelayBody, JoinHandle<SessionReport>)
    where
        S: Stream<Item = Result<UpstreamEvent, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.policy.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let session = StreamSession::new(self, tx, cancel.clone());
        let session_id = session.id;
        let span = tracing::info_span!(
            "relay",
            session_id = %session_id,
            provider = session.adapter.kind().as_str(),
            format = session.format.as_str()
        );
        let handle = tokio::spawn(session.run(events).instrument(span));
        let body = RelayBody {
            session_id,
            inner: ReceiverStream::new(rx),
            _guard: cancel.drop_guard(),
        };
        (body, handle)
    }
}

struct StreamSession {
    id: Uuid,
    state: RelayState,
    adapter: &'static dyn ProviderAdapter,
    format: DownstreamFormat,
    policy: RelayPolicy,
    extractor: Option<Extractor>,
    buffer: RelayBuffer,
    cancel: CancellationToken,
    tx: mpsc::Sender<Bytes>,
    last_activity: Instant,
    batch_opened: Option<Instant>,
    flushes: u64,
    chunks: u64,
}

impl StreamSession {
    fn new(relay: Relay, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RelayState::Idle,
            adapter: relay.adapter,
            format: relay.format,
            buffer: RelayBuffer::new(relay.policy.max_batch_bytes),
            policy: relay.policy,
            extractor: relay.extractor,
            cancel,
            tx,
            last_activity: Instant::now(),
            batch_opened: None,
            flushes: 0,
            chunks: 0,
        }
    }

    async fn run<S, E>(mut self, events: S) -> SessionReport
    where
        S: Stream<Item = Result<UpstreamEvent, E>> + Send,
        E: Display,
    {
        metrics::counter!("chatrelay_sessions_total", "format" => self.format.as_str())
            .increment(1);
        tracing::debug!("relay session started");

        let reason = self.drive(events).await;
        if reason == CloseReason::Cancelled {
            self.state = RelayState::Closed;
        }

        metrics::counter!("chatrelay_session_close_total", "reason" => reason.as_str())
            .increment(1);
        match reason {
            CloseReason::Cancelled => {
                tracing::info!(flushes = self.flushes, "caller disconnected; upstream aborted")
            }
            CloseReason::IdleTimeout => tracing::info!(
                idle_timeout_ms = self.policy.idle_timeout_ms,
                flushes = self.flushes,
                "upstream idle; stream closed"
            ),
            CloseReason::Completed | CloseReason::UpstreamError => tracing::debug!(
                reason = reason.as_str(),
                flushes = self.flushes,
                chunks = self.chunks,
                "relay session closed"
            ),
        }

        SessionReport {
            session_id: self.id,
            reason,
            terminal_state: self.state,
            flushes: self.flushes,
            chunks: self.chunks,
        }
    }

    /// Runs until a close condition. The upstream stream is dropped on return.
    async fn drive<S, E>(&mut self, events: S) -> CloseReason
    where
        S: Stream<Item = Result<UpstreamEvent, E>> + Send,
        E: Display,
    {
        let mut events = std::pin::pin!(events);
        let cancel = self.cancel.clone();

        if let Some(start) = self.format.start(self.id) {
            if !self.emit(start).await {
                return CloseReason::Cancelled;
            }
        }

        loop {
            let idle_deadline = deadline_after(self.last_activity, self.policy.idle_timeout());
            let batch_deadline = self
                .batch_opened
                .map(|opened| deadline_after(opened, self.policy.max_batch_delay()));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = sleep_until(idle_deadline) => {
                    if !self.flush().await {
                        return CloseReason::Cancelled;
                    }
                    self.state = RelayState::TimedOut;
                    return self.finish(CloseReason::IdleTimeout).await;
                }
                _ = sleep_until(batch_deadline.unwrap_or(idle_deadline)), if batch_deadline.is_some() => {
                    if !self.flush().await {
                        return CloseReason::Cancelled;
                    }
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        self.last_activity = Instant::now();
                        if event.is_retry_hint() {
                            tracing::debug!(retry = ?event.retry, "ignoring upstream retry hint");
                            continue;
                        }
                        match self.interpret(&event) {
                            Interpretation::Chunk(chunk) => {
                                if self.buffer.is_empty() {
                                    self.batch_opened = Some(Instant::now());
                                }
                                self.state = RelayState::Buffering;
                                self.chunks += 1;
                                if self.buffer.push(chunk) && !self.flush().await {
                                    return CloseReason::Cancelled;
                                }
                            }
                            Interpretation::Skip => {}
                            Interpretation::Malformed(reason) => {
                                let err = GatewayError::Parse(reason);
                                metrics::counter!("chatrelay_frames_dropped_total").increment(1);
                                tracing::warn!(event = %event.event, error = %err, "skipping malformed upstream frame");
                            }
                            Interpretation::Done => {
                                if !self.flush().await {
                                    return CloseReason::Cancelled;
                                }
                                return self.finish(CloseReason::Completed).await;
                            }
                            Interpretation::Fail(message) => {
                                if !self.flush().await {
                                    return CloseReason::Cancelled;
                                }
                                return self.fail(GatewayError::Upstream { status: None, message }).await;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        if !self.flush().await {
                            return CloseReason::Cancelled;
                        }
                        return self
                            .fail(GatewayError::Upstream { status: None, message: err.to_string() })
                            .await;
                    }
                    None => {
                        if !self.flush().await {
                            return CloseReason::Cancelled;
                        }
                        return self.finish(CloseReason::Completed).await;
                    }
                },
            }
        }
    }

    fn interpret(&self, event: &UpstreamEvent) -> Interpretation {
        match (&self.extractor, self.adapter.interpret(event)) {
            (Some(extract), Interpretation::Chunk(_) | Interpretation::Skip) => extract(event)
                .map(Interpretation::Chunk)
                .unwrap_or(Interpretation::Skip),
            (_, other) => other,
        }
    }

    /// Writes every buffered chunk as one downstream write. Returns false if the caller is gone.
    async fn flush(&mut self) -> bool {
        self.batch_opened = None;
        if self.buffer.is_empty() {
            return true;
        }
        self.state = RelayState::Flushing;
        let chunks = self.buffer.take();
        let bytes = self.format.batch(&chunks);
        self.flushes += 1;
        metrics::counter!("chatrelay_flushes_total").increment(1);
        metrics::histogram!("chatrelay_batch_chunks").record(chunks.len() as f64);
        tracing::trace!(chunks = chunks.len(), bytes = bytes.len(), "flushing batch");
        let sent = self.emit(bytes).await;
        self.state = RelayState::Idle;
        sent
    }

    async fn finish(&mut self, reason: CloseReason) -> CloseReason {
        if reason == CloseReason::Completed {
            self.state = RelayState::Closed;
        }
        if let Some(done) = self.format.done() {
            if !self.emit(done).await {
                return CloseReason::Cancelled;
            }
        }
        reason
    }

    async fn fail(&mut self, err: GatewayError) -> CloseReason {
        self.state = RelayState::Errored;
        metrics::counter!("chatrelay_upstream_errors_total", "stage" => "stream").increment(1);
        tracing::warn!(error = %err, "upstream failed mid-stream");
        let app = AppError::from(err);
        if !self.emit(self.format.error(&app)).await {
            return CloseReason::Cancelled;
        }
        CloseReason::UpstreamError
    }

    async fn emit(&self, bytes: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(bytes) => sent.is_ok(),
        }
    }
}
