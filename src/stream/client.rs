//! Low-level simulation stream transport.
//!
//! The client opens a server-sent-events stream over HTTP GET and keeps it
//! alive from a background worker, reconnecting after every failure until
//! it is explicitly closed. Everything the worker observes is pushed, in
//! order, onto one channel consumed by a single reader.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, RetryPolicy};

/// Stream endpoint of a locally running simulation service.
pub const DEFAULT_STREAM_ENDPOINT: &str = "http://localhost:8000/simulation/stream";
/// Connections that deliver no bytes for this long are treated as failed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry point for opening simulation stream connections.
#[derive(Clone, Debug)]
pub struct StreamClient {
    endpoint: String,
    raw_query: Option<String>,
    query_pairs: Vec<(String, String)>,
    reconnect_policy: RetryPolicy,
    idle_timeout: Option<Duration>,
    connect_timeout: Duration,
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClient {
    /// Creates a client for [`DEFAULT_STREAM_ENDPOINT`] that reconnects
    /// every two seconds, forever.
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_STREAM_ENDPOINT.to_string(),
            raw_query: None,
            query_pairs: Vec::new(),
            reconnect_policy: RetryPolicy::default(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the stream base address.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim().to_string();
        self
    }

    /// Forwards a query string verbatim, e.g. the page's current query.
    ///
    /// A leading `?` is stripped. Replaces any previously set query string.
    pub fn with_query_string(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        let query = query.trim().trim_start_matches('?');
        self.raw_query = (!query.is_empty()).then(|| query.to_string());
        self
    }

    /// Appends one percent-encoded query parameter after the forwarded
    /// query string.
    pub fn with_query_pair(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((key.into(), value.into()));
        self
    }

    /// Appends several query parameters in order.
    pub fn with_query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query_pairs
            .extend(pairs.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Sets how long a connection may stay silent before it is recycled.
    /// `None` waits forever.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn reconnect_policy(&self) -> &RetryPolicy {
        &self.reconnect_policy
    }

    /// Resolves the full stream URL from the endpoint and query settings.
    pub fn stream_url(&self) -> Result<Url, StreamClientError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|err| StreamClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: err.to_string(),
            })?;
        if url.cannot_be_a_base() {
            return Err(StreamClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "endpoint must be an absolute http(s) url".to_string(),
            });
        }

        if let Some(raw_query) = self.raw_query.as_deref() {
            url.set_query(Some(raw_query));
        }
        if !self.query_pairs.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_pairs {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Opens the stream.
    ///
    /// Connecting happens asynchronously on a background worker spawned on
    /// the current Tokio runtime; transport failures never surface here.
    pub fn connect(&self) -> Result<StreamConnection, StreamClientError> {
        let runtime = Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;
        let url = self.stream_url()?;
        let http = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(StreamClientError::Http)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = StreamWorker {
            http,
            url,
            reconnect_policy: self.reconnect_policy.clone(),
            idle_timeout: self.idle_timeout,
            inbound_tx,
            shutdown_rx,
        };
        runtime.spawn(worker.run());

        Ok(StreamConnection::from_parts(
            inbound_rx,
            StreamCloser {
                tx: Arc::new(shutdown_tx),
            },
        ))
    }
}

/// Everything the transport worker reports, in the order it happened.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection attempt is starting. `attempt` counts consecutive
    /// attempts since the last connection that delivered a message.
    Connecting { attempt: usize },
    /// One complete inbound payload.
    Message(String),
    /// The current connection failed; a reconnect follows unless the policy
    /// is exhausted or the stream was closed.
    Disconnected { error: StreamClientError },
    /// The reconnect policy ran out of attempts. The worker has stopped.
    GaveUp { attempts: usize },
    /// The stream was closed on request. The worker has stopped.
    Closed,
}

/// Cloneable handle that stops a stream worker.
#[derive(Clone, Debug)]
pub struct StreamCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl StreamCloser {
    /// Terminates the connection and any pending reconnect timer.
    /// Calling it more than once has no further effect.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving side of an open stream.
#[derive(Debug)]
pub struct StreamConnection {
    receiver: mpsc::UnboundedReceiver<TransportEvent>,
    closer: StreamCloser,
}

impl StreamConnection {
    pub(crate) fn from_parts(
        receiver: mpsc::UnboundedReceiver<TransportEvent>,
        closer: StreamCloser,
    ) -> Self {
        Self { receiver, closer }
    }

    /// Creates a connection fed by an external event source instead of a
    /// network worker. Closing it only flips the returned watch flag.
    pub fn detached(
        receiver: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closer = StreamCloser {
            tx: Arc::new(shutdown_tx),
        };
        (Self::from_parts(receiver, closer), shutdown_rx)
    }

    /// Receives the next transport event. `None` once the worker is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.receiver.recv().await
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

/// Errors produced by the stream transport.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("invalid stream endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("stream client must be connected from within a tokio runtime")]
    NoRuntime,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("stream ended by server")]
    StreamEnded,

    #[error("event-stream line exceeded {limit} bytes")]
    LineTooLong { limit: usize },
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect {
        error: StreamClientError,
        delivered: bool,
    },
}

struct StreamWorker {
    http: Client,
    url: Url,
    reconnect_policy: RetryPolicy,
    idle_timeout: Option<Duration>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamWorker {
    async fn run(mut self) {
        let mut failures = 0usize;

        loop {
            if *self.shutdown_rx.borrow_and_update() {
                break;
            }
            let attempt = failures + 1;
            info!(event = "stream_connecting", url = %self.url, attempt);
            if self
                .inbound_tx
                .send(TransportEvent::Connecting { attempt })
                .is_err()
            {
                return;
            }

            let outcome = tokio::select! {
                outcome = run_connected_session(
                    &self.http,
                    &self.url,
                    self.idle_timeout,
                    &self.inbound_tx,
                ) => outcome,
                _ = self.shutdown_rx.changed() => SessionOutcome::GracefulShutdown,
            };

            match outcome {
                SessionOutcome::GracefulShutdown => break,
                SessionOutcome::Reconnect { error, delivered } => {
                    if delivered {
                        failures = 0;
                    }
                    failures += 1;
                    warn!(event = "stream_disconnected", error = %error, failures);
                    if self
                        .inbound_tx
                        .send(TransportEvent::Disconnected { error })
                        .is_err()
                    {
                        return;
                    }

                    if !self.reconnect_policy.allows_retry(failures) {
                        warn!(event = "stream_reconnect_exhausted", attempts = failures);
                        let _ = self
                            .inbound_tx
                            .send(TransportEvent::GaveUp { attempts: failures });
                        return;
                    }

                    let delay = self.reconnect_policy.delay_for_attempt(failures);
                    debug!(
                        event = "stream_reconnect_scheduled",
                        delay_ms = delay.as_millis() as u64
                    );
                    if !wait_for_reconnect(delay, &mut self.shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        info!(event = "stream_closed", url = %self.url);
        let _ = self.inbound_tx.send(TransportEvent::Closed);
    }
}

async fn run_connected_session(
    http: &Client,
    url: &Url,
    idle_timeout: Option<Duration>,
    inbound_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> SessionOutcome {
    let reconnect = |error: StreamClientError, delivered: bool| SessionOutcome::Reconnect {
        error,
        delivered,
    };

    let request = http
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send();
    let sent = match idle_timeout {
        Some(limit) => match with_timeout(limit, request).await {
            Ok(sent) => sent,
            Err(_) => return reconnect(StreamClientError::IdleTimeout(limit), false),
        },
        None => request.await,
    };
    let response = match sent {
        Ok(response) => response,
        Err(err) => return reconnect(StreamClientError::Http(err), false),
    };
    let status = response.status();
    if !status.is_success() {
        return reconnect(StreamClientError::HttpStatus(status), false);
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut delivered = false;

    loop {
        let next = match idle_timeout {
            Some(limit) => match with_timeout(limit, body.next()).await {
                Ok(next) => next,
                Err(_) => return reconnect(StreamClientError::IdleTimeout(limit), delivered),
            },
            None => body.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                let (events, overflow) = match decoder.feed(&chunk) {
                    Ok(events) => (events, None),
                    Err(LineTooLong { limit, decoded }) => (decoded, Some(limit)),
                };
                for data in events {
                    if inbound_tx.send(TransportEvent::Message(data)).is_err() {
                        return SessionOutcome::GracefulShutdown;
                    }
                    delivered = true;
                }
                if let Some(limit) = overflow {
                    return reconnect(StreamClientError::LineTooLong { limit }, delivered);
                }
            }
            Some(Err(err)) => return reconnect(StreamClientError::Http(err), delivered),
            None => return reconnect(StreamClientError::StreamEnded, delivered),
        }
    }
}

/// Sleeps for `delay` unless the stream is closed first.
///
/// Returns `false` when the worker should stop instead of reconnecting.
async fn wait_for_reconnect(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow_and_update() {
                    return false;
                }
            }
        }
    }
}

/// Longest event-stream line the decoder buffers before giving up on the
/// connection.
pub const MAX_SSE_LINE_BYTES: usize = 4 * 1024 * 1024;

/// A line grew past the decoder's limit without a terminator.
#[derive(Debug, Error)]
#[error("event-stream line exceeded {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
    /// Events completed earlier in the same chunk, in order.
    pub decoded: Vec<String>,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Returns the `data` payload of every event completed by a chunk. Bytes are
/// buffered per line, so chunk boundaries may fall anywhere, including
/// inside a UTF-8 sequence or between the two bytes of a CRLF. Lines end at
/// LF, CRLF or a lone CR. Event types, ids and retry hints are ignored.
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
    has_data: bool,
    after_cr: bool,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line_len(MAX_SSE_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line_len(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            data: Vec::new(),
            has_data: false,
            after_cr: false,
            max_line,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        let mut events = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match byte {
                b'\n' if after_cr => {}
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut events);
                }
                _ => {
                    if self.line.len() >= self.max_line {
                        self.line.clear();
                        return Err(LineTooLong {
                            limit: self.max_line,
                            decoded: events,
                        });
                    }
                    self.line.push(byte);
                }
            }
        }
        Ok(events)
    }

    fn end_line(&mut self, events: &mut Vec<String>) {
        let line = match std::str::from_utf8(&self.line) {
            Ok(line) => line.to_owned(),
            Err(err) => {
                warn!(
                    event = "sse_invalid_utf8",
                    valid_up_to = err.valid_up_to(),
                    line_bytes = self.line.len()
                );
                String::from_utf8_lossy(&self.line).into_owned()
            }
        };
        self.line.clear();
        if let Some(event) = self.process_line(&line) {
            events.push(event);
        }
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if !self.has_data {
                return None;
            }
            self.has_data = false;
            return Some(std::mem::take(&mut self.data).join("\n"));
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
            self.has_data = true;
        }
        None
    }
}
