//! SSE consumer for incoming transactions

use crate::config::StreamConfig;
use crate::error::ConnectionFault;
use crate::metrics::PipelineMetrics;
use crate::reporter::API_KEY_HEADER;
use crate::types::transaction::Transaction;
use anyhow::Context;
use eventsource_stream::{Event as SseEvent, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Event types that carry no transaction
const CONTROL_EVENTS: &[&str] = &["ping", "keepalive", "heartbeat"];

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Exponential reconnect delay with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (1-based) of a failure streak
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl From<&StreamConfig> for ReconnectPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            initial: config.reconnect_delay(),
            max: config.max_reconnect_delay().max(config.reconnect_delay()),
        }
    }
}

/// How a stream session ended
enum SessionEnd {
    /// The connection failed; `delivered` transactions were handed off before it did
    Fault {
        fault: ConnectionFault,
        delivered: u64,
    },
    /// The coordinator is gone
    Shutdown,
}

/// Consumer for receiving transactions from the upstream event stream
pub struct StreamConsumer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    idle_timeout: Option<Duration>,
    max_event_bytes: usize,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<Transaction>,
    metrics: Arc<PipelineMetrics>,
}

impl StreamConsumer {
    /// Create a new transaction consumer
    pub fn new(
        config: &StreamConfig,
        tx: mpsc::Sender<Transaction>,
        metrics: Arc<PipelineMetrics>,
    ) -> anyhow::Result<Self> {
        // No overall request timeout: the response body is the stream itself
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build stream HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            idle_timeout: config.idle_timeout(),
            max_event_bytes: config.max_event_bytes,
            policy: ReconnectPolicy::from(config),
            tx,
            metrics,
        })
    }

    /// Consume the stream forever, reconnecting on every connection fault.
    ///
    /// Returns only once the receiving side of the hand-off channel is dropped.
    pub async fn run(&self) {
        let mut failures: u32 = 0;

        loop {
            info!(url = %self.url, "Connecting to transaction stream");
            match self.stream_session().await {
                SessionEnd::Shutdown => {
                    info!("Hand-off channel closed, stopping stream consumer");
                    return;
                }
                SessionEnd::Fault { fault, delivered } => {
                    failures = if delivered > 0 { 1 } else { failures.saturating_add(1) };
                    let delay = self.policy.delay(failures);
                    self.metrics.record_reconnect();
                    warn!(
                        error = %fault,
                        delivered,
                        retry_in_ms = delay.as_millis() as u64,
                        "Transaction stream interrupted, reconnecting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.tx.closed() => {
                            info!("Hand-off channel closed, stopping stream consumer");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn stream_session(&self) -> SessionEnd {
        let mut delivered = 0u64;
        let end = |fault: ConnectionFault, delivered: u64| SessionEnd::Fault { fault, delivered };

        let response = match self
            .client
            .get(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return end(ConnectionFault::Transport(e), 0),
        };

        let status = response.status();
        if !status.is_success() {
            return end(ConnectionFault::Status(status.as_u16()), 0);
        }
        info!(url = %self.url, "Transaction stream connected");

        let body = Box::pin(response.bytes_stream());
        let mut events =
            Box::pin(guarded_body(body, self.idle_timeout, self.max_event_bytes).eventsource());

        loop {
            let next = tokio::select! {
                next = events.next() => next,
                _ = self.tx.closed() => return SessionEnd::Shutdown,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(EventStreamError::Transport(fault))) => return end(fault, delivered),
                Some(Err(e)) => return end(ConnectionFault::Decode(e.to_string()), delivered),
                None => return end(ConnectionFault::Ended, delivered),
            };

            let Some(transaction) = self.parse_event(&event) else {
                continue;
            };
            // Awaiting here is the backpressure point: a full hand-off pauses the read
            if self.tx.send(transaction).await.is_err() {
                return SessionEnd::Shutdown;
            }
            delivered += 1;
        }
    }

    fn parse_event(&self, event: &SseEvent) -> Option<Transaction> {
        let kind = event.event.as_str();
        if event.data.trim().is_empty() || CONTROL_EVENTS.contains(&kind) {
            debug!(event = %kind, "Skipping control event");
            return None;
        }

        match Transaction::from_payload(&event.data) {
            Ok(transaction) => {
                debug!(trans_num = %transaction.trans_num, "Transaction received");
                Some(transaction)
            }
            Err(e) => {
                self.metrics.record_parse_failure();
                warn!(error = %e, payload = %truncate(&event.data, 200), "Skipping malformed stream payload");
                None
            }
        }
    }
}

/// Body chunks ready for the event-stream parser.
///
/// Applies the idle timeout per chunk, strips a leading byte order mark (even when split
/// across chunks) and ends with [`ConnectionFault::Oversized`] once a single frame grows
/// past `max_event_bytes`.
fn guarded_body<S, B>(
    mut body: S,
    idle: Option<Duration>,
    max_event_bytes: usize,
) -> impl Stream<Item = Result<B, ConnectionFault>>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]> + From<Vec<u8>>,
{
    async_stream::stream! {
        let mut head: Option<Vec<u8>> = Some(Vec::new());
        let mut frame = FrameLimit::new(max_event_bytes);

        loop {
            let chunk = match read_chunk(&mut body, idle).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(fault) => {
                    yield Err(fault);
                    break;
                }
            };

            let chunk = match head.take() {
                None => chunk,
                Some(mut pending) => {
                    pending.extend_from_slice(chunk.as_ref());
                    if pending.len() < BOM.len() && BOM.starts_with(&pending) {
                        head = Some(pending);
                        continue;
                    }
                    let start = if pending.starts_with(BOM) { BOM.len() } else { 0 };
                    B::from(pending.split_off(start))
                }
            };

            if let Err(fault) = frame.check(chunk.as_ref()) {
                yield Err(fault);
                break;
            }
            yield Ok(chunk);
        }
    }
}

/// Size of the event frame currently being received
struct FrameLimit {
    max: usize,
    pending: usize,
    line_start: bool,
    after_cr: bool,
}

impl FrameLimit {
    fn new(max: usize) -> Self {
        Self {
            max,
            pending: 0,
            line_start: true,
            after_cr: false,
        }
    }

    fn check(&mut self, chunk: &[u8]) -> Result<(), ConnectionFault> {
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\r' | b'\n' => {
                    // An empty line dispatches the frame
                    if self.line_start {
                        self.pending = 0;
                    }
                    self.line_start = true;
                    self.after_cr = byte == b'\r';
                }
                _ => {
                    self.after_cr = false;
                    self.line_start = false;
                    self.pending += 1;
                    if self.pending > self.max {
                        return Err(ConnectionFault::Oversized(self.max));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Next body chunk; `Ok(None)` when the server ended the stream
async fn read_chunk<S, T>(body: &mut S, idle: Option<Duration>) -> Result<Option<T>, ConnectionFault>
where
    S: Stream<Item = reqwest::Result<T>> + Unpin,
{
    let next = match idle {
        Some(idle) => tokio::time::timeout(idle, body.next())
            .await
            .map_err(|_| ConnectionFault::Idle(idle))?,
        None => body.next().await,
    };
    next.transpose().map_err(ConnectionFault::Transport)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
