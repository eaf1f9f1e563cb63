//! Resilient alert publisher.
//!
//! Owns the broker transport, a bounded outgoing buffer and the reconnect
//! loop. `publish` never waits on a reconnect, and a broker that stops
//! answering is given at most the send timeout: while the broker is away,
//! alerts are buffered (oldest evicted first) and flushed in order once a
//! connection is re-established.

pub mod buffer;
pub mod retry;
pub mod transport;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::detect::{AnomalyDetails, AnomalyRecord};

pub use self::buffer::{OutgoingBuffer, OutgoingMessage, DEFAULT_BUFFER_CAPACITY};
pub use self::retry::RetryPolicy;
pub use self::transport::{AmqpTransport, Transport, TransportError};

pub const EVENT_TYPE: &str = "anomaly.detected";
const FALLBACK_THRESHOLD: f64 = 0.65;
/// Bound on one connect attempt or one send (including the broker confirm).
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Buffered,
    /// The publisher is shutting down.
    Discarded,
}

/// Wire format of an anomaly alert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage<'a> {
    pub event_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<&'a str>,
    pub service: &'a str,
    pub method: Option<&'a str>,
    pub path: Option<&'a str>,
    pub metric_id: &'a str,
    pub anomaly_score: f64,
    pub detection_method: &'static str,
    pub threshold: f64,
    pub details: &'a AnomalyDetails,
}

impl<'a> AlertMessage<'a> {
    pub fn from_record(record: &'a AnomalyRecord) -> Self {
        Self {
            event_type: EVENT_TYPE,
            timestamp: record.timestamp,
            trace_id: record.trace_id.as_deref(),
            service: &record.service,
            method: record.method.as_deref(),
            path: record.path.as_deref(),
            metric_id: &record.metric_id,
            anomaly_score: record.anomaly_score,
            detection_method: record.detection_method.as_str(),
            threshold: record.threshold.unwrap_or(FALLBACK_THRESHOLD),
            details: &record.details,
        }
    }
}

pub fn routing_key(service: &str) -> String {
    format!("anomaly.{service}")
}

struct Inner {
    state: ConnectionState,
    buffer: OutgoingBuffer,
    /// Set while the buffer drains after a connect; new messages queue behind it.
    flushing: bool,
    reconnecting: bool,
    /// Session-loss watcher already running.
    watching: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ResilientPublisher {
    shared: Arc<Shared>,
}

impl ResilientPublisher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, capacity: usize) -> Self {
        Self::with_send_timeout(transport, policy, capacity, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        capacity: usize,
        send_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport,
                policy,
                send_timeout,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    buffer: OutgoingBuffer::new(capacity),
                    flushing: false,
                    reconnecting: false,
                    watching: false,
                }),
                shutdown,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Alerts dropped because the buffer overflowed.
    pub fn evicted(&self) -> u64 {
        self.lock().buffer.evicted()
    }

    async fn transport_connect(&self) -> Result<(), TransportError> {
        let limit = self.shared.send_timeout;
        tokio::time::timeout(limit, self.shared.transport.connect())
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))
    }

    async fn transport_send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let limit = self.shared.send_timeout;
        tokio::time::timeout(limit, self.shared.transport.send(message))
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))
    }

    /// One synchronous connect attempt. Used at startup, where the caller
    /// decides whether a failure is fatal.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Closing => return Err(TransportError::Closed),
                ConnectionState::Connected => return Ok(()),
                _ => inner.state = ConnectionState::Connecting,
            }
        }

        match self.transport_connect().await {
            Ok(()) => {
                self.on_connected().await;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.lock();
                if inner.state == ConnectionState::Connecting && !inner.reconnecting {
                    inner.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Start the background reconnect loop unless one is already running.
    pub fn spawn_reconnect(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closing || inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
            inner.state = ConnectionState::Connecting;
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if self.state() == ConnectionState::Closing {
                break;
            }
            match self.transport_connect().await {
                Ok(()) => {
                    if self.state() == ConnectionState::Closing {
                        self.shared.transport.close().await;
                        break;
                    }
                    info!(attempts = attempt + 1, "broker connection re-established");
                    self.lock().reconnecting = false;
                    self.on_connected().await;
                    return;
                }
                Err(e) => {
                    let delay = self.shared.policy.next_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, attempt, retry_in = ?delay, "broker connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        self.lock().reconnecting = false;
    }

    async fn on_connected(&self) {
        let watch_losses = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closing {
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.flushing = true;
            !std::mem::replace(&mut inner.watching, true)
        };
        if watch_losses {
            if let Some(losses) = self.shared.transport.session_losses() {
                let this = self.clone();
                tokio::spawn(async move { this.watch_session(losses).await });
            }
        }
        self.flush().await;
    }

    /// Demote to disconnected and reconnect when the transport reports a
    /// dropped session.
    async fn watch_session(&self, mut losses: watch::Receiver<u64>) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = losses.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            let lost = {
                let mut inner = self.lock();
                let connected = inner.state == ConnectionState::Connected;
                if connected {
                    inner.state = ConnectionState::Disconnected;
                }
                connected
            };
            if lost {
                warn!("broker session dropped, reconnecting");
                self.spawn_reconnect();
            }
        }
    }

    /// Drain the buffer in FIFO order. Stops at the first failure, which
    /// re-buffers the message and restarts the reconnect loop.
    async fn flush(&self) {
        let mut sent = 0usize;
        loop {
            let message = {
                let mut inner = self.lock();
                if inner.state != ConnectionState::Connected {
                    inner.flushing = false;
                    return;
                }
                match inner.buffer.pop_front() {
                    Some(m) => m,
                    None => {
                        inner.flushing = false;
                        if sent > 0 {
                            info!(sent, "flushed buffered alerts");
                        }
                        return;
                    }
                }
            };

            if let Err(e) = self.transport_send(&message).await {
                warn!(error = %e, "flush interrupted, re-buffering");
                {
                    let mut inner = self.lock();
                    if !inner.buffer.requeue_front(message) {
                        warn!("buffer full, dropped oldest alert");
                    }
                    inner.flushing = false;
                    if inner.state == ConnectionState::Connected {
                        inner.state = ConnectionState::Disconnected;
                    }
                }
                self.spawn_reconnect();
                return;
            }
            sent += 1;
        }
    }

    pub async fn publish(&self, record: &AnomalyRecord) -> PublishOutcome {
        let payload = match serde_json::to_vec(&AlertMessage::from_record(record)) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, metric_id = %record.metric_id, "failed to serialize alert");
                return PublishOutcome::Discarded;
            }
        };
        self.publish_message(OutgoingMessage {
            routing_key: routing_key(&record.service),
            payload,
        })
        .await
    }

    pub async fn publish_message(&self, message: OutgoingMessage) -> PublishOutcome {
        let (ready, start_reconnect) = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ConnectionState::Closing => return PublishOutcome::Discarded,
                ConnectionState::Connected if !inner.flushing => (Some(message), false),
                _ => {
                    inner.buffer.enqueue(message);
                    (None, state == ConnectionState::Disconnected)
                }
            }
        };

        let Some(message) = ready else {
            if start_reconnect {
                self.spawn_reconnect();
            }
            return PublishOutcome::Buffered;
        };

        match self.transport_send(&message).await {
            Ok(()) => PublishOutcome::Sent,
            Err(e) => {
                warn!(error = %e, routing_key = %message.routing_key, "publish failed, buffering");
                {
                    let mut inner = self.lock();
                    inner.buffer.enqueue(message);
                    if inner.state == ConnectionState::Connected {
                        inner.state = ConnectionState::Disconnected;
                    }
                }
                self.spawn_reconnect();
                PublishOutcome::Buffered
            }
        }
    }

    /// Stop reconnecting and close the transport. Terminal.
    pub async fn shutdown(&self) {
        let pending = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Closing;
            inner.buffer.len()
        };
        let _ = self.shared.shutdown.send(true);
        self.shared.transport.close().await;
        if pending > 0 {
            warn!(pending, "publisher closed with undelivered alerts");
        } else {
            info!("publisher closed");
        }
    }
}
