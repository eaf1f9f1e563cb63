//! Broker transports. The publisher only sees [`Transport`]; [`AmqpTransport`]
//! talks to RabbitMQ through a durable topic exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::publisher::buffer::OutgoingMessage;

/// AMQP delivery mode 2: persist to disk on the broker.
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport closed")]
    Closed,

    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        TransportError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the broker session.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError>;

    async fn close(&self);

    /// Ticks whenever an established session is lost outside of `send`.
    /// Transports that only notice failures on use return `None`.
    fn session_losses(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpTransport {
    url: String,
    exchange: String,
    session: Mutex<Option<AmqpSession>>,
    /// Incremented per connect; error hooks of replaced sessions stay silent.
    generation: Arc<AtomicU64>,
    losses: watch::Sender<u64>,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        let (losses, _) = watch::channel(0);
        Self {
            url: url.into(),
            exchange: exchange.into(),
            session: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            losses,
        }
    }

    fn watch_connection(&self, connection: &Connection) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let losses = self.losses.clone();
        connection.on_error(move |err| {
            if current.load(Ordering::SeqCst) == generation {
                warn!(error = %err, "broker connection lost");
                losses.send_modify(|n| *n += 1);
            }
        });
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        self.watch_connection(&connection);
        info!(exchange = %self.exchange, "connected to broker");
        let previous = self.session.lock().await.replace(AmqpSession { connection, channel });
        if let Some(old) = previous {
            let _ = old.connection.close(REPLY_SUCCESS, "replaced").await;
        }
        Ok(())
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| TransportError::Unavailable("not connected".to_string()))?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let result = async {
            let confirm = session
                .channel
                .basic_publish(
                    &self.exchange,
                    &message.routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await?;
            if confirm.await?.is_nack() {
                return Err(TransportError::Unavailable("broker nacked message".to_string()));
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            // force a fresh session on the next connect
            guard.take();
        } else {
            debug!(routing_key = %message.routing_key, "published");
        }
        result
    }

    async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.channel.close(REPLY_SUCCESS, "shutdown").await {
                debug!(error = %e, "channel close failed");
            }
            if let Err(e) = session.connection.close(REPLY_SUCCESS, "shutdown").await {
                debug!(error = %e, "connection close failed");
            }
            info!("disconnected from broker");
        }
    }

    fn session_losses(&self) -> Option<watch::Receiver<u64>> {
        Some(self.losses.subscribe())
    }
}
