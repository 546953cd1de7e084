//! Broker seam.
//!
//! This module contains:
//! - `Broker` trait: one broker channel (declare, bind, consume, publish, close)
//! - `Connector` trait: opens a `Broker`
//! - Wire-level message types shared by every implementation
//! - Implementations: AMQP (RabbitMQ), in-memory channel broker

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConnector};
pub use channel::{ChannelBroker, ChannelConnector, ChannelHub};

/// Name of the broker's default (direct-to-queue) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Content type stamped on every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Message for route '{route}' was unroutable")]
    Unroutable { route: String },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Transport is closed")]
    Closed,
}

// ============================================================================
// Messages
// ============================================================================

/// A message about to be published.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    /// Target exchange; `DEFAULT_EXCHANGE` delivers straight to the queue named
    /// by `routing_key`.
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Ask the broker to hand the message back when no queue matches.
    pub mandatory: bool,
    pub payload: Vec<u8>,
}

/// What the broker did with a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message. A non-mandatory message that matched
    /// no queue is still accepted (and dropped).
    Accepted,
    /// Mandatory message matched no queue and was returned.
    Returned,
}

/// Resolves once the broker has confirmed (or returned) a publish.
pub type PublishConfirm = BoxFuture<'static, Result<PublishOutcome>>;

/// Stream of deliveries from one consumer.
pub type Deliveries = BoxStream<'static, Delivery>;

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Private to the declaring connection.
    pub exclusive: bool,
    /// Deleted once the last consumer goes away.
    pub auto_delete: bool,
    pub durable: bool,
}

impl QueueSpec {
    /// Private, auto-deleted queue (reply and event queues).
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: true,
            auto_delete: true,
            durable: false,
        }
    }

    /// Queue shared by every process serving the same route.
    ///
    /// Deleted with its bindings when the last server stops consuming, so
    /// mandatory requests for a route nobody serves are returned.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: false,
            auto_delete: true,
            durable: false,
        }
    }
}

/// Acknowledgement handle for a delivery.
pub enum Acker {
    /// Delivery was consumed without acknowledgement.
    None,
    #[cfg(feature = "amqp")]
    Amqp(lapin::acker::Acker),
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acker::None => f.write_str("Acker::None"),
            #[cfg(feature = "amqp")]
            Acker::Amqp(_) => f.write_str("Acker::Amqp"),
        }
    }
}

/// An inbound message.
#[derive(Debug)]
pub struct Delivery {
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
    pub acker: Acker,
}

impl Delivery {
    /// Acknowledge the delivery.
    pub async fn ack(self) {
        match self.acker {
            Acker::None => {}
            #[cfg(feature = "amqp")]
            Acker::Amqp(acker) => {
                if let Err(e) = acker.ack(Default::default()).await {
                    tracing::error!(error = %e, "Failed to ack message");
                }
            }
        }
    }

    /// Reject the delivery without requeueing it.
    pub async fn reject(self) {
        match self.acker {
            Acker::None => {}
            #[cfg(feature = "amqp")]
            Acker::Amqp(acker) => {
                let options = lapin::options::BasicRejectOptions { requeue: false };
                if let Err(e) = acker.reject(options).await {
                    tracing::error!(error = %e, "Failed to reject message");
                }
            }
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// One broker channel.
///
/// Implementations are not required to tolerate concurrent writers; the
/// transport funnels every call through a single worker task.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a queue.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange for a routing key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// With `no_ack` set, deliveries carry `Acker::None` and count as
    /// acknowledged on receipt.
    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<Deliveries>;

    /// Write a message to the channel.
    ///
    /// Returns once the message has been handed to the broker; the returned
    /// confirm resolves when the broker has routed or returned it.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<()>;
}

/// Opens broker channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and a channel on it.
    async fn open(&self) -> Result<Box<dyn Broker>>;
}

/// Build the connector selected by configuration.
///
/// `channel` gets a fresh in-memory hub, so only transports built from the
/// returned connector share it.
pub fn init_connector(config: &MessagingConfig) -> Result<Arc<dyn Connector>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                info!(
                    messaging_type = "amqp",
                    host = %config.amqp.host,
                    vhost = %config.amqp.vhost,
                    "Connector initialized"
                );
                Ok(Arc::new(AmqpConnector::new(config.amqp.url())))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(TransportError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Connector initialized");
            Ok(Arc::new(ChannelHub::new().connector()))
        }
    }
}

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules:
/// - `*` matches exactly one dot-separated word
/// - `#` matches zero or more words
/// - Anything else must match the word literally
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) if *word == "*" || word == first => {
                matches_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
