//! Capability set of the underlying broker client.
//!
//! mqkit never speaks the wire protocol itself. Adapters implement
//! [`BrokerConnection`] and [`BrokerChannel`] on top of a real client (or an
//! in-process broker for tests), converting their wire structs to
//! [`Envelope`] and [`Delivery`] at the boundary.

use crate::envelope::Envelope;
use crate::topology::{Arguments, Binding, ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Name of the broker-provided direct-reply pseudo-queue.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Name of the default exchange, which routes to queues by name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used for acknowledgment
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish time
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Properties and body
    pub envelope: Envelope,
}

/// Broker-side delivery guarantees for a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Fail if the message cannot be routed to any queue
    pub mandatory: bool,
    /// Fail if no consumer can take the message immediately
    pub immediate: bool,
}

/// Options of a consume request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag; empty lets the broker pick one
    pub consumer_tag: String,
    /// Deliveries are considered acknowledged on send
    pub auto_ack: bool,
    /// Only this consumer may read the queue
    pub exclusive: bool,
    /// Do not deliver messages published on the same connection
    pub no_local: bool,
    /// Do not wait for the broker's confirmation
    pub no_wait: bool,
    /// Broker-specific arguments
    pub arguments: Arguments,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: String::new(),
            auto_ack: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
            arguments: Arguments::new(),
        }
    }
}

/// Kind of the destination of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    /// Exchange-to-exchange binding
    Exchange,
    /// Queue-to-exchange binding
    Queue,
}

/// Failures reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Entity exists with different parameters, or the request is invalid
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// Permission denied
    #[error("access refused: {0}")]
    AccessRefused(String),
    /// Entity is held exclusively by another connection or consumer
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    /// A mandatory or immediate publish could not be satisfied
    #[error("unroutable: {0}")]
    Unroutable(String),
    /// The channel is closed
    #[error("channel closed")]
    ChannelClosed,
    /// The connection is closed
    #[error("connection closed")]
    ConnectionClosed,
    /// Any other protocol or transport failure
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the failure is about connection or channel state rather than
    /// about the request.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosed | Self::ConnectionClosed | Self::Protocol(_)
        )
    }
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new multiplexed channel.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Whether the connection is usable.
    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a [`BrokerConnection`].
///
/// Like an AMQP channel, a failed declare, bind, delete or ack may leave the
/// channel closed; check [`BrokerChannel::is_open`] before reusing it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel is usable.
    fn is_open(&self) -> bool;

    /// Create the exchange, or succeed if an equivalent one exists.
    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Succeed only if an equivalent exchange exists.
    async fn declare_exchange_passive(
        &self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), BrokerError>;

    /// Create the queue, or succeed if an equivalent one exists.
    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Succeed only if an equivalent queue exists.
    async fn declare_queue_passive(&self, name: &str, spec: &QueueSpec)
        -> Result<(), BrokerError>;

    /// Bind `destination` to `binding.exchange`.
    async fn bind(
        &self,
        target: BindTarget,
        destination: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError>;

    /// Delete an exchange and its bindings.
    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Delete a queue and its bindings.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish an envelope.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: &Envelope,
    ) -> Result<(), BrokerError>;

    /// Start consuming a queue.
    async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Acknowledge one delivery, or all up to `delivery_tag` when `multiple`.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}
