//! # Memory Adapter
//!
//! An in-process broker implementing the mqkit broker capability set.
//!
//! It follows AMQP 0-9-1 semantics where the mqkit core depends on them:
//! - the default exchange routes to queues by name
//! - direct, fanout and topic routing; headers exchanges route like fanout
//! - soft errors (not found, inequivalent declare, ...) close the channel
//! - the `amq.rabbitmq.reply-to` pseudo-queue rewrites `reply_to` to a
//!   channel-scoped address
//!
//! Unacknowledged messages are dropped, not requeued, when their channel
//! closes.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod routing;
mod state;

pub use routing::matches as routing_matches;
pub use state::BrokerStats;

use async_trait::async_trait;
use mqkit_core::{
    BindTarget, Binding, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions,
    DeliveryStream, Envelope, ExchangeSpec, PublishOptions, QueueSpec,
};
use state::BrokerState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connection.
    #[must_use]
    pub fn connect(&self) -> Arc<MemoryConnection> {
        let id = self.lock().open_connection();
        tracing::debug!(connection_id = id, "Memory broker connection opened");
        Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        })
    }

    /// Drop every connection as if the network failed. Active subscriptions
    /// receive [`BrokerError::ConnectionClosed`] before their streams end.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        for id in state.connection_ids() {
            state.close_connection(id, Some(&BrokerError::ConnectionClosed));
        }
        tracing::debug!("Memory broker disconnected all connections");
    }

    /// Whether an exchange exists.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().has_exchange(name)
    }

    /// Declared parameters of an exchange.
    #[must_use]
    pub fn exchange_spec(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchange_spec(name)
    }

    /// Whether a queue exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().has_queue(name)
    }

    /// `(destination, routing_key)` pairs bound to `source`.
    #[must_use]
    pub fn bindings(&self, source: &str) -> Vec<(String, String)> {
        self.lock().bindings(source)
    }

    /// Messages waiting in a queue for a consumer.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queue_depth(name)
    }

    /// Live consumers on a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.lock().consumer_count(name)
    }

    /// Channels currently open across all connections.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.lock().open_channels()
    }

    /// Broker-side counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.lock().stats()
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = self.broker.lock().open_channel(self.id)?;
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.lock().connection_open(self.id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_connection(self.id, None);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryChannel {
    /// Messages delivered on this channel and not yet acknowledged.
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.broker.lock().unacked(self.id)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channel_open(self.id)
    }

    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .on_channel(self.id, |s| s.declare_exchange(name, spec, false))
    }

    async fn declare_exchange_passive(
        &self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .on_channel(self.id, |s| s.declare_exchange(name, spec, true))
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker
            .lock()
            .on_channel(id, |s| s.declare_queue(id, name, spec, false))
    }

    async fn declare_queue_passive(
        &self,
        name: &str,
        spec: &QueueSpec,
    ) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker
            .lock()
            .on_channel(id, |s| s.declare_queue(id, name, spec, true))
    }

    async fn bind(
        &self,
        target: BindTarget,
        destination: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .on_channel(self.id, |s| s.bind(target, destination, binding))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .on_channel(self.id, |s| s.delete_exchange(name))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.broker
            .lock()
            .on_channel(self.id, |s| s.delete_queue(name))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker.lock().on_channel(id, |s| {
            s.publish(id, exchange, routing_key, options, envelope)
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let id = self.id;
        self.broker
            .lock()
            .on_channel(id, |s| s.subscribe(id, queue, options))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker
            .lock()
            .on_channel(id, |s| s.ack(id, delivery_tag, multiple))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        if !state.channel_open(self.id) {
            return Err(BrokerError::ChannelClosed);
        }
        state.close_channel(self.id);
        Ok(())
    }
}
