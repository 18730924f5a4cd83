//! Broker state shared by every connection and channel.

use crate::routing;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use mqkit_core::{
    BindTarget, Binding, BrokerError, ConsumeOptions, Delivery, DeliveryStream, Envelope,
    ExchangeSpec, PublishOptions, QueueSpec, DEFAULT_EXCHANGE, DIRECT_REPLY_QUEUE,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

type DeliverySender = UnboundedSender<Result<Delivery, BrokerError>>;

/// Counters of broker-side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Exchanges created by an active declare
    pub exchanges_created: usize,
    /// Queues created by an active declare
    pub queues_created: usize,
    /// Distinct bindings created
    pub bindings_created: usize,
    /// Accepted publishes
    pub published: usize,
    /// Deliveries handed to consumers
    pub delivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    target: BindTarget,
    destination: String,
    routing_key: String,
}

struct ExchangeEntry {
    spec: ExchangeSpec,
    routes: Vec<Route>,
}

struct Pending {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
}

struct ConsumerSlot {
    channel_id: u64,
    auto_ack: bool,
    exclusive: bool,
    sender: DeliverySender,
}

struct QueueEntry {
    spec: QueueSpec,
    owner: Option<u64>,
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct ChannelEntry {
    connection_id: u64,
    next_delivery_tag: u64,
    unacked: BTreeSet<u64>,
    reply_consumer: Option<DeliverySender>,
}

impl ChannelEntry {
    fn next_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }
}

#[derive(Default)]
pub(crate) struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    channels: HashMap<u64, ChannelEntry>,
    connections: HashMap<u64, bool>,
    next_id: u64,
    next_consumer_tag: u64,
    stats: BrokerStats,
}

impl BrokerState {
    pub(crate) fn open_connection(&mut self) -> u64 {
        self.next_id += 1;
        self.connections.insert(self.next_id, true);
        self.next_id
    }

    pub(crate) fn connection_open(&self, connection_id: u64) -> bool {
        self.connections.get(&connection_id).copied().unwrap_or(false)
    }

    pub(crate) fn close_connection(&mut self, connection_id: u64, cause: Option<&BrokerError>) {
        self.connections.insert(connection_id, false);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            if let Some(cause) = cause {
                self.fail_consumers(id, cause);
            }
            self.close_channel(id);
        }
    }

    pub(crate) fn connection_ids(&self) -> Vec<u64> {
        self.connections.keys().copied().collect()
    }

    pub(crate) fn open_channel(&mut self, connection_id: u64) -> Result<u64, BrokerError> {
        if !self.connection_open(connection_id) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.next_id += 1;
        self.channels.insert(
            self.next_id,
            ChannelEntry {
                connection_id,
                next_delivery_tag: 0,
                unacked: BTreeSet::new(),
                reply_consumer: None,
            },
        );
        Ok(self.next_id)
    }

    pub(crate) fn channel_open(&self, channel_id: u64) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|c| self.connection_open(c.connection_id))
    }

    /// Run `op` on an open channel. Soft errors close the channel, as an
    /// AMQP broker does.
    pub(crate) fn on_channel<T>(
        &mut self,
        channel_id: u64,
        op: impl FnOnce(&mut Self) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        if !self.channel_open(channel_id) {
            return Err(BrokerError::ChannelClosed);
        }
        let result = op(self);
        if let Err(err) = &result {
            if closes_channel(err) {
                tracing::debug!(channel_id, error = %err, "Closing channel after soft error");
                self.close_channel(channel_id);
            }
        }
        result
    }

    /// Forget the channel with its unacked deliveries and its consumers.
    pub(crate) fn close_channel(&mut self, channel_id: u64) {
        self.channels.remove(&channel_id);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != channel_id);
        }
    }

    fn fail_consumers(&mut self, channel_id: u64, cause: &BrokerError) {
        for queue in self.queues.values() {
            for slot in queue.consumers.iter().filter(|s| s.channel_id == channel_id) {
                let _ = slot.sender.unbounded_send(Err(cause.clone()));
            }
        }
        if let Some(reply) = self
            .channels
            .get(&channel_id)
            .and_then(|c| c.reply_consumer.as_ref())
        {
            let _ = reply.unbounded_send(Err(cause.clone()));
        }
    }

    fn owner_of(&self, channel_id: u64) -> Option<u64> {
        self.channels.get(&channel_id).map(|c| c.connection_id)
    }

    pub(crate) fn declare_exchange(
        &mut self,
        name: &str,
        spec: &ExchangeSpec,
        passive: bool,
    ) -> Result<(), BrokerError> {
        if let Some(existing) = self.exchanges.get(name) {
            if existing.spec.is_equivalent(spec) {
                return Ok(());
            }
            return Err(BrokerError::PreconditionFailed(format!(
                "inequivalent arguments for exchange '{name}': declared {}, requested {}",
                existing.spec.kind, spec.kind
            )));
        }
        if passive {
            return Err(BrokerError::NotFound(format!("no exchange '{name}'")));
        }
        if name.starts_with("amq.") || name.is_empty() {
            return Err(BrokerError::AccessRefused(format!(
                "exchange name '{name}' is reserved"
            )));
        }
        let mut spec = spec.clone();
        spec.bindings.clear();
        self.exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                spec,
                routes: Vec::new(),
            },
        );
        self.stats.exchanges_created += 1;
        Ok(())
    }

    pub(crate) fn declare_queue(
        &mut self,
        channel_id: u64,
        name: &str,
        spec: &QueueSpec,
        passive: bool,
    ) -> Result<(), BrokerError> {
        let connection = self.owner_of(channel_id);
        if let Some(existing) = self.queues.get(name) {
            if existing.owner.is_some() && existing.owner != connection {
                return Err(BrokerError::ResourceLocked(format!(
                    "queue '{name}' is exclusive to another connection"
                )));
            }
            if existing.spec.is_equivalent(spec) {
                return Ok(());
            }
            return Err(BrokerError::PreconditionFailed(format!(
                "inequivalent arguments for queue '{name}'"
            )));
        }
        if passive {
            return Err(BrokerError::NotFound(format!("no queue '{name}'")));
        }
        if name.starts_with("amq.") {
            return Err(BrokerError::AccessRefused(format!(
                "queue name '{name}' is reserved"
            )));
        }
        let mut stored = spec.clone();
        stored.bindings.clear();
        self.queues.insert(
            name.to_string(),
            QueueEntry {
                owner: if spec.exclusive { connection } else { None },
                spec: stored,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        self.stats.queues_created += 1;
        Ok(())
    }

    pub(crate) fn bind(
        &mut self,
        target: BindTarget,
        destination: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError> {
        let destination_exists = match target {
            BindTarget::Exchange => self.exchanges.contains_key(destination),
            BindTarget::Queue => self.queues.contains_key(destination),
        };
        if !destination_exists {
            let kind = match target {
                BindTarget::Exchange => "exchange",
                BindTarget::Queue => "queue",
            };
            return Err(BrokerError::NotFound(format!("no {kind} '{destination}'")));
        }
        let source = self.exchanges.get_mut(&binding.exchange).ok_or_else(|| {
            BrokerError::NotFound(format!("no exchange '{}'", binding.exchange))
        })?;
        let route = Route {
            target,
            destination: destination.to_string(),
            routing_key: binding.routing_key.clone(),
        };
        if !source.routes.contains(&route) {
            source.routes.push(route);
            self.stats.bindings_created += 1;
        }
        Ok(())
    }

    pub(crate) fn delete_exchange(&mut self, name: &str) -> Result<(), BrokerError> {
        if self.exchanges.remove(name).is_none() {
            return Err(BrokerError::NotFound(format!("no exchange '{name}'")));
        }
        for exchange in self.exchanges.values_mut() {
            exchange
                .routes
                .retain(|r| !(r.target == BindTarget::Exchange && r.destination == name));
        }
        Ok(())
    }

    pub(crate) fn delete_queue(&mut self, name: &str) -> Result<(), BrokerError> {
        if self.queues.remove(name).is_none() {
            return Err(BrokerError::NotFound(format!("no queue '{name}'")));
        }
        for exchange in self.exchanges.values_mut() {
            exchange
                .routes
                .retain(|r| !(r.target == BindTarget::Queue && r.destination == name));
        }
        Ok(())
    }

    pub(crate) fn publish(
        &mut self,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let mut envelope = envelope.clone();

        if envelope.properties.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) {
            let has_reply_consumer = self
                .channels
                .get(&channel_id)
                .is_some_and(|c| c.reply_consumer.is_some());
            if !has_reply_consumer {
                return Err(BrokerError::PreconditionFailed(
                    "fast reply consumer does not exist".to_string(),
                ));
            }
            envelope.properties.reply_to = Some(format!("{DIRECT_REPLY_QUEUE}.{channel_id}"));
        }

        if exchange == DEFAULT_EXCHANGE {
            if let Some(target) = routing_key
                .strip_prefix(DIRECT_REPLY_QUEUE)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                return self.deliver_reply(target, routing_key, options, envelope);
            }
        }

        let queues = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let entry = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::NotFound(format!("no exchange '{exchange}'")))?;
            if entry.spec.internal {
                return Err(BrokerError::AccessRefused(format!(
                    "cannot publish to internal exchange '{exchange}'"
                )));
            }
            let mut queues = Vec::new();
            self.route(exchange, routing_key, &mut HashSet::new(), &mut queues);
            queues
        };

        if queues.is_empty() {
            if options.mandatory {
                return Err(BrokerError::Unroutable(format!(
                    "no route for key '{routing_key}' on exchange '{exchange}'"
                )));
            }
            tracing::debug!(exchange, routing_key, "Dropping unroutable message");
            return Ok(());
        }

        if options.immediate
            && !queues
                .iter()
                .any(|q| self.queues.get(q).is_some_and(|e| !e.consumers.is_empty()))
        {
            return Err(BrokerError::Unroutable(format!(
                "no consumer ready for key '{routing_key}' on exchange '{exchange}'"
            )));
        }

        self.stats.published += 1;
        for queue in queues {
            self.enqueue(
                &queue,
                Pending {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    envelope: envelope.clone(),
                },
            );
        }
        Ok(())
    }

    fn deliver_reply(
        &mut self,
        target: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: Envelope,
    ) -> Result<(), BrokerError> {
        let channel = target
            .parse::<u64>()
            .ok()
            .and_then(|id| self.channels.get_mut(&id));
        let Some(channel) = channel else {
            if options.mandatory {
                return Err(BrokerError::Unroutable(format!(
                    "reply address '{routing_key}' is gone"
                )));
            }
            tracing::debug!(routing_key, "Dropping reply for a closed channel");
            return Ok(());
        };
        let delivery_tag = channel.next_tag();
        let delivered = channel.reply_consumer.as_ref().is_some_and(|sender| {
            sender
                .unbounded_send(Ok(Delivery {
                    delivery_tag,
                    exchange: DEFAULT_EXCHANGE.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    envelope,
                }))
                .is_ok()
        });
        self.stats.published += 1;
        if delivered {
            self.stats.delivered += 1;
        }
        Ok(())
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        visited: &mut HashSet<String>,
        queues: &mut Vec<String>,
    ) {
        if !visited.insert(exchange.to_string()) {
            return;
        }
        let Some(entry) = self.exchanges.get(exchange) else {
            return;
        };
        for route in &entry.routes {
            if !routing::matches(entry.spec.kind, &route.routing_key, routing_key) {
                continue;
            }
            match route.target {
                BindTarget::Queue => {
                    if !queues.contains(&route.destination) {
                        queues.push(route.destination.clone());
                    }
                }
                BindTarget::Exchange => {
                    self.route(&route.destination, routing_key, visited, queues);
                }
            }
        }
    }

    fn enqueue(&mut self, queue_name: &str, pending: Pending) {
        let Self {
            queues,
            channels,
            stats,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        match try_deliver(queue, channels, pending, queue_name) {
            Ok(()) => stats.delivered += 1,
            Err(pending) => queue.ready.push_back(pending),
        }
    }

    pub(crate) fn subscribe(
        &mut self,
        channel_id: u64,
        queue_name: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let (sender, receiver) = mpsc::unbounded();

        if queue_name == DIRECT_REPLY_QUEUE {
            if !options.auto_ack {
                return Err(BrokerError::PreconditionFailed(
                    "reply consumer must use auto-ack".to_string(),
                ));
            }
            let channel = self
                .channels
                .get_mut(&channel_id)
                .ok_or(BrokerError::ChannelClosed)?;
            if channel.reply_consumer.is_some() {
                return Err(BrokerError::PreconditionFailed(
                    "reply consumer already set".to_string(),
                ));
            }
            channel.reply_consumer = Some(sender);
            return Ok(receiver.boxed());
        }

        let connection = self.owner_of(channel_id);
        let Self {
            queues,
            channels,
            stats,
            next_consumer_tag,
            ..
        } = self;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("no queue '{queue_name}'")))?;
        if queue.owner.is_some() && queue.owner != connection {
            return Err(BrokerError::ResourceLocked(format!(
                "queue '{queue_name}' is exclusive to another connection"
            )));
        }
        if queue.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !queue.consumers.is_empty())
        {
            return Err(BrokerError::AccessRefused(format!(
                "queue '{queue_name}' in exclusive use"
            )));
        }

        *next_consumer_tag += 1;
        let tag = if options.consumer_tag.is_empty() {
            format!("ctag-{channel_id}-{next_consumer_tag}")
        } else {
            options.consumer_tag.clone()
        };
        tracing::debug!(queue = queue_name, consumer_tag = %tag, "Consumer registered");

        queue.consumers.push(ConsumerSlot {
            channel_id,
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            sender,
        });

        while let Some(pending) = queue.ready.pop_front() {
            match try_deliver(queue, channels, pending, queue_name) {
                Ok(()) => stats.delivered += 1,
                Err(pending) => {
                    queue.ready.push_front(pending);
                    break;
                }
            }
        }

        Ok(receiver.boxed())
    }

    pub(crate) fn ack(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), BrokerError> {
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(BrokerError::ChannelClosed)?;
        let acknowledged = if multiple {
            let before = channel.unacked.len();
            channel
                .unacked
                .retain(|tag| delivery_tag != 0 && *tag > delivery_tag);
            before != channel.unacked.len()
        } else {
            channel.unacked.remove(&delivery_tag)
        };
        if acknowledged {
            Ok(())
        } else {
            Err(BrokerError::PreconditionFailed(format!(
                "unknown delivery tag {delivery_tag}"
            )))
        }
    }

    pub(crate) fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub(crate) fn exchange_spec(&self, name: &str) -> Option<ExchangeSpec> {
        self.exchanges.get(name).map(|e| e.spec.clone())
    }

    pub(crate) fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub(crate) fn bindings(&self, source: &str) -> Vec<(String, String)> {
        self.exchanges
            .get(source)
            .map(|e| {
                e.routes
                    .iter()
                    .map(|r| (r.destination.clone(), r.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn queue_depth(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.ready.len())
    }

    pub(crate) fn consumer_count(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.consumers.len())
    }

    pub(crate) fn unacked(&self, channel_id: u64) -> usize {
        self.channels.get(&channel_id).map_or(0, |c| c.unacked.len())
    }

    /// Channel entries held, open or not.
    #[cfg(test)]
    pub(crate) fn tracked_channels(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn open_channels(&self) -> usize {
        self.channels
            .keys()
            .filter(|id| self.channel_open(**id))
            .count()
    }

    pub(crate) fn stats(&self) -> BrokerStats {
        self.stats
    }
}

/// Hand `pending` to the next live consumer in round-robin order, dropping
/// consumers whose stream was dropped.
fn try_deliver(
    queue: &mut QueueEntry,
    channels: &mut HashMap<u64, ChannelEntry>,
    pending: Pending,
    queue_name: &str,
) -> Result<(), Pending> {
    while !queue.consumers.is_empty() {
        let idx = queue.next_consumer % queue.consumers.len();
        let slot = &queue.consumers[idx];
        let Some(channel) = channels.get_mut(&slot.channel_id) else {
            queue.consumers.remove(idx);
            continue;
        };
        if slot.sender.is_closed() {
            tracing::debug!(queue = queue_name, "Dropping consumer with closed stream");
            queue.consumers.remove(idx);
            continue;
        }
        let delivery_tag = channel.next_tag();
        if !slot.auto_ack {
            channel.unacked.insert(delivery_tag);
        }
        let delivery = Delivery {
            delivery_tag,
            exchange: pending.exchange.clone(),
            routing_key: pending.routing_key.clone(),
            redelivered: false,
            envelope: pending.envelope.clone(),
        };
        if slot.sender.unbounded_send(Ok(delivery)).is_ok() {
            queue.next_consumer = idx + 1;
            return Ok(());
        }
        channel.unacked.remove(&delivery_tag);
        queue.consumers.remove(idx);
    }
    Err(pending)
}

fn closes_channel(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::NotFound(_)
            | BrokerError::PreconditionFailed(_)
            | BrokerError::AccessRefused(_)
            | BrokerError::ResourceLocked(_)
    )
}
