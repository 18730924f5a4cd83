//! Request/reply over the direct-reply pseudo-queue.
//!
//! Every call on an [`RpcClient`] shares one reply subscription. Replies are
//! matched to waiting callers by correlation id; replies nobody waits for
//! (unknown ids, or calls that were already cancelled) are discarded.

use crate::channel::ChannelHandle;
use crate::message::Message;
use crate::publisher::{Publisher, PublisherConfig};
use futures::StreamExt;
use mqkit_core::{
    BrokerError, ConsumeOptions, CorrelationIdGenerator, Delivery, DeliveryStream, MqError,
    Publishing, UuidCorrelationIds, DIRECT_REPLY_QUEUE,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Immutable RPC client configuration.
#[derive(Clone)]
pub struct RpcConfig {
    exchange: String,
    mandatory: bool,
    cancellation: Option<CancellationToken>,
    correlation_ids: Arc<dyn CorrelationIdGenerator>,
}

impl RpcConfig {
    /// Send requests to `exchange`, with random UUID correlation ids.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            mandatory: false,
            cancellation: None,
            correlation_ids: Arc::new(UuidCorrelationIds),
        }
    }

    /// Fail requests the broker cannot route instead of waiting for a
    /// reply that never comes.
    #[must_use]
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Refuse new calls once `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Use `generator` for correlation ids.
    #[must_use]
    pub fn correlation_ids(mut self, generator: impl CorrelationIdGenerator + 'static) -> Self {
        self.correlation_ids = Arc::new(generator);
        self
    }

    fn publisher_config(&self) -> PublisherConfig {
        let config = PublisherConfig::new(self.exchange.clone()).mandatory(self.mandatory);
        match &self.cancellation {
            Some(token) => config.cancellation(token.clone()),
            None => config,
        }
    }
}

impl fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConfig")
            .field("exchange", &self.exchange)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

type Reply = Result<Message, MqError>;

#[derive(Default)]
struct Registry {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    stopped: Option<BrokerError>,
}

/// Correlation-id keyed waiters, shared with the dispatcher.
#[derive(Clone, Default)]
struct Waiters(Arc<Mutex<Registry>>);

impl Waiters {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Reply>, MqError> {
        let mut registry = self.lock();
        if let Some(cause) = &registry.stopped {
            return Err(MqError::connectivity("registering call", cause.clone()));
        }
        let (sender, receiver) = oneshot::channel();
        registry.waiters.insert(correlation_id.to_string(), sender);
        Ok(receiver)
    }

    fn take(&self, correlation_id: &str) -> Option<oneshot::Sender<Reply>> {
        self.lock().waiters.remove(correlation_id)
    }

    fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Refuse new calls and fail every outstanding one.
    fn fail_all(&self, cause: &BrokerError) {
        let waiters: Vec<_> = {
            let mut registry = self.lock();
            registry.stopped = Some(cause.clone());
            registry.waiters.drain().collect()
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(MqError::connectivity("awaiting reply", cause.clone())));
        }
    }
}

/// Removes a waiter when its call finishes or is dropped.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    correlation_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.take(&self.correlation_id);
    }
}

/// Correlates calls with replies arriving on one channel.
pub struct RpcClient {
    publisher: Publisher,
    correlation_ids: Arc<dyn CorrelationIdGenerator>,
    waiters: Waiters,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Subscribe to the direct-reply pseudo-queue on `channel` and start
    /// dispatching replies.
    ///
    /// The channel is owned by the client from now on; dropping the client
    /// closes it.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Subscription`] if the reply consumer cannot be
    /// started.
    pub async fn open(channel: ChannelHandle, config: RpcConfig) -> Result<Self, MqError> {
        let replies = channel
            .subscribe(DIRECT_REPLY_QUEUE, &ConsumeOptions::default())
            .await?;
        let waiters = Waiters::default();
        let dispatcher = tokio::spawn(dispatch(channel.clone(), replies, waiters.clone()));

        tracing::debug!(exchange = %config.exchange, "RPC client ready");

        Ok(Self {
            publisher: Publisher::new(channel, config.publisher_config()),
            correlation_ids: config.correlation_ids,
            waiters,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Channel carrying requests and replies.
    #[must_use]
    pub fn channel(&self) -> &ChannelHandle {
        self.publisher.channel()
    }

    /// Whether calls can still be made.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel().is_open()
    }

    /// Calls waiting for a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Send `publishing` with `routing_key` and wait for the matching reply
    /// or for `cancellation`, whichever comes first.
    ///
    /// # Errors
    ///
    /// - [`MqError::Cancelled`] if `cancellation` fires first
    /// - [`MqError::Connectivity`] if the reply subscription ends first
    /// - [`MqError::Publish`] if the request cannot be sent
    pub async fn call(
        &self,
        routing_key: &str,
        publishing: &Publishing,
        cancellation: &CancellationToken,
    ) -> Result<Message, MqError> {
        self.call_until(routing_key, publishing, cancellation.cancelled())
            .await
    }

    /// [`call`](Self::call) with a deadline instead of a token. Expiry is
    /// reported as [`MqError::Cancelled`].
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_timeout(
        &self,
        routing_key: &str,
        publishing: &Publishing,
        timeout: Duration,
    ) -> Result<Message, MqError> {
        self.call_until(routing_key, publishing, tokio::time::sleep(timeout))
            .await
    }

    async fn call_until(
        &self,
        routing_key: &str,
        publishing: &Publishing,
        cancelled: impl Future<Output = ()>,
    ) -> Result<Message, MqError> {
        let correlation_id = self.correlation_ids.next_id();
        let waiter = self.waiters.register(&correlation_id)?;
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            correlation_id: correlation_id.clone(),
        };

        let request = publishing
            .to_builder()
            .reply_to(DIRECT_REPLY_QUEUE)
            .correlation_id(correlation_id.as_str())
            .build();
        self.publisher.send(routing_key, &request).await?;
        tracing::debug!(correlation_id = %correlation_id, routing_key, "Call sent");

        tokio::select! {
            reply = waiter => reply.unwrap_or_else(|_| {
                Err(MqError::connectivity("awaiting reply", BrokerError::ChannelClosed))
            }),
            () = cancelled => {
                tracing::debug!(correlation_id = %correlation_id, "Call cancelled");
                Err(MqError::Cancelled)
            }
        }
    }

    /// Close the channel and wait for the dispatcher to stop. Outstanding
    /// calls fail with [`MqError::Connectivity`].
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker fails to close the
    /// channel.
    pub async fn close(&self) -> Result<(), MqError> {
        let result = self.channel().close().await;
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::warn!(error = %e, "RPC dispatcher failed");
            }
        }
        result
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.channel().close_detached();
    }
}

async fn dispatch(channel: ChannelHandle, mut replies: DeliveryStream, waiters: Waiters) {
    let cause = loop {
        let next = tokio::select! {
            biased;
            () = channel.closed() => break BrokerError::ChannelClosed,
            next = replies.next() => next,
        };
        match next {
            Some(Ok(delivery)) => route_reply(&channel, &waiters, delivery),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Reply stream failed");
                break e;
            }
            None => break BrokerError::ChannelClosed,
        }
    };
    tracing::debug!(pending = waiters.len(), "RPC dispatcher stopped");
    waiters.fail_all(&cause);
    if let Err(e) = channel.close().await {
        tracing::debug!(error = %e, "Reply channel close failed");
    }
}

fn route_reply(channel: &ChannelHandle, waiters: &Waiters, delivery: Delivery) {
    let Some(correlation_id) = delivery.envelope.properties.correlation_id.clone() else {
        tracing::debug!("Discarding reply without correlation id");
        return;
    };
    match waiters.take(&correlation_id) {
        Some(waiter) => {
            if waiter
                .send(Ok(Message::new(delivery, channel.clone())))
                .is_err()
            {
                tracing::debug!(correlation_id = %correlation_id, "Caller left before reply");
            }
        }
        None => tracing::debug!(correlation_id = %correlation_id, "Discarding unmatched reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_registry_refuses_new_calls() {
        let waiters = Waiters::default();
        let mut pending = waiters.register("a").unwrap();

        waiters.fail_all(&BrokerError::ConnectionClosed);

        let reply = pending.try_recv().unwrap();
        assert!(matches!(reply, Err(MqError::Connectivity { .. })));
        assert!(matches!(
            waiters.register("b"),
            Err(MqError::Connectivity { .. })
        ));
        assert_eq!(waiters.len(), 0);
    }

    #[test]
    fn guard_removes_waiter_on_drop() {
        let waiters = Waiters::default();
        let _receiver = waiters.register("a").unwrap();
        {
            let _guard = WaiterGuard {
                waiters: &waiters,
                correlation_id: "a".to_string(),
            };
            assert_eq!(waiters.len(), 1);
        }
        assert_eq!(waiters.len(), 0);
    }

    #[test]
    fn config_defaults_to_uuid_ids() {
        let config = RpcConfig::new("rpc");
        let first = config.correlation_ids.next_id();
        let second = config.correlation_ids.next_id();
        assert_ne!(first, second);
        assert_eq!(first.len(), 36);
    }
}
