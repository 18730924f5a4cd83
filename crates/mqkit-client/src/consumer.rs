//! Queue consumers and their dispatch loop.

use crate::channel::ChannelHandle;
use crate::message::Message;
use futures::{FutureExt, Stream, StreamExt};
use mqkit_core::{Arguments, BrokerError, ConsumeOptions, DeliveryStream, MqError};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Immutable consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    queue: String,
    consumer_tag: String,
    auto_ack: bool,
    exclusive: bool,
    no_local: bool,
    no_wait: bool,
    arguments: Arguments,
    errors: Option<mpsc::UnboundedSender<MqError>>,
}

impl ConsumerConfig {
    /// Consume from `queue` with auto-ack and a broker-assigned tag.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: String::new(),
            auto_ack: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
            arguments: Arguments::new(),
            errors: None,
        }
    }

    /// Set the consumer tag.
    #[must_use]
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Consider deliveries acknowledged as soon as they are sent.
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Request exclusive access to the queue.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Skip messages published on this connection.
    #[must_use]
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Do not wait for the broker to confirm the subscription.
    #[must_use]
    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Add a broker-specific consume argument.
    #[must_use]
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Report dispatch errors on `errors` instead of logging them.
    #[must_use]
    pub fn error_channel(mut self, errors: mpsc::UnboundedSender<MqError>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn options(&self) -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: self.consumer_tag.clone(),
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
            arguments: self.arguments.clone(),
        }
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not subscribed yet
    Created,
    /// Subscription accepted by the broker
    Subscribed,
    /// Dispatch loop running
    Dispatching,
    /// Loop exited or subscription gone
    Closed,
}

/// Consumes one queue over a [`ChannelHandle`].
#[derive(Debug)]
pub struct Consumer {
    channel: ChannelHandle,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    /// Create a consumer on `channel`.
    #[must_use]
    pub fn new(channel: ChannelHandle, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        Self {
            channel,
            config,
            state,
        }
    }

    /// Channel this consumer reads from.
    #[must_use]
    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Start the subscription and return the raw message stream.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Subscription`] if the consumer was already
    /// subscribed, its channel is closed, or the broker rejects the request.
    pub async fn subscribe(&self) -> Result<MessageStream, MqError> {
        if self.state() != ConsumerState::Created {
            return Err(MqError::Subscription {
                queue: self.config.queue.clone(),
                reason: "consumer already subscribed".to_string(),
            });
        }
        let deliveries = self
            .channel
            .subscribe(&self.config.queue, &self.config.options())
            .await?;
        self.state.send_replace(ConsumerState::Subscribed);
        tracing::info!(queue = %self.config.queue, "Consumer subscribed");
        Ok(MessageStream {
            queue: self.config.queue.clone(),
            deliveries,
            channel: self.channel.clone(),
        })
    }

    /// Subscribe and dispatch every message to `handler` on a spawned task.
    ///
    /// Messages are handled one at a time in delivery order. A panicking
    /// handler is reported and the loop moves on to the next message. The
    /// loop stops when the channel is closed or the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Subscription`] if the subscription is rejected;
    /// later failures go to the error channel.
    pub async fn run<F, Fut>(self, handler: F) -> Result<ConsumerHandle, MqError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let messages = self.subscribe().await?;
        let state = self.state.subscribe();
        let channel = self.channel.clone();
        let task = tokio::spawn(dispatch(
            self.channel,
            messages,
            handler,
            self.state,
            ErrorSink {
                queue: self.config.queue,
                errors: self.config.errors,
            },
        ));
        Ok(ConsumerHandle {
            channel,
            state,
            task,
        })
    }
}

/// Messages of one subscription.
pub struct MessageStream {
    queue: String,
    deliveries: DeliveryStream,
    channel: ChannelHandle,
}

impl MessageStream {
    /// Queue this stream reads from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Stream for MessageStream {
    type Item = Result<Message, MqError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        this.deliveries.poll_next_unpin(cx).map(|next| {
            next.map(|delivery| match delivery {
                Ok(delivery) => Ok(Message::new(delivery, this.channel.clone())),
                Err(e) => Err(MqError::connectivity(
                    format!("consuming from queue '{}'", this.queue),
                    e,
                )),
            })
        })
    }
}

/// Running consumer returned by [`Consumer::run`].
#[derive(Debug)]
pub struct ConsumerHandle {
    channel: ChannelHandle,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the dispatch loop has exited.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConsumerState::Closed).await;
    }

    /// Close the owning channel. The loop exits at its next suspension
    /// point; a handler already running finishes first.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker fails to close the
    /// channel.
    pub async fn close(&self) -> Result<(), MqError> {
        self.channel.close().await
    }

    /// Wait for the dispatch task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Handler`] if the task itself panicked.
    pub async fn join(self) -> Result<(), MqError> {
        self.task
            .await
            .map_err(|e| MqError::Handler(format!("dispatch task failed: {e}")))
    }
}

struct ErrorSink {
    queue: String,
    errors: Option<mpsc::UnboundedSender<MqError>>,
}

impl ErrorSink {
    fn report(&self, err: MqError) {
        let undelivered = match &self.errors {
            Some(errors) => errors.send(err).err().map(|e| e.0),
            None => Some(err),
        };
        if let Some(err) = undelivered {
            tracing::error!(queue = %self.queue, error = %err, "Consumer error");
        }
    }
}

async fn dispatch<F, Fut>(
    channel: ChannelHandle,
    mut messages: MessageStream,
    handler: F,
    state: watch::Sender<ConsumerState>,
    sink: ErrorSink,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    state.send_replace(ConsumerState::Dispatching);
    tracing::debug!(queue = %sink.queue, "Dispatch loop started");

    loop {
        let next = tokio::select! {
            biased;
            () = channel.closed() => {
                tracing::debug!(queue = %sink.queue, "Consumer observed close");
                break;
            }
            next = messages.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                let delivery_tag = message.delivery_tag();
                let outcome = AssertUnwindSafe(async { handler(message).await })
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    let reason = panic_message(panic.as_ref());
                    tracing::warn!(queue = %sink.queue, delivery_tag, "Handler panicked");
                    sink.report(MqError::Handler(reason));
                }
            }
            Some(Err(err)) => {
                sink.report(err);
                break;
            }
            None => {
                sink.report(MqError::connectivity(
                    format!("consuming from queue '{}'", sink.queue),
                    BrokerError::ChannelClosed,
                ));
                break;
            }
        }
    }

    if let Err(e) = channel.close().await {
        tracing::debug!(queue = %sink.queue, error = %e, "Channel close after dispatch failed");
    }
    state.send_replace(ConsumerState::Closed);
    tracing::info!(queue = %sink.queue, "Consumer closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ConsumerConfig::new("jobs");
        let options = config.options();
        assert_eq!(config.queue(), "jobs");
        assert!(options.auto_ack);
        assert!(!options.exclusive);
        assert!(options.consumer_tag.is_empty());
    }

    #[test]
    fn config_builder_sets_options() {
        let options = ConsumerConfig::new("jobs")
            .consumer_tag("worker-1")
            .auto_ack(false)
            .exclusive(true)
            .argument("x-priority", 5)
            .options();
        assert_eq!(options.consumer_tag, "worker-1");
        assert!(!options.auto_ack);
        assert!(options.exclusive);
        assert_eq!(options.arguments["x-priority"], 5);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn error_sink_falls_back_when_receiver_is_gone() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let sink = ErrorSink {
            queue: "jobs".to_string(),
            errors: Some(sender),
        };
        sink.report(MqError::Handler("boom".to_string()));
    }
}
