//! Publishing to an exchange.

use crate::channel::{ChannelHandle, CloseOnDrop};
use crate::message::Message;
use crate::rpc::{RpcClient, RpcConfig};
use mqkit_core::{MqError, PublishOptions, Publishing};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Immutable publisher configuration.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    exchange: String,
    mandatory: bool,
    immediate: bool,
    cancellation: Option<CancellationToken>,
}

impl PublisherConfig {
    /// Publish to `exchange`; the empty name is the default exchange.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Self::default()
        }
    }

    /// Fail publishes the broker cannot route.
    #[must_use]
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Fail publishes no consumer can take immediately.
    #[must_use]
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Refuse to send once `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Target exchange.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn options(&self) -> PublishOptions {
        PublishOptions {
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }
}

/// Sends envelopes to one exchange over a [`ChannelHandle`].
#[derive(Debug, Clone)]
pub struct Publisher {
    channel: ChannelHandle,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher on `channel`.
    #[must_use]
    pub fn new(channel: ChannelHandle, config: PublisherConfig) -> Self {
        Self { channel, config }
    }

    /// Channel this publisher sends on.
    #[must_use]
    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish `publishing` with `routing_key`.
    ///
    /// # Errors
    ///
    /// - [`MqError::Cancelled`] if the configured token is cancelled
    /// - [`MqError::Publish`] if the channel is closed or the broker rejects
    ///   the message
    pub async fn send(&self, routing_key: &str, publishing: &Publishing) -> Result<(), MqError> {
        if self
            .config
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(MqError::Cancelled);
        }
        let exchange = self.config.exchange.as_str();
        if !self.channel.is_open() {
            return Err(MqError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "channel is closed".to_string(),
            });
        }

        self.channel
            .broker()
            .publish(
                exchange,
                routing_key,
                self.config.options(),
                publishing.envelope(),
            )
            .await
            .map_err(|e| MqError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            exchange,
            routing_key,
            bytes = publishing.body().len(),
            "Message published"
        );
        Ok(())
    }

    /// Publish a persistent `text/plain` message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_text(
        &self,
        routing_key: &str,
        text: impl Into<String>,
    ) -> Result<(), MqError> {
        self.send(routing_key, &Publishing::text(text)).await
    }

    /// Publish a persistent `application/octet-stream` message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_binary(
        &self,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), MqError> {
        self.send(routing_key, &Publishing::binary(body)).await
    }

    /// Publish `value` as a persistent `application/json` message.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if `value` cannot be serialized, or
    /// any error of [`send`](Self::send).
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        value: &T,
    ) -> Result<(), MqError> {
        self.send(routing_key, &Publishing::json(value)?).await
    }

    /// Perform a single call over the direct-reply pseudo-queue and return
    /// the reply.
    ///
    /// The publisher's channel carries the reply subscription, so it is
    /// consumed and always closed afterwards, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`MqError::Cancelled`] if `cancellation` fires before a reply
    /// - [`MqError::Subscription`] if the reply consumer cannot start
    /// - any error of [`send`](Self::send)
    pub async fn request(
        self,
        routing_key: &str,
        publishing: &Publishing,
        cancellation: &CancellationToken,
    ) -> Result<Message, MqError> {
        let mut config =
            RpcConfig::new(self.config.exchange.clone()).mandatory(self.config.mandatory);
        if let Some(token) = &self.config.cancellation {
            config = config.cancellation(token.clone());
        }

        // Covers the caller dropping this future before it completes.
        let _release = CloseOnDrop(self.channel.clone());
        let rpc = match RpcClient::open(self.channel.clone(), config).await {
            Ok(rpc) => rpc,
            Err(e) => {
                if let Err(close_err) = self.channel.close().await {
                    tracing::warn!(error = %close_err, "Failed to close request channel");
                }
                return Err(e);
            }
        };

        let result = rpc.call(routing_key, publishing, cancellation).await;
        if let Err(close_err) = rpc.close().await {
            tracing::warn!(error = %close_err, "Failed to close request channel");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mqkit_adapter_memory::MemoryBroker;
    use mqkit_core::{
        ConsumeOptions, ExchangeKind, ExchangeSpec, QueueSpec, CONTENT_BLOB, CONTENT_TEXT,
    };

    #[test]
    fn config_builder() {
        let token = CancellationToken::new();
        let config = PublisherConfig::new("events")
            .mandatory(true)
            .cancellation(token);
        assert_eq!(config.exchange(), "events");
        assert!(config.options().mandatory);
        assert!(!config.options().immediate);
    }

    #[tokio::test]
    async fn send_text_and_binary_set_content_type() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();
        handle
            .broker()
            .declare_queue("inbox", &QueueSpec::new())
            .await
            .unwrap();
        let consumer_handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();
        let mut stream = consumer_handle
            .subscribe("inbox", &ConsumeOptions::default())
            .await
            .unwrap();

        let publisher = handle.publisher(PublisherConfig::new(""));
        publisher.send_text("inbox", "hello").await.unwrap();
        publisher.send_binary("inbox", vec![0_u8, 1, 2]).await.unwrap();

        let text = stream.next().await.unwrap().unwrap();
        let blob = stream.next().await.unwrap().unwrap();
        assert_eq!(
            text.envelope.properties.content_type.as_deref(),
            Some(CONTENT_TEXT)
        );
        assert_eq!(
            blob.envelope.properties.content_type.as_deref(),
            Some(CONTENT_BLOB)
        );
        assert_eq!(blob.envelope.body, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn send_fails_fast_when_cancelled() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();
        let token = CancellationToken::new();
        let publisher = handle.publisher(PublisherConfig::new("").cancellation(token.clone()));

        token.cancel();
        let err = publisher.send_text("inbox", "late").await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn broker_rejection_names_exchange_and_key() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();
        handle
            .broker()
            .declare_exchange("events", &ExchangeSpec::new(ExchangeKind::Direct))
            .await
            .unwrap();
        let publisher = handle.publisher(PublisherConfig::new("events").mandatory(true));

        let err = publisher.send_text("nowhere", "lost").await.unwrap_err();
        match err {
            MqError::Publish {
                exchange,
                routing_key,
                ..
            } => {
                assert_eq!(exchange, "events");
                assert_eq!(routing_key, "nowhere");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
