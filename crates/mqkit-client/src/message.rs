//! Inbound messages.

use crate::channel::ChannelHandle;
use mqkit_core::{
    Delivery, Envelope, MqError, Properties, PublishOptions, Publishing, DEFAULT_EXCHANGE,
};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::io::Cursor;

/// A delivered envelope bound to the channel that delivered it.
#[derive(Debug, Clone)]
pub struct Message {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    envelope: Envelope,
    channel: ChannelHandle,
}

impl Message {
    pub(crate) fn new(delivery: Delivery, channel: ChannelHandle) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            envelope: delivery.envelope,
            channel,
        }
    }

    /// Channel-scoped delivery tag.
    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Exchange the message was published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key used at publish time.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the broker delivered this message before.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Envelope properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.envelope.properties
    }

    /// Full envelope.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Correlation id, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.properties.correlation_id.as_deref()
    }

    /// Reply address, if any.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.properties.reply_to.as_deref()
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    /// Body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        self.envelope.text()
    }

    /// Reader over the raw body.
    #[must_use]
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.envelope.body.as_slice())
    }

    /// Body with the content encoding removed.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if the body cannot be decompressed.
    pub fn decoded_body(&self) -> Result<Cow<'_, [u8]>, MqError> {
        self.envelope.decoded_body()
    }

    /// Deserialize the decoded body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if decoding fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, MqError> {
        self.envelope.json()
    }

    /// Acknowledge this delivery. Only meaningful for consumers without
    /// auto-ack.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker rejects the ack.
    pub async fn ack(&self) -> Result<(), MqError> {
        self.channel.ack(self.delivery_tag, false).await
    }

    /// Publish `reply` to this message's reply address through the default
    /// exchange. The request's correlation id is copied onto replies that
    /// carry none.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Publish`] if the message has no reply address,
    /// the channel is closed or the broker rejects the publish.
    pub async fn reply(&self, reply: &Publishing) -> Result<(), MqError> {
        let failed = |routing_key: &str, reason: String| MqError::Publish {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };
        let reply_to = self
            .reply_to()
            .ok_or_else(|| failed("", "message has no reply_to".to_string()))?;
        if !self.channel.is_open() {
            return Err(failed(reply_to, "channel is closed".to_string()));
        }

        let owned;
        let reply = match (self.correlation_id(), &reply.properties().correlation_id) {
            (Some(id), None) => {
                owned = reply.to_builder().correlation_id(id).build();
                &owned
            }
            _ => reply,
        };

        self.channel
            .broker()
            .publish(
                DEFAULT_EXCHANGE,
                reply_to,
                PublishOptions::default(),
                reply.envelope(),
            )
            .await
            .map_err(|e| failed(reply_to, e.to_string()))?;
        tracing::debug!(
            reply_to,
            correlation_id = ?reply.properties().correlation_id,
            "Reply sent"
        );
        Ok(())
    }

    /// Drop the channel binding and keep the envelope.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}
