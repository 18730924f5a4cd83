//! Broker-neutral message envelope.
//!
//! [`Envelope`] is the unit every adapter converts to and from its own wire
//! representation. Outbound messages are wrapped in [`Publishing`], which is
//! assembled with a [`PublishingBuilder`] and cannot be changed afterwards.

use crate::error::MqError;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Content type for plain text bodies.
pub const CONTENT_TEXT: &str = "text/plain";
/// Content type for JSON bodies (the default).
pub const CONTENT_JSON: &str = "application/json";
/// Content type for opaque binary bodies.
pub const CONTENT_BLOB: &str = "application/octet-stream";
/// Content encoding for gzip-compressed bodies.
pub const ENCODING_GZIP: &str = "gzip";

/// Application headers attached to an envelope.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Message may be lost on broker restart
    Transient = 1,
    /// Message is written to disk by durable queues
    #[default]
    Persistent = 2,
}

impl DeliveryMode {
    /// Wire value of the delivery mode.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Transient),
            2 => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// Message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// MIME content type
    pub content_type: Option<String>,
    /// Content encoding (e.g. `gzip`)
    pub content_encoding: Option<String>,
    /// Delivery mode
    pub delivery_mode: Option<DeliveryMode>,
    /// Priority, 0-9
    pub priority: Option<u8>,
    /// Correlation id linking replies to requests
    pub correlation_id: Option<String>,
    /// Address replies should be sent to
    pub reply_to: Option<String>,
    /// Application message id
    pub message_id: Option<String>,
    /// Creation time
    pub timestamp: Option<DateTime<Utc>>,
    /// Message type name
    pub kind: Option<String>,
    /// Producing application
    pub app_id: Option<String>,
    /// Authenticated user id
    pub user_id: Option<String>,
    /// Per-message TTL in milliseconds, as a string
    pub expiration: Option<String>,
    /// Application headers
    pub headers: Headers,
}

/// Properties plus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Message properties
    pub properties: Properties,
    /// Opaque body bytes
    pub body: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with empty properties.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: Properties::default(),
            body: body.into(),
        }
    }

    /// Whether the body is gzip-compressed.
    #[must_use]
    pub fn is_gzip(&self) -> bool {
        self.properties.content_encoding.as_deref() == Some(ENCODING_GZIP)
    }

    /// Body with the content encoding removed.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if a gzip body cannot be decompressed.
    pub fn decoded_body(&self) -> Result<Cow<'_, [u8]>, MqError> {
        if !self.is_gzip() {
            return Ok(Cow::Borrowed(&self.body));
        }
        let mut decoded = Vec::new();
        GzDecoder::new(self.body.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|e| MqError::Payload(format!("gzip decode failed: {e}")))?;
        Ok(Cow::Owned(decoded))
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserialize the (decoded) body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if decoding or parsing fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, MqError> {
        let body = self.decoded_body()?;
        serde_json::from_slice(&body).map_err(|e| MqError::Payload(format!("invalid JSON: {e}")))
    }
}

/// An outbound message, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    envelope: Envelope,
}

impl Publishing {
    /// JSON content type, persistent delivery.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self::builder(body).build()
    }

    /// Start building a publishing with the default properties.
    #[must_use]
    pub fn builder(body: impl Into<Vec<u8>>) -> PublishingBuilder {
        PublishingBuilder::new(body)
    }

    /// Plain text body.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::builder(text.into())
            .content_type(CONTENT_TEXT)
            .delivery_mode(DeliveryMode::Persistent)
            .build()
    }

    /// Opaque binary body.
    #[must_use]
    pub fn binary(body: impl Into<Vec<u8>>) -> Self {
        Self::builder(body)
            .content_type(CONTENT_BLOB)
            .delivery_mode(DeliveryMode::Persistent)
            .build()
    }

    /// Serialize a value as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if serialization fails.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, MqError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| MqError::Payload(format!("unable to encode JSON: {e}")))?;
        Ok(Self::builder(body)
            .content_type(CONTENT_JSON)
            .delivery_mode(DeliveryMode::Persistent)
            .build())
    }

    /// Serialize a value as JSON and gzip the result.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if serialization or compression fails.
    pub fn json_gzip<T: Serialize + ?Sized>(value: &T) -> Result<Self, MqError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| MqError::Payload(format!("unable to encode JSON: {e}")))?;
        Ok(Self::builder(gzip(&body)?)
            .content_type(CONTENT_JSON)
            .content_encoding(ENCODING_GZIP)
            .build())
    }

    /// Read the whole body from a reader.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if the reader fails.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, MqError> {
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| MqError::Payload(format!("unable to read body: {e}")))?;
        Ok(Self::new(body))
    }

    /// Read the body from a reader and gzip it.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Payload`] if reading or compression fails.
    pub fn gzip_from_reader<R: Read>(mut reader: R) -> Result<Self, MqError> {
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| MqError::Payload(format!("unable to read body: {e}")))?;
        Ok(Self::builder(gzip(&body)?)
            .content_encoding(ENCODING_GZIP)
            .build())
    }

    /// The underlying envelope.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Message properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.envelope.properties
    }

    /// Body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.envelope.body
    }

    /// Copy into a new builder, leaving `self` untouched.
    #[must_use]
    pub fn to_builder(&self) -> PublishingBuilder {
        PublishingBuilder {
            envelope: self.envelope.clone(),
        }
    }

    /// Consume into the underlying envelope.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Fluent builder for [`Publishing`].
#[derive(Debug, Clone)]
#[must_use]
pub struct PublishingBuilder {
    envelope: Envelope,
}

impl PublishingBuilder {
    fn new(body: impl Into<Vec<u8>>) -> Self {
        let mut envelope = Envelope::new(body);
        envelope.properties.content_type = Some(CONTENT_JSON.to_string());
        envelope.properties.delivery_mode = Some(DeliveryMode::Persistent);
        Self { envelope }
    }

    /// Set the content type.
    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.content_type = Some(value.into());
        self
    }

    /// Set the content encoding.
    pub fn content_encoding(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.content_encoding = Some(value.into());
        self
    }

    /// Set the delivery mode.
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.envelope.properties.delivery_mode = Some(mode);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.envelope.properties.priority = Some(priority);
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.correlation_id = Some(value.into());
        self
    }

    /// Set the reply address.
    pub fn reply_to(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.reply_to = Some(value.into());
        self
    }

    /// Set the message id.
    pub fn message_id(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.message_id = Some(value.into());
        self
    }

    /// Set the timestamp.
    pub fn timestamp(mut self, value: DateTime<Utc>) -> Self {
        self.envelope.properties.timestamp = Some(value);
        self
    }

    /// Set the message type.
    pub fn kind(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.kind = Some(value.into());
        self
    }

    /// Set the application id.
    pub fn app_id(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.app_id = Some(value.into());
        self
    }

    /// Set the user id.
    pub fn user_id(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.user_id = Some(value.into());
        self
    }

    /// Set the per-message TTL.
    pub fn expiration(mut self, value: impl Into<String>) -> Self {
        self.envelope.properties.expiration = Some(value.into());
        self
    }

    /// Add a single header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.envelope
            .properties
            .headers
            .insert(key.into(), value.into());
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.envelope.properties.headers = headers;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Publishing {
        Publishing {
            envelope: self.envelope,
        }
    }
}

fn gzip(body: &[u8]) -> Result<Vec<u8>, MqError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .map_err(|e| MqError::Payload(format!("gzip encode failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| MqError::Payload(format!("gzip encode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Event {
        id: u32,
        name: String,
    }

    #[test]
    fn new_publishing_defaults() {
        let publishing = Publishing::new(b"{}".to_vec());
        let props = publishing.properties();
        assert_eq!(props.content_type.as_deref(), Some(CONTENT_JSON));
        assert_eq!(props.delivery_mode, Some(DeliveryMode::Persistent));
        assert!(props.correlation_id.is_none());
        assert!(props.reply_to.is_none());
    }

    #[test]
    fn convenience_constructors_set_content_type() {
        let text = Publishing::text("hello");
        assert_eq!(text.properties().content_type.as_deref(), Some(CONTENT_TEXT));
        assert_eq!(text.body(), b"hello");

        let blob = Publishing::binary(vec![0u8, 1, 2]);
        assert_eq!(blob.properties().content_type.as_deref(), Some(CONTENT_BLOB));
        assert_eq!(blob.properties().delivery_mode, Some(DeliveryMode::Persistent));
    }

    #[test]
    fn builder_overrides_defaults() {
        let publishing = Publishing::builder("x")
            .content_type(CONTENT_TEXT)
            .delivery_mode(DeliveryMode::Transient)
            .priority(5)
            .header("tenant", "acme")
            .header("attempt", 2)
            .build();

        let props = publishing.properties();
        assert_eq!(props.delivery_mode, Some(DeliveryMode::Transient));
        assert_eq!(props.priority, Some(5));
        assert_eq!(props.headers["tenant"], serde_json::json!("acme"));
        assert_eq!(props.headers["attempt"], serde_json::json!(2));
    }

    #[test]
    fn to_builder_leaves_original_untouched() {
        let original = Publishing::text("ping");
        let addressed = original.to_builder().correlation_id("42").build();

        assert!(original.properties().correlation_id.is_none());
        assert_eq!(addressed.properties().correlation_id.as_deref(), Some("42"));
        assert_eq!(addressed.body(), original.body());
    }

    #[test]
    fn json_gzip_decodes_back() {
        let event = Event {
            id: 7,
            name: "created".to_string(),
        };
        let publishing = Publishing::json_gzip(&event).unwrap();
        assert_eq!(
            publishing.properties().content_encoding.as_deref(),
            Some(ENCODING_GZIP)
        );
        assert_ne!(publishing.body(), serde_json::to_vec(&event).unwrap());

        let decoded: Event = publishing.envelope().json().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn corrupt_gzip_body_is_payload_error() {
        let envelope = Publishing::builder(b"not gzip".to_vec())
            .content_encoding(ENCODING_GZIP)
            .build()
            .into_envelope();
        assert!(matches!(envelope.decoded_body(), Err(MqError::Payload(_))));
    }

    #[test]
    fn from_reader_reads_everything() {
        let publishing = Publishing::from_reader(&b"streamed body"[..]).unwrap();
        assert_eq!(publishing.body(), b"streamed body");
        assert_eq!(
            publishing.properties().content_type.as_deref(),
            Some(CONTENT_JSON)
        );
    }

    #[test]
    fn delivery_mode_wire_values() {
        assert_eq!(DeliveryMode::Transient.as_u8(), 1);
        assert_eq!(DeliveryMode::Persistent.as_u8(), 2);
        assert_eq!(DeliveryMode::from_u8(2), Some(DeliveryMode::Persistent));
        assert_eq!(DeliveryMode::from_u8(9), None);
    }
}
