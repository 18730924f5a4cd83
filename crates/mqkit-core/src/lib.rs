//! # mqkit Core
//!
//! Data model shared by every mqkit crate.
//!
//! This crate provides:
//! - The broker-neutral [`Envelope`] and the immutable outbound [`Publishing`]
//! - The declarative [`Topology`] model and its YAML format
//! - The [`BrokerConnection`] / [`BrokerChannel`] capability set that
//!   adapters implement
//! - Injectable correlation id generation
//! - The [`MqError`] taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod topology;

pub use broker::{
    BindTarget, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, Delivery,
    DeliveryStream, PublishOptions, DEFAULT_EXCHANGE, DIRECT_REPLY_QUEUE,
};
pub use correlation::{CorrelationIdGenerator, SequentialCorrelationIds, UuidCorrelationIds};
pub use envelope::{
    DeliveryMode, Envelope, Headers, Properties, Publishing, PublishingBuilder, CONTENT_BLOB,
    CONTENT_JSON, CONTENT_TEXT, ENCODING_GZIP,
};
pub use error::{EntityFailure, MqError};
pub use topology::{Arguments, Binding, Entity, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
