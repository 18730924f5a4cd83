//! # lapin Adapter
//!
//! Implements the mqkit broker capability set on top of [`lapin`], for
//! RabbitMQ and other AMQP 0-9-1 brokers.
//!
//! This crate provides:
//! - [`LapinConnection`]: connects from an `amqp://` or `amqps://` URI
//! - [`LapinChannel`]: one lapin channel, with publisher confirms enabled
//!   so mandatory publishes report unroutable messages
//!
//! AMQP has no "check these parameters" operation. A passive check here is
//! a passive declare followed by an active declare with the same
//! parameters, which the broker rejects with `PRECONDITION_FAILED` when
//! they differ from the live entity.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod convert;
mod error;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use mqkit_core::{
    BindTarget, Binding, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions,
    DeliveryStream, Envelope, ExchangeSpec, PublishOptions, QueueSpec,
};
use std::sync::Arc;

use crate::error::broker_error;

/// A connection to an AMQP broker.
pub struct LapinConnection {
    connection: lapin::Connection,
}

impl LapinConnection {
    /// Connect to `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionClosed`] if the broker is
    /// unreachable, or the broker's refusal otherwise.
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        let connection = lapin::Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| broker_error(&e))?;
        tracing::info!("Connected to AMQP broker");
        Ok(Self { connection })
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| broker_error(&e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_error(&e))?;
        tracing::debug!(channel_id = channel.id(), "Channel opened");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| broker_error(&e))
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: lapin::Channel,
}

impl LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        spec: &ExchangeSpec,
        passive: bool,
    ) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            passive,
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: spec.internal,
            nowait: spec.no_wait,
        };
        self.channel
            .exchange_declare(
                name,
                convert::exchange_kind(spec.kind),
                options,
                convert::field_table(&spec.arguments),
            )
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn queue_declare(
        &self,
        name: &str,
        spec: &QueueSpec,
        passive: bool,
    ) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            passive,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: spec.no_wait,
        };
        self.channel
            .queue_declare(name, options, convert::field_table(&spec.arguments))
            .await
            .map(|_| ())
            .map_err(|e| broker_error(&e))
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.exchange_declare(name, spec, false).await
    }

    async fn declare_exchange_passive(
        &self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), BrokerError> {
        self.exchange_declare(name, spec, true).await?;
        // Predeclared exchanges refuse active declares.
        if name.starts_with("amq.") {
            return Ok(());
        }
        self.exchange_declare(name, spec, false).await
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.queue_declare(name, spec, false).await
    }

    async fn declare_queue_passive(
        &self,
        name: &str,
        spec: &QueueSpec,
    ) -> Result<(), BrokerError> {
        self.queue_declare(name, spec, true).await?;
        self.queue_declare(name, spec, false).await
    }

    async fn bind(
        &self,
        target: BindTarget,
        destination: &str,
        binding: &Binding,
    ) -> Result<(), BrokerError> {
        let result = match target {
            BindTarget::Exchange => {
                self.channel
                    .exchange_bind(
                        destination,
                        &binding.exchange,
                        &binding.routing_key,
                        ExchangeBindOptions {
                            nowait: binding.no_wait,
                        },
                        FieldTable::default(),
                    )
                    .await
            }
            BindTarget::Queue => {
                self.channel
                    .queue_bind(
                        destination,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions {
                            nowait: binding.no_wait,
                        },
                        FieldTable::default(),
                    )
                    .await
            }
        };
        result.map_err(|e| broker_error(&e))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| broker_error(&e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                &envelope.body,
                convert::basic_properties(&envelope.properties),
            )
            .await
            .map_err(|e| broker_error(&e))?;

        match confirm.await.map_err(|e| broker_error(&e))? {
            Confirmation::Nack(_) => Err(BrokerError::Protocol(format!(
                "broker nacked message for exchange '{exchange}'"
            ))),
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable(format!(
                "no route for key '{routing_key}' on exchange '{exchange}'"
            ))),
            _ => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                convert::field_table(&options.arguments),
            )
            .await
            .map_err(|e| broker_error(&e))?;
        tracing::debug!(queue, consumer_tag = %consumer.tag().as_str(), "Consuming");

        Ok(consumer
            .map(|item| item.map(convert::delivery).map_err(|e| broker_error(&e)))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| broker_error(&e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| broker_error(&e))
    }
}
