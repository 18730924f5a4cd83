//! Topology reconciliation.
//!
//! Every exchange and queue is checked passively first and declared only
//! when the check fails. Bindings are applied after all entities exist, so
//! the order entries appear in does not matter. A failure aborts the run;
//! entities declared before it are left in place.

use mqkit_core::{
    BindTarget, Binding, BrokerChannel, BrokerConnection, BrokerError, Entity, EntityFailure,
    ExchangeSpec, MqError, QueueSpec, Topology,
};
use std::sync::Arc;

/// What a reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Exchanges created by an active declare
    pub exchanges_declared: usize,
    /// Exchanges that already matched
    pub exchanges_existing: usize,
    /// Queues created by an active declare
    pub queues_declared: usize,
    /// Queues that already matched
    pub queues_existing: usize,
    /// Bindings applied (binding is idempotent on the broker)
    pub bindings_applied: usize,
}

impl ReconcileReport {
    /// Whether every entity was already present.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.exchanges_declared == 0 && self.queues_declared == 0
    }
}

/// Applies and removes topologies over a dedicated channel, reopening it
/// when a broker failure closes it.
pub struct Reconciler {
    connection: Arc<dyn BrokerConnection>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Reconciler {
    /// Create a reconciler. No channel is opened until first use.
    #[must_use]
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            connection,
            channel: None,
        }
    }

    async fn channel(&mut self) -> Result<Arc<dyn BrokerChannel>, MqError> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(channel));
        }
        if self.channel.is_some() {
            tracing::debug!("Reopening topology channel");
        }
        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(|e| MqError::connectivity("opening topology channel", e))?;
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Make the broker match `topology`.
    ///
    /// # Errors
    ///
    /// - [`MqError::Configuration`] if the topology is invalid
    /// - [`MqError::TopologyConflict`] naming the entity the broker rejected
    /// - [`MqError::Connectivity`] if the connection or channel is lost
    pub async fn reconcile(&mut self, topology: &Topology) -> Result<ReconcileReport, MqError> {
        topology.validate()?;
        let mut report = ReconcileReport::default();

        for (name, spec) in &topology.exchanges {
            if self.ensure_exchange(name, spec).await? {
                report.exchanges_declared += 1;
            } else {
                report.exchanges_existing += 1;
            }
        }
        for (name, spec) in &topology.queues {
            if self.ensure_queue(name, spec).await? {
                report.queues_declared += 1;
            } else {
                report.queues_existing += 1;
            }
        }

        for (name, spec) in &topology.exchanges {
            for binding in &spec.bindings {
                self.bind(BindTarget::Exchange, name, binding).await?;
                report.bindings_applied += 1;
            }
        }
        for (name, spec) in &topology.queues {
            for binding in &spec.bindings {
                self.bind(BindTarget::Queue, name, binding).await?;
                report.bindings_applied += 1;
            }
        }

        tracing::info!(
            exchanges_declared = report.exchanges_declared,
            exchanges_existing = report.exchanges_existing,
            queues_declared = report.queues_declared,
            queues_existing = report.queues_existing,
            bindings = report.bindings_applied,
            "Topology reconciled"
        );
        Ok(report)
    }

    /// Returns whether the exchange had to be declared.
    async fn ensure_exchange(&mut self, name: &str, spec: &ExchangeSpec) -> Result<bool, MqError> {
        let entity = || Entity::Exchange(name.to_string());
        match self.channel().await?.declare_exchange_passive(name, spec).await {
            Ok(()) => {
                tracing::debug!(exchange = %name, "Exchange already present");
                return Ok(false);
            }
            Err(e) if e.is_connectivity() => return Err(classify(entity(), e)),
            Err(e) => tracing::debug!(exchange = %name, reason = %e, "Passive check failed"),
        }

        self.channel()
            .await?
            .declare_exchange(name, spec)
            .await
            .map_err(|e| classify(entity(), e))?;
        tracing::info!(
            exchange = %name,
            kind = %spec.kind,
            durable = spec.durable,
            "Exchange declared"
        );
        Ok(true)
    }

    /// Returns whether the queue had to be declared.
    async fn ensure_queue(&mut self, name: &str, spec: &QueueSpec) -> Result<bool, MqError> {
        let entity = || Entity::Queue(name.to_string());
        match self.channel().await?.declare_queue_passive(name, spec).await {
            Ok(()) => {
                tracing::debug!(queue = %name, "Queue already present");
                return Ok(false);
            }
            Err(e) if e.is_connectivity() => return Err(classify(entity(), e)),
            Err(e) => tracing::debug!(queue = %name, reason = %e, "Passive check failed"),
        }

        self.channel()
            .await?
            .declare_queue(name, spec)
            .await
            .map_err(|e| classify(entity(), e))?;
        tracing::info!(queue = %name, durable = spec.durable, "Queue declared");
        Ok(true)
    }

    async fn bind(
        &mut self,
        target: BindTarget,
        destination: &str,
        binding: &Binding,
    ) -> Result<(), MqError> {
        self.channel()
            .await?
            .bind(target, destination, binding)
            .await
            .map_err(|e| {
                classify(
                    Entity::Binding {
                        source: binding.exchange.clone(),
                        destination: destination.to_string(),
                        routing_key: binding.routing_key.clone(),
                    },
                    e,
                )
            })?;
        tracing::debug!(
            source = %binding.exchange,
            destination,
            routing_key = %binding.routing_key,
            "Binding applied"
        );
        Ok(())
    }

    /// Delete every exchange, then every queue, of `topology`.
    ///
    /// All deletions are attempted even after one fails.
    ///
    /// # Errors
    ///
    /// - [`MqError::Teardown`] listing every entity that could not be deleted
    /// - [`MqError::Connectivity`] if no channel can be opened
    pub async fn delete(&mut self, topology: &Topology) -> Result<(), MqError> {
        let mut failures = Vec::new();

        for name in topology.exchanges.keys() {
            match self.channel().await?.delete_exchange(name).await {
                Ok(()) => tracing::info!(exchange = %name, "Exchange deleted"),
                Err(cause) => {
                    tracing::warn!(exchange = %name, error = %cause, "Exchange delete failed");
                    failures.push(EntityFailure {
                        entity: Entity::Exchange(name.clone()),
                        cause,
                    });
                }
            }
        }
        for name in topology.queues.keys() {
            match self.channel().await?.delete_queue(name).await {
                Ok(()) => tracing::info!(queue = %name, "Queue deleted"),
                Err(cause) => {
                    tracing::warn!(queue = %name, error = %cause, "Queue delete failed");
                    failures.push(EntityFailure {
                        entity: Entity::Queue(name.clone()),
                        cause,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MqError::Teardown { failures })
        }
    }

    /// Release the topology channel.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker fails to close it.
    pub async fn close(&mut self) -> Result<(), MqError> {
        match self.channel.take() {
            Some(channel) if channel.is_open() => channel
                .close()
                .await
                .map_err(|e| MqError::connectivity("closing topology channel", e)),
            _ => Ok(()),
        }
    }
}

fn classify(entity: Entity, source: BrokerError) -> MqError {
    if source.is_connectivity() {
        MqError::connectivity(format!("reconciling {entity}"), source)
    } else {
        MqError::TopologyConflict { entity, source }
    }
}
