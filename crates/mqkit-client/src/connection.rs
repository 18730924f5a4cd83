//! Connection facade.

use crate::channel::ChannelHandle;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::publisher::{Publisher, PublisherConfig};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::rpc::{RpcClient, RpcConfig};
use mqkit_core::{BrokerConnection, MqError, Topology};
use std::sync::Arc;

/// A broker connection that hands out channel-owning components.
///
/// Every publisher, consumer and RPC client gets its own channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<dyn BrokerConnection>,
}

impl Connection {
    /// Wrap an adapter connection.
    #[must_use]
    pub fn new(inner: Arc<dyn BrokerConnection>) -> Self {
        Self { inner }
    }

    /// Underlying adapter connection.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn BrokerConnection> {
        &self.inner
    }

    /// Whether the connection is usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Open a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker refuses the channel.
    pub async fn channel(&self) -> Result<ChannelHandle, MqError> {
        ChannelHandle::open(self.inner.as_ref()).await
    }

    /// Publisher on a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the channel cannot be opened.
    pub async fn publisher(&self, config: PublisherConfig) -> Result<Publisher, MqError> {
        Ok(self.channel().await?.publisher(config))
    }

    /// Consumer on a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the channel cannot be opened.
    pub async fn consumer(&self, config: ConsumerConfig) -> Result<Consumer, MqError> {
        Ok(self.channel().await?.consumer(config))
    }

    /// RPC client on a fresh channel.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the channel cannot be opened, or
    /// [`MqError::Subscription`] if the reply consumer cannot start.
    pub async fn rpc_client(&self, config: RpcConfig) -> Result<RpcClient, MqError> {
        let channel = self.channel().await?;
        match RpcClient::open(channel.clone(), config).await {
            Ok(client) => Ok(client),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Reconcile `topology` on a temporary channel.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile`].
    pub async fn reconcile(&self, topology: &Topology) -> Result<ReconcileReport, MqError> {
        let mut reconciler = Reconciler::new(Arc::clone(&self.inner));
        let result = reconciler.reconcile(topology).await;
        if let Err(e) = reconciler.close().await {
            tracing::warn!(error = %e, "Failed to close topology channel");
        }
        result
    }

    /// Delete `topology` on a temporary channel.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::delete`].
    pub async fn delete_topology(&self, topology: &Topology) -> Result<(), MqError> {
        let mut reconciler = Reconciler::new(Arc::clone(&self.inner));
        let result = reconciler.delete(topology).await;
        if let Err(e) = reconciler.close().await {
            tracing::warn!(error = %e, "Failed to close topology channel");
        }
        result
    }

    /// Parse a YAML topology and reconcile it.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] for malformed YAML, otherwise see
    /// [`Reconciler::reconcile`].
    pub async fn apply_yaml(&self, yaml: &str) -> Result<ReconcileReport, MqError> {
        let topology = Topology::from_yaml(yaml)?;
        self.reconcile(&topology).await
    }

    /// Close the connection and every channel on it.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker fails to close it.
    pub async fn close(&self) -> Result<(), MqError> {
        self.inner
            .close()
            .await
            .map_err(|e| MqError::connectivity("closing connection", e))?;
        tracing::info!("Connection closed");
        Ok(())
    }
}
