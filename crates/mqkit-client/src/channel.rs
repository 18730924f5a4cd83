//! Channel handle with a broadcast close signal.

use crate::consumer::{Consumer, ConsumerConfig};
use crate::publisher::{Publisher, PublisherConfig};
use mqkit_core::{
    BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, DeliveryStream, MqError,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A broker channel plus the close signal observed by everything running
/// on it.
///
/// Cloning yields another handle to the same channel. Closing any clone
/// closes them all.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn BrokerChannel>,
    closed: CancellationToken,
    released: AtomicBool,
    subscribed: AtomicBool,
}

impl ChannelHandle {
    /// Open a fresh channel on `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker refuses the channel.
    pub async fn open(connection: &dyn BrokerConnection) -> Result<Self, MqError> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| MqError::connectivity("opening channel", e))?;
        Ok(Self::from_channel(channel))
    }

    /// Wrap an already open broker channel. The handle takes ownership of
    /// its lifecycle.
    #[must_use]
    pub fn from_channel(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                closed: CancellationToken::new(),
                released: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the handle has not been closed and the broker channel is
    /// still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.is_cancelled() && self.inner.channel.is_open()
    }

    /// Whether [`close`](Self::close) was called on any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }

    /// Signal close to every waiter, then release the broker channel.
    ///
    /// The broker channel is released exactly once; later calls return
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Connectivity`] if the broker fails to close the
    /// channel.
    pub async fn close(&self) -> Result<(), MqError> {
        self.inner.closed.cancel();
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.inner.channel.close().await {
            Ok(()) | Err(BrokerError::ChannelClosed | BrokerError::ConnectionClosed) => {
                tracing::debug!("Channel released");
                Ok(())
            }
            Err(e) => Err(MqError::connectivity("closing channel", e)),
        }
    }

    /// Signal close now and release the broker channel on a spawned task.
    /// For `Drop` paths, where [`close`](Self::close) cannot be awaited.
    pub(crate) fn close_detached(&self) {
        self.inner.closed.cancel();
        if self.inner.released.load(Ordering::Acquire) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = self.clone();
                runtime.spawn(async move {
                    if let Err(e) = handle.close().await {
                        tracing::debug!(error = %e, "Detached channel close failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to release channel; it closes with the connection");
            }
        }
    }

    /// Consumer running on this handle.
    #[must_use]
    pub fn consumer(&self, config: ConsumerConfig) -> Consumer {
        Consumer::new(self.clone(), config)
    }

    /// Publisher sending on this handle.
    #[must_use]
    pub fn publisher(&self, config: PublisherConfig) -> Publisher {
        Publisher::new(self.clone(), config)
    }

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerChannel> {
        &self.inner.channel
    }

    /// Start the one consumer stream this handle allows.
    pub(crate) async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, MqError> {
        let rejected = |reason: &str| MqError::Subscription {
            queue: queue.to_string(),
            reason: reason.to_string(),
        };
        if !self.is_open() {
            return Err(rejected("channel is closed"));
        }
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            return Err(rejected("channel already has a consumer"));
        }
        match self.inner.channel.subscribe(queue, options).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.inner.subscribed.store(false, Ordering::Release);
                Err(rejected(&e.to_string()))
            }
        }
    }

    pub(crate) async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), MqError> {
        self.inner
            .channel
            .ack(delivery_tag, multiple)
            .await
            .map_err(|e| MqError::connectivity(format!("acknowledging delivery {delivery_tag}"), e))
    }
}

/// Closes a channel when dropped, unless it was closed already.
pub(crate) struct CloseOnDrop(pub(crate) ChannelHandle);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close_detached();
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("open", &self.is_open())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqkit_adapter_memory::MemoryBroker;
    use mqkit_core::QueueSpec;

    #[tokio::test]
    async fn close_is_idempotent_and_releases_once() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let handle = ChannelHandle::open(connection.as_ref()).await.unwrap();
        assert_eq!(broker.open_channels(), 1);

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(!handle.is_open());
        assert!(handle.is_closed());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn close_wakes_every_waiter() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.closed().await })
            })
            .collect();

        handle.close().await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_on_drop_releases_channel() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();

        drop(CloseOnDrop(handle.clone()));
        assert!(handle.is_closed());

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while broker.open_channels() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn second_subscription_is_rejected() {
        let broker = MemoryBroker::new();
        let handle = ChannelHandle::open(broker.connect().as_ref()).await.unwrap();
        handle
            .broker()
            .declare_queue("jobs", &QueueSpec::new())
            .await
            .unwrap();

        let _stream = handle
            .subscribe("jobs", &ConsumeOptions::default())
            .await
            .unwrap();
        let Err(err) = handle.subscribe("jobs", &ConsumeOptions::default()).await else {
            panic!("second subscription accepted");
        };

        assert!(matches!(err, MqError::Subscription { .. }));
    }
}
