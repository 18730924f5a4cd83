//! # mqkit Client
//!
//! Messaging components built on the mqkit broker capability set.
//!
//! This crate provides:
//! - [`Reconciler`]: declares a [`Topology`](mqkit_core::Topology)
//!   idempotently, bindings last
//! - [`ChannelHandle`]: a broker channel with a broadcast close signal
//! - [`Consumer`]: subscription plus a detached dispatch loop
//! - [`Publisher`]: fail-fast sends and single-use requests
//! - [`RpcClient`]: concurrent calls over the direct-reply pseudo-queue,
//!   matched by correlation id
//! - [`Connection`]: a facade handing out the above, one channel each

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod message;
pub mod publisher;
pub mod reconciler;
pub mod rpc;

pub use channel::ChannelHandle;
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerConfig, ConsumerHandle, ConsumerState, MessageStream};
pub use message::Message;
pub use publisher::{Publisher, PublisherConfig};
pub use reconciler::{ReconcileReport, Reconciler};
pub use rpc::{RpcClient, RpcConfig};

pub use tokio_util::sync::CancellationToken;
