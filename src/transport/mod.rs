//! Fan-out transport seams.
//!
//! The show core only needs two capabilities: publish a byte payload to every
//! receiver currently bound to an exchange, and receive payloads on an
//! ephemeral per-node subscription. [`local`] provides an in-process exchange
//! and [`tcp`] a small line-framed hub for real deployments.

pub mod local;
pub mod tcp;

pub use local::{LocalExchange, LocalPublisher, LocalSubscription};
pub use tcp::{Hub, TcpPublisher, TcpSubscriber};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hand `payload` to the exchange. Success says nothing about receivers.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Subscriber: Send {
    /// Next payload, or `None` once the subscription has ended.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        (**self).publish(payload).await
    }
}

#[async_trait]
impl<S: Subscriber + ?Sized> Subscriber for Box<S> {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        (**self).recv().await
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable at {endpoint}: {source}")]
    Unavailable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Transport closed")]
    Closed,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Subscription lagged, {skipped} messages skipped")]
    Lagged { skipped: u64 },
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
