use super::{Publisher, Subscriber, TransportError};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_EXCHANGE_CAPACITY: usize = 64;

/// In-process fan-out exchange, used for single-host shows and tests.
#[derive(Debug, Clone)]
pub struct LocalExchange {
    name: String,
    sender: broadcast::Sender<Vec<u8>>,
}

impl LocalExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_EXCHANGE_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(&self) -> LocalPublisher {
        LocalPublisher {
            exchange: self.name.clone(),
            sender: self.sender.clone(),
        }
    }

    /// Bind a new subscription. It only sees payloads published after this call.
    pub fn subscribe(&self) -> LocalSubscription {
        LocalSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone)]
pub struct LocalPublisher {
    exchange: String,
    sender: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        // No bound subscribers is not a publish failure.
        match self.sender.send(payload) {
            Ok(receivers) => debug!(exchange = %self.exchange, receivers, "Payload published"),
            Err(_) => debug!(exchange = %self.exchange, "Payload published with no subscribers bound"),
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct LocalSubscription {
    receiver: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscriber for LocalSubscription {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.receiver.recv().await {
            Ok(payload) => Some(Ok(payload)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(Err(TransportError::Lagged { skipped }))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
