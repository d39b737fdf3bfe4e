use crate::broker::{BrokerError, BrokerHandle};
use crate::types::{DeliveryTag, Epoch, Rpc};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Broker abstraction the sequencer publishes through
#[async_trait]
pub trait Backend: Send + Sync {
    /// Bring the connection up; a no-op when it already is
    ///
    /// Returns the epoch acks on this connection will carry.
    async fn connect(&self) -> Result<Epoch, BrokerError>;

    /// Send one message, returning the delivery tag the broker will
    /// acknowledge it under
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<DeliveryTag, BrokerError>;

    /// Run a synchronous control method
    async fn rpc(&self, rpc: Rpc) -> Result<(), BrokerError>;
}

#[async_trait]
impl Backend for BrokerHandle {
    async fn connect(&self) -> Result<Epoch, BrokerError> {
        BrokerHandle::connect(self).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<DeliveryTag, BrokerError> {
        BrokerHandle::publish(self, exchange, routing_key, payload).await
    }

    async fn rpc(&self, rpc: Rpc) -> Result<(), BrokerError> {
        BrokerHandle::rpc(self, rpc).await
    }
}

/// One message as seen by the in-memory backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct InMemoryState {
    connected: bool,
    epoch: Epoch,
    next_tag: DeliveryTag,
    /// Publishes left before the connection drops by itself
    publishes_until_drop: Option<usize>,
    published: Vec<Published>,
    rpcs: Vec<Rpc>,
    refuse_connects: usize,
    rpc_error: Option<BrokerError>,
}

/// In-memory broker for testing
///
/// Numbers publishes from 1 on every connect like a real broker does.
/// Acknowledgments are not generated; tests feed tags to the sequencer.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Simulate the connection dropping
    pub async fn drop_connection(&self) {
        self.state.write().await.connected = false;
    }

    /// Let `n` more publishes through, then drop the connection on the next
    pub async fn drop_after_publishes(&self, n: usize) {
        self.state.write().await.publishes_until_drop = Some(n);
    }

    /// Fail the next `n` connection attempts
    pub async fn refuse_connects(&self, n: usize) {
        self.state.write().await.refuse_connects = n;
    }

    /// Answer every following rpc with `error`
    pub async fn fail_rpcs_with(&self, error: BrokerError) {
        self.state.write().await.rpc_error = Some(error);
    }

    /// Every publish seen so far, across connections
    pub async fn published(&self) -> Vec<Published> {
        self.state.read().await.published.clone()
    }

    /// Drain recorded publishes (for testing)
    pub async fn drain_published(&self) -> Vec<Published> {
        self.state.write().await.published.drain(..).collect()
    }

    pub async fn rpcs(&self) -> Vec<Rpc> {
        self.state.read().await.rpcs.clone()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn connect(&self) -> Result<Epoch, BrokerError> {
        let mut state = self.state.write().await;
        if state.connected {
            return Ok(state.epoch);
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        state.connected = true;
        state.epoch += 1;
        state.next_tag = 1;
        Ok(state.epoch)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<DeliveryTag, BrokerError> {
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(BrokerError::ConnectionLost("not connected".to_string()));
        }
        match state.publishes_until_drop {
            Some(0) => {
                state.connected = false;
                state.publishes_until_drop = None;
                return Err(BrokerError::ConnectionLost("connection dropped".to_string()));
            }
            Some(n) => state.publishes_until_drop = Some(n - 1),
            None => {}
        }

        let tag = state.next_tag;
        state.next_tag += 1;
        state.published.push(Published {
            tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
        });
        Ok(tag)
    }

    async fn rpc(&self, rpc: Rpc) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        if !state.connected {
            return Err(BrokerError::ConnectionLost("not connected".to_string()));
        }
        state.rpcs.push(rpc);
        match &state.rpc_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_tags_restart_per_connection() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.connect().await.unwrap(), 1);

        let first = backend.publish("amq.direct", "a", Bytes::from("1")).await.unwrap();
        let second = backend.publish("amq.direct", "a", Bytes::from("2")).await.unwrap();
        assert_eq!((first, second), (1, 2));

        backend.drop_connection().await;
        assert!(matches!(
            backend.publish("amq.direct", "a", Bytes::from("3")).await,
            Err(BrokerError::ConnectionLost(_))
        ));

        assert_eq!(backend.connect().await.unwrap(), 2);
        let third = backend.publish("amq.direct", "a", Bytes::from("3")).await.unwrap();
        assert_eq!(third, 1);
        assert_eq!(backend.published().await.len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_drops_after_publishes() {
        let backend = InMemoryBackend::new();
        backend.connect().await.unwrap();
        backend.drop_after_publishes(1).await;

        assert!(backend.publish("x", "a", Bytes::from("1")).await.is_ok());
        assert!(backend.publish("x", "a", Bytes::from("2")).await.is_err());
        assert!(!backend.is_connected().await);
        assert_eq!(backend.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_refused_connects() {
        let backend = InMemoryBackend::new();
        backend.refuse_connects(2).await;

        assert!(backend.connect().await.is_err());
        assert!(backend.connect().await.is_err());
        assert!(backend.connect().await.is_ok());
        assert!(backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_in_memory_rpc_failure() {
        let backend = InMemoryBackend::new();
        backend.connect().await.unwrap();
        backend
            .fail_rpcs_with(BrokerError::Rpc {
                code: 406,
                text: "PRECONDITION_FAILED".to_string(),
            })
            .await;

        let rpc = Rpc::ExchangeDelete {
            exchange: "x".to_string(),
        };
        assert_eq!(
            backend.rpc(rpc.clone()).await,
            Err(BrokerError::Rpc {
                code: 406,
                text: "PRECONDITION_FAILED".to_string()
            })
        );
        assert_eq!(backend.rpcs().await, vec![rpc]);
    }
}
