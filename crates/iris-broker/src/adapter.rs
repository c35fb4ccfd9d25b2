use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// One message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to ack or nack this delivery. Only valid on the connection
    /// that produced it.
    pub tag: u64,
    pub body: Bytes,
    pub redelivered: bool,
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection with a single channel.
///
/// `subscribe` binds `queue` to `routing_key` and returns the consumer
/// stream. The stream ends when the connection is lost.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn publish(&self, queue: &str, body: Bytes) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        queue: &str,
        routing_key: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    async fn ack(&self, tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self);
}
