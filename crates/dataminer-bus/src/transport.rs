//! Broker transport abstraction.
//!
//! A transport moves opaque payloads between fan-out topics: every active
//! subscription on a topic receives every message published to it.

use std::sync::Arc;

use async_trait::async_trait;
use dataminer_core::{Error, Result};
use futures::stream::BoxStream;

use crate::memory::MemoryBroker;
use crate::redis_transport::RedisConnector;

/// Declaration options passed to the broker for every topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicOptions {
    pub durable: bool,
    /// Reclaim the topic once its last subscriber leaves.
    pub auto_delete: bool,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: true,
        }
    }
}

/// Payloads delivered to one subscription, in broker order.
pub type PayloadStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Declare a fan-out topic. Idempotent.
    async fn declare(&self, topic: &str, options: TopicOptions) -> Result<()>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Bind a new subscription. The stream ends when the broker drops it.
    async fn subscribe(&self, topic: &str, options: TopicOptions) -> Result<PayloadStream>;

    /// Release a topic this side declared.
    async fn release(&self, topic: &str) -> Result<()>;
}

/// Opens transports bound to one broker.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusTransport>>;
}

/// Pick a connector from a bus URI: `redis://`/`rediss://` or `memory://`.
pub fn connector_for(uri: &str) -> Result<Arc<dyn BusConnector>> {
    if uri.starts_with("memory://") {
        Ok(Arc::new(MemoryBroker::new()))
    } else if uri.starts_with("redis://") || uri.starts_with("rediss://") {
        Ok(Arc::new(RedisConnector::new(uri)?))
    } else {
        Err(Error::Config(format!("unsupported bus URI scheme: {}", uri)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_options_default_durable_auto_delete() {
        let opts = TopicOptions::default();
        assert!(opts.durable && opts.auto_delete);
    }

    #[test]
    fn test_connector_for_schemes() {
        assert!(connector_for("memory://").is_ok());
        assert!(connector_for("redis://127.0.0.1:6379").is_ok());
        assert!(matches!(
            connector_for("amqp://localhost"),
            Err(Error::Config(_))
        ));
    }
}
