//! Redis pub/sub transport.
//!
//! Redis channels are fan-out by nature and disappear once the last
//! subscriber leaves, which gives topics their auto-delete behavior without
//! explicit declaration. Publishing goes through a shared
//! `ConnectionManager`; every subscription holds its own pub/sub connection.

use std::sync::Arc;

use async_trait::async_trait;
use dataminer_core::{Error, Result};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::transport::{BusConnector, BusTransport, PayloadStream, TopicOptions};

/// Connects transports to one Redis server.
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(uri: &str) -> Result<Self> {
        let client = redis::Client::open(uri)
            .map_err(|e| Error::Config(format!("invalid bus URI: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BusConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn BusTransport>> {
        let connection = ConnectionManager::new(self.client.clone()).await?;
        info!(
            subsystem = "bus",
            component = "redis",
            op = "connect",
            "Broker connection established"
        );
        Ok(Arc::new(RedisTransport {
            client: self.client.clone(),
            connection,
        }))
    }
}

/// Transport bound to one Redis server.
pub struct RedisTransport {
    client: redis::Client,
    connection: ConnectionManager,
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn declare(&self, topic: &str, options: TopicOptions) -> Result<()> {
        // Channels need no declaration; a PING proves the broker is reachable.
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        debug!(topic, durable = options.durable, auto_delete = options.auto_delete, "Topic declared");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!(topic, receivers, "Redis publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _options: TopicOptions) -> Result<PayloadStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }

    async fn release(&self, _topic: &str) -> Result<()> {
        Ok(())
    }
}
