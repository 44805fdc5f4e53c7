//! Downstream consumer helper.
//!
//! Analyzers outside the proxy subscribe to event topics through an
//! [`EventConsumer`], which decodes envelopes, keeps a [`MessageCache`] fed
//! from `message-created` events, and publishes application messages back
//! to a conversation's return topic.

use std::sync::Arc;

use async_trait::async_trait;
use dataminer_core::models::{decode_body, MessageResponse};
use dataminer_core::{CachedMessage, Envelope, EventKind, MessageCache, Result};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::adapter::{BusAdapter, BusHandler};

/// Receives decoded envelopes.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn on_event(&self, envelope: Envelope);
}

/// Subscribes to event topics on behalf of one analyzer.
pub struct EventConsumer {
    adapter: Arc<BusAdapter>,
    cache: Arc<Mutex<MessageCache>>,
}

impl EventConsumer {
    pub fn new(adapter: Arc<BusAdapter>) -> Self {
        Self::with_cache(adapter, MessageCache::default())
    }

    pub fn with_cache(adapter: Arc<BusAdapter>, cache: MessageCache) -> Self {
        Self {
            adapter,
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    /// Subscribe to one event kind's topic.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        let bridge = Arc::new(EnvelopeBridge {
            cache: self.cache.clone(),
            handler,
        });
        self.adapter.ensure_subscriber(kind.topic(), bridge).await?;
        Ok(())
    }

    /// Send an application message to a conversation's client.
    pub async fn reply(&self, cid: &str, payload: &[u8]) -> Result<()> {
        self.adapter.ensure_publisher(cid).await?;
        self.adapter.publish(cid, payload).await
    }

    /// Look up a recently seen message.
    pub async fn cached_message(&self, message_id: &str) -> Option<CachedMessage> {
        self.cache.lock().await.get(message_id).cloned()
    }

    /// Stop every subscription this consumer made.
    pub async fn close(&self) -> Result<()> {
        self.adapter.tear_down().await
    }
}

struct EnvelopeBridge {
    cache: Arc<Mutex<MessageCache>>,
    handler: Arc<dyn EnvelopeHandler>,
}

#[async_trait]
impl BusHandler for EnvelopeBridge {
    async fn handle(&self, topic: &str, payload: Vec<u8>) {
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic, error = %e, "Dropping undecodable envelope");
                return;
            }
        };

        if envelope.kind == EventKind::MessageCreated {
            match decode_body::<MessageResponse>(envelope.payload()) {
                Ok(body) => {
                    let cached = self.cache.lock().await.ingest(&body);
                    trace!(topic, cached, "Message cache updated");
                }
                Err(e) => warn!(topic, error = %e, "Message envelope without usable body"),
            }
        }

        self.handler.on_event(envelope).await;
    }
}
