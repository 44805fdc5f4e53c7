//! In-process broker.
//!
//! One `tokio::sync::broadcast` channel per topic. Clones share the broker, so
//! proxy instances and downstream consumers in the same process talk to each
//! other. The most recent publishes are also kept per topic for inspection,
//! along with a running count.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dataminer_core::defaults::{BUS_PUBLISH_LOG_CAPACITY, BUS_TOPIC_CAPACITY};
use dataminer_core::{Error, Result};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::transport::{BusConnector, BusTransport, PayloadStream, TopicOptions};

#[derive(Default)]
struct TopicLog {
    recent: VecDeque<Vec<u8>>,
    total: usize,
}

#[derive(Default)]
struct Topics {
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
    published: HashMap<String, TopicLog>,
}

/// Shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    topics: Arc<Mutex<Topics>>,
    unavailable: Arc<AtomicBool>,
    capacity: usize,
    log_capacity: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(Topics::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
            capacity: BUS_TOPIC_CAPACITY,
            log_capacity: BUS_PUBLISH_LOG_CAPACITY,
        }
    }

    /// Keep at most `n` payloads per topic in the publish log.
    pub fn with_log_capacity(mut self, n: usize) -> Self {
        self.log_capacity = n;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Transient("broker unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Simulate a broker outage: every following call fails transiently.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a topic so every open subscription on it ends, as on a broker
    /// restart.
    pub fn close_topic(&self, topic: &str) {
        self.lock().channels.remove(topic);
    }

    /// Most recent payloads published on a topic, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .get(topic)
            .map(|log| log.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Payloads ever published on a topic, including ones rotated out of the log.
    pub fn publish_count(&self, topic: &str) -> usize {
        self.lock().published.get(topic).map_or(0, |log| log.total)
    }

    /// Whether a topic is currently declared.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.lock().channels.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .channels
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl BusTransport for MemoryBroker {
    async fn declare(&self, topic: &str, _options: TopicOptions) -> Result<()> {
        self.check_available()?;
        let capacity = self.capacity;
        self.lock()
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.check_available()?;
        let capacity = self.capacity;
        let log_capacity = self.log_capacity;
        let mut topics = self.lock();
        let log = topics.published.entry(topic.to_string()).or_default();
        log.total += 1;
        if log_capacity > 0 {
            if log.recent.len() == log_capacity {
                log.recent.pop_front();
            }
            log.recent.push_back(payload.to_vec());
        }
        let tx = topics
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        let receivers = tx.send(payload.to_vec()).unwrap_or(0);
        debug!(topic, receivers, "Memory bus publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _options: TopicOptions) -> Result<PayloadStream> {
        self.check_available()?;
        let capacity = self.capacity;
        let rx = self
            .lock()
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }

    async fn release(&self, topic: &str) -> Result<()> {
        let mut topics = self.lock();
        let idle = topics
            .channels
            .get(topic)
            .is_some_and(|tx| tx.receiver_count() == 0);
        if idle {
            topics.channels.remove(topic);
        }
        Ok(())
    }
}

#[async_trait]
impl BusConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BusTransport>> {
        self.check_available()?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut a = broker
            .subscribe("topic-created", TopicOptions::default())
            .await
            .unwrap();
        let mut b = broker
            .subscribe("topic-created", TopicOptions::default())
            .await
            .unwrap();

        broker.publish("topic-created", b"x").await.unwrap();

        assert_eq!(a.next().await.unwrap(), b"x".to_vec());
        assert_eq!(b.next().await.unwrap(), b"x".to_vec());
        assert_eq!(broker.publish_count("topic-created"), 1);
    }

    #[tokio::test]
    async fn test_publish_log_keeps_most_recent() {
        let broker = MemoryBroker::new().with_log_capacity(3);
        for i in 0..5u8 {
            broker.publish("message-created", &[i]).await.unwrap();
        }

        assert_eq!(broker.publish_count("message-created"), 5);
        assert_eq!(
            broker.published("message-created"),
            vec![vec![2u8], vec![3u8], vec![4u8]]
        );
        assert!(broker.published("insight-created").is_empty());
    }

    #[tokio::test]
    async fn test_release_only_reclaims_idle_topic() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("C1", TopicOptions::default()).await.unwrap();
        broker.release("C1").await.unwrap();
        assert!(broker.has_topic("C1"));

        drop(sub);
        broker.release("C1").await.unwrap();
        assert!(!broker.has_topic("C1"));
    }

    #[tokio::test]
    async fn test_close_topic_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("C1", TopicOptions::default()).await.unwrap();
        broker.close_topic("C1");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_transiently() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        let err = broker.publish("x", b"1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(broker.connect().await.is_err());
    }
}
