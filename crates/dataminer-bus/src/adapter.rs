//! Bus adapter: the per-instance view of the broker.
//!
//! Tracks which publishers and subscribers an owner created so they can all
//! be torn down together. Both tables sit behind one mutex; creation is
//! idempotent. After [`BusAdapter::tear_down`] every operation fails with
//! [`Error::BusNotInitialized`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dataminer_core::{Error, Result};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::transport::{BusConnector, BusTransport, PayloadStream, TopicOptions};

/// Receives payloads for one subscription.
///
/// Injected at subscribe time so owners never hand the adapter a pointer
/// back to themselves.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: Vec<u8>);
}

/// Handle to an ensured publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publisher {
    topic: String,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Handle to an ensured subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    topic: String,
}

impl Subscriber {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct SubscriberEntry {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Tables {
    initialized: bool,
    publishers: HashMap<String, Publisher>,
    subscribers: HashMap<String, SubscriberEntry>,
}

/// Publisher/subscriber registry over one broker transport.
pub struct BusAdapter {
    transport: Arc<dyn BusTransport>,
    options: TopicOptions,
    tables: Mutex<Tables>,
    healthy: Arc<AtomicBool>,
}

impl BusAdapter {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            options: TopicOptions::default(),
            tables: Mutex::new(Tables {
                initialized: true,
                ..Default::default()
            }),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open a transport through the connector and wrap it.
    pub async fn connect(connector: &dyn BusConnector) -> Result<Self> {
        Ok(Self::new(connector.connect().await?))
    }

    /// False once a broker call failed or a subscription ended on its own.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.tables.lock().await.initialized
    }

    fn note<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if e.is_transient() {
                self.healthy.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Declare a publisher topic. Returns the existing handle if present.
    #[instrument(skip(self), fields(subsystem = "bus", component = "adapter"))]
    pub async fn ensure_publisher(&self, name: &str) -> Result<Publisher> {
        let mut tables = self.tables.lock().await;
        if !tables.initialized {
            return Err(Error::BusNotInitialized);
        }
        if let Some(existing) = tables.publishers.get(name) {
            return Ok(existing.clone());
        }
        self.note(self.transport.declare(name, self.options).await)?;
        let publisher = Publisher {
            topic: name.to_string(),
        };
        tables.publishers.insert(name.to_string(), publisher.clone());
        debug!(topic = name, "Publisher ensured");
        Ok(publisher)
    }

    /// Bind a subscriber and start its consume loop. Idempotent by name; the
    /// first handler wins.
    #[instrument(skip(self, handler), fields(subsystem = "bus", component = "adapter"))]
    pub async fn ensure_subscriber(
        &self,
        name: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<Subscriber> {
        let mut tables = self.tables.lock().await;
        if !tables.initialized {
            return Err(Error::BusNotInitialized);
        }
        if tables.subscribers.contains_key(name) {
            return Ok(Subscriber {
                topic: name.to_string(),
            });
        }

        self.note(self.transport.declare(name, self.options).await)?;
        let stream = self.note(self.transport.subscribe(name, self.options).await)?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(consume(
            name.to_string(),
            stream,
            handler,
            shutdown_rx,
            self.healthy.clone(),
        ));
        tables
            .subscribers
            .insert(name.to_string(), SubscriberEntry { shutdown_tx, task });
        debug!(topic = name, "Subscriber ensured");
        Ok(Subscriber {
            topic: name.to_string(),
        })
    }

    /// Publish on a previously ensured topic.
    pub async fn publish(&self, name: &str, payload: &[u8]) -> Result<()> {
        {
            let tables = self.tables.lock().await;
            if !tables.initialized {
                return Err(Error::BusNotInitialized);
            }
            if !tables.publishers.contains_key(name) {
                return Err(Error::PublisherNotFound(name.to_string()));
            }
        }
        self.note(self.transport.publish(name, payload).await)
    }

    /// Stop one subscriber's consume loop and release its topic.
    pub async fn close_subscriber(&self, name: &str) -> Result<()> {
        let entry = {
            let mut tables = self.tables.lock().await;
            if !tables.initialized {
                return Err(Error::BusNotInitialized);
            }
            tables
                .subscribers
                .remove(name)
                .ok_or_else(|| Error::SubscriberNotFound(name.to_string()))?
        };
        stop_subscriber(name, entry).await;
        self.transport.release(name).await
    }

    /// Close every subscriber, then every publisher. Logs and continues past
    /// individual failures; the adapter is unusable afterwards.
    #[instrument(skip(self), fields(subsystem = "bus", component = "adapter", op = "tear_down"))]
    pub async fn tear_down(&self) -> Result<()> {
        let (subscribers, publishers) = {
            let mut tables = self.tables.lock().await;
            if !tables.initialized {
                return Err(Error::BusNotInitialized);
            }
            tables.initialized = false;
            (
                std::mem::take(&mut tables.subscribers),
                std::mem::take(&mut tables.publishers),
            )
        };

        for (name, entry) in subscribers {
            stop_subscriber(&name, entry).await;
            if let Err(e) = self.transport.release(&name).await {
                warn!(topic = %name, error = %e, "Failed to release subscriber topic");
            }
        }
        for name in publishers.keys() {
            if let Err(e) = self.transport.release(name).await {
                warn!(topic = %name, error = %e, "Failed to release publisher topic");
            }
        }
        info!("Bus adapter torn down");
        Ok(())
    }

    /// Names of ensured publishers, sorted.
    pub async fn publishers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.lock().await.publishers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of ensured subscribers, sorted.
    pub async fn subscribers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.lock().await.subscribers.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn stop_subscriber(name: &str, entry: SubscriberEntry) {
    let _ = entry.shutdown_tx.send(()).await;
    if let Err(e) = entry.task.await {
        warn!(topic = name, error = %e, "Subscriber task ended abnormally");
    }
}

async fn consume(
    topic: String,
    mut stream: PayloadStream,
    handler: Arc<dyn BusHandler>,
    mut shutdown_rx: mpsc::Receiver<()>,
    healthy: Arc<AtomicBool>,
) {
    debug!(topic = %topic, "Subscriber consume loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(topic = %topic, "Subscriber consume loop stopped");
                break;
            }
            next = stream.next() => match next {
                Some(payload) => handler.handle(&topic, payload).await,
                None => {
                    warn!(topic = %topic, "Broker closed subscription");
                    healthy.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
}
