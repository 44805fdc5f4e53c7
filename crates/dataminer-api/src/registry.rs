//! Conversation registry: at most one proxy instance per CID.
//!
//! Both maps (CID to slot, port to CID) sit behind one mutex that is only
//! held for map updates. First contact reserves a pending slot and its ports
//! under the lock, builds the instance with the lock released, then publishes
//! the entry or drops the reservation. Concurrent requests for a pending CID
//! wait for that outcome, so exactly one instance is created and the port map
//! stays injective. A CID whose instance is shutting down is only handed a
//! new instance once the old one is CLOSED. Instances report when they close;
//! their entries are dropped only if the stored instance id still matches.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use axum_server::tls_rustls::RustlsConfig;
use dataminer_bus::BusConnector;
use dataminer_core::{Capabilities, DataminerConfig, Error, Result};
use dataminer_graph::GraphDriver;
use dataminer_proxy::{
    ClosedInstance, InstanceConfig, InstanceListeners, InstanceState, ProxyInstance, StopReason,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ports::PortAllocator;

struct Entry {
    instance: ProxyInstance,
    redirect_base: String,
    notify_base: Option<String>,
    ports: Vec<u16>,
    /// Picked by the reaper; no longer handed out while it stops.
    retiring: bool,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.retiring
            && matches!(
                self.instance.state(),
                InstanceState::Initializing | InstanceState::Connected
            )
    }
}

enum Slot {
    /// Instance under construction. `done` flips once the slot is published
    /// or dropped.
    Pending {
        ports: Vec<u16>,
        done: watch::Receiver<bool>,
    },
    Ready(Entry),
}

impl Slot {
    fn ports(&self) -> &[u16] {
        match self {
            Slot::Pending { ports, .. } => ports,
            Slot::Ready(entry) => &entry.ports,
        }
    }

    fn ready(&self) -> Option<&Entry> {
        match self {
            Slot::Ready(entry) => Some(entry),
            Slot::Pending { .. } => None,
        }
    }
}

#[derive(Default)]
struct Maps {
    by_cid: HashMap<String, Slot>,
    by_port: HashMap<u16, String>,
    closing: bool,
}

impl Maps {
    fn remove(&mut self, cid: &str) -> Option<Slot> {
        let slot = self.by_cid.remove(cid)?;
        for port in slot.ports() {
            self.by_port.remove(port);
        }
        Some(slot)
    }

    fn entries(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.by_cid
            .iter()
            .filter_map(|(cid, slot)| slot.ready().map(|entry| (cid, entry)))
    }
}

/// Ports and config held for an instance that is not built yet.
struct Reservation {
    config: InstanceConfig,
    listeners: InstanceListeners,
    done: watch::Sender<bool>,
}

/// Where a redirect sends the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    /// `scheme://host:port`, without path.
    pub base: String,
    pub created: bool,
}

/// Operator view of one active conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveConversation {
    pub cid: String,
    pub instance_id: Uuid,
    pub redirect: String,
    pub state: String,
    pub connected: bool,
}

struct RegistryInner {
    config: DataminerConfig,
    driver: Arc<dyn GraphDriver>,
    connector: Arc<dyn BusConnector>,
    tls: Option<RustlsConfig>,
    ports: PortAllocator,
    maps: Mutex<Maps>,
    closed_tx: mpsc::UnboundedSender<ClosedInstance>,
}

/// Shared handle to the registry. Cheap to clone.
#[derive(Clone)]
pub struct ConversationRegistry {
    inner: Arc<RegistryInner>,
}

impl ConversationRegistry {
    /// Build the registry and start its cleanup task. Needs a Tokio runtime.
    pub fn new(
        config: DataminerConfig,
        driver: Arc<dyn GraphDriver>,
        connector: Arc<dyn BusConnector>,
        tls: Option<RustlsConfig>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let ports = PortAllocator::new(config.port_range, config.router_host.clone());
        let inner = Arc::new(RegistryInner {
            config,
            driver,
            connector,
            tls,
            ports,
            maps: Mutex::new(Maps::default()),
            closed_tx,
        });
        tokio::spawn(cleanup(Arc::downgrade(&inner), closed_rx));
        Self { inner }
    }

    pub fn config(&self) -> &DataminerConfig {
        &self.inner.config
    }

    /// Redirect target for a CID, creating its instance on first contact.
    #[instrument(skip(self), fields(subsystem = "router", component = "registry", op = "redirect"))]
    pub async fn redirect_for(&self, cid: &str, capabilities: Capabilities) -> Result<RedirectTarget> {
        if cid.is_empty() {
            return Err(Error::InvalidInput("empty conversation id".to_string()));
        }
        loop {
            let mut maps = self.inner.maps.lock().await;
            if maps.closing {
                return Err(Error::Internal("router is shutting down".to_string()));
            }

            let replaced = match maps.by_cid.get(cid) {
                Some(Slot::Ready(entry)) if entry.is_live() => {
                    return Ok(RedirectTarget {
                        base: entry.redirect_base.clone(),
                        created: false,
                    });
                }
                Some(Slot::Pending { done, .. }) => {
                    let mut done = done.clone();
                    drop(maps);
                    if !settled(&mut done).await {
                        return Err(Error::Internal("instance creation aborted".to_string()));
                    }
                    // Published or dropped; look again.
                    continue;
                }
                Some(Slot::Ready(_)) => match maps.remove(cid) {
                    Some(Slot::Ready(entry)) => Some(entry.instance),
                    _ => None,
                },
                None => None,
            };

            let reservation = self.reserve(&mut maps, cid, capabilities)?;
            drop(maps);

            // Detached so a dropped request cannot strand the pending slot.
            let registry = self.clone();
            let cid = cid.to_string();
            let build = tokio::spawn(async move {
                if let Some(old) = replaced {
                    debug!(cid, instance_id = %old.id(), "Waiting for replaced instance to close");
                    old.closed().await;
                }
                let Reservation {
                    config,
                    listeners,
                    done,
                } = reservation;
                let created = registry.create(config, listeners).await;
                registry.publish(&cid, created, done).await
            });
            return match build.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("instance creation task failed: {}", e))),
            };
        }
    }

    /// Bind the instance's ports and park a pending slot for the CID.
    fn reserve(&self, maps: &mut Maps, cid: &str, capabilities: Capabilities) -> Result<Reservation> {
        let config = &self.inner.config;
        let instance_config = InstanceConfig::new(cid, config.upstream_url.as_str())
            .with_capabilities(capabilities)
            .with_return_mode(config.return_mode)
            .with_tls(self.inner.tls.clone());

        let proxy = self
            .inner
            .ports
            .allocate(|port| maps.by_port.contains_key(&port))?;
        let proxy_port = proxy.local_addr()?.port();
        let notify = if instance_config.wants_notify() {
            Some(self.inner.ports.allocate(|port| {
                port == proxy_port || maps.by_port.contains_key(&port)
            })?)
        } else {
            None
        };
        let mut ports = vec![proxy_port];
        if let Some(listener) = &notify {
            ports.push(listener.local_addr()?.port());
        }

        for port in &ports {
            maps.by_port.insert(*port, cid.to_string());
        }
        let (done_tx, done_rx) = watch::channel(false);
        maps.by_cid.insert(
            cid.to_string(),
            Slot::Pending {
                ports,
                done: done_rx,
            },
        );
        Ok(Reservation {
            config: instance_config,
            listeners: InstanceListeners { proxy, notify },
            done: done_tx,
        })
    }

    async fn create(&self, instance_config: InstanceConfig, listeners: InstanceListeners) -> Result<Entry> {
        let config = &self.inner.config;
        let session = self.inner.driver.session().await?;
        let instance = ProxyInstance::new(
            instance_config,
            listeners,
            session,
            self.inner.connector.clone(),
        )?
        .with_closed_notifier(self.inner.closed_tx.clone());

        instance.init().await?;
        if let Err(e) = instance.start().await {
            instance.stop(StopReason::Shutdown).await;
            return Err(e);
        }

        let scheme = config.redirect_scheme();
        let mut ports = vec![instance.proxy_port()];
        ports.extend(instance.notify_port());
        Ok(Entry {
            redirect_base: format!("{}://{}:{}", scheme, config.redirect_host, instance.proxy_port()),
            notify_base: instance
                .notify_port()
                .map(|port| format!("{}://{}:{}", scheme, config.redirect_host, port)),
            ports,
            instance,
            retiring: false,
        })
    }

    /// Swap the pending slot for the built entry, or drop it on failure.
    async fn publish(
        &self,
        cid: &str,
        created: Result<Entry>,
        done: watch::Sender<bool>,
    ) -> Result<RedirectTarget> {
        let mut maps = self.inner.maps.lock().await;
        if maps.closing {
            drop(maps);
            if let Ok(entry) = &created {
                entry.instance.stop(StopReason::Shutdown).await;
            }
            done.send_replace(true);
            return Err(Error::Internal("router is shutting down".to_string()));
        }

        let result = match created {
            Ok(entry) => {
                let base = entry.redirect_base.clone();
                info!(
                    cid,
                    instance_id = %entry.instance.id(),
                    port = entry.instance.proxy_port(),
                    active = maps.entries().count() + 1,
                    "Instance created"
                );
                maps.by_cid.insert(cid.to_string(), Slot::Ready(entry));
                Ok(RedirectTarget {
                    base,
                    created: true,
                })
            }
            Err(e) => {
                warn!(cid, error = %e, "Instance creation failed");
                maps.remove(cid);
                Err(e)
            }
        };
        drop(maps);
        done.send_replace(true);
        result
    }

    /// Notify-listener base for a CID.
    pub async fn notification_redirect(&self, cid: &str) -> Result<String> {
        let maps = self.inner.maps.lock().await;
        let entry = maps
            .by_cid
            .get(cid)
            .and_then(Slot::ready)
            .filter(|entry| entry.is_live())
            .ok_or_else(|| Error::NotFound(format!("conversation {}", cid)))?;
        entry
            .notify_base
            .clone()
            .ok_or_else(|| Error::NotFound(format!("conversation {} has no notification stream", cid)))
    }

    /// Stop and drop every instance that no longer reports connected.
    ///
    /// Entries stay registered, marked retiring, until their instance is
    /// CLOSED, so a redirect racing the sweep waits for the old instance.
    #[instrument(skip(self), fields(subsystem = "router", component = "reaper", op = "sweep"))]
    pub async fn reap(&self) -> usize {
        let dead: Vec<ProxyInstance> = {
            let mut maps = self.inner.maps.lock().await;
            maps.by_cid
                .values_mut()
                .filter_map(|slot| match slot {
                    Slot::Ready(entry) if !entry.retiring && !entry.instance.is_connected() => {
                        entry.retiring = true;
                        Some(entry.instance.clone())
                    }
                    _ => None,
                })
                .collect()
        };

        for instance in &dead {
            info!(cid = %instance.cid(), instance_id = %instance.id(), "Reaping instance");
            instance.stop(StopReason::Reaped).await;
        }

        if !dead.is_empty() {
            let mut maps = self.inner.maps.lock().await;
            for instance in &dead {
                let registered = maps
                    .by_cid
                    .get(instance.cid())
                    .and_then(Slot::ready)
                    .is_some_and(|entry| entry.instance.id() == instance.id());
                if registered {
                    maps.remove(instance.cid());
                }
            }
            debug!(reaped = dead.len(), "Reaper sweep finished");
        }
        dead.len()
    }

    /// Active conversations, sorted by CID.
    pub async fn active(&self) -> Vec<ActiveConversation> {
        let maps = self.inner.maps.lock().await;
        let mut list: Vec<_> = maps
            .entries()
            .map(|(cid, entry)| ActiveConversation {
                cid: cid.clone(),
                instance_id: entry.instance.id(),
                redirect: entry.redirect_base.clone(),
                state: entry.instance.state().to_string(),
                connected: entry.instance.is_connected(),
            })
            .collect();
        list.sort_by(|a, b| a.cid.cmp(&b.cid));
        list
    }

    /// The registered instance for a CID, if any.
    pub async fn instance(&self, cid: &str) -> Option<ProxyInstance> {
        let maps = self.inner.maps.lock().await;
        maps.by_cid
            .get(cid)
            .and_then(Slot::ready)
            .map(|entry| entry.instance.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.maps.lock().await.entries().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a port is currently assigned to an instance.
    pub async fn port_in_use(&self, port: u16) -> bool {
        self.inner.maps.lock().await.by_port.contains_key(&port)
    }

    /// Stop every instance and refuse new ones. Used on process shutdown.
    #[instrument(skip(self), fields(subsystem = "router", component = "registry", op = "shutdown"))]
    pub async fn shutdown(&self) {
        let (instances, pending) = {
            let mut maps = self.inner.maps.lock().await;
            maps.closing = true;
            maps.by_port.clear();
            let mut instances = Vec::new();
            let mut pending = Vec::new();
            for (_, slot) in maps.by_cid.drain() {
                match slot {
                    Slot::Ready(entry) => instances.push(entry.instance),
                    Slot::Pending { done, .. } => pending.push(done),
                }
            }
            (instances, pending)
        };
        let count = instances.len();
        futures::future::join_all(
            instances
                .iter()
                .map(|instance| instance.stop(StopReason::Shutdown)),
        )
        .await;
        // Creators that finish now stop their own instance.
        for mut done in pending {
            settled(&mut done).await;
        }
        info!(stopped = count, "All instances stopped");
    }
}

/// Wait until a pending slot is published or dropped. False if its creator
/// went away without settling it.
async fn settled(done: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *done.borrow_and_update() {
            return true;
        }
        if done.changed().await.is_err() {
            return *done.borrow();
        }
    }
}

async fn cleanup(registry: Weak<RegistryInner>, mut closed: mpsc::UnboundedReceiver<ClosedInstance>) {
    while let Some(notice) = closed.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        let mut maps = inner.maps.lock().await;
        let matches = maps
            .by_cid
            .get(&notice.cid)
            .and_then(Slot::ready)
            .is_some_and(|entry| entry.instance.id() == notice.id);
        if matches {
            maps.remove(&notice.cid);
            debug!(cid = %notice.cid, instance_id = %notice.id, "Closed instance removed");
        } else {
            debug!(cid = %notice.cid, instance_id = %notice.id, "Closed instance no longer registered");
        }
    }
}
