//! Proxy instance: everything one active conversation owns.
//!
//! # Lifecycle
//!
//! ```text
//! INITIALIZING --init()--> CONNECTED --stop(reason)--> TEARING_DOWN --> CLOSED
//! ```
//!
//! `init()` connects the bus adapter, subscribes the return channel, builds
//! the dispatcher and ensures the seven event publishers; any failure rolls
//! the earlier steps back. `start()` spawns the frame pump, the tunnel
//! listener, the notify listener (SSE mode) and a supervisor that turns the
//! first stop request into `stop()`. Stop requests come from a terminal
//! frame, a closed client or upstream socket, the reaper, or shutdown.

use std::fmt;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dataminer_bus::{BusAdapter, BusConnector};
use dataminer_core::{Capabilities, Error, EventKind, Result, ReturnMode};
use dataminer_graph::{GraphSession, GraphWriter};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::delivery::ReturnChannel;
use crate::dispatcher::{Dispatcher, FrameOutcome};
use crate::notify::{self, NotifyState};
use crate::server;
use crate::tunnel::{self, TunnelState};

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Initializing,
    Connected,
    TearingDown,
    Closed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Initializing => "initializing",
            InstanceState::Connected => "connected",
            InstanceState::TearingDown => "tearing_down",
            InstanceState::Closed => "closed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TerminalFrame,
    ClientClosed,
    UpstreamClosed,
    Reaped,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TerminalFrame => "terminal_frame",
            StopReason::ClientClosed => "client_closed",
            StopReason::UpstreamClosed => "upstream_closed",
            StopReason::Reaped => "reaped",
            StopReason::Shutdown => "shutdown",
        }
    }

    /// Completion frame published when the upstream never sent one.
    pub fn teardown_frame(&self) -> String {
        format!(
            r#"{{"type":"message","message":{{"type":"conversation_completed","reason":"{}"}}}}"#,
            self.as_str()
        )
    }
}

/// Sent to the owner once an instance reaches CLOSED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedInstance {
    pub cid: String,
    pub id: Uuid,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Per-instance settings.
#[derive(Clone)]
pub struct InstanceConfig {
    pub cid: String,
    pub upstream_url: String,
    pub capabilities: Capabilities,
    pub return_mode: ReturnMode,
    pub tls: Option<RustlsConfig>,
}

impl InstanceConfig {
    pub fn new(cid: impl Into<String>, upstream_url: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            upstream_url: upstream_url.into(),
            capabilities: Capabilities::default(),
            return_mode: ReturnMode::default(),
            tls: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_return_mode(mut self, mode: ReturnMode) -> Self {
        self.return_mode = mode;
        self
    }

    pub fn with_tls(mut self, tls: Option<RustlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Whether this instance needs a notify listener.
    pub fn wants_notify(&self) -> bool {
        self.return_mode == ReturnMode::Sse && self.capabilities.messaging
    }
}

/// Listeners bound by the allocator before the instance is built.
pub struct InstanceListeners {
    pub proxy: TcpListener,
    pub notify: Option<TcpListener>,
}

// =============================================================================
// INSTANCE
// =============================================================================

struct Parts {
    adapter: Arc<BusAdapter>,
    dispatcher: Arc<Dispatcher>,
    return_channel: Option<Arc<ReturnChannel>>,
}

struct Running {
    pump: JoinHandle<()>,
    servers: Vec<(Handle, JoinHandle<()>)>,
}

#[derive(Default)]
struct Lifecycle {
    listeners: Option<InstanceListeners>,
    session: Option<Box<dyn GraphSession>>,
    parts: Option<Parts>,
    running: Option<Running>,
    requests: Option<mpsc::UnboundedReceiver<StopReason>>,
}

struct Inner {
    id: Uuid,
    config: InstanceConfig,
    proxy_port: u16,
    notify_port: Option<u16>,
    connector: Arc<dyn BusConnector>,
    state: watch::Sender<InstanceState>,
    stop_signal: watch::Sender<bool>,
    requests_tx: mpsc::UnboundedSender<StopReason>,
    adapter: OnceLock<Arc<BusAdapter>>,
    closed_tx: Option<mpsc::UnboundedSender<ClosedInstance>>,
    lifecycle: Mutex<Lifecycle>,
}

/// One active conversation. Cheap to clone.
#[derive(Clone)]
pub struct ProxyInstance {
    inner: Arc<Inner>,
}

impl ProxyInstance {
    pub fn new(
        config: InstanceConfig,
        listeners: InstanceListeners,
        session: Box<dyn GraphSession>,
        connector: Arc<dyn BusConnector>,
    ) -> Result<Self> {
        if config.cid.is_empty() {
            return Err(Error::InvalidInput("empty conversation id".to_string()));
        }
        if config.wants_notify() && listeners.notify.is_none() {
            return Err(Error::InvalidInput(
                "SSE return mode needs a notify listener".to_string(),
            ));
        }
        let proxy_port = listeners.proxy.local_addr()?.port();
        let notify_port = match &listeners.notify {
            Some(listener) => Some(listener.local_addr()?.port()),
            None => None,
        };
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                id: Uuid::now_v7(),
                config,
                proxy_port,
                notify_port,
                connector,
                state: watch::channel(InstanceState::Initializing).0,
                stop_signal: watch::channel(false).0,
                requests_tx,
                adapter: OnceLock::new(),
                closed_tx: None,
                lifecycle: Mutex::new(Lifecycle {
                    listeners: Some(listeners),
                    session: Some(session),
                    requests: Some(requests_rx),
                    ..Default::default()
                }),
            }),
        })
    }

    /// Report `(cid, id)` on this channel once the instance is CLOSED.
    ///
    /// Must be called before the instance is shared.
    pub fn with_closed_notifier(mut self, tx: mpsc::UnboundedSender<ClosedInstance>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.closed_tx = Some(tx);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn cid(&self) -> &str {
        &self.inner.config.cid
    }

    pub fn proxy_port(&self) -> u16 {
        self.inner.proxy_port
    }

    pub fn notify_port(&self) -> Option<u16> {
        self.inner.notify_port
    }

    pub fn state(&self) -> InstanceState {
        *self.inner.state.borrow()
    }

    /// True only in CONNECTED with a healthy bus adapter.
    pub fn is_connected(&self) -> bool {
        self.state() == InstanceState::Connected
            && self
                .inner
                .adapter
                .get()
                .is_some_and(|adapter| adapter.is_healthy())
    }

    /// Wait until the instance reaches CLOSED.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        while *rx.borrow_and_update() != InstanceState::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Connect the bus, subscribe the return channel, build the dispatcher
    /// and ensure every event publisher. Rolls back on failure.
    #[instrument(skip(self), fields(subsystem = "proxy", component = "instance", op = "init", cid = %self.cid()))]
    pub async fn init(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.state() != InstanceState::Initializing || lifecycle.parts.is_some() {
            return Err(Error::Internal(format!(
                "instance {} cannot init in state {}",
                self.inner.id,
                self.state()
            )));
        }
        let session = lifecycle
            .session
            .take()
            .ok_or_else(|| Error::Internal("graph session already consumed".to_string()))?;
        let writer = GraphWriter::new(session);

        let adapter = match BusAdapter::connect(self.inner.connector.as_ref()).await {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                if let Err(close_err) = writer.close().await {
                    warn!(error = %close_err, "Failed to close graph session during rollback");
                }
                return Err(e);
            }
        };

        let config = &self.inner.config;
        let return_channel = config.capabilities.messaging.then(|| {
            Arc::new(ReturnChannel::new(
                config.cid.as_str(),
                config.return_mode,
                self.inner.state.subscribe(),
            ))
        });

        let dispatcher = Arc::new(Dispatcher::new(
            config.cid.as_str(),
            writer,
            adapter.clone(),
            config.capabilities,
        ));

        if let Err(e) = self.prepare_bus(&adapter, return_channel.clone()).await {
            if let Err(teardown_err) = adapter.tear_down().await {
                warn!(error = %teardown_err, "Bus rollback failed");
            }
            if let Err(close_err) = dispatcher.close().await {
                warn!(error = %close_err, "Failed to close graph session during rollback");
            }
            return Err(e);
        }

        let _ = self.inner.adapter.set(adapter.clone());
        lifecycle.parts = Some(Parts {
            adapter,
            dispatcher,
            return_channel,
        });
        self.inner.state.send_replace(InstanceState::Connected);
        info!(instance_id = %self.inner.id, port = self.inner.proxy_port, "Instance initialized");
        Ok(())
    }

    async fn prepare_bus(
        &self,
        adapter: &BusAdapter,
        return_channel: Option<Arc<ReturnChannel>>,
    ) -> Result<()> {
        if let Some(channel) = return_channel {
            adapter.ensure_subscriber(self.cid(), channel).await?;
        }
        for kind in EventKind::ALL {
            adapter.ensure_publisher(kind.topic()).await?;
        }
        Ok(())
    }

    /// Spawn the frame pump, listeners and supervisor.
    #[instrument(skip(self), fields(subsystem = "proxy", component = "instance", op = "start", cid = %self.cid()))]
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.running.is_some() {
            return Err(Error::Internal("instance already started".to_string()));
        }
        let (dispatcher, return_channel) = match &lifecycle.parts {
            Some(parts) => (parts.dispatcher.clone(), parts.return_channel.clone()),
            None => return Err(Error::Internal("instance not initialized".to_string())),
        };
        let listeners = lifecycle
            .listeners
            .take()
            .ok_or_else(|| Error::Internal("listeners already consumed".to_string()))?;
        let requests = lifecycle
            .requests
            .take()
            .ok_or_else(|| Error::Internal("supervisor already running".to_string()))?;

        let config = &self.inner.config;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(
            dispatcher,
            frames_rx,
            self.inner.stop_signal.subscribe(),
            self.inner.requests_tx.clone(),
        ));

        let inlay = return_channel
            .clone()
            .filter(|channel| channel.mode() == ReturnMode::WebSocket);
        let tunnel_app = tunnel::router(TunnelState {
            cid: Arc::from(config.cid.as_str()),
            upstream_url: Arc::from(config.upstream_url.as_str()),
            attached: Arc::new(AtomicBool::new(false)),
            frames: frames_tx,
            inlay,
            stop: self.inner.stop_signal.subscribe(),
            requests: self.inner.requests_tx.clone(),
        });
        let mut servers = vec![self.spawn_server("tunnel", listeners.proxy, tunnel_app)];

        if let (Some(listener), Some(channel)) = (listeners.notify, return_channel) {
            if channel.mode() == ReturnMode::Sse {
                let notify_app = notify::router(NotifyState {
                    cid: Arc::from(config.cid.as_str()),
                    channel,
                    stop: self.inner.stop_signal.subscribe(),
                });
                servers.push(self.spawn_server("notify", listener, notify_app));
            }
        }

        tokio::spawn(supervise(
            self.clone(),
            requests,
            self.inner.stop_signal.subscribe(),
        ));
        lifecycle.running = Some(Running { pump, servers });
        info!(
            instance_id = %self.inner.id,
            port = self.inner.proxy_port,
            notify_port = ?self.inner.notify_port,
            "Instance started"
        );
        Ok(())
    }

    fn spawn_server(
        &self,
        name: &'static str,
        listener: TcpListener,
        app: axum::Router,
    ) -> (Handle, JoinHandle<()>) {
        let handle = Handle::new();
        let tls = self.inner.config.tls.clone();
        let requests = self.inner.requests_tx.clone();
        let cid = self.inner.config.cid.clone();
        let task = tokio::spawn({
            let handle = handle.clone();
            async move {
                if let Err(e) = server::serve_listener(listener, app, tls, handle).await {
                    error!(cid = %cid, listener = name, error = %e, "Listener failed");
                    let _ = requests.send(StopReason::Shutdown);
                }
            }
        });
        (handle, task)
    }

    /// Tear the instance down. Idempotent; later calls wait for the first.
    #[instrument(skip(self), fields(subsystem = "proxy", component = "instance", op = "stop", cid = %self.cid(), reason = reason.as_str()))]
    pub async fn stop(&self, reason: StopReason) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if matches!(
            self.state(),
            InstanceState::TearingDown | InstanceState::Closed
        ) {
            debug!("Instance already stopped");
            return;
        }
        self.inner.state.send_replace(InstanceState::TearingDown);
        self.inner.stop_signal.send_replace(true);

        // Let the pump drain frames already received before the teardown.
        let servers = match lifecycle.running.take() {
            Some(Running { pump, servers }) => {
                if let Err(e) = pump.await {
                    warn!(error = %e, "Frame pump ended abnormally");
                }
                Some(servers)
            }
            None => None,
        };

        if let Some(parts) = lifecycle.parts.take() {
            if let Err(e) = parts.dispatcher.conclude(&reason.teardown_frame()).await {
                warn!(error = %e, "Failed to publish conversation teardown");
            }
            if let Err(e) = parts.adapter.tear_down().await {
                warn!(error = %e, "Bus tear-down failed");
            }
            if let Err(e) = parts.dispatcher.close().await {
                warn!(error = %e, "Failed to close graph session");
            }
        }

        match servers {
            Some(servers) => {
                for (handle, task) in servers {
                    server::shutdown(&handle);
                    if let Err(e) = task.await {
                        warn!(error = %e, "Listener task ended abnormally");
                    }
                }
            }
            None => {
                lifecycle.listeners = None;
                if let Some(session) = lifecycle.session.take() {
                    if let Err(e) = session.close().await {
                        warn!(error = %e, "Failed to close unused graph session");
                    }
                }
            }
        }

        self.inner.state.send_replace(InstanceState::Closed);
        info!(instance_id = %self.inner.id, "Instance closed");
        if let Some(tx) = &self.inner.closed_tx {
            let _ = tx.send(ClosedInstance {
                cid: self.inner.config.cid.clone(),
                id: self.inner.id,
            });
        }
    }

    /// Return-channel counters `(delivered, dropped)`, when messaging is on.
    pub async fn return_channel_stats(&self) -> Option<(u64, u64)> {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle
            .parts
            .as_ref()
            .and_then(|parts| parts.return_channel.as_ref())
            .map(|channel| (channel.delivered(), channel.dropped()))
    }
}

async fn pump(
    dispatcher: Arc<Dispatcher>,
    mut frames: mpsc::UnboundedReceiver<String>,
    mut stop: watch::Receiver<bool>,
    requests: mpsc::UnboundedSender<StopReason>,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => handle_frame(&dispatcher, &frame, &requests).await,
                None => break,
            },
            _ = stop.changed() => {
                while let Ok(frame) = frames.try_recv() {
                    handle_frame(&dispatcher, &frame, &requests).await;
                }
                break;
            }
        }
    }
    debug!(cid = %dispatcher.cid(), "Frame pump stopped");
}

async fn handle_frame(
    dispatcher: &Dispatcher,
    frame: &str,
    requests: &mpsc::UnboundedSender<StopReason>,
) {
    match dispatcher.on_frame(frame).await {
        Ok(FrameOutcome::Terminal) => {
            let _ = requests.send(StopReason::TerminalFrame);
        }
        Ok(_) => {}
        Err(e) => warn!(
            cid = %dispatcher.cid(),
            error = %e,
            error_category = e.category(),
            "Frame ingest failed"
        ),
    }
}

async fn supervise(
    instance: ProxyInstance,
    mut requests: mpsc::UnboundedReceiver<StopReason>,
    mut stop: watch::Receiver<bool>,
) {
    tokio::select! {
        Some(reason) = requests.recv() => instance.stop(reason).await,
        _ = stop.changed() => {}
    }
}
