//! Process configuration loaded from the environment.
//!
//! Loaded once at start-up, then threaded through constructors. Nothing in
//! the dataminer reads the environment after [`DataminerConfig::from_env`].
//!
//! ## Environment variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `GRAPH_BACKEND` | `neo4j` (`memory` for an in-process graph) |
//! | `GRAPH_URI` | `127.0.0.1:7687` |
//! | `GRAPH_USERNAME` | `neo4j` |
//! | `GRAPH_PASSWORD` | required for `neo4j` |
//! | `BUS_URI` | `redis://127.0.0.1:6379` |
//! | `ROUTER_HOST` / `ROUTER_PORT` | `0.0.0.0` / `8443` |
//! | `REDIRECT_HOST` | `localhost` |
//! | `UPSTREAM_URL` | `wss://api.symbl.ai` |
//! | `PROXY_PORT_START` / `PROXY_PORT_END` | `9000` / `9999` |
//! | `NOTIFICATIONS_TOKEN` | `notifications` |
//! | `HEADER_NAMESPACE` | `DATAMINER` |
//! | `DEFAULT_TRANSCRIPTION` / `DEFAULT_MESSAGING` | `false` / `true` |
//! | `RETURN_MODE` | `websocket` (or `sse`) |
//! | `REAPER_INTERVAL_SECS` | `60` |
//! | `TLS_CERT_PATH` / `TLS_KEY_PATH` | unset (plain HTTP/WS) |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::defaults;
use crate::{Error, Result};

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Per-instance capability flags, requested through request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Log recognition results at INFO instead of TRACE.
    pub transcription: bool,
    /// Enable the return channel (CID subscriber and delivery).
    pub messaging: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            transcription: defaults::DEFAULT_TRANSCRIPTION,
            messaging: defaults::DEFAULT_MESSAGING,
        }
    }
}

/// Parse a header/env flag. `1`, `true`, `yes`, `on` (any case) are truthy.
pub fn parse_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// =============================================================================
// RETURN MODE
// =============================================================================

/// How application messages reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnMode {
    /// Injected into the downstream direction of the tunnel.
    #[default]
    WebSocket,
    /// Published as `messages` events on the instance's notify port.
    Sse,
}

impl FromStr for ReturnMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" | "inlay" => Ok(ReturnMode::WebSocket),
            "sse" => Ok(ReturnMode::Sse),
            other => Err(Error::Config(format!(
                "RETURN_MODE must be 'websocket' or 'sse', got '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// PORT RANGE
// =============================================================================

/// Inclusive port range for proxy instances. `start == end + 1` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(Error::InvalidInput(
                "port range must not start at 0".to_string(),
            ));
        }
        if u32::from(start) > u32::from(end) + 1 {
            return Err(Error::InvalidInput(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        (u32::from(self.end) + 1 - u32::from(self.start)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: defaults::PROXY_PORT_START,
            end: defaults::PROXY_PORT_END,
        }
    }
}

// =============================================================================
// GRAPH / TLS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphBackend {
    #[default]
    Neo4j,
    Memory,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub backend: GraphBackend,
    pub uri: String,
    pub username: String,
    pub password: String,
    pub tx_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: GraphBackend::Memory,
            uri: defaults::GRAPH_URI.to_string(),
            username: defaults::GRAPH_USERNAME.to_string(),
            password: String::new(),
            tx_timeout: Duration::from_secs(defaults::GRAPH_TX_TIMEOUT_SECS),
        }
    }
}

/// PEM certificate and key shared by the router and every instance listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

// =============================================================================
// DATAMINER CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct DataminerConfig {
    pub router_host: String,
    pub router_port: u16,
    pub redirect_host: String,
    pub upstream_url: String,
    pub port_range: PortRange,
    pub notifications_token: String,
    pub header_namespace: String,
    pub default_capabilities: Capabilities,
    pub return_mode: ReturnMode,
    pub reaper_interval: Duration,
    pub graph: GraphConfig,
    pub bus_uri: String,
    pub tls: Option<TlsConfig>,
}

impl Default for DataminerConfig {
    /// Development defaults: in-process graph and bus, loopback only.
    fn default() -> Self {
        Self {
            router_host: "127.0.0.1".to_string(),
            router_port: defaults::ROUTER_PORT,
            redirect_host: defaults::REDIRECT_HOST.to_string(),
            upstream_url: defaults::UPSTREAM_URL.to_string(),
            port_range: PortRange::default(),
            notifications_token: defaults::NOTIFICATIONS_TOKEN.to_string(),
            header_namespace: defaults::HEADER_NAMESPACE.to_string(),
            default_capabilities: Capabilities::default(),
            return_mode: ReturnMode::default(),
            reaper_interval: Duration::from_secs(defaults::REAPER_INTERVAL_SECS),
            graph: GraphConfig::default(),
            bus_uri: "memory://".to_string(),
            tls: None,
        }
    }
}

impl DataminerConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let backend = match get("GRAPH_BACKEND", "neo4j").to_ascii_lowercase().as_str() {
            "neo4j" => GraphBackend::Neo4j,
            "memory" => GraphBackend::Memory,
            other => {
                return Err(Error::Config(format!(
                    "GRAPH_BACKEND must be 'neo4j' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let password = lookup("GRAPH_PASSWORD").unwrap_or_default();
        if backend == GraphBackend::Neo4j && password.is_empty() {
            return Err(Error::InvalidInput(
                "GRAPH_PASSWORD is required".to_string(),
            ));
        }

        let graph = GraphConfig {
            backend,
            uri: get("GRAPH_URI", defaults::GRAPH_URI),
            username: get("GRAPH_USERNAME", defaults::GRAPH_USERNAME),
            password,
            tx_timeout: Duration::from_secs(defaults::GRAPH_TX_TIMEOUT_SECS),
        };

        let port_range = PortRange::new(
            parse_number(&lookup, "PROXY_PORT_START", defaults::PROXY_PORT_START)?,
            parse_number(&lookup, "PROXY_PORT_END", defaults::PROXY_PORT_END)?,
        )?;

        let default_capabilities = Capabilities {
            transcription: lookup("DEFAULT_TRANSCRIPTION")
                .map(|v| parse_truthy(&v))
                .unwrap_or(defaults::DEFAULT_TRANSCRIPTION),
            messaging: lookup("DEFAULT_MESSAGING")
                .map(|v| parse_truthy(&v))
                .unwrap_or(defaults::DEFAULT_MESSAGING),
        };

        let tls = match (lookup("TLS_CERT_PATH"), lookup("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string(),
                ))
            }
        };

        let reaper_secs: u64 =
            parse_number(&lookup, "REAPER_INTERVAL_SECS", defaults::REAPER_INTERVAL_SECS)?;

        let notifications_token = get("NOTIFICATIONS_TOKEN", defaults::NOTIFICATIONS_TOKEN);
        if notifications_token.is_empty() || notifications_token.contains('/') {
            return Err(Error::Config(format!(
                "NOTIFICATIONS_TOKEN must be a single path segment, got '{}'",
                notifications_token
            )));
        }

        Ok(Self {
            router_host: get("ROUTER_HOST", defaults::ROUTER_HOST),
            router_port: parse_number(&lookup, "ROUTER_PORT", defaults::ROUTER_PORT)?,
            redirect_host: get("REDIRECT_HOST", defaults::REDIRECT_HOST),
            upstream_url: get("UPSTREAM_URL", defaults::UPSTREAM_URL),
            port_range,
            notifications_token,
            header_namespace: get("HEADER_NAMESPACE", defaults::HEADER_NAMESPACE),
            default_capabilities,
            return_mode: get("RETURN_MODE", "websocket").parse()?,
            reaper_interval: Duration::from_secs(reaper_secs.max(1)),
            graph,
            bus_uri: get("BUS_URI", defaults::BUS_URI),
            tls,
        })
    }

    /// Set the proxy port range.
    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    /// Set the return-channel delivery mode.
    pub fn with_return_mode(mut self, mode: ReturnMode) -> Self {
        self.return_mode = mode;
        self
    }

    /// Set the upstream WebSocket base URL.
    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }

    /// Set the reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// `X-<ns>-TRANSCRIPTION` header name.
    pub fn transcription_header(&self) -> String {
        format!("X-{}-TRANSCRIPTION", self.header_namespace)
    }

    /// `X-<ns>-MESSAGING` header name.
    pub fn messaging_header(&self) -> String {
        format!("X-{}-MESSAGING", self.header_namespace)
    }

    /// `https` when TLS material is configured, else `http`.
    pub fn redirect_scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("{} is not a valid number: '{}'", key, raw))),
        None => Ok(default),
    }
}
