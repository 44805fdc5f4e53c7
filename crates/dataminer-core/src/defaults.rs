//! Centralized default constants for the dataminer.
//!
//! Every crate and the router binary reference these constants instead of
//! defining their own magic numbers. Environment variables override most of
//! them at start-up (see [`crate::config`]).

// =============================================================================
// ROUTER
// =============================================================================

/// Router bind host.
pub const ROUTER_HOST: &str = "0.0.0.0";

/// Router well-known port.
pub const ROUTER_PORT: u16 = 8443;

/// Host placed in redirect URLs handed back to clients.
pub const REDIRECT_HOST: &str = "localhost";

/// Last path segment that marks a notification redirect.
pub const NOTIFICATIONS_TOKEN: &str = "notifications";

/// `<ns>` in the `X-<ns>-TRANSCRIPTION` / `X-<ns>-MESSAGING` headers.
pub const HEADER_NAMESPACE: &str = "DATAMINER";

/// Reaper sweep interval in seconds.
pub const REAPER_INTERVAL_SECS: u64 = 60;

/// Grace period for in-flight requests during process shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

// =============================================================================
// PORT ALLOCATION
// =============================================================================

/// First port handed to proxy instances (inclusive).
pub const PROXY_PORT_START: u16 = 9000;

/// Last port handed to proxy instances (inclusive).
pub const PROXY_PORT_END: u16 = 9999;

/// Sampling attempts per port in range before reporting exhaustion.
pub const PORT_SAMPLE_FACTOR: usize = 4;

// =============================================================================
// UPSTREAM
// =============================================================================

/// Upstream conversational-intelligence WebSocket base URL.
pub const UPSTREAM_URL: &str = "wss://api.symbl.ai";

/// Request headers copied onto the upstream handshake.
pub const FORWARDED_HEADERS: &[&str] = &["authorization", "x-api-key"];

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Default for the transcription capability when no header is sent.
pub const DEFAULT_TRANSCRIPTION: bool = false;

/// Default for the messaging capability when no header is sent.
pub const DEFAULT_MESSAGING: bool = true;

// =============================================================================
// GRAPH
// =============================================================================

/// Graph connection URI.
pub const GRAPH_URI: &str = "127.0.0.1:7687";

/// Graph username.
pub const GRAPH_USERNAME: &str = "neo4j";

/// Deadline for one graph transaction.
pub const GRAPH_TX_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// BUS
// =============================================================================

/// Broker URI. `memory://` selects the in-process bus.
pub const BUS_URI: &str = "redis://127.0.0.1:6379";

/// Per-topic buffer of the in-process bus.
pub const BUS_TOPIC_CAPACITY: usize = 256;

/// Payloads the in-process bus keeps per topic for inspection.
pub const BUS_PUBLISH_LOG_CAPACITY: usize = 1024;

// =============================================================================
// RETURN CHANNEL
// =============================================================================

/// SSE event name carrying application messages.
pub const SSE_STREAM_NAME: &str = "messages";

/// SSE keep-alive interval in seconds.
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// Buffer between the return-channel subscriber and connected clients.
pub const RETURN_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// DOWNSTREAM CONSUMERS
// =============================================================================

/// Recent messages kept per downstream consumer for reference resolution.
pub const MESSAGE_CACHE_CAPACITY: usize = 50;
