//! Structured logging schema and field name constants for the dataminer.
//!
//! All crates log with these field names so log aggregation can correlate a
//! conversation across the router, its proxy instance, and the bus.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue: unknown frame, failed write, dropped message |
//! | INFO  | Lifecycle events: instance created/closed, listener bound |
//! | DEBUG | Per-frame decisions, redirects, publishes |
//! | TRACE | Payload-level data (recognition results, raw frames) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Conversation identifier supplied by the client.
pub const CID: &str = "cid";

/// UUIDv7 of one proxy instance (a CID may see several over its lifetime).
pub const INSTANCE_ID: &str = "instance_id";

/// Subsystem originating the log event.
/// Values: "router", "proxy", "graph", "bus"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "registry", "reaper", "tunnel", "dispatcher", "writer", "adapter"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "redirect", "init", "stop", "write", "publish"
pub const OPERATION: &str = "op";

// ─── Event fields ──────────────────────────────────────────────────────────

/// Event kind being dispatched or published.
pub const EVENT_KIND: &str = "event_kind";

/// Bus topic name.
pub const TOPIC: &str = "topic";

/// Reason an instance is tearing down.
pub const REASON: &str = "reason";

// ─── Resource fields ───────────────────────────────────────────────────────

/// Proxy (tunnel) port of an instance.
pub const PORT: &str = "port";

/// SSE notify port of an instance.
pub const NOTIFY_PORT: &str = "notify_port";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of graph operations in one transaction.
pub const OP_COUNT: &str = "op_count";

/// Byte length of a frame or payload.
pub const PAYLOAD_LEN: &str = "payload_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Error category from [`crate::Error::category`].
pub const ERROR_CATEGORY: &str = "error_category";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_field_names_are_unique_snake_case() {
        let fields = [
            CID,
            INSTANCE_ID,
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            EVENT_KIND,
            TOPIC,
            REASON,
            PORT,
            NOTIFY_PORT,
            DURATION_MS,
            OP_COUNT,
            PAYLOAD_LEN,
            ERROR_MSG,
            ERROR_CATEGORY,
        ];
        let unique: HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
        for f in fields {
            assert!(f
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
