//! Error types for the dataminer.

use thiserror::Error;

/// Result type alias using the dataminer's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by every dataminer crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input (empty CID, bad header, malformed request)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (missing env var, invalid port range, TLS material)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker or graph I/O failed in a way that may succeed on a later attempt
    #[error("Transient I/O error: {0}")]
    Transient(String),

    /// Graph rejected a statement (constraint violation, malformed statement)
    #[error("Permanent graph error: {0}")]
    Permanent(String),

    /// Upstream payload lacks a field the writer requires
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bus publisher was never ensured
    #[error("Publisher not found: {0}")]
    PublisherNotFound(String),

    /// Bus subscriber was never ensured
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),

    /// Bus adapter used before connect or after tear-down
    #[error("Bus adapter not initialized")]
    BusNotInitialized,

    /// Every port in the configured range is taken
    #[error("No free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is worth retrying by the caller.
    ///
    /// Nothing in the dataminer retries on its own; upstream resends or the
    /// publisher re-publishes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_))
    }

    /// Whether the failure stems from the payload rather than the store.
    pub fn is_logical(&self) -> bool {
        matches!(self, Error::MissingField(_) | Error::Serialization(_))
    }

    /// Short category label for structured logs.
    pub fn category(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else if self.is_logical() {
            "logical"
        } else {
            match self {
                Error::Permanent(_) => "permanent",
                Error::NotFound(_)
                | Error::PublisherNotFound(_)
                | Error::SubscriberNotFound(_) => "not_found",
                Error::InvalidInput(_) | Error::Config(_) | Error::PortExhausted { .. } => {
                    "invalid_input"
                }
                _ => "internal",
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<neo4rs::Error> for Error {
    fn from(e: neo4rs::Error) -> Self {
        if matches!(
            e,
            neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError
        ) {
            Error::Transient(format!("graph: {}", e))
        } else {
            Error::Permanent(e.to_string())
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Transient(format!("broker: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("empty conversation id".to_string());
        assert_eq!(err.to_string(), "Invalid input: empty conversation id");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("GRAPH_PASSWORD is required".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: GRAPH_PASSWORD is required"
        );
    }

    #[test]
    fn test_error_display_transient() {
        let err = Error::Transient("graph transaction timed out".to_string());
        assert_eq!(
            err.to_string(),
            "Transient I/O error: graph transaction timed out"
        );
    }

    #[test]
    fn test_error_display_missing_field() {
        let err = Error::MissingField("messages[0].id".to_string());
        assert_eq!(err.to_string(), "Missing field: messages[0].id");
    }

    #[test]
    fn test_error_display_publisher_not_found() {
        let err = Error::PublisherNotFound("message-created".to_string());
        assert_eq!(err.to_string(), "Publisher not found: message-created");
    }

    #[test]
    fn test_error_display_subscriber_not_found() {
        let err = Error::SubscriberNotFound("C1".to_string());
        assert_eq!(err.to_string(), "Subscriber not found: C1");
    }

    #[test]
    fn test_error_display_bus_not_initialized() {
        assert_eq!(
            Error::BusNotInitialized.to_string(),
            "Bus adapter not initialized"
        );
    }

    #[test]
    fn test_error_display_port_exhausted() {
        let err = Error::PortExhausted {
            start: 9000,
            end: 8999,
        };
        assert_eq!(err.to_string(), "No free port in range 9000-8999");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.is_logical());
    }

    #[test]
    fn test_error_from_redis_is_transient() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err: Error = redis_err.into();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("Transient I/O error: broker:"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::Transient("x".into()).category(), "transient");
        assert_eq!(Error::Permanent("x".into()).category(), "permanent");
        assert_eq!(Error::MissingField("x".into()).category(), "logical");
        assert_eq!(Error::PublisherNotFound("x".into()).category(), "not_found");
        assert_eq!(
            Error::PortExhausted { start: 1, end: 0 }.category(),
            "invalid_input"
        );
        assert_eq!(Error::BusNotInitialized.category(), "internal");
    }
}
