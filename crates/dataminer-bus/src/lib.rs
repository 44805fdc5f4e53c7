//! # dataminer-bus
//!
//! Topic-per-kind pub/sub for conversation events.
//!
//! Seven fixed fan-out topics carry persisted events; one additional topic
//! per conversation id carries application messages back to that
//! conversation's client.

pub mod adapter;
pub mod consumer;
pub mod memory;
pub mod redis_transport;
pub mod transport;

pub use adapter::{BusAdapter, BusHandler, Publisher, Subscriber};
pub use consumer::{EnvelopeHandler, EventConsumer};
pub use memory::MemoryBroker;
pub use redis_transport::{RedisConnector, RedisTransport};
pub use transport::{connector_for, BusConnector, BusTransport, PayloadStream, TopicOptions};
