//! # dataminer-core
//!
//! Shared types for the conversation dataminer: the error taxonomy, default
//! constants, the upstream frame model, published event kinds and their bus
//! envelope, the downstream message cache, and environment configuration.

pub mod cache;
pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;

// Re-export commonly used types at crate root
pub use cache::{CachedMessage, MessageCache};
pub use config::{
    parse_truthy, Capabilities, DataminerConfig, GraphBackend, GraphConfig, PortRange, ReturnMode,
    TlsConfig,
};
pub use error::{Error, Result};
pub use events::{Envelope, EventKind};
pub use models::{FrameKind, InsightType};
