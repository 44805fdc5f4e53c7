//! # dataminer-graph
//!
//! Idempotent persistence of conversation events as a labeled property graph.
//!
//! - [`ops`]: the closed set of upserts (merge node, merge relationship)
//! - [`cypher`]: parameterized Cypher for each upsert plus schema bootstrap
//! - [`session`]: driver/session traits and the Neo4j implementation
//! - [`memory`]: an in-process graph with identical merge semantics
//! - [`writer`]: the per-conversation graph writer

pub mod cypher;
pub mod memory;
pub mod ops;
pub mod session;
pub mod writer;

pub use memory::{EdgeSnapshot, MemoryGraph};
pub use ops::{GraphOp, GraphValue, Label, MergeMode, NodeRef, RelType, WriteBatch};
pub use session::{GraphDriver, GraphSession, Neo4jDriver};
pub use writer::{plan, GraphWriter, WriteSummary};
