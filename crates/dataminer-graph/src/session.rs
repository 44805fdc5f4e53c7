//! Graph driver and session abstractions, with the Neo4j implementation.
//!
//! The router owns one driver; each proxy instance takes one session and
//! never shares it, so writes for a conversation are serialized.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dataminer_core::{Error, GraphConfig, Result};
use neo4rs::{ConfigBuilder, Graph, Query};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cypher::{self, Statement};
use crate::ops::{GraphValue, WriteBatch};

/// Runs write batches, one transaction each.
#[async_trait]
pub trait GraphSession: Send + Sync {
    /// Apply every op in the batch inside one transaction.
    async fn execute(&self, batch: WriteBatch) -> Result<()>;

    /// Release the session. Further use is a caller bug.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Hands out sessions and owns schema bootstrap.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    async fn session(&self) -> Result<Box<dyn GraphSession>>;

    /// Create one uniqueness constraint per label. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;
}

// =============================================================================
// NEO4J
// =============================================================================

/// Neo4j-backed driver over a pooled `neo4rs::Graph`.
#[derive(Clone)]
pub struct Neo4jDriver {
    graph: Arc<Graph>,
    tx_timeout: Duration,
}

impl Neo4jDriver {
    /// Connect with the configured credentials.
    pub async fn connect(config: &GraphConfig) -> Result<Self> {
        let neo_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.username.as_str())
            .password(config.password.as_str())
            .build()
            .map_err(|e| Error::Config(format!("graph config: {}", e)))?;

        let graph = Graph::connect(neo_config).await?;

        info!(
            subsystem = "graph",
            component = "driver",
            op = "connect",
            uri = %config.uri,
            "Graph driver connected"
        );

        Ok(Self {
            graph: Arc::new(graph),
            tx_timeout: config.tx_timeout,
        })
    }
}

#[async_trait]
impl GraphDriver for Neo4jDriver {
    async fn session(&self) -> Result<Box<dyn GraphSession>> {
        Ok(Box::new(Neo4jSession {
            graph: self.graph.clone(),
            tx_timeout: self.tx_timeout,
            serial: Mutex::new(()),
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in cypher::schema_statements() {
            self.graph.run(neo4rs::query(&statement)).await?;
        }
        info!(
            subsystem = "graph",
            component = "driver",
            op = "ensure_schema",
            "Graph constraints ensured"
        );
        Ok(())
    }
}

/// One conversation's session. Batches run one at a time.
pub struct Neo4jSession {
    graph: Arc<Graph>,
    tx_timeout: Duration,
    serial: Mutex<()>,
}

impl Neo4jSession {
    async fn run_batch(&self, queries: Vec<Query>) -> Result<()> {
        let mut txn = self.graph.start_txn().await?;
        txn.run_queries(queries).await?;
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl GraphSession for Neo4jSession {
    async fn execute(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _serial = self.serial.lock().await;
        let start = Instant::now();
        let op_count = batch.len();

        let queries: Vec<Query> = batch
            .ops
            .iter()
            .map(|op| to_query(cypher::render(op, batch.timestamp)))
            .collect();

        match tokio::time::timeout(self.tx_timeout, self.run_batch(queries)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Transient(format!(
                    "graph transaction timed out after {}s",
                    self.tx_timeout.as_secs()
                )))
            }
        }

        debug!(
            subsystem = "graph",
            component = "session",
            op = "execute",
            op_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Graph batch committed"
        );
        Ok(())
    }
}

fn to_query(statement: Statement) -> Query {
    statement
        .params
        .into_iter()
        .fold(neo4rs::query(&statement.text), |q, (name, value)| {
            match value {
                GraphValue::Str(s) => q.param(&name, s),
                GraphValue::Int(i) => q.param(&name, i),
                GraphValue::Float(x) => q.param(&name, x),
                GraphValue::Bool(b) => q.param(&name, b),
                GraphValue::List(items) => q.param(&name, items),
            }
        })
}
