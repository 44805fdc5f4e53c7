//! In-process graph.
//!
//! Applies [`GraphOp`]s with the same merge semantics as the rendered Cypher.
//! Used by tests and by `GRAPH_BACKEND=memory` for local development.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dataminer_core::{Error, Result};

use crate::ops::{GraphOp, GraphValue, Label, MergeMode, NodeRef, Props, RelType, WriteBatch};
use crate::session::{GraphDriver, GraphSession};

/// Properties of one stored node or relationship.
pub type PropMap = BTreeMap<String, GraphValue>;

/// Snapshot of a stored relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSnapshot {
    pub from: NodeRef,
    pub rel: RelType,
    pub to: NodeRef,
    pub props: PropMap,
}

impl EdgeSnapshot {
    pub fn prop_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EdgeKey {
    from: NodeRef,
    rel: RelType,
    to: NodeRef,
    identity: String,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: BTreeMap<NodeRef, PropMap>,
    edges: BTreeMap<EdgeKey, PropMap>,
}

impl GraphState {
    /// Reject a batch that would fail part way, before anything is written.
    ///
    /// Node merges never fail, so the only check is that every edge endpoint
    /// exists or is merged earlier in the same batch.
    fn check(&self, ops: &[GraphOp]) -> Result<()> {
        let mut merged: HashSet<&NodeRef> = HashSet::new();
        for op in ops {
            match op {
                GraphOp::MergeNode { node, .. } => {
                    merged.insert(node);
                }
                GraphOp::MergeEdge { from, rel, to, .. } => {
                    for endpoint in [from, to] {
                        if !merged.contains(endpoint) && !self.nodes.contains_key(endpoint) {
                            return Err(Error::Permanent(format!(
                                "{} edge endpoint {} does not exist",
                                rel.as_str(),
                                endpoint
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: &GraphOp, now: i64) {
        match op {
            GraphOp::MergeNode { node, props, mode } => {
                let created = !self.nodes.contains_key(node);
                let entry = self.nodes.entry(node.clone()).or_default();
                if created {
                    entry.insert(
                        node.label.key_property().to_string(),
                        GraphValue::Str(node.key.clone()),
                    );
                    entry.insert("createdAt".to_string(), GraphValue::Int(now));
                }
                let last = entry
                    .get("lastAccessed")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(i64::MIN);
                entry.insert("lastAccessed".to_string(), GraphValue::Int(last.max(now)));

                if created || *mode == MergeMode::Upsert {
                    for (name, value) in props {
                        entry.insert(name.to_string(), value.clone());
                    }
                }
            }
            GraphOp::MergeEdge {
                from,
                rel,
                to,
                props,
            } => {
                let key = EdgeKey {
                    from: from.clone(),
                    rel: *rel,
                    to: to.clone(),
                    identity: identity(props),
                };
                self.edges.entry(key).or_insert_with(|| {
                    let mut map: PropMap = props
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect();
                    map.insert("createdAt".to_string(), GraphValue::Int(now));
                    map
                });
            }
        }
    }
}

fn identity(props: &Props) -> String {
    props
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Shared in-process graph. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryGraph {
    state: Arc<Mutex<GraphState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following write fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_writes.store(unavailable, Ordering::SeqCst);
    }

    /// Apply a batch atomically: either every op lands or none does.
    pub fn apply(&self, batch: &WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transient("graph unavailable".to_string()));
        }
        let mut state = self.lock();
        state.check(&batch.ops)?;
        for op in &batch.ops {
            state.apply(op, batch.timestamp);
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.lock().edges.len()
    }

    pub fn count_label(&self, label: Label) -> usize {
        self.lock().nodes.keys().filter(|n| n.label == label).count()
    }

    /// Properties of one node.
    pub fn node(&self, label: Label, key: &str) -> Option<PropMap> {
        self.lock().nodes.get(&NodeRef::new(label, key)).cloned()
    }

    /// Every relationship of one type.
    pub fn edges(&self, rel: RelType) -> Vec<EdgeSnapshot> {
        self.lock()
            .edges
            .iter()
            .filter(|(k, _)| k.rel == rel)
            .map(|(k, props)| EdgeSnapshot {
                from: k.from.clone(),
                rel: k.rel,
                to: k.to.clone(),
                props: props.clone(),
            })
            .collect()
    }

    /// Every relationship tagged with one conversation id.
    pub fn edges_for_conversation(&self, cid: &str) -> Vec<EdgeSnapshot> {
        self.lock()
            .edges
            .iter()
            .filter(|(_, props)| props.get("conversationId").and_then(|v| v.as_str()) == Some(cid))
            .map(|(k, props)| EdgeSnapshot {
                from: k.from.clone(),
                rel: k.rel,
                to: k.to.clone(),
                props: props.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl GraphSession for MemoryGraph {
    async fn execute(&self, batch: WriteBatch) -> Result<()> {
        self.apply(&batch)
    }
}

#[async_trait]
impl GraphDriver for MemoryGraph {
    async fn session(&self) -> Result<Box<dyn GraphSession>> {
        Ok(Box::new(self.clone()))
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(cid: &str) -> NodeRef {
        NodeRef::new(Label::Conversation, cid)
    }

    #[test]
    fn test_upsert_overwrites_and_keeps_created_at() {
        let g = MemoryGraph::new();
        let m = NodeRef::new(Label::Message, "m1");
        g.apply(&WriteBatch::new(
            vec![GraphOp::upsert(m.clone(), vec![("content", "a".into())])],
            10,
        ))
        .unwrap();
        g.apply(&WriteBatch::new(
            vec![GraphOp::upsert(m, vec![("content", "b".into())])],
            20,
        ))
        .unwrap();

        let node = g.node(Label::Message, "m1").unwrap();
        assert_eq!(node["content"], GraphValue::Str("b".into()));
        assert_eq!(node["createdAt"], GraphValue::Int(10));
        assert_eq!(node["lastAccessed"], GraphValue::Int(20));
        assert_eq!(node["messageId"], GraphValue::Str("m1".into()));
    }

    #[test]
    fn test_stub_never_overwrites() {
        let g = MemoryGraph::new();
        let m = NodeRef::new(Label::Message, "m1");
        g.apply(&WriteBatch::new(
            vec![GraphOp::upsert(m.clone(), vec![("content", "hi".into())])],
            10,
        ))
        .unwrap();
        g.apply(&WriteBatch::new(
            vec![GraphOp::stub(m, vec![("content", "".into())])],
            20,
        ))
        .unwrap();

        let node = g.node(Label::Message, "m1").unwrap();
        assert_eq!(node["content"], GraphValue::Str("hi".into()));
    }

    #[test]
    fn test_last_accessed_never_decreases() {
        let g = MemoryGraph::new();
        let c = conv("C1");
        g.apply(&WriteBatch::new(vec![GraphOp::stub(c.clone(), vec![])], 50))
            .unwrap();
        g.apply(&WriteBatch::new(vec![GraphOp::stub(c, vec![])], 30))
            .unwrap();
        assert_eq!(
            g.node(Label::Conversation, "C1").unwrap()["lastAccessed"],
            GraphValue::Int(50)
        );
    }

    #[test]
    fn test_edge_merge_is_idempotent_per_identity() {
        let g = MemoryGraph::new();
        let t = NodeRef::new(Label::Tracker, "tr");
        let m = NodeRef::new(Label::Message, "m1");
        let ops = vec![
            GraphOp::stub(t.clone(), vec![]),
            GraphOp::stub(m.clone(), vec![]),
            GraphOp::edge(
                t.clone(),
                RelType::TrackerMessageRef,
                m.clone(),
                vec![("conversationId", "C1".into()), ("value", "price".into())],
            ),
            GraphOp::edge(
                t.clone(),
                RelType::TrackerMessageRef,
                m.clone(),
                vec![("conversationId", "C1".into()), ("value", "cost".into())],
            ),
        ];
        g.apply(&WriteBatch::new(ops.clone(), 1)).unwrap();
        g.apply(&WriteBatch::new(ops, 2)).unwrap();

        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.edges_for_conversation("C1").len(), 2);
    }

    #[test]
    fn test_batch_is_atomic() {
        let g = MemoryGraph::new();
        let ops = vec![
            GraphOp::stub(conv("C1"), vec![]),
            GraphOp::edge(
                conv("C1"),
                RelType::Messages,
                NodeRef::new(Label::Message, "missing"),
                vec![("conversationId", "C1".into())],
            ),
        ];
        let err = g.apply(&WriteBatch::new(ops, 1)).unwrap_err();
        assert!(matches!(err, Error::Permanent(_)));
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn test_rejected_batch_leaves_existing_nodes_untouched() {
        let g = MemoryGraph::new();
        g.apply(&WriteBatch::new(
            vec![GraphOp::upsert(conv("C1"), vec![("raw", "first".into())])],
            1,
        ))
        .unwrap();

        let ops = vec![
            GraphOp::upsert(conv("C1"), vec![("raw", "second".into())]),
            GraphOp::edge(
                conv("C1"),
                RelType::Messages,
                NodeRef::new(Label::Message, "missing"),
                vec![("conversationId", "C1".into())],
            ),
        ];
        assert!(g.apply(&WriteBatch::new(ops, 2)).is_err());

        let node = g.node(Label::Conversation, "C1").unwrap();
        assert_eq!(node["raw"], GraphValue::Str("first".into()));
        assert_eq!(node["lastAccessed"], GraphValue::Int(1));
    }

    #[test]
    fn test_edge_to_node_merged_earlier_in_batch() {
        let g = MemoryGraph::new();
        let m = NodeRef::new(Label::Message, "m1");
        let ops = vec![
            GraphOp::stub(conv("C1"), vec![]),
            GraphOp::upsert(m.clone(), vec![("content", "hi".into())]),
            GraphOp::edge(
                conv("C1"),
                RelType::Messages,
                m,
                vec![("conversationId", "C1".into())],
            ),
        ];
        g.apply(&WriteBatch::new(ops, 1)).unwrap();

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edges(RelType::Messages).len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_graph_fails_transiently() {
        let g = MemoryGraph::new();
        g.set_unavailable(true);
        let session = g.session().await.unwrap();
        let err = session
            .execute(WriteBatch::new(vec![GraphOp::stub(conv("C1"), vec![])], 1))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(g.node_count(), 0);
    }
}
