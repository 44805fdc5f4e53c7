//! Graph operations.
//!
//! Every write the dataminer performs is one of two upserts: merge a node on
//! its natural key, or merge a relationship between two keyed nodes. Both
//! backends (Neo4j via [`crate::cypher`], in-process via [`crate::memory`])
//! apply the same semantics.

use std::fmt;

/// Property value stored on a node or relationship.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl GraphValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GraphValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GraphValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GraphValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Missing optional values are stored as empty strings.
    pub fn opt_str(value: Option<&str>) -> Self {
        GraphValue::Str(value.unwrap_or_default().to_string())
    }

    pub fn opt_int(value: Option<i64>) -> Self {
        value.map(GraphValue::Int).unwrap_or_else(|| GraphValue::Str(String::new()))
    }

    pub fn opt_float(value: Option<f64>) -> Self {
        value.map(GraphValue::Float).unwrap_or_else(|| GraphValue::Str(String::new()))
    }
}

impl fmt::Display for GraphValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphValue::Str(s) => write!(f, "{:?}", s),
            GraphValue::Int(i) => write!(f, "{}", i),
            GraphValue::Float(x) => write!(f, "{}", x),
            GraphValue::Bool(b) => write!(f, "{}", b),
            GraphValue::List(items) => write!(f, "{:?}", items),
        }
    }
}

impl From<&str> for GraphValue {
    fn from(s: &str) -> Self {
        GraphValue::Str(s.to_string())
    }
}

impl From<String> for GraphValue {
    fn from(s: String) -> Self {
        GraphValue::Str(s)
    }
}

impl From<i64> for GraphValue {
    fn from(i: i64) -> Self {
        GraphValue::Int(i)
    }
}

impl From<bool> for GraphValue {
    fn from(b: bool) -> Self {
        GraphValue::Bool(b)
    }
}

impl From<Vec<String>> for GraphValue {
    fn from(items: Vec<String>) -> Self {
        GraphValue::List(items)
    }
}

/// Node labels with their natural key property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    Conversation,
    Message,
    User,
    Topic,
    Tracker,
    Entity,
    Insight,
}

impl Label {
    pub const ALL: [Label; 7] = [
        Label::Conversation,
        Label::Message,
        Label::User,
        Label::Topic,
        Label::Tracker,
        Label::Entity,
        Label::Insight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Conversation => "Conversation",
            Label::Message => "Message",
            Label::User => "User",
            Label::Topic => "Topic",
            Label::Tracker => "Tracker",
            Label::Entity => "Entity",
            Label::Insight => "Insight",
        }
    }

    /// Property holding the natural key; unique per label.
    pub fn key_property(&self) -> &'static str {
        match self {
            Label::Conversation => "conversationId",
            Label::Message => "messageId",
            Label::User => "userId",
            Label::Topic => "topicId",
            Label::Tracker => "trackerId",
            Label::Entity => "entityId",
            Label::Insight => "insightId",
        }
    }
}

/// Relationship types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelType {
    Messages,
    Topics,
    Tracker,
    Entity,
    Insight,
    Spoke,
    TopicMessageRef,
    TrackerMessageRef,
    TrackerInsightRef,
    EntityMessageRef,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::Messages => "MESSAGES",
            RelType::Topics => "TOPICS",
            RelType::Tracker => "TRACKER",
            RelType::Entity => "ENTITY",
            RelType::Insight => "INSIGHT",
            RelType::Spoke => "SPOKE",
            RelType::TopicMessageRef => "TOPIC_MESSAGE_REF",
            RelType::TrackerMessageRef => "TRACKER_MESSAGE_REF",
            RelType::TrackerInsightRef => "TRACKER_INSIGHT_REF",
            RelType::EntityMessageRef => "ENTITY_MESSAGE_REF",
        }
    }
}

/// A node addressed by label and natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub label: Label,
    pub key: String,
}

impl NodeRef {
    pub fn new(label: Label, key: impl Into<String>) -> Self {
        Self {
            label,
            key: key.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label.as_str(), self.key)
    }
}

/// Ordered property list. Names are compile-time constants.
pub type Props = Vec<(&'static str, GraphValue)>;

/// How a node merge treats an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Overwrite every listed property.
    Upsert,
    /// Set the listed properties only when the node is created. Used for
    /// referenced nodes whose own event has not arrived yet.
    Stub,
}

/// One upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    MergeNode {
        node: NodeRef,
        props: Props,
        mode: MergeMode,
    },
    /// Both endpoints must already exist (merged earlier in the batch or
    /// before). The property set is the relationship's identity.
    MergeEdge {
        from: NodeRef,
        rel: RelType,
        to: NodeRef,
        props: Props,
    },
}

impl GraphOp {
    pub fn upsert(node: NodeRef, props: Props) -> Self {
        GraphOp::MergeNode {
            node,
            props,
            mode: MergeMode::Upsert,
        }
    }

    pub fn stub(node: NodeRef, props: Props) -> Self {
        GraphOp::MergeNode {
            node,
            props,
            mode: MergeMode::Stub,
        }
    }

    pub fn edge(from: NodeRef, rel: RelType, to: NodeRef, props: Props) -> Self {
        GraphOp::MergeEdge {
            from,
            rel,
            to,
            props,
        }
    }
}

/// Operations applied in one transaction, stamped with one clock reading.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<GraphOp>,
    /// Epoch milliseconds used for `createdAt` / `lastAccessed`.
    pub timestamp: i64,
}

impl WriteBatch {
    pub fn new(ops: Vec<GraphOp>, timestamp: i64) -> Self {
        Self { ops, timestamp }
    }

    pub fn now(ops: Vec<GraphOp>) -> Self {
        Self::new(ops, chrono::Utc::now().timestamp_millis())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
