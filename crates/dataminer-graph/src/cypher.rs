//! Cypher rendering of [`GraphOp`]s.
//!
//! Labels, relationship types, and property names come from closed enums and
//! constants, so they are inlined. Every value travels as a parameter.

use std::fmt::Write as _;

use crate::ops::{GraphOp, GraphValue, Label, MergeMode, NodeRef, Props, RelType};

/// One parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<(String, GraphValue)>,
}

impl Statement {
    fn new(text: String) -> Self {
        Self {
            text,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, name: impl Into<String>, value: GraphValue) {
        self.params.push((name.into(), value));
    }

    pub fn param(&self, name: &str) -> Option<&GraphValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Name of the uniqueness constraint for a label's key.
pub fn constraint_name(label: Label) -> String {
    format!("dataminer_{}_key", label.as_str().to_lowercase())
}

/// One uniqueness constraint per label, safe to run on every start-up.
pub fn schema_statements() -> Vec<String> {
    Label::ALL
        .iter()
        .map(|label| {
            format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
                constraint_name(*label),
                label.as_str(),
                label.key_property()
            )
        })
        .collect()
}

/// Render one operation at the batch timestamp.
pub fn render(op: &GraphOp, timestamp: i64) -> Statement {
    match op {
        GraphOp::MergeNode { node, props, mode } => render_node(node, props, *mode, timestamp),
        GraphOp::MergeEdge {
            from,
            rel,
            to,
            props,
        } => render_edge(from, *rel, to, props, timestamp),
    }
}

const TOUCH: &str = "n.lastAccessed = CASE WHEN n.lastAccessed IS NULL OR n.lastAccessed < $now THEN $now ELSE n.lastAccessed END";

fn render_node(node: &NodeRef, props: &Props, mode: MergeMode, timestamp: i64) -> Statement {
    let mut text = format!(
        "MERGE (n:{} {{{}: $key}})\nON CREATE SET n.createdAt = $now",
        node.label.as_str(),
        node.label.key_property()
    );

    let assignments: Vec<String> = props
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("n.{} = $p{}", name, i))
        .collect();

    match mode {
        MergeMode::Upsert => {
            let _ = write!(text, "\nSET {}", TOUCH);
            for a in &assignments {
                let _ = write!(text, ", {}", a);
            }
        }
        MergeMode::Stub => {
            for a in &assignments {
                let _ = write!(text, ", {}", a);
            }
            let _ = write!(text, "\nSET {}", TOUCH);
        }
    }

    let mut stmt = Statement::new(text);
    stmt.bind("key", GraphValue::Str(node.key.clone()));
    stmt.bind("now", GraphValue::Int(timestamp));
    for (i, (_, value)) in props.iter().enumerate() {
        stmt.bind(format!("p{}", i), value.clone());
    }
    stmt
}

fn render_edge(
    from: &NodeRef,
    rel: RelType,
    to: &NodeRef,
    props: &Props,
    timestamp: i64,
) -> Statement {
    let identity: Vec<String> = props
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{}: $p{}", name, i))
        .collect();

    let text = format!(
        "MATCH (a:{} {{{}: $from}}), (b:{} {{{}: $to}})\nMERGE (a)-[r:{} {{{}}}]->(b)\nON CREATE SET r.createdAt = $now",
        from.label.as_str(),
        from.label.key_property(),
        to.label.as_str(),
        to.label.key_property(),
        rel.as_str(),
        identity.join(", ")
    );

    let mut stmt = Statement::new(text);
    stmt.bind("from", GraphValue::Str(from.key.clone()));
    stmt.bind("to", GraphValue::Str(to.key.clone()));
    stmt.bind("now", GraphValue::Int(timestamp));
    for (i, (_, value)) in props.iter().enumerate() {
        stmt.bind(format!("p{}", i), value.clone());
    }
    stmt
}
