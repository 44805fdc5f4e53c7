//! Graph writer: turns one upstream frame into one transaction of upserts.
//!
//! Planning ([`plan`]) is pure; [`GraphWriter::write`] stamps the plan with
//! the current time and runs it on the instance's session.
//!
//! Order within a plan is fixed: the Conversation node, then each child node,
//! then its relationships, then referenced nodes (as stubs) and the reference
//! relationships. A referenced node that has not been ingested yet is created
//! as a stub with empty fields; its own event later overwrites them.

use std::time::Instant;

use dataminer_core::models::{
    decode_body, entity_id, normalize_entity_part, EntityResponse, InsightResponse,
    MessageResponse, ObjectRef, Speaker, TopicResponse, TrackerResponse,
};
use dataminer_core::{Error, EventKind, InsightType, Result};
use tracing::{debug, instrument, warn};

use crate::ops::{GraphOp, GraphValue, Label, NodeRef, Props, RelType, WriteBatch};
use crate::session::GraphSession;

/// Outcome of one successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub op_count: usize,
}

/// Persists upstream events through one owned session.
pub struct GraphWriter {
    session: Box<dyn GraphSession>,
}

impl GraphWriter {
    pub fn new(session: Box<dyn GraphSession>) -> Self {
        Self { session }
    }

    /// Persist one frame. Idempotent: replaying a frame converges on the
    /// same graph (timestamps aside).
    #[instrument(skip(self, frame), fields(subsystem = "graph", component = "writer", op = "write"))]
    pub async fn write(&self, kind: EventKind, cid: &str, frame: &str) -> Result<WriteSummary> {
        let start = Instant::now();
        let ops = plan(kind, cid, frame)?;
        let op_count = ops.len();
        self.session.execute(WriteBatch::now(ops)).await?;
        debug!(
            cid,
            event_kind = %kind,
            op_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Event persisted"
        );
        Ok(WriteSummary { op_count })
    }

    /// Close the underlying session.
    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

/// Plan the upserts for one frame without touching the store.
///
/// `raw` is stored byte for byte on the nodes that keep the frame.
pub fn plan(kind: EventKind, cid: &str, raw: &str) -> Result<Vec<GraphOp>> {
    if cid.is_empty() {
        return Err(Error::InvalidInput("empty conversation id".to_string()));
    }
    let mut p = Planner::new(cid, raw);

    match kind {
        EventKind::ConversationCreated => {
            p.ops.push(GraphOp::upsert(p.conversation(), vec![("raw", raw.into())]));
        }
        EventKind::ConversationTeardown => {
            p.ops.push(GraphOp::upsert(
                p.conversation(),
                vec![
                    ("terminated", true.into()),
                    ("completedAt", GraphValue::Int(chrono::Utc::now().timestamp_millis())),
                ],
            ));
        }
        EventKind::MessageCreated => p.messages(&decode_body(raw)?)?,
        EventKind::InsightCreated => p.insights(&decode_body(raw)?)?,
        EventKind::TopicCreated => p.topics(&decode_body(raw)?)?,
        EventKind::TrackerCreated => p.trackers(&decode_body(raw)?)?,
        EventKind::EntityCreated => p.entities(&decode_body(raw)?)?,
    }

    Ok(p.ops)
}

struct Planner<'a> {
    cid: &'a str,
    raw: &'a str,
    ops: Vec<GraphOp>,
}

impl<'a> Planner<'a> {
    fn new(cid: &'a str, raw: &'a str) -> Self {
        Self {
            cid,
            raw,
            ops: Vec::new(),
        }
    }

    fn conversation(&self) -> NodeRef {
        NodeRef::new(Label::Conversation, self.cid)
    }

    /// MERGE the parent without touching its fields.
    fn ensure_conversation(&mut self) {
        let node = self.conversation();
        self.ops
            .push(GraphOp::stub(node, vec![("terminated", false.into()), ("raw", "".into())]));
    }

    fn tagged(&self, extra: Option<(&'static str, GraphValue)>) -> Props {
        let mut props: Props = vec![("conversationId", self.cid.into())];
        props.extend(extra);
        props
    }

    fn edge(&mut self, from: NodeRef, rel: RelType, to: NodeRef) {
        let props = self.tagged(None);
        self.ops.push(GraphOp::edge(from, rel, to, props));
    }

    fn edge_with(
        &mut self,
        from: NodeRef,
        rel: RelType,
        to: NodeRef,
        attr: (&'static str, GraphValue),
    ) {
        let props = self.tagged(Some(attr));
        self.ops.push(GraphOp::edge(from, rel, to, props));
    }

    fn user(&mut self, speaker: &Speaker) -> Option<NodeRef> {
        let key = speaker.key()?;
        let node = NodeRef::new(Label::User, key);
        self.ops.push(GraphOp::upsert(
            node.clone(),
            vec![
                ("realId", GraphValue::opt_str(speaker.id.as_deref())),
                ("name", GraphValue::opt_str(speaker.name.as_deref())),
                ("email", GraphValue::opt_str(speaker.user_id.as_deref())),
                ("raw", self.raw.into()),
            ],
        ));
        Some(node)
    }

    fn message_stub(&mut self, id: &str) -> NodeRef {
        let node = NodeRef::new(Label::Message, id);
        self.ops.push(GraphOp::stub(
            node.clone(),
            vec![
                ("content", "".into()),
                ("startTime", "".into()),
                ("endTime", "".into()),
                ("timeOffset", "".into()),
                ("duration", "".into()),
                ("sequenceNumber", "".into()),
                ("raw", "".into()),
            ],
        ));
        node
    }

    fn insight_stub(&mut self, id: &str) -> NodeRef {
        let node = NodeRef::new(Label::Insight, id);
        self.ops.push(GraphOp::stub(
            node.clone(),
            vec![
                ("type", "".into()),
                ("content", "".into()),
                ("sequenceNumber", "".into()),
                ("assigneeId", "".into()),
                ("raw", "".into()),
            ],
        ));
        node
    }

    fn messages(&mut self, body: &MessageResponse) -> Result<()> {
        self.ensure_conversation();
        for (i, message) in body.messages.iter().enumerate() {
            let id = required(message.id.as_deref(), || format!("messages[{}].id", i))?;
            let timing = message.duration.clone().unwrap_or_default();
            let node = NodeRef::new(Label::Message, id);
            self.ops.push(GraphOp::upsert(
                node.clone(),
                vec![
                    ("content", GraphValue::opt_str(message.text())),
                    ("startTime", GraphValue::opt_str(timing.start_time.as_deref())),
                    ("endTime", GraphValue::opt_str(timing.end_time.as_deref())),
                    ("timeOffset", GraphValue::opt_float(timing.time_offset)),
                    ("duration", GraphValue::opt_float(timing.duration)),
                    ("sequenceNumber", GraphValue::opt_int(message.sequence_number)),
                    ("raw", self.raw.into()),
                ],
            ));
            self.edge(self.conversation(), RelType::Messages, node.clone());

            if let Some(user) = message.from.as_ref().and_then(|f| self.user(f)) {
                self.edge(node, RelType::Spoke, user);
            }
        }
        Ok(())
    }

    fn insights(&mut self, body: &InsightResponse) -> Result<()> {
        self.ensure_conversation();
        for (i, insight) in body.insights.iter().enumerate() {
            let id = required(insight.id.as_deref(), || format!("insights[{}].id", i))?;
            let raw_type = insight.kind.as_deref().unwrap_or_default();
            let Some(insight_type) = InsightType::parse(raw_type) else {
                warn!(
                    cid = self.cid,
                    insight_id = id,
                    insight_type = raw_type,
                    "Skipping insight with unsupported type"
                );
                continue;
            };

            let node = NodeRef::new(Label::Insight, id);
            self.ops.push(GraphOp::upsert(
                node.clone(),
                vec![
                    ("type", insight_type.as_str().into()),
                    (
                        "content",
                        GraphValue::opt_str(
                            insight.payload.as_ref().and_then(|p| p.content.as_deref()),
                        ),
                    ),
                    ("sequenceNumber", GraphValue::opt_int(insight.sequence_number)),
                    (
                        "assigneeId",
                        GraphValue::opt_str(insight.assignee.as_ref().and_then(|a| a.id.as_deref())),
                    ),
                    ("raw", self.raw.into()),
                ],
            ));
            self.edge(self.conversation(), RelType::Insight, node.clone());

            if let Some(user) = insight.from.as_ref().and_then(|f| self.user(f)) {
                self.edge(node, RelType::Spoke, user);
            }
        }
        Ok(())
    }

    fn topics(&mut self, body: &TopicResponse) -> Result<()> {
        self.ensure_conversation();
        for (i, topic) in body.topics.iter().enumerate() {
            let id = required(topic.id.as_deref(), || format!("topics[{}].id", i))?;
            let phrase = topic.phrases.clone().unwrap_or_default();
            let root_words: Vec<String> = topic
                .root_words
                .iter()
                .filter_map(|w| w.text.clone())
                .collect();

            let node = NodeRef::new(Label::Topic, id);
            self.ops.push(GraphOp::upsert(
                node.clone(),
                vec![
                    ("phrases", phrase.clone().into()),
                    ("score", GraphValue::opt_float(topic.score)),
                    ("type", GraphValue::opt_str(topic.kind.as_deref())),
                    ("messageIndex", GraphValue::opt_int(topic.message_index)),
                    ("rootWords", root_words.into()),
                    ("raw", self.raw.into()),
                ],
            ));
            self.edge(self.conversation(), RelType::Topics, node.clone());

            for message_id in ref_ids(&topic.message_references) {
                let message = self.message_stub(message_id);
                self.edge_with(
                    node.clone(),
                    RelType::TopicMessageRef,
                    message,
                    ("phrase", phrase.clone().into()),
                );
            }
        }
        Ok(())
    }

    fn trackers(&mut self, body: &TrackerResponse) -> Result<()> {
        self.ensure_conversation();
        for (i, tracker) in body.trackers.iter().enumerate() {
            let key = required(tracker.key(), || format!("trackers[{}].id", i))?;
            let node = NodeRef::new(Label::Tracker, key);
            self.ops.push(GraphOp::upsert(
                node.clone(),
                vec![
                    ("name", GraphValue::opt_str(tracker.name.as_deref())),
                    ("raw", self.raw.into()),
                ],
            ));
            self.edge(self.conversation(), RelType::Tracker, node.clone());

            for m in &tracker.matches {
                let value = m.value.clone().unwrap_or_default();
                for message_id in ref_ids(&m.message_refs) {
                    let message = self.message_stub(message_id);
                    self.edge_with(
                        node.clone(),
                        RelType::TrackerMessageRef,
                        message,
                        ("value", value.clone().into()),
                    );
                }
                for insight_id in ref_ids(&m.insight_refs) {
                    let insight = self.insight_stub(insight_id);
                    self.edge_with(
                        node.clone(),
                        RelType::TrackerInsightRef,
                        insight,
                        ("value", value.clone().into()),
                    );
                }
            }
        }
        Ok(())
    }

    fn entities(&mut self, body: &EntityResponse) -> Result<()> {
        self.ensure_conversation();
        for (i, entity) in body.entities.iter().enumerate() {
            let kind = required(entity.kind.as_deref(), || format!("entities[{}].type", i))?;
            let value = required(entity.value.as_deref(), || format!("entities[{}].value", i))?;
            let category = entity.category.as_deref().unwrap_or_default();
            let sub_type = entity.sub_type.as_deref().unwrap_or_default();

            let node = NodeRef::new(Label::Entity, entity_id(category, kind, sub_type, value));
            self.ops.push(GraphOp::upsert(
                node.clone(),
                vec![
                    ("category", normalize_entity_part(category).into()),
                    ("type", normalize_entity_part(kind).into()),
                    ("subType", normalize_entity_part(sub_type).into()),
                    ("value", normalize_entity_part(value).into()),
                    ("raw", self.raw.into()),
                ],
            ));
            self.edge(self.conversation(), RelType::Entity, node.clone());

            for m in &entity.matches {
                let detected = m.detected_value.clone().unwrap_or_default();
                for message_id in ref_ids(&m.message_refs) {
                    let message = self.message_stub(message_id);
                    self.edge_with(
                        node.clone(),
                        RelType::EntityMessageRef,
                        message,
                        ("detectedValue", detected.clone().into()),
                    );
                }
            }
        }
        Ok(())
    }
}

fn required<'s>(value: Option<&'s str>, path: impl FnOnce() -> String) -> Result<&'s str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MissingField(path()))
}

fn ref_ids(refs: &[ObjectRef]) -> impl Iterator<Item = &str> {
    refs.iter()
        .filter_map(|r| r.id.as_deref())
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use crate::ops::MergeMode;

    const MESSAGES: &str = r#"{"type":"message_response","messages":[{"id":"m1","payload":{"content":"hi"},"from":{"id":"u1","name":"A","userId":"a@x"},"duration":{"startTime":"2026-01-01T00:00:00Z","endTime":"2026-01-01T00:00:01Z"},"sequenceNumber":3}]}"#;

    fn labels(ops: &[GraphOp]) -> Vec<String> {
        ops.iter()
            .map(|op| match op {
                GraphOp::MergeNode { node, mode, .. } => format!(
                    "{}{}",
                    node,
                    if *mode == MergeMode::Stub { "~" } else { "" }
                ),
                GraphOp::MergeEdge { rel, .. } => rel.as_str().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_plan_message_order() {
        let ops = plan(EventKind::MessageCreated, "C1", MESSAGES).unwrap();
        assert_eq!(
            labels(&ops),
            vec![
                "Conversation(C1)~",
                "Message(m1)",
                "MESSAGES",
                "User(a@x)",
                "SPOKE"
            ]
        );
    }

    #[test]
    fn test_plan_message_stores_raw_and_sequence() {
        let ops = plan(EventKind::MessageCreated, "C1", MESSAGES).unwrap();
        let GraphOp::MergeNode { props, .. } = &ops[1] else {
            panic!("expected message node");
        };
        let get = |name: &str| props.iter().find(|(n, _)| *n == name).map(|(_, v)| v.clone());
        assert_eq!(get("raw"), Some(GraphValue::Str(MESSAGES.into())));
        assert_eq!(get("sequenceNumber"), Some(GraphValue::Int(3)));
        assert_eq!(get("timeOffset"), Some(GraphValue::Str(String::new())));
        assert_eq!(get("content"), Some(GraphValue::Str("hi".into())));
    }

    #[test]
    fn test_plan_keeps_frame_bytes_untouched() {
        let frame = format!("\n  {}\r\n", MESSAGES);
        let ops = plan(EventKind::MessageCreated, "C1", &frame).unwrap();
        let GraphOp::MergeNode { props, .. } = &ops[1] else {
            panic!("expected message node");
        };
        let raw = props.iter().find(|(n, _)| *n == "raw").map(|(_, v)| v.clone());
        assert_eq!(raw, Some(GraphValue::Str(frame.clone())));

        let ops = plan(EventKind::ConversationCreated, "C1", &frame).unwrap();
        let GraphOp::MergeNode { props, .. } = &ops[0] else {
            panic!("expected conversation node");
        };
        assert_eq!(props[0].1, GraphValue::Str(frame));
    }

    #[test]
    fn test_plan_missing_message_id_rejects_whole_event() {
        let frame = r#"{"type":"message_response","messages":[{"id":"m1"},{"content":"x"}]}"#;
        let err = plan(EventKind::MessageCreated, "C1", frame).unwrap_err();
        assert!(matches!(err, Error::MissingField(ref f) if f == "messages[1].id"));
    }

    #[test]
    fn test_plan_empty_cid_rejected() {
        let err = plan(EventKind::ConversationCreated, "", "{}").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_plan_unknown_insight_subtype_is_skipped() {
        let frame = r#"{"type":"insight_response","insights":[
            {"id":"i1","type":"question","payload":{"content":"why?"}},
            {"id":"i2","type":"summary"},
            {"id":"i3","type":"follow_up","assignee":{"id":"u2"}}
        ]}"#;
        let ops = plan(EventKind::InsightCreated, "C1", frame).unwrap();
        let nodes: Vec<_> = labels(&ops)
            .into_iter()
            .filter(|l| l.starts_with("Insight("))
            .collect();
        assert_eq!(nodes, vec!["Insight(i1)", "Insight(i3)"]);
    }

    #[test]
    fn test_plan_topic_refs_create_message_stubs() {
        let frame = r#"{"type":"topic_response","topics":[{"id":"t1","phrases":"greet","messageReferences":[{"id":"m1"},{"id":""}]}]}"#;
        let ops = plan(EventKind::TopicCreated, "C1", frame).unwrap();
        assert_eq!(
            labels(&ops),
            vec![
                "Conversation(C1)~",
                "Topic(t1)",
                "TOPICS",
                "Message(m1)~",
                "TOPIC_MESSAGE_REF"
            ]
        );
    }

    #[test]
    fn test_plan_entity_id_normalized() {
        let frame = r#"{"type":"entity_response","entities":[{"category":"Custom","type":"Product Name","value":"Acme Widget","matches":[{"detectedValue":"acme widget","messageRefs":[{"id":"m1"}]}]}]}"#;
        let ops = plan(EventKind::EntityCreated, "C1", frame).unwrap();
        assert!(labels(&ops).contains(&"Entity(custom/product_name//acme_widget)".to_string()));
    }

    #[test]
    fn test_plan_entity_requires_type_and_value() {
        let frame = r#"{"type":"entity_response","entities":[{"category":"custom","type":"x"}]}"#;
        let err = plan(EventKind::EntityCreated, "C1", frame).unwrap_err();
        assert!(matches!(err, Error::MissingField(ref f) if f == "entities[0].value"));
    }

    #[test]
    fn test_plan_malformed_body_is_logical() {
        let frame = r#"{"type":"topic_response","topics":"nope"}"#;
        let err = plan(EventKind::TopicCreated, "C1", frame).unwrap_err();
        assert!(err.is_logical());
    }

    #[tokio::test]
    async fn test_write_runs_one_batch() {
        let graph = MemoryGraph::new();
        let writer = GraphWriter::new(Box::new(graph.clone()));
        let summary = writer
            .write(EventKind::MessageCreated, "C1", MESSAGES)
            .await
            .unwrap();
        assert_eq!(summary.op_count, 5);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
    }

    #[tokio::test]
    async fn test_write_propagates_transient_errors() {
        let graph = MemoryGraph::new();
        graph.set_unavailable(true);
        let writer = GraphWriter::new(Box::new(graph));
        let err = writer
            .write(EventKind::ConversationCreated, "C1", "{}")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
