//! Upstream frame model.
//!
//! Frames are classified from their `type` / `message.type` fields first
//! ([`FrameKind::classify`]); the typed bodies below are only decoded for
//! frames that are persisted.

use serde::Deserialize;

use crate::events::EventKind;
use crate::{Error, Result};

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Closed set of upstream frame kinds the dataminer recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// `type=message, message.type=conversation_created`
    Initialization,
    /// `type=recognition_result` (or `message.type=recognition_result`)
    RecognitionResult,
    /// `type=message_response`
    Messages,
    /// `type=insight_response`
    Insights,
    /// `type=topic_response`
    Topics,
    /// `type=tracker_response`
    Trackers,
    /// `type=entity_response`
    Entities,
    /// `type=message, message.type=conversation_completed`
    Teardown,
    /// Anything else; carries the offending type for logging.
    Unknown(String),
}

impl FrameKind {
    /// Classify a frame by its type fields. Fails only on malformed JSON.
    pub fn classify(frame: &str) -> Result<Self> {
        let header: serde_json::Value = serde_json::from_str(frame)?;
        let outer = header.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        let inner = header
            .get("message")
            .and_then(|m| m.get("type"))
            .and_then(|t| t.as_str())
            .unwrap_or_default();

        Ok(match (outer, inner) {
            ("message", "conversation_created") => FrameKind::Initialization,
            ("message", "conversation_completed") => FrameKind::Teardown,
            ("message", "recognition_result") | ("recognition_result", _) => {
                FrameKind::RecognitionResult
            }
            ("message_response", _) => FrameKind::Messages,
            ("insight_response", _) => FrameKind::Insights,
            ("topic_response", _) => FrameKind::Topics,
            ("tracker_response", _) => FrameKind::Trackers,
            ("entity_response", _) => FrameKind::Entities,
            ("message", other) => FrameKind::Unknown(format!("message/{}", other)),
            (other, _) => FrameKind::Unknown(other.to_string()),
        })
    }

    /// Event kind published for this frame, if any.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            FrameKind::Initialization => Some(EventKind::ConversationCreated),
            FrameKind::Messages => Some(EventKind::MessageCreated),
            FrameKind::Insights => Some(EventKind::InsightCreated),
            FrameKind::Topics => Some(EventKind::TopicCreated),
            FrameKind::Trackers => Some(EventKind::TrackerCreated),
            FrameKind::Entities => Some(EventKind::EntityCreated),
            FrameKind::Teardown => Some(EventKind::ConversationTeardown),
            FrameKind::RecognitionResult | FrameKind::Unknown(_) => None,
        }
    }
}

// =============================================================================
// SHARED PIECES
// =============================================================================

/// Reference to another upstream object by id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectRef {
    #[serde(default)]
    pub id: Option<String>,
}

/// Speaker or author of a message/insight.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Speaker {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Speaker {
    /// User node key: `userId` (usually an email) when present, else `id`.
    pub fn key(&self) -> Option<&str> {
        non_empty(self.user_id.as_deref()).or_else(|| non_empty(self.id.as_deref()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub time_offset: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub messages: Vec<UpstreamMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<Speaker>,
    #[serde(default)]
    pub payload: Option<TextPayload>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub duration: Option<Timing>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

impl UpstreamMessage {
    /// Message text: `content`, falling back to `payload.content`.
    pub fn text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .or_else(|| self.payload.as_ref().and_then(|p| p.content.as_deref()))
    }
}

// =============================================================================
// INSIGHTS
// =============================================================================

/// Insight subtypes the graph distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightType {
    Question,
    FollowUp,
    ActionItem,
}

impl InsightType {
    /// Accepts both upstream spellings (`follow_up`, `followUp`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "question" => Some(InsightType::Question),
            "follow_up" | "followUp" => Some(InsightType::FollowUp),
            "action_item" | "actionItem" => Some(InsightType::ActionItem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::Question => "question",
            InsightType::FollowUp => "followUp",
            InsightType::ActionItem => "actionItem",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InsightResponse {
    #[serde(default)]
    pub insights: Vec<UpstreamInsight>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamInsight {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Option<TextPayload>,
    #[serde(default)]
    pub from: Option<Speaker>,
    #[serde(default)]
    pub assignee: Option<ObjectRef>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

// =============================================================================
// TOPICS
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopicResponse {
    #[serde(default)]
    pub topics: Vec<UpstreamTopic>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RootWord {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTopic {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub phrases: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message_index: Option<i64>,
    #[serde(default)]
    pub root_words: Vec<RootWord>,
    #[serde(default)]
    pub message_references: Vec<ObjectRef>,
}

// =============================================================================
// TRACKERS
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerResponse {
    #[serde(default)]
    pub trackers: Vec<UpstreamTracker>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamTracker {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub matches: Vec<TrackerMatch>,
}

impl UpstreamTracker {
    /// Tracker node key: `id`, falling back to `name`.
    pub fn key(&self) -> Option<&str> {
        non_empty(self.id.as_deref()).or_else(|| non_empty(self.name.as_deref()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerMatch {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub message_refs: Vec<ObjectRef>,
    #[serde(default)]
    pub insight_refs: Vec<ObjectRef>,
}

// =============================================================================
// ENTITIES
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityResponse {
    #[serde(default)]
    pub entities: Vec<UpstreamEntity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamEntity {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub matches: Vec<EntityMatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMatch {
    #[serde(default)]
    pub detected_value: Option<String>,
    #[serde(default)]
    pub message_refs: Vec<ObjectRef>,
}

/// Lowercase and replace spaces with underscores, the entity-id component form.
pub fn normalize_entity_part(part: &str) -> String {
    part.trim().to_lowercase().replace(' ', "_")
}

/// `category/type/subType/value`, each part normalized.
pub fn entity_id(category: &str, kind: &str, sub_type: &str, value: &str) -> String {
    [category, kind, sub_type, value]
        .iter()
        .map(|p| normalize_entity_part(p))
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// HELPERS
// =============================================================================

/// Decode a typed body, mapping serde failures to logical errors.
pub fn decode_body<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T> {
    serde_json::from_str(frame).map_err(|e| Error::MissingField(format!("malformed body: {}", e)))
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_lifecycle_frames() {
        let created = r#"{"type":"message","message":{"type":"conversation_created","data":{"conversationId":"x"}}}"#;
        let completed = r#"{"type":"message","message":{"type":"conversation_completed"}}"#;
        assert_eq!(FrameKind::classify(created).unwrap(), FrameKind::Initialization);
        assert_eq!(FrameKind::classify(completed).unwrap(), FrameKind::Teardown);
    }

    #[test]
    fn test_classify_recognition_result_both_shapes() {
        let top = r#"{"type":"recognition_result","isFinal":false}"#;
        let nested = r#"{"type":"message","message":{"type":"recognition_result"}}"#;
        assert_eq!(FrameKind::classify(top).unwrap(), FrameKind::RecognitionResult);
        assert_eq!(FrameKind::classify(nested).unwrap(), FrameKind::RecognitionResult);
        assert_eq!(FrameKind::RecognitionResult.event_kind(), None);
    }

    #[test]
    fn test_classify_responses() {
        for (ty, kind) in [
            ("message_response", EventKind::MessageCreated),
            ("insight_response", EventKind::InsightCreated),
            ("topic_response", EventKind::TopicCreated),
            ("tracker_response", EventKind::TrackerCreated),
            ("entity_response", EventKind::EntityCreated),
        ] {
            let frame = format!(r#"{{"type":"{}"}}"#, ty);
            let classified = FrameKind::classify(&frame).unwrap();
            assert_eq!(classified.event_kind(), Some(kind), "{}", ty);
        }
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(
            FrameKind::classify(r#"{"type":"audio_level"}"#).unwrap(),
            FrameKind::Unknown("audio_level".to_string())
        );
        assert_eq!(
            FrameKind::classify(r#"{"type":"message","message":{"type":"started_listening"}}"#)
                .unwrap(),
            FrameKind::Unknown("message/started_listening".to_string())
        );
        assert_eq!(
            FrameKind::classify("{}").unwrap(),
            FrameKind::Unknown(String::new())
        );
    }

    #[test]
    fn test_classify_malformed() {
        assert!(FrameKind::classify("[1,2").is_err());
    }

    #[test]
    fn test_message_text_falls_back_to_payload() {
        let body: MessageResponse = decode_body(
            r#"{"messages":[{"id":"m1","payload":{"content":"hi"}},{"id":"m2","content":"top"}]}"#,
        )
        .unwrap();
        assert_eq!(body.messages[0].text(), Some("hi"));
        assert_eq!(body.messages[1].text(), Some("top"));
    }

    #[test]
    fn test_speaker_key_prefers_user_id() {
        let s = Speaker {
            id: Some("u1".into()),
            name: Some("A".into()),
            user_id: Some("a@x".into()),
        };
        assert_eq!(s.key(), Some("a@x"));

        let s = Speaker {
            id: Some("u1".into()),
            user_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(s.key(), Some("u1"));
        assert_eq!(Speaker::default().key(), None);
    }

    #[test]
    fn test_insight_type_spellings() {
        assert_eq!(InsightType::parse("follow_up"), Some(InsightType::FollowUp));
        assert_eq!(InsightType::parse("followUp"), Some(InsightType::FollowUp));
        assert_eq!(InsightType::parse("action_item").map(|t| t.as_str()), Some("actionItem"));
        assert_eq!(InsightType::parse("summary"), None);
    }

    #[test]
    fn test_entity_id_normalization() {
        assert_eq!(
            entity_id("Custom", "Product Name", "", "Acme Widget"),
            "custom/product_name//acme_widget"
        );
        assert_eq!(
            entity_id("custom", "product name", "", "ACME WIDGET"),
            entity_id("Custom", "Product Name", "", "Acme Widget")
        );
    }

    #[test]
    fn test_tracker_key_falls_back_to_name() {
        let t = UpstreamTracker {
            name: Some("pricing".into()),
            ..Default::default()
        };
        assert_eq!(t.key(), Some("pricing"));
    }

    #[test]
    fn test_decode_body_type_mismatch_is_logical() {
        let err = decode_body::<TopicResponse>(r#"{"topics":[{"score":"high"}]}"#).unwrap_err();
        assert!(err.is_logical());
    }
}
