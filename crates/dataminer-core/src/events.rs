//! Published event kinds and the bus envelope.
//!
//! Each persisted upstream event is published on one fan-out topic per kind.
//! The envelope carries the conversation id next to the upstream frame,
//! embedded verbatim so subscribers see exactly what the upstream sent.

use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::{Error, Result};

/// Envelope key holding the conversation id.
pub const CONVERSATION_ID_FIELD: &str = "conversationId";

/// Kinds of events published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConversationCreated,
    MessageCreated,
    TopicCreated,
    TrackerCreated,
    EntityCreated,
    InsightCreated,
    ConversationTeardown,
}

impl EventKind {
    /// Every event kind, in the order publishers are ensured.
    pub const ALL: [EventKind; 7] = [
        EventKind::ConversationCreated,
        EventKind::MessageCreated,
        EventKind::TopicCreated,
        EventKind::TrackerCreated,
        EventKind::EntityCreated,
        EventKind::InsightCreated,
        EventKind::ConversationTeardown,
    ];

    /// Fan-out topic the kind is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::ConversationCreated => "conversation-created",
            EventKind::MessageCreated => "message-created",
            EventKind::TopicCreated => "topic-created",
            EventKind::TrackerCreated => "tracker-created",
            EventKind::EntityCreated => "entity-created",
            EventKind::InsightCreated => "insight-created",
            EventKind::ConversationTeardown => "conversation-teardown",
        }
    }

    /// Envelope key holding the upstream frame.
    pub fn envelope_field(&self) -> &'static str {
        match self {
            EventKind::ConversationCreated => "conversationCreated",
            EventKind::MessageCreated => "messageResponse",
            EventKind::TopicCreated => "topicResponse",
            EventKind::TrackerCreated => "trackerResponse",
            EventKind::EntityCreated => "entityResponse",
            EventKind::InsightCreated => "insightResponse",
            EventKind::ConversationTeardown => "conversationCompleted",
        }
    }

    /// Reverse lookup of [`EventKind::topic`].
    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.topic() == topic)
    }

    fn from_envelope_field(field: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.envelope_field() == field)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// Wrapper published on every event topic.
///
/// Serializes as `{"conversationId": "<CID>", "<field>": <frame>}` where the
/// frame text is copied through untouched. Whitespace around the document is
/// not part of the embedded value.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub conversation_id: String,
    pub kind: EventKind,
    payload: Box<RawValue>,
}

impl Envelope {
    /// Wrap an upstream frame. Fails if `frame` is not a JSON document.
    pub fn new(kind: EventKind, conversation_id: impl Into<String>, frame: &str) -> Result<Self> {
        let payload = RawValue::from_string(frame.to_string())?;
        Ok(Self {
            conversation_id: conversation_id.into(),
            kind,
            payload,
        })
    }

    /// The wrapped frame, exactly as received.
    pub fn payload(&self) -> &str {
        self.payload.get()
    }

    /// Parse the wrapped frame into a concrete type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.payload.get())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope received from the bus.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut fields: HashMap<String, Box<RawValue>> = serde_json::from_slice(bytes)?;

        let cid_raw = fields.remove(CONVERSATION_ID_FIELD).ok_or_else(|| {
            Error::MissingField(format!("envelope.{}", CONVERSATION_ID_FIELD))
        })?;
        let conversation_id: String = serde_json::from_str(cid_raw.get())?;

        let (kind, payload) = fields
            .into_iter()
            .find_map(|(key, value)| EventKind::from_envelope_field(&key).map(|k| (k, value)))
            .ok_or_else(|| Error::MissingField("envelope payload field".to_string()))?;

        Ok(Self {
            conversation_id,
            kind,
            payload,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(CONVERSATION_ID_FIELD, &self.conversation_id)?;
        map.serialize_entry(self.kind.envelope_field(), &self.payload)?;
        map.end()
    }
}
