//! Bounded LRU of recently seen messages.
//!
//! Downstream consumers keep one of these so message references in topic,
//! tracker, and entity events resolve to text without a graph round-trip.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::defaults::MESSAGE_CACHE_CAPACITY;
use crate::models::MessageResponse;

/// Text and author of one cached message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub text: String,
    pub author: String,
}

/// LRU map `messageId → (text, author)`.
pub struct MessageCache {
    entries: LruCache<String, CachedMessage>,
}

impl MessageCache {
    /// Capacity 0 is bumped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn insert(&mut self, message_id: impl Into<String>, message: CachedMessage) {
        self.entries.put(message_id.into(), message);
    }

    /// Look up a message and mark it most recently used.
    pub fn get(&mut self, message_id: &str) -> Option<&CachedMessage> {
        self.entries.get(message_id)
    }

    /// Cache every message in a `message_response` body. Returns how many were cached.
    pub fn ingest(&mut self, body: &MessageResponse) -> usize {
        let mut cached = 0;
        for message in &body.messages {
            let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };
            let author = message
                .from
                .as_ref()
                .and_then(|f| f.name.clone().or_else(|| f.key().map(str::to_string)))
                .unwrap_or_default();
            self.insert(
                id,
                CachedMessage {
                    text: message.text().unwrap_or_default().to_string(),
                    author,
                },
            );
            cached += 1;
        }
        cached
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(MESSAGE_CACHE_CAPACITY)
    }
}
