//! Event dispatcher: one upstream frame in, persistence and publication out.
//!
//! [`decide`] is the pure half: it maps a frame onto an [`Action`]. The
//! [`Dispatcher`] carries the action out against the instance's graph writer
//! and bus adapter. Frames for one conversation are handed over strictly in
//! receipt order by a single task, so the dispatcher never runs concurrently
//! with itself.

use std::sync::Arc;

use dataminer_bus::BusAdapter;
use dataminer_core::{Capabilities, Envelope, EventKind, FrameKind, Result};
use dataminer_graph::GraphWriter;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// What to do with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Persist, then publish on the kind's topic.
    Persist(EventKind),
    /// Persist the completion, publish the teardown once, end the conversation.
    Teardown,
    /// Log only.
    Observe,
    /// Unrecognized frame type; logged and swallowed.
    Skip(String),
}

/// Map a frame onto an action. Fails only on malformed JSON.
pub fn decide(frame: &str) -> Result<Action> {
    Ok(match FrameKind::classify(frame)? {
        FrameKind::Teardown => Action::Teardown,
        FrameKind::RecognitionResult => Action::Observe,
        FrameKind::Unknown(label) => Action::Skip(label),
        known => match known.event_kind() {
            Some(kind) => Action::Persist(kind),
            None => Action::Skip(format!("{:?}", known)),
        },
    })
}

/// Result of handling one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Ignored,
    Observed,
    Dispatched(EventKind),
    /// The conversation is complete; the owner should tear down.
    Terminal,
}

/// Per-conversation dispatcher.
pub struct Dispatcher {
    cid: String,
    writer: GraphWriter,
    adapter: Arc<BusAdapter>,
    capabilities: Capabilities,
    termination_sent: Mutex<bool>,
}

impl Dispatcher {
    pub fn new(
        cid: impl Into<String>,
        writer: GraphWriter,
        adapter: Arc<BusAdapter>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            cid: cid.into(),
            writer,
            adapter,
            capabilities,
            termination_sent: Mutex::new(false),
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Handle one frame.
    ///
    /// A persisted event is published even when its graph write failed; the
    /// write error is returned afterwards. Teardown failures are logged and
    /// never stop the frame from being reported as terminal.
    pub async fn on_frame(&self, frame: &str) -> Result<FrameOutcome> {
        match decide(frame)? {
            Action::Skip(label) => {
                warn!(cid = %self.cid, frame_type = %label, "Unhandled upstream frame type");
                Ok(FrameOutcome::Ignored)
            }
            Action::Observe => {
                if self.capabilities.transcription {
                    info!(cid = %self.cid, payload_len = frame.len(), "Recognition result");
                } else {
                    trace!(cid = %self.cid, payload_len = frame.len(), "Recognition result");
                }
                Ok(FrameOutcome::Observed)
            }
            Action::Persist(kind) => {
                let written = self.writer.write(kind, &self.cid, frame).await;
                if let Err(ref e) = written {
                    warn!(
                        cid = %self.cid,
                        event_kind = %kind,
                        error = %e,
                        error_category = e.category(),
                        "Graph write failed"
                    );
                }
                self.publish(kind, frame).await?;
                written?;
                debug!(cid = %self.cid, event_kind = %kind, "Event dispatched");
                Ok(FrameOutcome::Dispatched(kind))
            }
            Action::Teardown => {
                if let Err(e) = self.conclude(frame).await {
                    warn!(cid = %self.cid, error = %e, "Teardown from upstream frame failed");
                }
                Ok(FrameOutcome::Terminal)
            }
        }
    }

    /// Persist and publish the conversation's completion, at most once.
    ///
    /// Returns `Ok(false)` when the teardown was already published. The
    /// flag only flips after a successful publish, so a failed attempt can
    /// be retried by the next caller.
    pub async fn conclude(&self, frame: &str) -> Result<bool> {
        let mut sent = self.termination_sent.lock().await;
        if *sent {
            debug!(cid = %self.cid, "Teardown already published");
            return Ok(false);
        }
        if let Err(e) = self
            .writer
            .write(EventKind::ConversationTeardown, &self.cid, frame)
            .await
        {
            warn!(cid = %self.cid, error = %e, "Failed to persist conversation completion");
        }
        self.publish(EventKind::ConversationTeardown, frame).await?;
        *sent = true;
        info!(cid = %self.cid, "Conversation teardown published");
        Ok(true)
    }

    pub async fn teardown_sent(&self) -> bool {
        *self.termination_sent.lock().await
    }

    async fn publish(&self, kind: EventKind, frame: &str) -> Result<()> {
        let envelope = Envelope::new(kind, self.cid.as_str(), frame)?;
        let bytes = envelope.to_bytes()?;
        self.adapter.publish(kind.topic(), &bytes).await?;
        trace!(cid = %self.cid, topic = kind.topic(), payload_len = bytes.len(), "Envelope published");
        Ok(())
    }

    /// Release the graph session.
    pub async fn close(&self) -> Result<()> {
        self.writer.close().await
    }
}
