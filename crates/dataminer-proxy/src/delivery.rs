//! Return-channel delivery.
//!
//! Application messages published on a conversation's own topic are fanned
//! into a local broadcast channel. The tunnel injects them into the
//! downstream direction (WebSocket inlay) or the notify listener streams them
//! as `messages` events (SSE). Messages arriving outside CONNECTED, or with
//! nobody attached, are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dataminer_bus::BusHandler;
use dataminer_core::defaults::RETURN_CHANNEL_CAPACITY;
use dataminer_core::ReturnMode;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::instance::InstanceState;

pub struct ReturnChannel {
    cid: String,
    mode: ReturnMode,
    state: watch::Receiver<InstanceState>,
    outbound: broadcast::Sender<Vec<u8>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ReturnChannel {
    pub fn new(cid: impl Into<String>, mode: ReturnMode, state: watch::Receiver<InstanceState>) -> Self {
        Self {
            cid: cid.into(),
            mode,
            state,
            outbound: broadcast::channel(RETURN_CHANNEL_CAPACITY).0,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ReturnMode {
        self.mode
    }

    /// Attach a client-side sink.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.outbound.subscribe()
    }

    /// Hand one message to every attached sink. Returns whether anyone got it.
    pub fn deliver(&self, payload: Vec<u8>) -> bool {
        let state = *self.state.borrow();
        if state != InstanceState::Connected {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(cid = %self.cid, state = %state, payload_len = payload.len(), "Return-channel message dropped");
            return false;
        }
        match self.outbound.send(payload) {
            Ok(receivers) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(cid = %self.cid, receivers, "Return-channel message delivered");
                true
            }
            Err(broadcast::error::SendError(payload)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(cid = %self.cid, payload_len = payload.len(), "No client attached for return-channel message");
                false
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BusHandler for ReturnChannel {
    async fn handle(&self, _topic: &str, payload: Vec<u8>) {
        self.deliver(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivers_only_while_connected() {
        let (state_tx, state_rx) = watch::channel(InstanceState::Initializing);
        let channel = ReturnChannel::new("C1", ReturnMode::WebSocket, state_rx);
        let mut sink = channel.subscribe();

        assert!(!channel.deliver(b"early".to_vec()));

        state_tx.send_replace(InstanceState::Connected);
        assert!(channel.deliver(b"hello".to_vec()));
        assert_eq!(sink.try_recv().unwrap(), b"hello".to_vec());

        state_tx.send_replace(InstanceState::TearingDown);
        assert!(!channel.deliver(b"late".to_vec()));
        assert!(sink.try_recv().is_err());

        assert_eq!(channel.delivered(), 1);
        assert_eq!(channel.dropped(), 2);
    }

    #[test]
    fn test_drops_without_attached_client() {
        let (_state_tx, state_rx) = watch::channel(InstanceState::Connected);
        let channel = ReturnChannel::new("C1", ReturnMode::Sse, state_rx);
        assert!(!channel.deliver(b"nobody".to_vec()));
        assert_eq!(channel.dropped(), 1);
    }
}
