//! SSE notify listener for the return channel.
//!
//! Exposes `/<CID>/notifications`; each application message becomes one
//! `messages` event. Streams end when the instance stops.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::get;
use axum::Router;
use dataminer_core::defaults::{SSE_KEEPALIVE_SECS, SSE_STREAM_NAME};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::delivery::ReturnChannel;

#[derive(Clone)]
pub(crate) struct NotifyState {
    pub cid: Arc<str>,
    pub channel: Arc<ReturnChannel>,
    pub stop: watch::Receiver<bool>,
}

pub(crate) fn router(state: NotifyState) -> Router {
    Router::new()
        .route("/:cid/notifications", get(notifications))
        .with_state(state)
}

async fn notifications(State(state): State<NotifyState>, Path(cid): Path<String>) -> Response {
    if cid != *state.cid {
        return (StatusCode::NOT_FOUND, "unknown conversation").into_response();
    }
    debug!(cid = %state.cid, "Notification stream opened");

    let mut stop = state.stop.clone();
    let stream = BroadcastStream::new(state.channel.subscribe())
        .filter_map(|item| async move {
            item.ok().map(|payload| {
                Ok::<_, Infallible>(
                    Event::default()
                        .event(SSE_STREAM_NAME)
                        .data(String::from_utf8_lossy(&payload)),
                )
            })
        })
        .take_until(async move {
            while !*stop.borrow_and_update() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        )
        .into_response()
}
