//! Transparent WebSocket tunnel between one client and the upstream.
//!
//! Client to upstream is relayed untouched. Upstream to client is tee'd:
//! every text frame is also queued for the dispatcher before it is
//! forwarded, so ingest never delays or drops client traffic. In WebSocket
//! inlay mode, return-channel messages are injected into the same downstream
//! direction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dataminer_core::defaults::FORWARDED_HEADERS;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};

use crate::delivery::ReturnChannel;
use crate::instance::StopReason;

#[derive(Clone)]
pub(crate) struct TunnelState {
    pub cid: Arc<str>,
    pub upstream_url: Arc<str>,
    pub attached: Arc<AtomicBool>,
    pub frames: mpsc::UnboundedSender<String>,
    pub inlay: Option<Arc<ReturnChannel>>,
    pub stop: watch::Receiver<bool>,
    pub requests: mpsc::UnboundedSender<StopReason>,
}

impl TunnelState {
    fn request_stop(&self, reason: StopReason) {
        if self.requests.send(reason).is_err() {
            debug!(cid = %self.cid, reason = reason.as_str(), "Instance already stopping");
        }
    }
}

pub(crate) fn router(state: TunnelState) -> Router {
    Router::new()
        .route("/", get(tunnel_handler))
        .route("/*path", get(tunnel_handler))
        .with_state(state)
}

/// Upstream URL for a client request: configured base plus the client's
/// path and query.
pub fn upstream_target(base: &str, uri: &Uri) -> String {
    let suffix = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base.trim_end_matches('/'), suffix)
}

async fn tunnel_handler(
    State(state): State<TunnelState>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if state.attached.swap(true, Ordering::SeqCst) {
        warn!(cid = %state.cid, "Rejecting second client for conversation");
        return (StatusCode::CONFLICT, "conversation already has a client").into_response();
    }

    let target = upstream_target(&state.upstream_url, &uri);
    let mut request = match target.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(cid = %state.cid, error = %e, "Invalid upstream URL");
            state.request_stop(StopReason::UpstreamClosed);
            return (StatusCode::BAD_GATEWAY, format!("invalid upstream URL: {}", e)).into_response();
        }
    };
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name) {
            request.headers_mut().insert(*name, value.clone());
        }
    }

    let upstream = match tokio_tungstenite::connect_async(request).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            warn!(cid = %state.cid, error = %e, "Upstream connect failed");
            state.request_stop(StopReason::UpstreamClosed);
            return (StatusCode::BAD_GATEWAY, format!("upstream unavailable: {}", e)).into_response();
        }
    };
    info!(cid = %state.cid, "Client attached, upstream connected");

    ws.on_upgrade(move |socket| relay(socket, upstream, state))
}

async fn relay<S>(client: WebSocket, upstream: tokio_tungstenite::WebSocketStream<S>, state: TunnelState)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let mut outbound = tokio::spawn(async move {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if upstream_tx.send(to_upstream(msg)).await.is_err() {
                return Some(StopReason::UpstreamClosed);
            }
            if closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
        Some(StopReason::ClientClosed)
    });

    let frames = state.frames.clone();
    let mut stop = state.stop.clone();
    let mut inlay = state.inlay.as_ref().map(|channel| channel.subscribe());
    let cid = state.cid.clone();
    let mut inbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    let _ = client_tx.send(Message::Close(None)).await;
                    return None;
                }
                payload = next_inlay(&mut inlay) => {
                    if client_tx.send(inlay_message(payload)).await.is_err() {
                        return Some(StopReason::ClientClosed);
                    }
                }
                msg = upstream_rx.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Some(frame) = frame_text(&msg) {
                            if frames.send(frame).is_err() {
                                debug!(cid = %cid, "Dispatcher gone, frame not ingested");
                            }
                        }
                        let closing = matches!(msg, UpstreamMessage::Close(_));
                        if let Some(msg) = to_client(msg) {
                            if client_tx.send(msg).await.is_err() {
                                return Some(StopReason::ClientClosed);
                            }
                        }
                        if closing {
                            return Some(StopReason::UpstreamClosed);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(cid = %cid, error = %e, "Upstream read failed");
                        return Some(StopReason::UpstreamClosed);
                    }
                    None => return Some(StopReason::UpstreamClosed),
                }
            }
        }
    });

    let reason = tokio::select! {
        r = &mut outbound => { inbound.abort(); r.ok().flatten() }
        r = &mut inbound => { outbound.abort(); r.ok().flatten() }
    };
    if let Some(reason) = reason {
        info!(cid = %state.cid, reason = reason.as_str(), "Tunnel closed");
        state.request_stop(reason);
    }
}

async fn next_inlay(rx: &mut Option<broadcast::Receiver<Vec<u8>>>) -> Vec<u8> {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending::<Vec<u8>>().await;
        };
        match inner.recv().await {
            Ok(payload) => return payload,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Return channel lagged");
            }
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}

/// Text for the dispatcher: text frames, and binary frames that are UTF-8.
fn frame_text(msg: &UpstreamMessage) -> Option<String> {
    match msg {
        UpstreamMessage::Text(text) => Some(text.clone()),
        UpstreamMessage::Binary(bytes) => std::str::from_utf8(bytes).ok().map(str::to_owned),
        _ => None,
    }
}

fn inlay_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

fn to_upstream(msg: Message) -> UpstreamMessage {
    match msg {
        Message::Text(text) => UpstreamMessage::Text(text),
        Message::Binary(bytes) => UpstreamMessage::Binary(bytes),
        Message::Ping(bytes) => UpstreamMessage::Ping(bytes),
        Message::Pong(bytes) => UpstreamMessage::Pong(bytes),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    Some(match msg {
        UpstreamMessage::Text(text) => Message::Text(text),
        UpstreamMessage::Binary(bytes) => Message::Binary(bytes),
        UpstreamMessage::Ping(bytes) => Message::Ping(bytes),
        UpstreamMessage::Pong(bytes) => Message::Pong(bytes),
        UpstreamMessage::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason,
        })),
        UpstreamMessage::Frame(_) => return None,
    })
}
