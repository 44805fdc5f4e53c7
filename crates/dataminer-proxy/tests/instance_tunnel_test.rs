//! End-to-end instance tests against a scripted upstream WebSocket server.
//!
//! The graph and bus are the in-memory backends, so these run without
//! external services.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dataminer_bus::{BusTransport, MemoryBroker};
use dataminer_core::{Envelope, ReturnMode};
use dataminer_graph::{Label, MemoryGraph, RelType};
use dataminer_proxy::{
    ClosedInstance, InstanceConfig, InstanceListeners, InstanceState, ProxyInstance, StopReason,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as ClientMessage;

const INIT: &str = r#"{"type":"message","message":{"type":"conversation_created","data":{"conversationId":"C1"}}}"#;
const MESSAGES: &str = r#"{"type":"message_response","messages":[{"id":"m1","payload":{"content":"hi"},"from":{"id":"u1","name":"A","userId":"a@x"}}]}"#;
const TOPICS: &str = r#"{"type":"topic_response","topics":[{"id":"t1","phrases":"greet","messageReferences":[{"id":"m1"}]}]}"#;
const DONE: &str = r#"{"type":"message","message":{"type":"conversation_completed"}}"#;

// =============================================================================
// SCRIPTED UPSTREAM
// =============================================================================

#[derive(Clone)]
struct UpstreamState {
    script: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    seen: mpsc::UnboundedSender<String>,
}

struct Upstream {
    url: String,
    send: mpsc::UnboundedSender<String>,
    seen: mpsc::UnboundedReceiver<String>,
}

async fn upstream_ws(State(state): State<UpstreamState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let Some(mut script) = state.script.lock().await.take() else {
            return;
        };
        let (mut tx, mut rx) = socket.split();
        loop {
            tokio::select! {
                frame = script.recv() => match frame {
                    Some(frame) => {
                        if tx.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = state.seen.send(text);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    })
}

async fn spawn_upstream() -> Upstream {
    let (send, script) = mpsc::unbounded_channel();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let state = UpstreamState {
        script: Arc::new(Mutex::new(Some(script))),
        seen: seen_tx,
    };
    let app = Router::new()
        .route("/", get(upstream_ws))
        .route("/*path", get(upstream_ws))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream {
        url: format!("ws://{}", addr),
        send,
        seen,
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn bind() -> std::net::TcpListener {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap()
}

struct Harness {
    instance: ProxyInstance,
    graph: MemoryGraph,
    broker: MemoryBroker,
    closed: mpsc::UnboundedReceiver<ClosedInstance>,
}

async fn start_instance(upstream_url: &str, mode: ReturnMode) -> Harness {
    let graph = MemoryGraph::new();
    let broker = MemoryBroker::new();
    let (closed_tx, closed) = mpsc::unbounded_channel();

    let config = InstanceConfig::new("C1", upstream_url).with_return_mode(mode);
    let listeners = InstanceListeners {
        proxy: bind(),
        notify: config.wants_notify().then(bind),
    };
    let instance = ProxyInstance::new(
        config,
        listeners,
        Box::new(graph.clone()),
        Arc::new(broker.clone()),
    )
    .unwrap()
    .with_closed_notifier(closed_tx);
    instance.init().await.unwrap();
    instance.start().await.unwrap();

    Harness {
        instance,
        graph,
        broker,
        closed,
    }
}

fn client_url(instance: &ProxyInstance) -> String {
    format!("ws://127.0.0.1:{}/v1/streaming/C1", instance.proxy_port())
}

/// Receive the next Text message from a WS stream, skipping Ping/Pong frames.
async fn next_text_message(
    ws: &mut (impl futures::Stream<
        Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> String {
    let deadline = Duration::from_secs(5);
    let start = tokio::time::Instant::now();
    loop {
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            panic!("timeout waiting for WS text message");
        }
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timeout waiting for WS message")
            .expect("stream ended")
            .expect("WS error");
        if msg.is_text() {
            return msg.into_text().unwrap();
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {}", what);
}

async fn wait_closed(instance: &ProxyInstance) {
    tokio::time::timeout(Duration::from_secs(10), instance.closed())
        .await
        .expect("instance did not close");
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn test_tunnel_relays_both_directions_and_dispatches() {
    let mut upstream = spawn_upstream().await;
    let h = start_instance(&upstream.url, ReturnMode::WebSocket).await;
    assert_eq!(h.instance.state(), InstanceState::Connected);
    assert!(h.instance.is_connected());

    let (mut client, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    client
        .send(ClientMessage::Text("{\"type\":\"start_request\"}".into()))
        .await
        .unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), upstream.seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, "{\"type\":\"start_request\"}");

    for frame in [INIT, MESSAGES, TOPICS] {
        upstream.send.send(frame.to_string()).unwrap();
        assert_eq!(next_text_message(&mut client).await, frame);
    }

    let broker = h.broker.clone();
    eventually("three events published", move || {
        broker.publish_count("conversation-created") == 1
            && broker.publish_count("message-created") == 1
            && broker.publish_count("topic-created") == 1
    })
    .await;

    let envelope = Envelope::decode(&h.broker.published("message-created")[0]).unwrap();
    assert_eq!(envelope.conversation_id, "C1");
    assert_eq!(envelope.payload(), MESSAGES);

    assert!(h.graph.node(Label::Message, "m1").is_some());
    assert!(h.graph.node(Label::User, "a@x").is_some());
    assert_eq!(h.graph.edges(RelType::TopicMessageRef).len(), 1);
}

#[tokio::test]
async fn test_terminal_frame_tears_down_once() {
    let upstream = spawn_upstream().await;
    let mut h = start_instance(&upstream.url, ReturnMode::WebSocket).await;
    let (mut client, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    upstream.send.send(INIT.to_string()).unwrap();
    upstream.send.send(DONE.to_string()).unwrap();
    assert_eq!(next_text_message(&mut client).await, INIT);
    assert_eq!(next_text_message(&mut client).await, DONE);

    wait_closed(&h.instance).await;
    assert_eq!(h.broker.publish_count("conversation-teardown"), 1);
    let envelope = Envelope::decode(&h.broker.published("conversation-teardown")[0]).unwrap();
    assert_eq!(envelope.payload(), DONE);

    let conversation = h.graph.node(Label::Conversation, "C1").unwrap();
    assert_eq!(
        conversation.get("terminated").and_then(|v| v.as_bool()),
        Some(true)
    );

    let closed = h.closed.recv().await.unwrap();
    assert_eq!(closed.cid, "C1");
    assert_eq!(closed.id, h.instance.id());
}

#[tokio::test]
async fn test_client_disconnect_publishes_synthesized_teardown() {
    let upstream = spawn_upstream().await;
    let h = start_instance(&upstream.url, ReturnMode::WebSocket).await;
    let (mut client, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    upstream.send.send(MESSAGES.to_string()).unwrap();
    assert_eq!(next_text_message(&mut client).await, MESSAGES);
    client.close(None).await.unwrap();
    drop(client);

    wait_closed(&h.instance).await;
    assert!(!h.instance.is_connected());
    assert_eq!(h.broker.publish_count("message-created"), 1);
    assert_eq!(h.broker.publish_count("conversation-teardown"), 1);

    let envelope = Envelope::decode(&h.broker.published("conversation-teardown")[0]).unwrap();
    let payload: serde_json::Value = serde_json::from_str(envelope.payload()).unwrap();
    assert_eq!(payload["message"]["type"], "conversation_completed");
    assert_eq!(payload["message"]["reason"], "client_closed");

    // The proxy port is free again.
    assert!(std::net::TcpListener::bind(("127.0.0.1", h.instance.proxy_port())).is_ok());
}

#[tokio::test]
async fn test_upstream_close_tears_down_instance() {
    let Upstream { url, send, seen: _seen } = spawn_upstream().await;
    let h = start_instance(&url, ReturnMode::WebSocket).await;
    let (mut client, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    send.send(MESSAGES.to_string()).unwrap();
    assert_eq!(next_text_message(&mut client).await, MESSAGES);
    // Ending the script makes the upstream drop its socket.
    drop(send);

    wait_closed(&h.instance).await;
    assert_eq!(h.instance.state(), InstanceState::Closed);
    assert_eq!(h.broker.publish_count("message-created"), 1);
    assert_eq!(h.broker.publish_count("conversation-teardown"), 1);

    let envelope = Envelope::decode(&h.broker.published("conversation-teardown")[0]).unwrap();
    let payload: serde_json::Value = serde_json::from_str(envelope.payload()).unwrap();
    assert_eq!(payload["message"]["reason"], "upstream_closed");

    assert!(std::net::TcpListener::bind(("127.0.0.1", h.instance.proxy_port())).is_ok());
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let dead = bind();
    let url = format!("ws://{}", dead.local_addr().unwrap());
    drop(dead);

    let h = start_instance(&url, ReturnMode::WebSocket).await;
    let err = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 502)
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }

    wait_closed(&h.instance).await;
    assert_eq!(h.broker.publish_count("conversation-teardown"), 1);
    let envelope = Envelope::decode(&h.broker.published("conversation-teardown")[0]).unwrap();
    let payload: serde_json::Value = serde_json::from_str(envelope.payload()).unwrap();
    assert_eq!(payload["message"]["reason"], "upstream_closed");
}

#[tokio::test]
async fn test_second_client_is_rejected() {
    let upstream = spawn_upstream().await;
    let h = start_instance(&upstream.url, ReturnMode::WebSocket).await;
    let (_first, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    let err = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 409)
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_return_channel_inlay_until_teardown() {
    let upstream = spawn_upstream().await;
    let h = start_instance(&upstream.url, ReturnMode::WebSocket).await;
    let (mut client, _) = tokio_tungstenite::connect_async(client_url(&h.instance))
        .await
        .unwrap();

    // A relayed frame proves the downstream loop (and its inlay sink) is live.
    upstream.send.send(INIT.to_string()).unwrap();
    assert_eq!(next_text_message(&mut client).await, INIT);

    h.broker.publish("C1", b"{\"insight\":\"pricing\"}").await.unwrap();
    assert_eq!(next_text_message(&mut client).await, "{\"insight\":\"pricing\"}");
    assert_eq!(h.instance.return_channel_stats().await, Some((1, 0)));

    h.instance.stop(StopReason::Shutdown).await;
    assert_eq!(h.instance.state(), InstanceState::Closed);
    assert_eq!(h.broker.subscriber_count("C1"), 0);

    h.broker.publish("C1", b"{\"late\":true}").await.unwrap();
    let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), client.collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(rest
        .into_iter()
        .filter_map(|m| m.ok())
        .all(|m| !m.is_text()));
}

#[tokio::test]
async fn test_sse_return_channel() {
    let upstream = spawn_upstream().await;
    let h = start_instance(&upstream.url, ReturnMode::Sse).await;
    let notify_port = h.instance.notify_port().unwrap();

    let url = format!("http://127.0.0.1:{}/C1/notifications", notify_port);
    let mut response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);

    h.broker.publish("C1", b"{\"note\":1}").await.unwrap();

    let mut body = String::new();
    while !body.contains("data: {\"note\":1}") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("timeout waiting for SSE event")
            .unwrap()
            .expect("SSE stream ended");
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(body.contains("event: messages"));

    let other = reqwest::get(format!("http://127.0.0.1:{}/C2/notifications", notify_port))
        .await
        .unwrap();
    assert_eq!(other.status(), 404);

    h.instance.stop(StopReason::Shutdown).await;
    assert_eq!(h.instance.state(), InstanceState::Closed);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let upstream = spawn_upstream().await;
    let mut h = start_instance(&upstream.url, ReturnMode::WebSocket).await;

    h.instance.stop(StopReason::Reaped).await;
    h.instance.stop(StopReason::Shutdown).await;

    assert_eq!(h.broker.publish_count("conversation-teardown"), 1);
    let envelope = Envelope::decode(&h.broker.published("conversation-teardown")[0]).unwrap();
    assert!(envelope.payload().contains("\"reason\":\"reaped\""));

    assert!(h.closed.recv().await.is_some());
    assert!(h.closed.try_recv().is_err());
}

#[tokio::test]
async fn test_init_failure_rolls_back() {
    let graph = MemoryGraph::new();
    let broker = MemoryBroker::new();
    broker.set_unavailable(true);

    let instance = ProxyInstance::new(
        InstanceConfig::new("C1", "ws://127.0.0.1:1"),
        InstanceListeners {
            proxy: bind(),
            notify: None,
        },
        Box::new(graph.clone()),
        Arc::new(broker.clone()),
    )
    .unwrap();

    let err = instance.init().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(instance.state(), InstanceState::Initializing);
    assert!(!instance.is_connected());
    assert!(instance.start().await.is_err());

    instance.stop(StopReason::Shutdown).await;
    assert_eq!(instance.state(), InstanceState::Closed);
    assert_eq!(broker.publish_count("conversation-teardown"), 0);
}
