//! HTTP surface of the router: health, diagnostics, and the redirect
//! catch-all that routes each conversation to its proxy instance.

use axum::{
    extract::State,
    http::{HeaderMap, Uri},
    response::{IntoResponse, Redirect},
    routing::get,
    Json, Router,
};
use dataminer_core::{parse_truthy, Capabilities, DataminerConfig};
use serde_json::json;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::registry::ConversationRegistry;

// =============================================================================
// REQUEST ID
// =============================================================================

/// Request IDs are UUIDv7 so they sort by arrival time in logs.
#[derive(Clone, Copy)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

// =============================================================================
// APP
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub registry: ConversationRegistry,
}

impl AppState {
    pub fn new(registry: ConversationRegistry) -> Self {
        Self { registry }
    }
}

/// Build the router application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/conversations", get(list_conversations))
        .fallback(redirect)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active": state.registry.len().await,
    }))
}

async fn list_conversations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.active().await)
}

// =============================================================================
// REDIRECTS
// =============================================================================

/// What a request path asks for.
#[derive(Debug, PartialEq, Eq)]
enum RedirectRequest {
    Proxy { cid: String },
    Notifications { cid: String },
}

/// Split a request path into its redirect kind and CID.
///
/// The last segment is the CID unless it equals the notifications token, in
/// which case the CID is the segment before it. Segments are percent-decoded.
fn parse_request(path: &str, notifications_token: &str) -> Result<RedirectRequest, ApiError> {
    let segments: Vec<String> = path
        .strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|_| ApiError::BadRequest(format!("invalid path segment: {}", segment)))
        })
        .collect::<Result<_, _>>()?;

    let last = segments.last().map(String::as_str).unwrap_or_default();
    if last == notifications_token && segments.len() >= 2 {
        let cid = segments[segments.len() - 2].clone();
        if cid.is_empty() {
            return Err(ApiError::BadRequest("empty conversation id".to_string()));
        }
        return Ok(RedirectRequest::Notifications { cid });
    }
    if last.is_empty() {
        return Err(ApiError::BadRequest("empty conversation id".to_string()));
    }
    Ok(RedirectRequest::Proxy {
        cid: last.to_string(),
    })
}

/// Capabilities for a new instance: configured defaults, overridden by headers.
fn capabilities_from_headers(config: &DataminerConfig, headers: &HeaderMap) -> Capabilities {
    let flag = |name: String, default: bool| {
        headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .map(parse_truthy)
            .unwrap_or(default)
    };
    let defaults = config.default_capabilities;
    Capabilities {
        transcription: flag(config.transcription_header(), defaults.transcription),
        messaging: flag(config.messaging_header(), defaults.messaging),
    }
}

fn target(base: &str, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base, path)
}

#[instrument(skip(state, headers), fields(subsystem = "router", component = "redirect"))]
async fn redirect(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Redirect, ApiError> {
    let registry = &state.registry;
    let config = registry.config();

    match parse_request(uri.path(), &config.notifications_token)? {
        RedirectRequest::Notifications { cid } => {
            let base = registry.notification_redirect(&cid).await?;
            debug!(cid, %base, "Notification redirect");
            Ok(Redirect::to(&target(&base, &uri)))
        }
        RedirectRequest::Proxy { cid } => {
            let capabilities = capabilities_from_headers(config, &headers);
            let redirect = registry.redirect_for(&cid, capabilities).await?;
            debug!(cid, base = %redirect.base, created = redirect.created, "Proxy redirect");
            Ok(Redirect::to(&target(&redirect.base, &uri)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_request() {
        assert_eq!(
            parse_request("/v1/streaming/C1", "notifications").unwrap(),
            RedirectRequest::Proxy {
                cid: "C1".to_string()
            }
        );
        assert_eq!(
            parse_request("/C1", "notifications").unwrap(),
            RedirectRequest::Proxy {
                cid: "C1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_notification_request() {
        assert_eq!(
            parse_request("/C1/notifications", "notifications").unwrap(),
            RedirectRequest::Notifications {
                cid: "C1".to_string()
            }
        );
    }

    #[test]
    fn test_lone_token_is_a_cid() {
        assert_eq!(
            parse_request("/notifications", "notifications").unwrap(),
            RedirectRequest::Proxy {
                cid: "notifications".to_string()
            }
        );
    }

    #[test]
    fn test_empty_cid_rejected() {
        assert!(parse_request("/", "notifications").is_err());
        assert!(parse_request("/a/", "notifications").is_err());
        assert!(parse_request("//notifications", "notifications").is_err());
    }

    #[test]
    fn test_cid_is_percent_decoded() {
        assert_eq!(
            parse_request("/conv%20one", "notifications").unwrap(),
            RedirectRequest::Proxy {
                cid: "conv one".to_string()
            }
        );
    }

    #[test]
    fn test_capabilities_from_headers() {
        let config = DataminerConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-dataminer-messaging", "yes".parse().unwrap());
        headers.insert("x-dataminer-transcription", "0".parse().unwrap());
        let caps = capabilities_from_headers(&config, &headers);
        assert!(caps.messaging);
        assert!(!caps.transcription);

        let caps = capabilities_from_headers(&config, &HeaderMap::new());
        assert_eq!(caps, config.default_capabilities);
    }
}
