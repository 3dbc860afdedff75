//! Turn upstream outcomes into inbound responses.

use crate::config::Route;
use crate::context::RequestContext;
use crate::error::ProxyError;
use crate::logging::{LogLevel, SharedLogger};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;

/// Body the code-completion client treats as an empty, finished stream.
const CODE_STREAM_DONE: &str = "data: [DONE]\n";

/// Relay an upstream response. Success bodies are streamed through untouched;
/// failure bodies are logged and replaced by a generic message. With
/// `log_body`, each relayed chunk is also logged at debug level.
pub async fn relay_upstream(
    route: Route,
    ctx: &RequestContext,
    response: reqwest::Response,
    logger: &SharedLogger,
    log_body: bool,
) -> Response {
    let status = response.status();

    if !status.is_success() {
        let upstream_body = response.text().await.unwrap_or_default();
        logger.route_event(
            LogLevel::Error,
            "relay",
            route,
            format!("Upstream returned status {}: {}", status.as_u16(), truncate(&upstream_body, 2000)),
            serde_json::json!({
                "request_id": ctx.id().to_string(),
                "status": status.as_u16(),
            }),
        );
        return failure_response(route, &ProxyError::UpstreamHttp { status: status.as_u16() });
    }

    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

    let stream_logger = logger.clone();
    let request_id = ctx.id();
    let stream = response
        .bytes_stream()
        .inspect_ok(move |chunk| {
            if log_body {
                tracing::debug!(
                    route = %route,
                    request_id = %request_id,
                    chunk = %String::from_utf8_lossy(chunk),
                    "Response chunk"
                );
            }
        })
        .inspect_err(move |e| {
            stream_logger.route_event(
                LogLevel::Error,
                "relay",
                route,
                format!("Failed to copy response body: {e}"),
                serde_json::json!({ "request_id": request_id.to_string() }),
            );
        });
    let body = Body::from_stream(stream);

    let mut relayed = Response::new(body);
    *relayed.status_mut() = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);
    if let Some(content_type) = content_type {
        if let Ok(value) = HeaderValue::from_bytes(content_type.as_bytes()) {
            relayed.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    relayed
}

/// Caller-facing response for a failed request. Never includes upstream detail.
pub fn failure_response(route: Route, err: &ProxyError) -> Response {
    let status = err.status();
    match route {
        Route::Code => (
            status,
            [(header::CONTENT_TYPE, "text/event-stream")],
            CODE_STREAM_DONE,
        )
            .into_response(),
        Route::Chat => (
            status,
            Json(serde_json::json!({
                "error": {
                    "message": generic_message(err),
                    "type": "proxy_error",
                    "code": status.as_u16(),
                }
            })),
        )
            .into_response(),
    }
}

fn generic_message(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::InvalidInboundBody { .. } => "Invalid request body",
        ProxyError::Unauthorized => "Unauthorized",
        ProxyError::RequestTimeout => "Request timed out",
        ProxyError::ShuttingDown => "Proxy is shutting down",
        ProxyError::UpstreamHttp { .. } => "Upstream request failed",
        _ => "Internal proxy error",
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_code_failure_is_done_marker() {
        let response = failure_response(Route::Code, &ProxyError::RequestTimeout);
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_text(response).await, "data: [DONE]\n");
    }

    #[tokio::test]
    async fn test_chat_failure_is_generic_json() {
        let err = ProxyError::UpstreamTransport {
            attempts: 4,
            message: "dns error: upstream.internal".into(),
        };
        let response = failure_response(Route::Chat, &err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(response).await;
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["error"]["message"], "Internal proxy error");
        assert_eq!(body["error"]["code"], 500);
        assert!(!text.contains("upstream.internal"));
    }

    fn upstream(status: u16, content_type: &str, body: &'static str) -> reqwest::Response {
        let response = axum::http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .unwrap();
        reqwest::Response::from(response)
    }

    #[tokio::test]
    async fn test_success_relayed_with_body_logging() {
        let logger = SharedLogger::in_memory();
        let ctx = RequestContext::new(None);
        let events = "data: {\"text\":\"a\"}\n\ndata: [DONE]\n\n";

        let response = relay_upstream(
            Route::Code,
            &ctx,
            upstream(200, "text/event-stream", events),
            &logger,
            true,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_text(response).await, events);
        assert!(logger.recent(10).is_empty());
    }

    #[tokio::test]
    async fn test_error_body_journaled_not_relayed() {
        let logger = SharedLogger::in_memory();
        let ctx = RequestContext::new(None);

        let response = relay_upstream(
            Route::Chat,
            &ctx,
            upstream(429, "application/json", r#"{"error":"quota exceeded for org-123"}"#),
            &logger,
            true,
        )
        .await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let text = body_text(response).await;
        assert!(!text.contains("org-123"));

        let entries = logger.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].component, "relay");
        assert_eq!(entries[0].route, Some(Route::Chat));
        assert!(entries[0].message.contains("quota exceeded for org-123"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("héllo", 2), "h");
    }
}
