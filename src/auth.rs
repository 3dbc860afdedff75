//! Static path-token gate for the completion routes.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the path capture holding the caller's token.
pub const TOKEN_PARAM: &str = "token";

/// Reject the request unless its `:token` segment equals `expected`.
pub async fn require_path_token(
    State(expected): State<Arc<str>>,
    params: Option<Path<HashMap<String, String>>>,
    request: Request,
    next: Next,
) -> Response {
    let supplied = params
        .as_ref()
        .and_then(|Path(p)| p.get(TOKEN_PARAM))
        .map(String::as_str);

    if supplied != Some(&*expected) {
        tracing::warn!(path = %request.uri().path(), "Rejected request with invalid path token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    next.run(request).await
}
