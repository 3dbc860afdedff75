use crate::auth;
use crate::config::{Route, RouteConfig, ServiceConfig};
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::models::ModelListing;
use crate::proxy::{build_http_client, UpstreamClient};
use crate::rate_limit::{AdmissionControl, TokenBucket};
use crate::relay;
use crate::retry::RetryPolicy;
use crate::translate::{self, Payload};

use axum::body::Body;
use axum::extract::State;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Chat completion paths, relative to the optional `/:token` prefix.
pub const CHAT_PATHS: &[&str] = &["/v1/chat/completions", "/v1/v1/chat/completions"];

/// Code completion paths, relative to the optional `/:token` prefix.
pub const CODE_PATHS: &[&str] = &[
    "/v1/engines/copilot-codex/completions",
    "/v1/v1/engines/copilot-codex/completions",
];

pub struct AppState {
    pub chat: RouteConfig,
    pub code: RouteConfig,
    pub upstream: UpstreamClient,
    pub logger: SharedLogger,
    pub models: ModelListing,
    pub auth_token: Option<Arc<str>>,
    pub timeout: Option<Duration>,
    pub max_body_bytes: usize,
    pub log_payloads: bool,
}

impl AppState {
    /// State backed by a token bucket sized from `requests_per_sec`.
    pub fn from_config(config: &ServiceConfig, logger: SharedLogger) -> Result<Self> {
        let limiter = Arc::new(TokenBucket::new(config.requests_per_sec as f64, 1));
        Self::with_limiter(config, logger, limiter)
    }

    pub fn with_limiter(
        config: &ServiceConfig,
        logger: SharedLogger,
        limiter: Arc<dyn AdmissionControl>,
    ) -> Result<Self> {
        let (chat, code) = config.route_configs()?;
        let upstream = UpstreamClient::new(
            build_http_client(config)?,
            limiter,
            RetryPolicy::from(&config.retry),
            logger.clone(),
        );

        Ok(Self {
            chat,
            code,
            upstream,
            logger,
            models: ModelListing::from_config(config),
            auth_token: config.auth_token.as_deref().map(Arc::from),
            timeout: Some(config.timeout()),
            max_body_bytes: config.max_body_bytes,
            log_payloads: false,
        })
    }

    #[must_use]
    pub fn route(&self, route: Route) -> &RouteConfig {
        match route {
            Route::Chat => &self.chat,
            Route::Code => &self.code,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let prefix = if state.auth_token.is_some() { "/:token" } else { "" };

    let mut completions = Router::new();
    for path in CHAT_PATHS {
        completions = completions.route(&format!("{prefix}{path}"), post(handle_chat));
    }
    for path in CODE_PATHS {
        completions = completions.route(&format!("{prefix}{path}"), post(handle_code));
    }
    if let Some(token) = state.auth_token.clone() {
        completions = completions.route_layer(middleware::from_fn_with_state(
            token,
            auth::require_path_token,
        ));
    }

    Router::new()
        .route("/_ping", get(handle_ping))
        .route("/models", get(handle_models))
        .route("/v1/models", get(handle_models))
        .merge(completions)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat(State(state): State<Arc<AppState>>, body: Body) -> Response {
    handle_completion(&state, Route::Chat, body).await
}

async fn handle_code(State(state): State<Arc<AppState>>, body: Body) -> Response {
    handle_completion(&state, Route::Code, body).await
}

async fn handle_completion(state: &AppState, route: Route, body: Body) -> Response {
    let ctx = RequestContext::new(state.timeout);

    match forward(state, &ctx, route, body).await {
        Ok(response) => response,
        Err(err) => {
            let level = match err {
                ProxyError::RequestTimeout | ProxyError::InvalidInboundBody { .. } => LogLevel::Warn,
                _ => LogLevel::Error,
            };
            state.logger.route_event(
                level,
                "server",
                route,
                format!("Request failed: {err}"),
                serde_json::json!({
                    "request_id": ctx.id().to_string(),
                    "status": err.status().as_u16(),
                }),
            );
            relay::failure_response(route, &err)
        }
    }
}

/// Admission, body read, rewrite, upstream call, relay. Strictly in that order.
async fn forward(
    state: &AppState,
    ctx: &RequestContext,
    route: Route,
    body: Body,
) -> Result<Response> {
    if ctx.is_cancelled() {
        return Err(ProxyError::RequestTimeout);
    }
    state.upstream.admit(ctx).await?;

    let raw = tokio::select! {
        raw = axum::body::to_bytes(body, state.max_body_bytes) => {
            raw.map_err(|e| ProxyError::invalid_body(e.to_string()))?
        }
        () = ctx.cancelled() => return Err(ProxyError::RequestTimeout),
    };

    if state.log_payloads {
        tracing::debug!(
            route = %route,
            request_id = %ctx.id(),
            body = %String::from_utf8_lossy(&raw),
            "Inbound request body"
        );
    }

    let route_config = state.route(route);
    let mut payload = Payload::from(raw);
    translate::rewrite(&mut payload, route_config)?;

    if state.log_payloads {
        tracing::debug!(
            route = %route,
            request_id = %ctx.id(),
            payload = %String::from_utf8_lossy(payload.as_bytes()),
            "Outbound payload"
        );
    }

    let response = state
        .upstream
        .send(ctx, route_config, payload.into_bytes())
        .await?;

    tracing::info!(
        route = %route,
        request_id = %ctx.id(),
        status = response.status().as_u16(),
        "Upstream responded"
    );

    Ok(relay::relay_upstream(route, ctx, response, &state.logger, state.log_payloads).await)
}

async fn handle_ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "now": chrono::Utc::now().timestamp(),
        "status": "ok",
        "ns1": "200 OK",
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<ModelListing> {
    Json(state.models.clone())
}
