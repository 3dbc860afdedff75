//! Outbound request construction and resilient execution.

use crate::config::{RouteConfig, ServiceConfig};
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::rate_limit::AdmissionControl;
use crate::retry::{with_retry, RetryError, RetryPolicy};

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;

pub const ORGANIZATION_HEADER: &str = "OpenAI-Organization";
pub const PROJECT_HEADER: &str = "OpenAI-Project";

/// Build the upstream POST for a transformed payload.
pub fn build_upstream_request(
    client: &reqwest::Client,
    route: &RouteConfig,
    body: Bytes,
) -> reqwest::RequestBuilder {
    let mut builder = client
        .post(route.upstream_url())
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", route.api_key));

    if let Some(org) = route.organization.as_deref().filter(|v| !v.is_empty()) {
        builder = builder.header(ORGANIZATION_HEADER, org);
    }
    if let Some(project) = route.project.as_deref().filter(|v| !v.is_empty()) {
        builder = builder.header(PROJECT_HEADER, project);
    }

    builder.body(body)
}

/// HTTP client for upstream calls, shared by every request.
pub fn build_http_client(config: &ServiceConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout())
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90));

    if let Some(ref proxy_url) = config.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url.as_str())
            .map_err(|e| ProxyError::config(format!("Invalid proxy_url '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Upstream executor with admission control and transport retries.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    limiter: Arc<dyn AdmissionControl>,
    policy: RetryPolicy,
    logger: SharedLogger,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        limiter: Arc<dyn AdmissionControl>,
        policy: RetryPolicy,
        logger: SharedLogger,
    ) -> Self {
        Self {
            http,
            limiter,
            policy,
            logger,
        }
    }

    /// Wait for a rate-limit permit; fails with `RequestTimeout` if `ctx` is cancelled first.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<()> {
        self.limiter.acquire(ctx).await
    }

    /// Stop admitting new requests.
    pub fn close(&self) {
        self.limiter.close();
    }

    /// Send the payload upstream, retrying transport failures.
    ///
    /// Any HTTP response, including non-2xx, is returned as `Ok`. A request that
    /// cannot be built (say, an API key that is not a valid header value) fails
    /// on the first attempt.
    pub async fn send(
        &self,
        ctx: &RequestContext,
        route: &RouteConfig,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let result = with_retry(
            &self.policy,
            ctx,
            route.route,
            &self.logger,
            |e: &reqwest::Error| !e.is_builder(),
            || build_upstream_request(&self.http, route, body.clone()).send(),
        )
        .await;

        match result {
            Ok(response) => Ok(response),
            Err(RetryError::Cancelled) => Err(ProxyError::RequestTimeout),
            Err(RetryError::Exhausted { attempts, last }) => Err(ProxyError::UpstreamTransport {
                attempts,
                message: last.to_string(),
            }),
            Err(RetryError::Permanent { error, .. }) => Err(ProxyError::Http(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelFamily, ModelSelection, Route};
    use crate::rate_limit::TokenBucket;

    fn route(org: Option<&str>, project: Option<&str>) -> RouteConfig {
        RouteConfig {
            route: Route::Code,
            base_url: "https://code.example.com/v1/".to_string(),
            api_key: "sk-code".to_string(),
            organization: org.map(str::to_string),
            project: project.map(str::to_string),
            max_tokens: 2048,
            model: ModelSelection::Fixed("m".to_string()),
            locale: "zh_CN".to_string(),
            family: ModelFamily::PassthroughCode,
        }
    }

    #[test]
    fn test_request_headers_and_url() {
        let client = reqwest::Client::new();
        let request = build_upstream_request(
            &client,
            &route(Some("org-9"), Some("proj-2")),
            Bytes::from_static(b"{\"model\":\"m\"}"),
        )
        .build()
        .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://code.example.com/v1/completions");
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer sk-code");
        assert_eq!(request.headers()[ORGANIZATION_HEADER], "org-9");
        assert_eq!(request.headers()[PROJECT_HEADER], "proj-2");
        assert_eq!(
            request.body().and_then(reqwest::Body::as_bytes),
            Some(&b"{\"model\":\"m\"}"[..])
        );
    }

    #[test]
    fn test_optional_headers_omitted_when_empty() {
        let client = reqwest::Client::new();
        let request = build_upstream_request(&client, &route(Some(""), None), Bytes::new())
            .build()
            .unwrap();

        assert!(request.headers().get(ORGANIZATION_HEADER).is_none());
        assert!(request.headers().get(PROJECT_HEADER).is_none());
    }

    #[test]
    fn test_invalid_proxy_url_is_config_error() {
        let config = ServiceConfig {
            proxy_url: Some("http://[::1".to_string()),
            ..ServiceConfig::default()
        };
        assert!(matches!(
            build_http_client(&config),
            Err(ProxyError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_not_retried() {
        let logger = SharedLogger::in_memory();
        let client = UpstreamClient::new(
            reqwest::Client::new(),
            Arc::new(TokenBucket::new(100.0, 1)),
            RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(5),
            },
            logger.clone(),
        );
        let mut bad_key = route(None, None);
        bad_key.api_key = "sk-bad\nkey".to_string();

        let started = std::time::Instant::now();
        let err = client
            .send(&RequestContext::new(None), &bad_key, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Http(ref e) if e.is_builder()), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(logger.recent(10).iter().all(|e| e.component != "retry"));
    }
}
