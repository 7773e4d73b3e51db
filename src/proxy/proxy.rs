// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatch: pick a backend, forward, fail over on transport errors
// ────────────────────────────────

use super::panic_message;
use super::{BackendPool, BackendServer};
use crate::config::Config;
use crate::health::HealthCheckHandle;
use crate::load_balancer::{create_strategy, Strategy};
use crate::metrics::MetricsCollector;
use anyhow::Result;
use futures::FutureExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

/// Upper bound on forwarding attempts per inbound request.
pub const MAX_ATTEMPTS: usize = 3;

/// Peer address of the inbound connection, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// An inbound request with its body buffered so it can be replayed.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    client_addr: Option<SocketAddr>,
}

impl ForwardRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            client_addr,
        }
    }

    pub async fn from_request(req: Request<Body>) -> Result<Self, ProxyError> {
        let client_addr = req.extensions().get::<ClientAddr>().map(|addr| addr.0);
        let (parts, body) = req.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        Ok(Self::new(parts.method, parts.uri, parts.headers, body, client_addr))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Host the client addressed, from the Host header or the request URI.
    pub fn host(&self) -> &str {
        self.headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.host())
            .unwrap_or("")
    }

    pub fn user_agent(&self) -> &str {
        self.headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

/// Owns the backend set and the selection strategy.
pub struct LoadBalancer {
    pool: BackendPool,
    strategy: Arc<dyn Strategy>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl LoadBalancer {
    pub fn new(pool: BackendPool, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            pool,
            strategy,
            metrics: None,
        }
    }

    /// Builds the pool and strategy; an unknown strategy name is an error.
    pub fn from_config(config: &Config) -> Result<Self> {
        let strategy = create_strategy(config.strategy_kind()?);
        let pool = BackendPool::from_config(config)?;
        Ok(Self::new(pool, strategy))
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        metrics.update_backend_counts(self.pool.len(), self.pool.len());
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Starts one health check loop per backend with checks enabled.
    pub fn start_health_check(&self) -> HealthCheckHandle {
        HealthCheckHandle::spawn(&self.pool, self.metrics.clone())
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let span = info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            method = %req.method(),
            path = %req.uri().path(),
        );

        async move {
            let start = Instant::now();
            let method = req.method().clone();

            let result = match ForwardRequest::from_request(req).await {
                Ok(request) => self.dispatch(&request).await,
                Err(e) => Err(e),
            };

            if let Some(metrics) = &self.metrics {
                let status = match &result {
                    Ok(response) => response.status(),
                    Err(e) => e.status_code(),
                };
                metrics.record_request(method.as_str(), status.as_u16(), start.elapsed());
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: &ForwardRequest) -> Result<Response<Body>, ProxyError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = AssertUnwindSafe(self.attempt(request, attempt))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(ProxyError::NoHealthyBackends)) => {
                    warn!(attempt, "No healthy backends available");
                    return Err(ProxyError::NoHealthyBackends);
                }
                Ok(Err(_)) => {}
                Err(panic) => {
                    error!(
                        attempt,
                        panic = %panic_message(panic.as_ref()),
                        "Request attempt panicked"
                    );
                }
            }
        }

        Err(ProxyError::AttemptsExhausted(MAX_ATTEMPTS))
    }

    async fn attempt(
        &self,
        request: &ForwardRequest,
        attempt: usize,
    ) -> Result<Response<Body>, ProxyError> {
        let server: Arc<BackendServer> = self
            .strategy
            .next(self.pool.all_backends())
            .await
            .ok_or(ProxyError::NoHealthyBackends)?;

        let start = Instant::now();
        let result = server.do_request(request).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_backend_request(server.label(), result.is_ok(), start.elapsed());
        }
        if let Err(e) = &result {
            warn!(backend = %server.label(), attempt, error = %e, "Forwarding failed");
        }
        result
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Backend error: {0}")]
    Backend(#[from] hyper::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid upstream URI: {0}")]
    InvalidUpstreamUri(#[from] hyper::http::uri::InvalidUri),

    #[error("All {0} forwarding attempts failed")]
    AttemptsExhausted(usize),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Backend(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidUpstreamUri(_) => StatusCode::BAD_GATEWAY,
            ProxyError::AttemptsExhausted(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        status_response(err.status_code())
    }
}

/// Plain-text response carrying the status' canonical reason.
pub(crate) fn status_response(status: StatusCode) -> Response<Body> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut response = Response::new(Body::from(format!("{}\n", reason)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
