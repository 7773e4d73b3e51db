// src/proxy/access_log.rs
use super::proxy::ForwardRequest;
use hyper::StatusCode;
use std::time::Duration;

/// Emits the access record for one forwarding attempt.
pub fn record(request: &ForwardRequest, backend: &str, status: StatusCode, latency: Duration) {
    let client = request
        .client_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    tracing::info!(
        target: "access",
        client = %client,
        latency_secs = latency.as_secs_f64(),
        status = status.as_u16(),
        method = %request.method(),
        path = request.path(),
        host = request.host(),
        agent = request.user_agent(),
        backend,
        "{} {:.6} {} - {} {}",
        client,
        latency.as_secs_f64(),
        status.as_u16(),
        request.method(),
        request.path(),
    );
}
