// src/proxy/backend.rs
use super::access_log;
use super::panic_message;
use super::proxy::{status_response, ForwardRequest, ProxyError};
use crate::config::{BackendSettings, ClientConfig};
use crate::health::{self, HealthState, HealthStatus, HealthThresholds, ProbeOutcome};
use anyhow::Result;
use chrono::Utc;
use futures::{stream, FutureExt, StreamExt};
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// One upstream server: identity, health configuration and health state.
pub struct BackendServer {
    pub name: String,
    host: Url,
    health_check_enabled: bool,
    thresholds: HealthThresholds,
    health_check_interval: Duration,
    request_timeout: Duration,
    client: HttpClient,
    probe_client: reqwest::Client,
    health: Mutex<HealthStatus>,
    // Serialises whole probe-and-transition cycles.
    check_lock: Mutex<()>,
}

impl BackendServer {
    pub fn new(settings: BackendSettings, client_config: &ClientConfig) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(client_config.connect_timeout()));
        let https = HttpsConnector::new_with_connector(http);

        let client = Client::builder()
            .pool_idle_timeout(client_config.idle_timeout())
            .pool_max_idle_per_host(client_config.max_idle_connections)
            .build::<_, Body>(https);

        let probe_client = health::build_probe_client(client_config)?;

        Ok(Self {
            name: settings.name,
            host: settings.host,
            health_check_enabled: settings.health_check_enabled,
            thresholds: settings.thresholds,
            health_check_interval: settings.health_check_interval,
            request_timeout: client_config.request_timeout(),
            client,
            probe_client,
            health: Mutex::new(HealthStatus::default()),
            check_lock: Mutex::new(()),
        })
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    /// Name for logs and metrics; falls back to the host when unnamed.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.host.as_str()
        } else {
            &self.name
        }
    }

    pub fn health_check_enabled(&self) -> bool {
        self.health_check_enabled
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    pub async fn is_healthy(&self) -> bool {
        self.health.lock().await.state.is_healthy()
    }

    pub async fn state(&self) -> HealthState {
        self.health.lock().await.state
    }

    pub async fn health_snapshot(&self) -> HealthStatus {
        self.health.lock().await.clone()
    }

    /// Probes the backend once and applies the outcome.
    ///
    /// A panic inside the cycle is logged and leaves the state untouched.
    pub async fn check_server_health(&self) -> HealthState {
        self.run_check_cycle(async {
            let outcome = health::probe(&self.probe_client, &self.host).await;
            self.record_probe(outcome).await
        })
        .await
    }

    /// Runs one probe-and-transition cycle under the cycle lock.
    pub(crate) async fn run_check_cycle<F>(&self, cycle: F) -> HealthState
    where
        F: Future<Output = HealthState>,
    {
        let _cycle = self.check_lock.lock().await;

        match AssertUnwindSafe(cycle).catch_unwind().await {
            Ok(state) => state,
            Err(panic) => {
                error!(
                    backend = %self.label(),
                    panic = %panic_message(panic.as_ref()),
                    "Health check panicked; state unchanged"
                );
                self.state().await
            }
        }
    }

    /// Applies one probe outcome to the counters and lifecycle state.
    pub async fn record_probe(&self, outcome: ProbeOutcome) -> HealthState {
        let mut health = self.health.lock().await;
        let previous = health.state;
        let state = health.record(outcome, self.thresholds, Utc::now());

        if state != previous {
            if state == HealthState::Failed {
                warn!(
                    backend = %self.label(),
                    failures = health.consecutive_failures,
                    "Backend {} -> {}", previous, state
                );
            } else {
                info!(
                    backend = %self.label(),
                    failures = health.consecutive_failures,
                    successes = health.consecutive_successes,
                    "Backend {} -> {}", previous, state
                );
            }
        }

        state
    }

    /// Forwards `request` to this backend.
    ///
    /// Only transport errors come back as `Err`; any upstream status is
    /// passed through. A panic while forwarding yields a 503 response.
    pub async fn do_request(&self, request: &ForwardRequest) -> Result<Response<Body>, ProxyError> {
        let start = Instant::now();

        let result = self.contain_forward(self.forward(request)).await;
        let status = match &result {
            Ok(response) => response.status(),
            Err(e) => e.status_code(),
        };

        access_log::record(request, self.label(), status, start.elapsed());
        result
    }

    /// Turns a panic in `forwarding` into a 503 response.
    pub(crate) async fn contain_forward<F>(&self, forwarding: F) -> Result<Response<Body>, ProxyError>
    where
        F: Future<Output = Result<Response<Body>, ProxyError>>,
    {
        match AssertUnwindSafe(forwarding).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    backend = %self.label(),
                    panic = %panic_message(panic.as_ref()),
                    "Forwarding panicked"
                );
                Ok(status_response(StatusCode::SERVICE_UNAVAILABLE))
            }
        }
    }

    async fn forward(&self, request: &ForwardRequest) -> Result<Response<Body>, ProxyError> {
        let mut outbound = Request::new(Body::from(request.body().clone()));
        *outbound.method_mut() = request.method().clone();
        *outbound.uri_mut() = self.upstream_uri(request.path_and_query())?;
        *outbound.headers_mut() = upstream_headers(request);

        // The timeout covers the response head and the body transfer.
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let response = tokio::time::timeout_at(deadline, self.client.request(outbound))
            .await
            .map_err(|_| ProxyError::Timeout)??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body_until(body, deadline)))
    }

    fn upstream_uri(&self, path_and_query: &str) -> Result<Uri, ProxyError> {
        let base = self.host.as_str().trim_end_matches('/');
        Ok(format!("{}{}", base, path_and_query).parse()?)
    }
}

impl fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServer")
            .field("name", &self.name)
            .field("host", &self.host.as_str())
            .field("health_check_enabled", &self.health_check_enabled)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

fn upstream_headers(request: &ForwardRequest) -> HeaderMap {
    let mut headers = request.headers().clone();
    strip_hop_by_hop(&mut headers);
    // Let the client derive Host from the upstream URI.
    headers.remove(HOST);

    if let Some(addr) = request.client_addr() {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers
}

/// Re-streams `body`, failing it once `deadline` passes.
fn body_until(body: Body, deadline: tokio::time::Instant) -> Body {
    let chunks = stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout_at(deadline, body.next()).await {
            Ok(Some(chunk)) => {
                let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
                Some((chunk, Some(body)))
            }
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream body not received in time",
                )),
                None,
            )),
        }
    });
    Body::wrap_stream(chunks)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
