// tests/load_balancer_tests.rs
use async_trait::async_trait;
use health_balancer::config::{BackendSettings, ClientConfig};
use health_balancer::health::{HealthState, HealthThresholds, ProbeOutcome};
use health_balancer::load_balancer::{RoundRobin, Strategy};
use health_balancer::proxy::{BackendPool, BackendServer, LoadBalancer, ProxyError, MAX_ATTEMPTS};
use health_balancer::server::RequestHandler;
use hyper::{Body, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

const DEAD_HOST: &str = "http://127.0.0.1:1";

fn client_config() -> ClientConfig {
    ClientConfig {
        request_timeout_secs: 5,
        connect_timeout_secs: 1,
        ..ClientConfig::default()
    }
}

fn backend(name: &str, host: &str) -> Arc<BackendServer> {
    let settings = BackendSettings::new(name, Url::parse(host).unwrap());
    Arc::new(BackendServer::new(settings, &client_config()).unwrap())
}

fn checked_backend(name: &str, host: &str, interval: Duration) -> Arc<BackendServer> {
    let settings = BackendSettings::new(name, Url::parse(host).unwrap()).with_health_check(
        HealthThresholds {
            max_failures: 2,
            min_successes: 1,
        },
        interval,
    );
    Arc::new(BackendServer::new(settings, &client_config()).unwrap())
}

fn balancer(backends: Vec<Arc<BackendServer>>) -> LoadBalancer {
    LoadBalancer::new(BackendPool::new(backends), Arc::new(RoundRobin::new()))
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_string(response: hyper::Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Always hands out the same backend and counts how often it was asked.
struct Pinned {
    backend: Arc<BackendServer>,
    calls: AtomicUsize,
}

#[async_trait]
impl Strategy for Pinned {
    async fn next(&self, _servers: &[Arc<BackendServer>]) -> Option<Arc<BackendServer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(self.backend.clone())
    }

    fn name(&self) -> &'static str {
        "pinned"
    }
}

struct Exploding;

#[async_trait]
impl Strategy for Exploding {
    async fn next(&self, _servers: &[Arc<BackendServer>]) -> Option<Arc<BackendServer>> {
        panic!("selection blew up");
    }

    fn name(&self) -> &'static str {
        "exploding"
    }
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut alpha = mockito::Server::new_async().await;
    let mut beta = mockito::Server::new_async().await;
    let alpha_mock = alpha
        .mock("GET", "/hello")
        .with_body("alpha")
        .expect(2)
        .create_async()
        .await;
    let beta_mock = beta
        .mock("GET", "/hello")
        .with_body("beta")
        .expect(2)
        .create_async()
        .await;

    let lb = balancer(vec![
        backend("alpha", &alpha.url()),
        backend("beta", &beta.url()),
    ]);

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let response = lb.handle(get("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        bodies.push(body_string(response).await);
    }

    assert_eq!(bodies, vec!["alpha", "beta", "alpha", "beta"]);
    alpha_mock.assert_async().await;
    beta_mock.assert_async().await;
}

#[tokio::test]
async fn test_failover_to_next_backend_on_transport_error() {
    let mut live = mockito::Server::new_async().await;
    let _orders = live
        .mock("POST", "/orders")
        .match_body("order-1")
        .with_status(202)
        .with_body("accepted")
        .create_async()
        .await;

    let lb = balancer(vec![backend("dead", DEAD_HOST), backend("live", &live.url())]);

    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .body(Body::from("order-1"))
        .unwrap();
    let response = lb.handle(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_string(response).await, "accepted");
}

#[tokio::test]
async fn test_upstream_errors_are_not_retried() {
    let mut first = mockito::Server::new_async().await;
    let mut second = mockito::Server::new_async().await;
    let _broken = first
        .mock("GET", "/")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let untouched = second
        .mock("GET", "/")
        .expect(0)
        .create_async()
        .await;

    let lb = balancer(vec![backend("first", &first.url()), backend("second", &second.url())]);
    let response = lb.handle(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    untouched.assert_async().await;
}

#[tokio::test]
async fn test_no_healthy_backends_returns_503() {
    let failed = backend("failed", DEAD_HOST);
    for _ in 0..failed.thresholds().max_failures {
        failed.record_probe(ProbeOutcome::Failure).await;
    }
    assert_eq!(failed.state().await, HealthState::Failed);

    let lb = balancer(vec![failed]);
    let err = lb.handle(get("/")).await.unwrap_err();

    assert!(matches!(err, ProxyError::NoHealthyBackends));
    let response: hyper::Response<Body> = err.into();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_attempts_are_bounded() {
    let strategy = Arc::new(Pinned {
        backend: backend("dead", DEAD_HOST),
        calls: AtomicUsize::new(0),
    });
    let lb = LoadBalancer::new(BackendPool::new(vec![strategy.backend.clone()]), strategy.clone());

    let err = lb.handle(get("/")).await.unwrap_err();

    assert!(matches!(err, ProxyError::AttemptsExhausted(MAX_ATTEMPTS)));
    assert_eq!(strategy.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_panicking_strategy_is_contained() {
    let lb = LoadBalancer::new(
        BackendPool::new(vec![backend("any", DEAD_HOST)]),
        Arc::new(Exploding),
    );

    let err = lb.handle(get("/")).await.unwrap_err();
    assert!(matches!(err, ProxyError::AttemptsExhausted(MAX_ATTEMPTS)));
}

#[tokio::test]
async fn test_handler_sets_forwarded_for_header() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("GET", "/whoami")
        .match_header("x-forwarded-for", "10.1.2.3")
        .with_body("ok")
        .create_async()
        .await;

    let lb = Arc::new(balancer(vec![backend("upstream", &upstream.url())]));
    let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
    let handler = RequestHandler::new(lb).for_peer(peer);

    let response = handler.oneshot(get("/whoami")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_handler_renders_errors_as_responses() {
    let failed = backend("failed", DEAD_HOST);
    for _ in 0..failed.thresholds().max_failures {
        failed.record_probe(ProbeOutcome::Failure).await;
    }
    let handler = RequestHandler::new(Arc::new(balancer(vec![failed])));

    let response = handler.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_check_loops_mark_failures_and_stop() {
    let mut flaky = mockito::Server::new_async().await;
    let _unavailable = flaky
        .mock("GET", "/")
        .with_status(503)
        .expect_at_least(2)
        .create_async()
        .await;

    let checked = checked_backend("flaky", &flaky.url(), Duration::from_millis(20));
    let unchecked = backend("unchecked", DEAD_HOST);
    let lb = balancer(vec![checked.clone(), unchecked.clone()]);

    let handle = lb.start_health_check();
    assert_eq!(handle.len(), 1);

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        while checked.state().await != HealthState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(failed.is_ok(), "backend never reached the failed state");
    assert_eq!(unchecked.state().await, HealthState::NewlyOnboarded);

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("health check loops did not stop");

    let stopped_at = checked.health_snapshot().await.last_checked_on;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(checked.health_snapshot().await.last_checked_on, stopped_at);
}

#[tokio::test]
async fn test_health_check_recovers_backend() {
    let mut upstream = mockito::Server::new_async().await;
    let _ok = upstream
        .mock("GET", "/")
        .with_status(200)
        .create_async()
        .await;

    let server = checked_backend("upstream", &upstream.url(), Duration::from_millis(20));
    for _ in 0..2 {
        server.record_probe(ProbeOutcome::Failure).await;
    }
    assert!(!server.is_healthy().await);

    let lb = balancer(vec![server.clone()]);
    let handle = lb.start_health_check();

    let healthy = tokio::time::timeout(Duration::from_secs(5), async {
        while !server.is_healthy().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(healthy.is_ok(), "backend never recovered");
    assert_eq!(server.state().await, HealthState::Healthy);

    handle.shutdown().await;
}
