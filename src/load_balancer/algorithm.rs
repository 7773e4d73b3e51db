// src/load_balancer/algorithm.rs
use crate::proxy::BackendServer;
use async_trait::async_trait;
use std::sync::Arc;

/// Picks the backend that serves the next request.
///
/// `servers` is the full ordered backend set; implementations decide
/// eligibility via `BackendServer::is_healthy` and return `None` when no
/// backend may take traffic. Must be safe to call from many requests at once.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn next(&self, servers: &[Arc<BackendServer>]) -> Option<Arc<BackendServer>>;

    fn name(&self) -> &'static str;
}

pub use crate::config::StrategyKind;
