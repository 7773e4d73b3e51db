// src/health/checker.rs
use crate::config::ClientConfig;
use crate::health::ProbeOutcome;
use crate::metrics::MetricsCollector;
use crate::proxy::{BackendPool, BackendServer};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};
use url::Url;

/// Builds the pooled client used for health probes.
pub fn build_probe_client(config: &ClientConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .pool_idle_timeout(config.idle_timeout())
        .pool_max_idle_per_host(config.max_idle_connections)
        .build()
        .context("Failed to create health check client")
}

/// Issues one GET against `url`.
///
/// Transport errors and any status >= 500 count as failures.
pub async fn probe(client: &Client, url: &Url) -> ProbeOutcome {
    match client.get(url.as_str()).send().await {
        Ok(response) if response.status().as_u16() >= 500 => {
            debug!(%url, status = %response.status(), "probe failed");
            ProbeOutcome::Failure
        }
        Ok(response) => {
            debug!(%url, status = %response.status(), "probe succeeded");
            ProbeOutcome::Success
        }
        Err(e) => {
            debug!(%url, error = %e, "probe transport error");
            ProbeOutcome::Failure
        }
    }
}

/// Owns the per-backend health check loops.
///
/// Every loop watches a shared shutdown channel at its sleep boundary.
/// Dropping the handle closes the channel, which also stops the loops.
#[must_use = "health check loops stop when the handle is dropped"]
pub struct HealthCheckHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthCheckHandle {
    pub(crate) fn spawn(pool: &BackendPool, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks: Vec<_> = pool
            .all_backends()
            .iter()
            .filter(|server| server.health_check_enabled())
            .map(|server| {
                let server = server.clone();
                let pool = pool.clone();
                let metrics = metrics.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(run_checks(server, pool, metrics, shutdown_rx))
            })
            .collect();

        info!("Started {} health check loop(s)", tasks.len());

        Self { shutdown_tx, tasks }
    }

    /// Number of loops that were started.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signals every loop to stop and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!("Health check task join error: {}", e);
            }
        }
        info!("Health check loops stopped");
    }
}

async fn run_checks(
    server: Arc<BackendServer>,
    pool: BackendPool,
    metrics: Option<Arc<MetricsCollector>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = server.health_check_interval();
    debug!(backend = %server.name, ?interval, "health check loop starting");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let state = server.check_server_health().await;

        if let Some(metrics) = &metrics {
            metrics.update_backend_health(server.label(), state.is_healthy());
            let healthy = pool.healthy_count().await;
            metrics.update_backend_counts(healthy, pool.len());
        }

        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!(backend = %server.name, "health check loop exiting");
}
