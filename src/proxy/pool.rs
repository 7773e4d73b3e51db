//
// src/proxy/pool.rs
//

use super::backend::BackendServer;
use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;

/// Fixed, ordered set of backends. Order defines round-robin order.
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: Arc<Vec<Arc<BackendServer>>>,
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<BackendServer>>) -> Self {
        Self {
            backends: Arc::new(backends),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let backends = config
            .backend_settings()?
            .into_iter()
            .map(|settings| -> Result<Arc<BackendServer>> {
                let backend = BackendServer::new(settings, &config.client)?;
                tracing::info!(
                    "Registered backend {} at {} (health checks {})",
                    backend.label(),
                    backend.host(),
                    if backend.health_check_enabled() { "on" } else { "off" }
                );
                Ok(Arc::new(backend))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(backends))
    }

    pub fn all_backends(&self) -> &[Arc<BackendServer>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn healthy_count(&self) -> usize {
        let mut healthy = 0;
        for backend in self.backends.iter() {
            if backend.is_healthy().await {
                healthy += 1;
            }
        }
        healthy
    }
}
