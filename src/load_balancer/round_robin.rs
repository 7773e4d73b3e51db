// src/load_balancer/round_robin.rs
use crate::load_balancer::Strategy;
use crate::proxy::BackendServer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cycles through the backend list in order, skipping ineligible ones.
#[derive(Default)]
pub struct RoundRobin {
    last: Mutex<Option<Arc<BackendServer>>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Strategy for RoundRobin {
    async fn next(&self, servers: &[Arc<BackendServer>]) -> Option<Arc<BackendServer>> {
        let mut last = self.last.lock().await;

        let mut eligible = Vec::with_capacity(servers.len());
        for server in servers {
            eligible.push(server.is_healthy().await);
        }
        if !eligible.contains(&true) {
            return None;
        }

        // Position of the previous pick in the full list, -1 if unknown.
        let previous = last
            .as_ref()
            .and_then(|prev| servers.iter().position(|s| Arc::ptr_eq(s, prev)))
            .map(|index| index as isize)
            .unwrap_or(-1);

        let len = servers.len();
        let index = (1..=len)
            .map(|step| (previous + step as isize) as usize % len)
            .find(|&index| eligible[index])?;

        let chosen = servers[index].clone();
        *last = Some(chosen.clone());
        Some(chosen)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
