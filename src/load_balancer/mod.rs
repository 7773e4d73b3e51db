// src/load_balancer/mod.rs
mod algorithm;
mod round_robin;

pub use algorithm::{Strategy, StrategyKind};
pub use round_robin::RoundRobin;

use std::sync::Arc;

pub fn create_strategy(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
    }
}
