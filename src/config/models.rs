// src/config/models.rs
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::health::HealthThresholds;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listen host for the proxy itself.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub health_check_enabled: bool,

    /// Consecutive failed probes before a backend is marked `failed`.
    #[serde(default)]
    pub max_health_check_failures: u32,

    /// Consecutive successful probes before a backend is `healthy` again.
    #[serde(default)]
    pub min_health_check_success: u32,

    #[serde(default)]
    pub health_check_frequency_in_seconds: u64,

    /// Backends in round-robin order.
    pub servers: Vec<ServerConfig>,

    pub strategy: String,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub name: String,
    pub host: String,
}

/// Outbound connection tuning shared by the forwarding and probe clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_idle_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 60,
            idle_timeout_secs: 600,
            max_idle_connections: 1024,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

/// Everything a single `BackendServer` needs from configuration.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub name: String,
    pub host: Url,
    pub health_check_enabled: bool,
    pub thresholds: HealthThresholds,
    pub health_check_interval: Duration,
}

impl BackendSettings {
    /// Settings with health checking turned off.
    pub fn new(name: impl Into<String>, host: Url) -> Self {
        Self {
            name: name.into(),
            host,
            health_check_enabled: false,
            thresholds: HealthThresholds::default(),
            health_check_interval: Duration::from_secs(1),
        }
    }

    pub fn with_health_check(mut self, thresholds: HealthThresholds, interval: Duration) -> Self {
        self.health_check_enabled = true;
        self.thresholds = thresholds;
        self.health_check_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "roundrobin",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid strategy")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roundrobin" | "round_robin" => Ok(StrategyKind::RoundRobin),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    80
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("at least one server must be configured");
        }

        for server in &self.servers {
            parse_host(&server.host)?;
        }

        self.strategy_kind()?;

        if self.health_check_enabled {
            if self.max_health_check_failures == 0 {
                bail!("max_health_check_failures must be at least 1 when health checks are enabled");
            }
            if self.min_health_check_success == 0 {
                bail!("min_health_check_success must be at least 1 when health checks are enabled");
            }
            if self.health_check_frequency_in_seconds == 0 {
                bail!("health_check_frequency_in_seconds must be at least 1 when health checks are enabled");
            }
        }

        Ok(())
    }

    pub fn strategy_kind(&self) -> Result<StrategyKind, UnknownStrategy> {
        self.strategy.parse()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_frequency_in_seconds)
    }

    pub fn backend_settings(&self) -> Result<Vec<BackendSettings>> {
        let thresholds = HealthThresholds {
            max_failures: self.max_health_check_failures,
            min_successes: self.min_health_check_success,
        };

        self.servers
            .iter()
            .map(|server| -> Result<BackendSettings> {
                let settings = BackendSettings {
                    name: server.name.clone(),
                    host: parse_host(&server.host)?,
                    health_check_enabled: self.health_check_enabled,
                    thresholds,
                    health_check_interval: self.health_check_interval(),
                };
                Ok(settings)
            })
            .collect()
    }
}

fn parse_host(host: &str) -> Result<Url> {
    let url = Url::parse(host).with_context(|| format!("invalid server host {:?}", host))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("server host {:?} has unsupported scheme {:?}", host, other),
    }
}
