use std::env;
use std::time::Duration;

use common::FailoverConfig;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: String,
    /// Tiempo sin heartbeat tras el que un worker se da por muerto.
    pub worker_dead_timeout: Duration,
    pub monitor_interval: Duration,
    pub failover: FailoverConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            worker_dead_timeout: WORKER_DEAD_TIMEOUT,
            monitor_interval: MONITOR_INTERVAL,
            failover: FailoverConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Variables: MASTER_LISTEN_ADDR, WORKER_DEAD_TIMEOUT_SECS,
    /// MONITOR_INTERVAL_SECS y MAX_FAILOVER_ATTEMPTS.
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr =
            env::var("MASTER_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

        let worker_dead_timeout = env::var("WORKER_DEAD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(WORKER_DEAD_TIMEOUT);

        let monitor_interval = env::var("MONITOR_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(MONITOR_INTERVAL);

        Ok(Self {
            listen_addr,
            worker_dead_timeout,
            monitor_interval,
            failover: FailoverConfig::from_env()?,
        })
    }
}
