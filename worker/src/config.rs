use std::env;
use std::time::Duration;

use common::FailoverConfig;

pub const DEFAULT_MASTER_BASE_URL: &str = "http://master:8080";
pub const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_base_url: String,
    pub max_concurrency: u32,
    pub heartbeat_interval: Duration,
    /// Si el worker pide jobs de otros cuando se queda sin trabajo.
    pub stealing: bool,
    pub failover: FailoverConfig,
}

impl WorkerConfig {
    /// Variables: MASTER_BASE_URL, WORKER_CONCURRENCY, WORKER_HEARTBEAT_SECS,
    /// WORKER_STEALING y MAX_FAILOVER_ATTEMPTS.
    pub fn from_env() -> anyhow::Result<Self> {
        let master_base_url =
            env::var("MASTER_BASE_URL").unwrap_or_else(|_| DEFAULT_MASTER_BASE_URL.to_string());

        let max_concurrency = env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        let heartbeat_interval = env::var("WORKER_HEARTBEAT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);

        let stealing = env::var("WORKER_STEALING")
            .map(|s| !matches!(s.trim(), "0" | "false" | "no"))
            .unwrap_or(true);

        Ok(Self {
            master_base_url: master_base_url.trim_end_matches('/').to_string(),
            max_concurrency,
            heartbeat_interval,
            stealing,
            failover: FailoverConfig::from_env()?,
        })
    }
}
