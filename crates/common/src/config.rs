use std::str::FromStr;

use serde::Deserialize;

/// How the dispatcher decides a job is `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishPolicy {
    /// Finished only when every recipient succeeded in a single pass.
    /// A job with recipients handled in an earlier pass stays `Partial`.
    #[default]
    FreshPass,
    /// Finished when no recipient is left in `New` or `Error`.
    AllTerminal,
}

impl FromStr for FinishPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh_pass" => Ok(FinishPolicy::FreshPass),
            "all_terminal" => Ok(FinishPolicy::AllTerminal),
            other => Err(anyhow::anyhow!(
                "FINISH_POLICY must be 'fresh_pass' or 'all_terminal', got '{}'",
                other
            )),
        }
    }
}

/// Guard against two dispatches of the same job running at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchGuard {
    /// Take an atomic claim on the job before processing it.
    #[default]
    Claim,
    /// Only re-check the persisted status before sending.
    Recheck,
}

impl FromStr for DispatchGuard {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claim" => Ok(DispatchGuard::Claim),
            "recheck" => Ok(DispatchGuard::Recheck),
            other => Err(anyhow::anyhow!(
                "DISPATCH_GUARD must be 'claim' or 'recheck', got '{}'",
                other
            )),
        }
    }
}

/// Dispatcher behaviour switches.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DispatchOptions {
    pub finish_policy: FinishPolicy,
    pub guard: DispatchGuard,
    /// Lifetime of a dispatch claim in seconds.
    pub claim_ttl_secs: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            finish_policy: FinishPolicy::default(),
            guard: DispatchGuard::default(),
            claim_ttl_secs: 600,
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Fallback language when an app has none configured (default: en)
    pub system_language: String,

    /// Base URL of the messaging platform API
    pub wechat_api_base: String,

    /// Dispatcher behaviour switches
    pub dispatch: DispatchOptions,

    /// Only jobs created within this many hours are re-scanned (default: 24)
    pub sweep_window_hours: i64,

    /// Interval between re-scans in seconds (default: 3600)
    pub sweep_interval_secs: u64,

    /// Interval between retention purges in seconds (default: 86400)
    pub purge_interval_secs: u64,

    /// Jobs older than this are deleted by the purge (default: 100)
    pub retention_days: i64,

    /// Blocking-pop timeout for the dispatch queue in seconds (default: 5)
    pub queue_block_secs: u64,

    /// Maximum number of jobs dispatched concurrently by one worker (default: 4)
    pub worker_concurrency: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "10")?,
            system_language: std::env::var("SYSTEM_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            wechat_api_base: std::env::var("WECHAT_API_BASE")
                .unwrap_or_else(|_| "https://api.weixin.qq.com".to_string()),
            dispatch: DispatchOptions {
                finish_policy: parse_var("FINISH_POLICY", "fresh_pass")?,
                guard: parse_var("DISPATCH_GUARD", "claim")?,
                claim_ttl_secs: parse_var("DISPATCH_CLAIM_TTL_SECS", "600")?,
            },
            sweep_window_hours: parse_var("SWEEP_WINDOW_HOURS", "24")?,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", "3600")?,
            purge_interval_secs: parse_var("PURGE_INTERVAL_SECS", "86400")?,
            retention_days: parse_var("RETENTION_DAYS", "100")?,
            queue_block_secs: parse_var("QUEUE_BLOCK_SECS", "5")?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", "4")?,
        })
    }
}

fn parse_var<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e))
}
