//! Worker configuration: environment-driven settings and default sandbox
//! resource limits.

use std::time::Duration;

/// Task queue name on the Redis broker.
pub const TASK_QUEUE: &str = "judger:task";
/// Result queue name on the Redis broker.
pub const RESULT_QUEUE: &str = "judger:result";

/// Blocking-pop timeout, so a stop request is observed promptly.
pub const BLPOP_TIMEOUT_SECS: f64 = 5.0;

/// Default CPU time limit in nanoseconds (10 s).
pub const DEFAULT_TIME_LIMIT_NS: u64 = 10_000_000_000;
/// Default memory limit in bytes (512 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
/// Default process count limit.
pub const DEFAULT_PROC_LIMIT: u64 = 64;
/// Default CPU rate limit; 1000 equals one full core.
pub const DEFAULT_CPU_RATE_LIMIT: u64 = 1000;
/// Default output cap in bytes (16 MiB).
pub const DEFAULT_OUTPUT_LIMIT_BYTES: u64 = 16 * 1024 * 1024;

/// Environment handed to every sandboxed command.
pub const SANDBOX_ENV: &[&str] = &["PATH=/usr/bin:/bin", "ONLINE_JUDGE=1"];

/// How long a cached sandbox file may go unused before eviction.
pub const CACHE_EXPIRE: Duration = Duration::from_secs(1800);
/// How often the cache evictor wakes up.
pub const CACHE_RECYCLE_GAP: Duration = Duration::from_secs(60);

/// Settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub sandbox_endpoint: String,
    pub init_concurrent: usize,
    /// Log file path; empty disables file logging.
    pub log_file: String,
    pub debug: bool,
}

impl Config {
    /// Read the configuration from `PTOJ_*` environment variables,
    /// falling back to the documented defaults.
    pub fn from_env() -> Self {
        Self {
            redis_url: env_or("PTOJ_REDIS_URL", "redis://localhost:6379"),
            sandbox_endpoint: env_or("PTOJ_SANDBOX_ENDPOINT", "http://localhost:5050"),
            init_concurrent: env_or("PTOJ_INIT_CONCURRENT", "4").parse().unwrap_or(4),
            log_file: env_or("PTOJ_LOG_FILE", "judger.log"),
            debug: env_or("PTOJ_DEBUG", "1") == "1",
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
