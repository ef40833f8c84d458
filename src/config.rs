//! Configuration types.

use std::time::Duration;

/// Orchestrator configuration.
///
/// Key prefixes partition the backing KV store between the shared data
/// area, the result store, and the schedule table. All of them can be
/// overridden through `CONVEYOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker identity written into every result record.
    pub worker_hostname: String,
    /// Prefix for per-job shared data documents.
    pub data_prefix: String,
    /// Prefix for per-job shared stacks.
    pub stack_prefix: String,
    /// Prefix for result records.
    pub result_prefix: String,
    /// Prefix for the legacy-compatible records read by the execution
    /// engine's own introspection tools.
    pub legacy_result_prefix: String,
    /// Prefix for persistent schedule entries.
    pub schedule_prefix: String,
    /// Routing queue stamped onto every schedule entry on write.
    pub default_queue: String,
    /// TTL applied to shared data and shared stacks on every write.
    pub shared_ttl: Duration,
    /// TTL applied to result records (None = keep until purged).
    pub result_ttl: Option<Duration>,
    /// Default interval for polling another unit's result record.
    pub poll_interval: Duration,
    /// Interval of the periodic scheduling loop.
    pub beat_interval: Duration,
    /// Maximum number of trace entries kept per result record.
    pub trace_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_hostname: "worker@localhost".to_string(),
            data_prefix: "conveyor-data-".to_string(),
            stack_prefix: "conveyor-stack-".to_string(),
            result_prefix: "conveyor-result-".to_string(),
            legacy_result_prefix: "task-meta-".to_string(),
            schedule_prefix: "conveyor-schedule:".to_string(),
            default_queue: "default".to_string(),
            shared_ttl: Duration::from_secs(24 * 3600),
            result_ttl: None,
            poll_interval: Duration::from_millis(500),
            beat_interval: Duration::from_secs(5),
            trace_limit: 200,
        }
    }
}

impl Config {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_hostname: env_string("CONVEYOR_WORKER", defaults.worker_hostname),
            data_prefix: env_string("CONVEYOR_DATA_PREFIX", defaults.data_prefix),
            stack_prefix: env_string("CONVEYOR_STACK_PREFIX", defaults.stack_prefix),
            result_prefix: env_string("CONVEYOR_RESULT_PREFIX", defaults.result_prefix),
            legacy_result_prefix: env_string(
                "CONVEYOR_LEGACY_RESULT_PREFIX",
                defaults.legacy_result_prefix,
            ),
            schedule_prefix: env_string("CONVEYOR_SCHEDULE_PREFIX", defaults.schedule_prefix),
            default_queue: env_string("CONVEYOR_DEFAULT_QUEUE", defaults.default_queue),
            shared_ttl: env_secs("CONVEYOR_SHARED_TTL_SECS", defaults.shared_ttl),
            result_ttl: std::env::var("CONVEYOR_RESULT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            poll_interval: env_millis("CONVEYOR_POLL_INTERVAL_MS", defaults.poll_interval),
            beat_interval: env_secs("CONVEYOR_BEAT_INTERVAL_SECS", defaults.beat_interval),
            trace_limit: defaults.trace_limit,
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
