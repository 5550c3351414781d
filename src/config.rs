//! Environment-derived settings and tunables.

use std::env;
use std::time::Duration;

/// Default byte cap for one webhook batch.
pub const DEFAULT_PAYLOAD_LIMIT: usize = 900_000;

/// Process-wide settings shared by every consumer and the produce action.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Byte cap for one webhook batch (`PAYLOAD_LIMIT`).
    pub payload_limit: usize,
    /// Disable webhook TLS verification (`LOCAL_DEV=True`).
    pub local_dev: bool,
    /// Host override applied to every trigger URL (`API_HOST`).
    pub api_host: Option<String>,
    /// Webhook retry attempts before skip-and-advance.
    pub max_retries: u32,
    /// Wall-time budget of one polling window.
    pub poll_window: Duration,
    /// Deadline for a single bus poll.
    pub poll_deadline: Duration,
    /// Webhook POST timeout.
    pub http_timeout: Duration,
    /// Pause between main-loop iterations so empty topics do not hot-spin.
    pub idle_pause: Duration,
    /// Doctor scan cadence.
    pub doctor_interval: Duration,
    /// Seconds without a completed poll before a Running worker counts as
    /// stalled.
    pub stall_seconds: f64,
    /// Bounded wait when joining a worker task; the task is aborted on
    /// overrun. Must cover the longest backoff sleep plus the HTTP timeout.
    pub join_timeout: Duration,
    /// Producer cache capacity.
    pub max_cached_producers: usize,
    /// Producer acquisition attempts in the produce action.
    pub produce_attempts: u32,
    /// Delivery-report wait in the produce action.
    pub delivery_timeout: Duration,
    /// Flush deadline for evicted producers.
    pub eviction_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            local_dev: false,
            api_host: None,
            max_retries: 6,
            poll_window: Duration::from_secs(2),
            poll_deadline: Duration::from_secs(1),
            http_timeout: Duration::from_secs(10),
            idle_pause: Duration::from_millis(100),
            doctor_interval: Duration::from_secs(2),
            stall_seconds: 10.0,
            join_timeout: Duration::from_secs(90),
            max_cached_producers: 10,
            produce_attempts: 3,
            delivery_timeout: Duration::from_secs(20),
            eviction_timeout: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Read the process environment.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.payload_limit = payload_limit_from(env::var("PAYLOAD_LIMIT").ok().as_deref());
        settings.local_dev = local_dev_from(env::var("LOCAL_DEV").ok().as_deref());
        settings.api_host = env::var("API_HOST").ok().filter(|host| !host.is_empty());
        settings
    }
}

fn payload_limit_from(value: Option<&str>) -> usize {
    value
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_PAYLOAD_LIMIT)
}

fn local_dev_from(value: Option<&str>) -> bool {
    value == Some("True")
}
