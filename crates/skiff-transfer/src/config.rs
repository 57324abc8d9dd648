use std::env;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;
pub const DEFAULT_WINDOW: usize = 32;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;

/// Tunables for one transfer session. Divergences between the prototype
/// implementations (window sizes, retry counts) live here, not in code paths.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per chunk; the final chunk of a file may be shorter.
    pub chunk_size: u32,
    /// Max chunks sent but not yet acknowledged.
    pub window: usize,
    /// Resend attempts per chunk before the session fails.
    pub max_retries: u32,
    /// How long a chunk may sit unacknowledged before a resend.
    pub retry_timeout: Duration,
    /// Admission pauses when the channel buffers at least this many bytes.
    pub high_water: usize,
    /// Admission resumes once the channel drains to this level.
    pub low_water: usize,
    /// How long the direct channel may take to open before relay fallback.
    pub direct_timeout: Duration,
    /// Bounded re-check interval while gated on channel backpressure.
    pub backpressure_poll: Duration,
    /// Minimum spacing between progress events per file; the event on file
    /// completion is never suppressed.
    pub progress_interval: Duration,
    /// Interval between relay batch listings while waiting for uploads.
    pub relay_poll: Duration,
    /// Overall bound on waiting for the relay path to produce the batch.
    pub relay_deadline: Duration,
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: parse_env("SKIFF_CHUNK_SIZE", defaults.chunk_size),
            window: parse_env("SKIFF_WINDOW", defaults.window),
            max_retries: parse_env("SKIFF_MAX_RETRIES", defaults.max_retries),
            retry_timeout: Duration::from_millis(parse_env(
                "SKIFF_RETRY_TIMEOUT_MS",
                defaults.retry_timeout.as_millis() as u64,
            )),
            high_water: parse_env("SKIFF_HIGH_WATER", defaults.high_water),
            low_water: parse_env("SKIFF_LOW_WATER", defaults.low_water),
            direct_timeout: Duration::from_millis(parse_env(
                "SKIFF_DIRECT_TIMEOUT_MS",
                defaults.direct_timeout.as_millis() as u64,
            )),
            backpressure_poll: Duration::from_millis(parse_env(
                "SKIFF_BACKPRESSURE_POLL_MS",
                defaults.backpressure_poll.as_millis() as u64,
            )),
            progress_interval: Duration::from_millis(parse_env(
                "SKIFF_PROGRESS_INTERVAL_MS",
                defaults.progress_interval.as_millis() as u64,
            )),
            relay_poll: Duration::from_millis(parse_env(
                "SKIFF_RELAY_POLL_MS",
                defaults.relay_poll.as_millis() as u64,
            )),
            relay_deadline: Duration::from_millis(parse_env(
                "SKIFF_RELAY_DEADLINE_MS",
                defaults.relay_deadline.as_millis() as u64,
            )),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: DEFAULT_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_timeout: Duration::from_secs(10),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_HIGH_WATER / 2,
            direct_timeout: Duration::from_secs(6),
            backpressure_poll: Duration::from_millis(25),
            progress_interval: Duration::from_millis(100),
            relay_poll: Duration::from_secs(2),
            relay_deadline: Duration::from_secs(120),
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(value) => value.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}
