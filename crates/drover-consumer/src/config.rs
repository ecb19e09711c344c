//! Listener configuration and environment resolution.
//!
//! Every knob resolves with the same precedence: explicit builder value >
//! environment variable > built-in default. Resolution is centralized here
//! so no other module reads the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_WAIT_TIME_SECONDS: u32 = 20;
const DEFAULT_BATCH_SIZE: u32 = 10;
const DEFAULT_VISIBILITY_SECONDS: u32 = 60;
const DEFAULT_MAX_EXTEND_SECONDS: u32 = 900;
const DEFAULT_WORKER_THREADS: usize = 4;
const DEFAULT_IDLE_SLEEP_MAX_SECONDS: f64 = 2.0;

/// Fully-resolved parameters for one registered listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Long-poll duration per receive, 0-20 seconds.
    pub wait_time_seconds: u32,
    /// Maximum messages per receive, 1-10.
    pub batch_size: u32,
    /// Initial visibility timeout set on receive; also the value each
    /// heartbeat extension resets the remaining timeout to.
    pub visibility_timeout_seconds: u32,
    /// Hard cap on how long a single reception may be kept leased.
    pub max_extend_seconds: u32,
    /// Concurrent pollers for this listener; in per-message mode also the
    /// handler-execution concurrency ceiling.
    pub worker_threads: usize,
    /// Upper bound of the randomized sleep after an empty receive.
    pub idle_sleep_max: Duration,
    /// Reset visibility to zero for handler-reported failures so they
    /// redeliver immediately, instead of waiting out the current timeout.
    pub release_on_failure: bool,
}

impl ListenerConfig {
    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder::default()
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds as u64)
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds as u64)
    }

    pub fn max_extend(&self) -> Duration {
        Duration::from_secs(self.max_extend_seconds as u64)
    }

    /// How far ahead of the visibility deadline extensions are issued.
    pub fn safety_margin(&self) -> Duration {
        self.visibility().mul_f64(0.2).max(Duration::from_secs(5))
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=10).contains(&self.batch_size) {
            return Err(ConfigError::OutOfRange(format!(
                "batch_size must be in 1..=10, got {}",
                self.batch_size
            )));
        }
        if self.wait_time_seconds > 20 {
            return Err(ConfigError::OutOfRange(format!(
                "wait_time_seconds must be in 0..=20, got {}",
                self.wait_time_seconds
            )));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::OutOfRange(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.visibility() < self.wait_time() + self.safety_margin() {
            return Err(ConfigError::OutOfRange(format!(
                "visibility timeout {}s must cover the long-poll wait {}s plus the {}s safety margin",
                self.visibility_timeout_seconds,
                self.wait_time_seconds,
                self.safety_margin().as_secs()
            )));
        }
        if self.max_extend_seconds < self.visibility_timeout_seconds {
            return Err(ConfigError::OutOfRange(format!(
                "max_extend {}s must be at least the visibility timeout {}s",
                self.max_extend_seconds, self.visibility_timeout_seconds
            )));
        }
        Ok(self)
    }
}

impl Default for ListenerConfig {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self {
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            visibility_timeout_seconds: DEFAULT_VISIBILITY_SECONDS,
            max_extend_seconds: DEFAULT_MAX_EXTEND_SECONDS,
            worker_threads: DEFAULT_WORKER_THREADS,
            idle_sleep_max: Duration::from_secs_f64(DEFAULT_IDLE_SLEEP_MAX_SECONDS),
            release_on_failure: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("{0}")]
    OutOfRange(String),
}

/// Builder holding explicit overrides; unset fields fall back to the
/// environment and then to the defaults.
#[derive(Debug, Clone, Default)]
pub struct ListenerConfigBuilder {
    wait_time_seconds: Option<u32>,
    batch_size: Option<u32>,
    visibility_timeout_seconds: Option<u32>,
    max_extend_seconds: Option<u32>,
    worker_threads: Option<usize>,
    idle_sleep_max: Option<Duration>,
    release_on_failure: Option<bool>,
}

impl ListenerConfigBuilder {
    pub fn wait_time_seconds(mut self, value: u32) -> Self {
        self.wait_time_seconds = Some(value);
        self
    }

    pub fn batch_size(mut self, value: u32) -> Self {
        self.batch_size = Some(value);
        self
    }

    pub fn visibility_timeout_seconds(mut self, value: u32) -> Self {
        self.visibility_timeout_seconds = Some(value);
        self
    }

    pub fn max_extend_seconds(mut self, value: u32) -> Self {
        self.max_extend_seconds = Some(value);
        self
    }

    pub fn worker_threads(mut self, value: usize) -> Self {
        self.worker_threads = Some(value);
        self
    }

    pub fn idle_sleep_max(mut self, value: Duration) -> Self {
        self.idle_sleep_max = Some(value);
        self
    }

    pub fn release_on_failure(mut self, value: bool) -> Self {
        self.release_on_failure = Some(value);
        self
    }

    pub fn build(self) -> Result<ListenerConfig, ConfigError> {
        let idle_sleep_max = match self.idle_sleep_max {
            Some(value) => value,
            None => Duration::from_secs_f64(
                env_override::<f64>("IDLE_SLEEP_MAX")?.unwrap_or(DEFAULT_IDLE_SLEEP_MAX_SECONDS),
            ),
        };

        let config = ListenerConfig {
            wait_time_seconds: resolve(self.wait_time_seconds, "WAIT_TIME", DEFAULT_WAIT_TIME_SECONDS)?,
            batch_size: resolve(self.batch_size, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            visibility_timeout_seconds: resolve(
                self.visibility_timeout_seconds,
                "VISIBILITY_SECS",
                DEFAULT_VISIBILITY_SECONDS,
            )?,
            max_extend_seconds: resolve(
                self.max_extend_seconds,
                "MAX_EXTEND",
                DEFAULT_MAX_EXTEND_SECONDS,
            )?,
            worker_threads: resolve(self.worker_threads, "WORKER_THREADS", DEFAULT_WORKER_THREADS)?,
            idle_sleep_max,
            release_on_failure: self.release_on_failure.unwrap_or(false),
        };
        config.validate()
    }
}

fn resolve<T: FromStr>(explicit: Option<T>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match explicit {
        Some(value) => Ok(value),
        None => Ok(env_override(key)?.unwrap_or(default)),
    }
}

fn env_override<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
        _ => Ok(None),
    }
}
