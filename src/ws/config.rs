#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(20);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_AUTH_PARAM: &str = "token";

/// Configuration for the real-time connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint of the event socket (`ws://` or `wss://`)
    pub endpoint: Url,
    /// Query parameter carrying the credential during the handshake
    pub auth_param: String,
    /// Upper bound on a single connect attempt, handshake included
    pub handshake_timeout: Duration,
    /// Interval for sending PING messages to keep connection alive
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for PONG response before considering connection dead
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Build a configuration with default timings for `endpoint`.
    ///
    /// Fails if `endpoint` does not parse or does not use the `ws`/`wss` scheme.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint scheme must be ws or wss, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            auth_param: DEFAULT_AUTH_PARAM.to_owned(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        })
    }

    /// The endpoint with the credential appended as the handshake parameter.
    #[must_use]
    pub fn authenticated_endpoint(&self, credential: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(&self.auth_param, credential);
        url
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // Jitter off: the schedule is part of the observable contract
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Retry bookkeeping for one connection driver.
///
/// Each failure yields `min(initial * multiplier^attempts, max)` and bumps the attempt
/// counter; once the counter exceeds `max_attempts` no further delay is handed out.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    backoff: ExponentialBackoff,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl ReconnectSchedule {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            backoff: config.clone().into(),
            attempts: 0,
            max_attempts: config.max_attempts,
        }
    }

    /// Record a failure. Returns the delay before the next attempt, or `None` when the retry
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let delay = self.backoff.next_backoff()?;
        self.attempts = self.attempts.saturating_add(1);

        if self.is_exhausted() { None } else { Some(delay) }
    }

    /// Forget every failure, e.g. after a session reached `Connected`.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next failure would be assigned.
    #[must_use]
    pub const fn current_backoff(&self) -> Duration {
        self.backoff.current_interval
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts > max)
    }
}
