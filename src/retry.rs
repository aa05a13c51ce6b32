// SPDX-License-Identifier: MIT
//! Retry policy: pure functions deciding *whether* and *when* to retry.
//!
//! Unlike an operation-retrying harness that owns the loop and the sleep,
//! this module only answers two questions — `should_retry` and
//! `delay_for` — so the Worker can persist the decision (next_retry_at) and
//! let the Index Store's scheduled set drive the actual wait. Jitter is
//! injected via [`JitterSource`] rather than hard-coded, so tests can run
//! deterministically.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// A source of randomness for jitter. The default implementation uses
/// `rand::random`; tests substitute a fixed-value source.
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[0.0, 1.0)`.
    fn next_f64(&self) -> f64;
}

/// Jitter source backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn next_f64(&self) -> f64 {
        use rand::Rng;
        rand::rng().random::<f64>()
    }
}

/// Jitter source that always returns the same value — for reproducible tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// HTTP status codes retried by default when no override is configured.
pub const DEFAULT_RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Substrings that mark a transport-level failure (no status code at all)
/// as retryable. A message that matches none of these — a validation error
/// surfaced as a transport string, say — is treated as non-retryable.
const TRANSPORT_FAILURE_MARKERS: [&str; 7] = [
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "dns",
    "broken pipe",
    "unreachable",
];

fn is_transport_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSPORT_FAILURE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// The shape of a failed attempt, as seen by `should_retry`. `status_code`
/// is `None` for a transport failure (connection never produced a response).
#[derive(Debug, Clone, Copy)]
pub struct RetryOutcome<'a> {
    pub status_code: Option<u16>,
    pub error: Option<&'a str>,
}

/// A custom delay function: given the attempt number (1-based, the attempt
/// that just failed), returns the base delay before the next one, before
/// jitter and the `max_delay` cap are applied.
pub type CustomDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Which requests get retried, overriding the default status set.
#[derive(Clone)]
pub enum RetryOn {
    /// Retry `DEFAULT_RETRYABLE_STATUS` responses and transport failures.
    Default,
    /// Retry only these status codes; transport failures still retry.
    StatusCodes(Vec<u16>),
    /// Caller-supplied classifier, given the status code (if any) and the
    /// error message (if any).
    Predicate(Arc<dyn Fn(Option<u16>, Option<&str>) -> bool + Send + Sync>),
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::Default => write!(f, "Default"),
            RetryOn::StatusCodes(codes) => write!(f, "StatusCodes({codes:?})"),
            RetryOn::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Named backoff shapes. `Custom` delegates to `RetryConfig::custom_delay`
/// and fails with `ConfigError` if that's unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// `base_delay * multiplier ^ (attempt - 1)`, capped at `max_delay`.
    Exponential,
    /// `base_delay * attempt`, capped at `max_delay`.
    Linear,
    /// `base_delay` every time.
    Fixed,
    /// `custom_delay(attempt)`.
    Custom,
}

/// Retry policy configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try). Comes from
    /// `Request::max_retries + 1`.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts, applied after jitter.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry. Exponential only.
    pub multiplier: f64,
    pub strategy: RetryStrategy,
    /// Required when `strategy` is `Custom`.
    pub custom_delay: Option<CustomDelayFn>,
    /// Whether to jitter the computed delay by a uniform factor in [0.75, 1.25).
    pub jitter: bool,
    pub retry_on: RetryOn,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("strategy", &self.strategy)
            .field("custom_delay", &self.custom_delay.as_ref().map(|_| "Fn(u32) -> Duration"))
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            strategy: RetryStrategy::Exponential,
            custom_delay: None,
            jitter: true,
            retry_on: RetryOn::Default,
        }
    }
}

/// Whether an attempt numbered `attempt_number` (1-based, the attempt that
/// just failed) should be retried under `config`, given its outcome.
pub fn should_retry(config: &RetryConfig, attempt_number: u32, outcome: RetryOutcome<'_>) -> bool {
    if attempt_number >= config.max_attempts {
        return false;
    }
    match &config.retry_on {
        RetryOn::Predicate(f) => f(outcome.status_code, outcome.error),
        RetryOn::StatusCodes(codes) => match outcome.status_code {
            Some(code) => codes.contains(&code),
            None => is_transport_failure(outcome.error.unwrap_or("")),
        },
        RetryOn::Default => match outcome.status_code {
            Some(code) => DEFAULT_RETRYABLE_STATUS.contains(&code),
            None => is_transport_failure(outcome.error.unwrap_or("")),
        },
    }
}

/// The delay to wait before `attempt_number + 1`, given `attempt_number`
/// failed attempts so far. Dispatches on `config.strategy`; `Custom` returns
/// `ConfigError` if no `custom_delay` was supplied.
pub fn delay_for(config: &RetryConfig, attempt_number: u32, jitter: &dyn JitterSource) -> EngineResult<Duration> {
    let raw = match config.strategy {
        RetryStrategy::Exponential => {
            let exp = config.multiplier.powi(attempt_number.saturating_sub(1) as i32);
            Duration::from_millis((config.base_delay.as_millis() as f64 * exp).max(0.0) as u64)
        }
        RetryStrategy::Linear => {
            Duration::from_millis((config.base_delay.as_millis() as f64 * attempt_number as f64).max(0.0) as u64)
        }
        RetryStrategy::Fixed => config.base_delay,
        RetryStrategy::Custom => {
            let f = config
                .custom_delay
                .as_ref()
                .ok_or_else(|| EngineError::ConfigError("custom retry strategy selected with no custom_delay set".into()))?;
            f(attempt_number)
        }
    };
    Ok(apply_jitter(raw, config, jitter))
}

/// Multiplies `raw` by a uniform factor in `[0.75, 1.25)` when jitter is
/// enabled, then caps the result at `max_delay`. The cap always applies,
/// jittered or not — a strategy's own formula already bounds the
/// pre-jitter delay, but jitter can push it back above `max_delay`.
fn apply_jitter(raw: Duration, config: &RetryConfig, jitter: &dyn JitterSource) -> Duration {
    let base = if config.jitter {
        let factor = 0.75 + jitter.next_f64() * 0.5;
        let jittered_ms = (raw.as_millis() as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(jittered_ms)
    } else {
        raw
    };
    base.min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status_code: Option<u16>) -> RetryOutcome<'static> {
        RetryOutcome { status_code, error: None }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        assert!(should_retry(&cfg, 1, outcome(Some(503))));
        assert!(should_retry(&cfg, 2, outcome(Some(503))));
        assert!(!should_retry(&cfg, 3, outcome(Some(503))));
    }

    #[test]
    fn should_retry_only_retryable_statuses_by_default() {
        let cfg = RetryConfig::default();
        assert!(should_retry(&cfg, 1, outcome(Some(503))));
        assert!(should_retry(&cfg, 1, outcome(Some(429))));
        assert!(!should_retry(&cfg, 1, outcome(Some(404))));
        assert!(!should_retry(&cfg, 1, outcome(Some(400))));
        assert!(!should_retry(&cfg, 1, outcome(Some(501))));
    }

    #[test]
    fn should_retry_transport_failures_without_a_status_code() {
        let cfg = RetryConfig::default();
        assert!(should_retry(
            &cfg,
            1,
            RetryOutcome { status_code: None, error: Some("connection refused") }
        ));
        assert!(!should_retry(
            &cfg,
            1,
            RetryOutcome { status_code: None, error: Some("request body too large") }
        ));
    }

    #[test]
    fn retry_on_status_codes_overrides_default_set() {
        let cfg = RetryConfig {
            retry_on: RetryOn::StatusCodes(vec![418]),
            ..RetryConfig::default()
        };
        assert!(should_retry(&cfg, 1, outcome(Some(418))));
        assert!(!should_retry(&cfg, 1, outcome(Some(503))));
    }

    #[test]
    fn retry_on_predicate_is_consulted() {
        let cfg = RetryConfig {
            retry_on: RetryOn::Predicate(Arc::new(|status, _| status == Some(200))),
            ..RetryConfig::default()
        };
        assert!(should_retry(&cfg, 1, outcome(Some(200))));
        assert!(!should_retry(&cfg, 1, outcome(Some(503))));
    }

    #[test]
    fn delay_grows_exponentially_before_cap() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
            max_attempts: 10,
            ..RetryConfig::default()
        };
        let jitter = FixedJitter(0.0);
        assert_eq!(delay_for(&cfg, 1, &jitter).unwrap(), Duration::from_millis(100));
        assert_eq!(delay_for(&cfg, 2, &jitter).unwrap(), Duration::from_millis(200));
        assert_eq!(delay_for(&cfg, 3, &jitter).unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn delay_grows_linearly() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter: false,
            max_attempts: 10,
            strategy: RetryStrategy::Linear,
            ..RetryConfig::default()
        };
        let jitter = FixedJitter(0.0);
        assert_eq!(delay_for(&cfg, 1, &jitter).unwrap(), Duration::from_millis(100));
        assert_eq!(delay_for(&cfg, 3, &jitter).unwrap(), Duration::from_millis(300));
    }

    #[test]
    fn delay_is_fixed() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(60),
            jitter: false,
            max_attempts: 10,
            strategy: RetryStrategy::Fixed,
            ..RetryConfig::default()
        };
        let jitter = FixedJitter(0.0);
        assert_eq!(delay_for(&cfg, 1, &jitter).unwrap(), Duration::from_millis(250));
        assert_eq!(delay_for(&cfg, 5, &jitter).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn custom_strategy_invokes_supplied_function() {
        let cfg = RetryConfig {
            max_delay: Duration::from_secs(60),
            jitter: false,
            max_attempts: 10,
            strategy: RetryStrategy::Custom,
            custom_delay: Some(Arc::new(|attempt| Duration::from_millis(attempt as u64 * 7))),
            ..RetryConfig::default()
        };
        let jitter = FixedJitter(0.0);
        assert_eq!(delay_for(&cfg, 3, &jitter).unwrap(), Duration::from_millis(21));
    }

    #[test]
    fn custom_strategy_without_function_is_a_config_error() {
        let cfg = RetryConfig {
            strategy: RetryStrategy::Custom,
            custom_delay: None,
            ..RetryConfig::default()
        };
        assert!(matches!(delay_for(&cfg, 1, &FixedJitter(0.0)), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(1),
            multiplier: 10.0,
            max_delay: Duration::from_millis(5),
            jitter: false,
            max_attempts: 20,
            ..RetryConfig::default()
        };
        let jitter = FixedJitter(0.0);
        let d = delay_for(&cfg, 10, &jitter).unwrap();
        assert!(d <= Duration::from_millis(5));
    }

    #[test]
    fn jitter_multiplies_within_three_quarters_to_five_quarters() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            max_attempts: 10,
            ..RetryConfig::default()
        };
        let low = delay_for(&cfg, 1, &FixedJitter(0.0)).unwrap();
        let high = delay_for(&cfg, 1, &FixedJitter(0.999_999)).unwrap();
        assert_eq!(low, Duration::from_millis(750));
        assert!(high >= Duration::from_millis(1249) && high <= Duration::from_millis(1250));
    }

    #[test]
    fn jitter_disabled_returns_raw_delay() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
            max_attempts: 10,
            ..RetryConfig::default()
        };
        assert_eq!(delay_for(&cfg, 1, &FixedJitter(0.5)).unwrap(), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_result_still_capped_by_max_delay() {
        let cfg = RetryConfig {
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1100),
            jitter: true,
            max_attempts: 10,
            ..RetryConfig::default()
        };
        let d = delay_for(&cfg, 1, &FixedJitter(0.999_999)).unwrap();
        assert_eq!(d, Duration::from_millis(1100));
    }
}
