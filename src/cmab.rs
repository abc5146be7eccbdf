//! Contextual multi-armed bandit (CMAB) decisions.
//!
//! For experiments marked as CMAB, the variation is chosen by a remote prediction endpoint from a
//! subset of the user's attributes. Decisions are cached per (user, rule) and reused for as long
//! as the attributes the bandit looks at stay the same.
mod client;
mod service;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

pub use client::{CmabClient, HttpCmabClient};
pub use service::{CmabCacheEntry, CmabService};

use crate::TypedValue;

/// Attributes sent to the prediction endpoint, sorted by attribute key.
pub type CmabAttributes = BTreeMap<String, TypedValue>;

/// Variation chosen by the bandit for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabDecision {
    pub variation_id: String,
    /// Correlation id of the prediction request, reported along with the decision.
    pub cmab_uuid: String,
}

/// Errors that can occur while obtaining a bandit decision.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum CmabError {
    /// Request could not be completed (connection error, timeout).
    #[error("prediction request failed: {0}")]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Transport(Arc<reqwest::Error>),

    /// Prediction endpoint responded with a non-success status.
    #[error("prediction request failed with status {0}")]
    HttpStatus(u16),

    /// Prediction endpoint responded with a body of unexpected shape. Not retried.
    #[error("invalid prediction response")]
    InvalidResponse,

    /// All attempts failed.
    #[error("exhausted all retries for prediction request after {attempts} attempts, last error: {last}")]
    RetriesExhausted {
        /// Number of requests made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        last: Box<CmabError>,
    },

    /// Rule is not a CMAB experiment in the current configuration.
    #[error("experiment {0} is not a contextual bandit")]
    NotCmabExperiment(String),

    /// Prediction endpoint chose a variation the experiment does not have.
    #[error("prediction returned unknown variation {variation_id} for experiment {experiment_key}")]
    UnknownVariation {
        experiment_key: String,
        variation_id: String,
    },

    /// A CMAB experiment was evaluated but no bandit service is configured.
    #[error("no contextual bandit service configured")]
    NotConfigured,
}

impl CmabError {
    /// Transport failures and non-success statuses may go away on their own.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, CmabError::Transport(_) | CmabError::HttpStatus(_))
    }
}

impl From<reqwest::Error> for CmabError {
    fn from(value: reqwest::Error) -> Self {
        CmabError::Transport(Arc::new(value.without_url()))
    }
}

/// Retry policy of the prediction client: exponential backoff with a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 1;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

    pub fn new() -> RetryConfig {
        RetryConfig {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            backoff_multiplier: Self::DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> RetryConfig {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> RetryConfig {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> RetryConfig {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> RetryConfig {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig::new()
    }
}

/// Configuration of [`CmabService`] and [`HttpCmabClient`].
#[derive(Debug, Clone)]
pub struct CmabConfig {
    /// Maximum number of cached decisions.
    pub cache_size: usize,
    /// How long a cached decision stays valid.
    pub cache_timeout: Duration,
    /// Base URL of the prediction endpoint. The rule id is appended as the last path segment.
    pub prediction_endpoint: String,
    /// Timeout of a single prediction request.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    /// Number of locks serializing requests for the same (user, rule).
    pub lock_shards: usize,
}

impl CmabConfig {
    pub const DEFAULT_CACHE_SIZE: usize = 100;
    pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_PREDICTION_ENDPOINT: &'static str =
        "https://prediction.cmab.example.com/predict";
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_LOCK_SHARDS: usize = 1000;

    pub fn new() -> CmabConfig {
        CmabConfig {
            cache_size: Self::DEFAULT_CACHE_SIZE,
            cache_timeout: Self::DEFAULT_CACHE_TIMEOUT,
            prediction_endpoint: Self::DEFAULT_PREDICTION_ENDPOINT.to_owned(),
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
            lock_shards: Self::DEFAULT_LOCK_SHARDS,
        }
    }

    /// Set cache size. Zero falls back to [`Self::DEFAULT_CACHE_SIZE`].
    pub fn with_cache_size(mut self, cache_size: usize) -> CmabConfig {
        self.cache_size = if cache_size == 0 {
            Self::DEFAULT_CACHE_SIZE
        } else {
            cache_size
        };
        self
    }

    /// Set cache timeout. Zero falls back to [`Self::DEFAULT_CACHE_TIMEOUT`].
    pub fn with_cache_timeout(mut self, cache_timeout: Duration) -> CmabConfig {
        self.cache_timeout = if cache_timeout.is_zero() {
            Self::DEFAULT_CACHE_TIMEOUT
        } else {
            cache_timeout
        };
        self
    }

    pub fn with_prediction_endpoint(mut self, endpoint: impl Into<String>) -> CmabConfig {
        self.prediction_endpoint = endpoint.into();
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> CmabConfig {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> CmabConfig {
        self.retry = retry;
        self
    }

    pub fn with_lock_shards(mut self, lock_shards: usize) -> CmabConfig {
        self.lock_shards = lock_shards.max(1);
        self
    }
}

impl Default for CmabConfig {
    fn default() -> CmabConfig {
        CmabConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CmabConfig, CmabError, RetryConfig};

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig::new()
            .with_initial_backoff(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_backoff(Duration::from_secs(1));

        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_secs(1));
        assert_eq!(retry.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn invalid_cache_settings_fall_back_to_defaults() {
        let config = CmabConfig::new()
            .with_cache_size(0)
            .with_cache_timeout(Duration::ZERO);
        assert_eq!(config.cache_size, CmabConfig::DEFAULT_CACHE_SIZE);
        assert_eq!(config.cache_timeout, CmabConfig::DEFAULT_CACHE_TIMEOUT);

        let config = CmabConfig::new()
            .with_cache_size(5)
            .with_cache_timeout(Duration::from_secs(5));
        assert_eq!(config.cache_size, 5);
        assert_eq!(config.cache_timeout, Duration::from_secs(5));
    }

    #[test]
    fn only_transport_and_status_errors_are_retryable() {
        assert!(CmabError::HttpStatus(500).is_retryable());
        assert!(!CmabError::InvalidResponse.is_retryable());
        assert!(!CmabError::NotConfigured.is_retryable());
    }
}
