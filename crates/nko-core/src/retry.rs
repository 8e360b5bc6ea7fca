//! Exponential backoff retry executor
//!
//! Wraps any fallible async operation. On a retryable failure the executor
//! waits `min(base * 2^attempt, max) + uniform(0, jitter)` and tries again;
//! after `max_retries + 1` failed attempts it returns
//! [`NkoError::RetryExhausted`] carrying the attempt count and the last cause.
//! Errors whose kind is not in the policy propagate immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, NkoError, Result};

/// Upper bound accepted for any delay or jitter setting, in seconds (one day)
pub const MAX_DELAY_BOUND_SECS: f64 = 86_400.0;

/// Callback invoked before each backoff sleep with (attempt, error, delay)
pub type RetryObserver = Arc<dyn Fn(u32, &NkoError, Duration) + Send + Sync>;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry policy for one collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = exactly one attempt)
    pub max_retries: u32,

    /// Delay before the first retry, in seconds
    pub base_delay_secs: f64,

    /// Upper bound on the exponential part of the delay, in seconds
    pub max_delay_secs: f64,

    /// Maximum random jitter added to each delay, in seconds
    pub jitter_secs: f64,

    /// Error kinds considered retryable
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// Create and validate a policy
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
        retry_on: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self> {
        let policy = Self {
            max_retries,
            base_delay_secs: base_delay.as_secs_f64(),
            max_delay_secs: max_delay.as_secs_f64(),
            jitter_secs: jitter.as_secs_f64(),
            retry_on: retry_on.into_iter().collect(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Preset for the generative-AI API
    pub fn llm() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
            jitter_secs: 1.0,
            retry_on: vec![ErrorKind::Transient, ErrorKind::RateLimited, ErrorKind::Llm],
        }
    }

    /// Preset for the hosted database API
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            jitter_secs: 1.0,
            retry_on: vec![ErrorKind::Transient, ErrorKind::RateLimited],
        }
    }

    /// Preset for generic network calls
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 5.0,
            max_delay_secs: 60.0,
            jitter_secs: 1.0,
            retry_on: vec![ErrorKind::Transient, ErrorKind::RateLimited],
        }
    }

    /// Set jitter
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_secs = jitter.as_secs_f64();
        self
    }

    /// Set retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check the policy bounds
    pub fn validate(&self) -> Result<()> {
        if !(self.base_delay_secs.is_finite() && self.base_delay_secs > 0.0) {
            return Err(NkoError::Validation(format!(
                "base_delay must be > 0, got {}",
                self.base_delay_secs
            )));
        }
        if !(self.max_delay_secs.is_finite() && self.max_delay_secs >= self.base_delay_secs) {
            return Err(NkoError::Validation(format!(
                "max_delay ({}) must be >= base_delay ({})",
                self.max_delay_secs, self.base_delay_secs
            )));
        }
        if !(self.jitter_secs.is_finite() && self.jitter_secs >= 0.0) {
            return Err(NkoError::Validation(format!(
                "jitter must be >= 0, got {}",
                self.jitter_secs
            )));
        }
        for (name, value) in [
            ("max_delay", self.max_delay_secs),
            ("jitter", self.jitter_secs),
        ] {
            if value > MAX_DELAY_BOUND_SECS {
                return Err(NkoError::Validation(format!(
                    "{name} must be <= {MAX_DELAY_BOUND_SECS}s, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Whether an error should be retried under this policy
    pub fn is_retryable(&self, error: &NkoError) -> bool {
        self.retry_on.contains(&error.kind())
    }

    /// Delay before retry number `attempt + 1`, without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay_secs * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        seconds(exponential.min(self.max_delay_secs))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter_secs > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_secs);
            base.saturating_add(seconds(jitter))
        } else {
            base
        }
    }
}

/// Seconds to a duration, clamped to the accepted bound
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_DELAY_BOUND_SECS)).unwrap_or(Duration::ZERO)
}

// ============================================================================
// Retry Executor
// ============================================================================

/// A named retry wrapper around a policy
#[derive(Clone)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Create a new executor
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            observer: None,
        }
    }

    /// Register a callback invoked before every backoff sleep
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &NkoError, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Get the policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run an operation under this executor's policy
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            operation = %self.name,
                            attempts = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if !self.policy.is_retryable(&err) => {
                    tracing::debug!(
                        operation = %self.name,
                        error = %err,
                        "Non-retryable error, propagating"
                    );
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= self.policy.max_retries {
                        let attempts = attempt + 1;
                        tracing::error!(
                            operation = %self.name,
                            attempts,
                            error = %err,
                            "Retries exhausted"
                        );
                        return Err(NkoError::RetryExhausted {
                            attempts,
                            source: Box::new(err),
                        });
                    }

                    let delay = self.policy.jittered_delay(attempt);
                    if let Some(observer) = &self.observer {
                        observer(attempt + 1, &err, delay);
                    }
                    tracing::warn!(
                        operation = %self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable error, backing off"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run an operation with exponential backoff under `policy`
pub async fn retry_with_backoff<T, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(name, policy.clone()).run(operation).await
}

// ============================================================================
// Tests
// ============================================================================
