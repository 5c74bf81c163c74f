//! Bounded retry with exponential backoff.
//!
//! [`RetryExecutor`] wraps any fallible call. The caller supplies the
//! classification of errors into [`ErrorClass::Retryable`] and
//! [`ErrorClass::Fatal`] (normally the backend adapter's `classify_error`),
//! so the executor itself never special-cases a backend.
//!
//! The async path suspends only the calling task between attempts; the
//! blocking path sleeps the calling thread.

use crate::config::RetryConfig;
use crate::db::backoff;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Whether reattempting a failed call could plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connectivity, timeout and transient resource errors.
    Retryable,
    /// Authentication, permission, malformed request and constraint errors.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// What an operation does to the database, which decides whether it may be resent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read-only; always safe to resend.
    #[default]
    Read,
    /// Mutation that is never resent automatically.
    Write,
    /// Mutation the caller declares safe to resend.
    IdempotentWrite,
}

impl OperationKind {
    pub fn is_retry_safe(&self) -> bool {
        !matches!(self, Self::Write)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::IdempotentWrite => write!(f, "idempotent_write"),
        }
    }
}

/// Why the executor stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStop {
    /// Retry was switched off; the call ran once.
    Disabled,
    /// The error was classified as fatal.
    Fatal,
    /// The retry budget ran out.
    Exhausted,
}

impl fmt::Display for RetryStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "retry disabled"),
            Self::Fatal => write!(f, "fatal error"),
            Self::Exhausted => write!(f, "retries exhausted"),
        }
    }
}

/// The last error of a retried call, tagged with how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Total calls made, original call included.
    pub attempts: u32,
    pub stop: RetryStop,
}

impl<E> RetryFailure<E> {
    pub fn is_exhausted(&self) -> bool {
        self.stop == RetryStop::Exhausted
    }

    pub fn into_inner(self) -> E {
        self.error
    }

    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> RetryFailure<F> {
        RetryFailure {
            error: f(self.error),
            attempts: self.attempts,
            stop: self.stop,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} attempt(s): {}", self.stop, self.attempts, self.error)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// One failed attempt, as reported to a [`RetryObserver`].
#[derive(Clone, Copy)]
pub struct AttemptEvent<'a> {
    pub operation: &'a str,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub class: ErrorClass,
    pub error: &'a dyn fmt::Display,
    /// Delay before the next attempt; `None` when this was the last one.
    pub next_delay: Option<Duration>,
}

impl fmt::Debug for AttemptEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptEvent")
            .field("operation", &self.operation)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("class", &self.class)
            .field("error", &format_args!("{}", self.error))
            .field("next_delay", &self.next_delay)
            .finish()
    }
}

/// Optional sink for per-attempt diagnostics (metrics, test probes).
pub trait RetryObserver: Send + Sync {
    fn on_failure(&self, event: &AttemptEvent<'_>);

    fn on_success(&self, _operation: &str, _attempts: u32) {}
}

enum Decision {
    Retry(Duration),
    Stop(RetryStop),
}

/// Runs fallible calls under a [`RetryConfig`].
#[derive(Clone, Default)]
pub struct RetryExecutor {
    observer: Option<Arc<dyn RetryObserver>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every attempt to `observer` in addition to the log.
    pub fn with_observer(observer: Arc<dyn RetryObserver>) -> Self {
        Self {
            observer: Some(observer),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the retry budget is spent.
    ///
    /// With `config.enable == false` the call runs exactly once.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        operation: &str,
        config: &RetryConfig,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: fmt::Display,
    {
        if !config.enable {
            return op().await.map_err(|error| RetryFailure {
                error,
                attempts: 1,
                stop: RetryStop::Disabled,
            });
        }

        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    self.succeeded(operation, retries + 1);
                    return Ok(value);
                }
                Err(error) => match self.decide(operation, config, retries, &error, &classify) {
                    Decision::Retry(delay) => {
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    Decision::Stop(stop) => {
                        return Err(RetryFailure {
                            error,
                            attempts: retries + 1,
                            stop,
                        });
                    }
                },
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute) for plain threads.
    ///
    /// Must not be called from inside an async task.
    pub fn execute_blocking<T, E, F, C>(
        &self,
        operation: &str,
        config: &RetryConfig,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        C: Fn(&E) -> ErrorClass,
        E: fmt::Display,
    {
        if !config.enable {
            return op().map_err(|error| RetryFailure {
                error,
                attempts: 1,
                stop: RetryStop::Disabled,
            });
        }

        let mut retries = 0u32;
        loop {
            match op() {
                Ok(value) => {
                    self.succeeded(operation, retries + 1);
                    return Ok(value);
                }
                Err(error) => match self.decide(operation, config, retries, &error, &classify) {
                    Decision::Retry(delay) => {
                        std::thread::sleep(delay);
                        retries += 1;
                    }
                    Decision::Stop(stop) => {
                        return Err(RetryFailure {
                            error,
                            attempts: retries + 1,
                            stop,
                        });
                    }
                },
            }
        }
    }

    fn decide<E, C>(
        &self,
        operation: &str,
        config: &RetryConfig,
        retries: u32,
        error: &E,
        classify: &C,
    ) -> Decision
    where
        C: Fn(&E) -> ErrorClass,
        E: fmt::Display,
    {
        let class = classify(error);
        let attempt = retries + 1;
        let max_attempts = config.max_attempts();

        let decision = match class {
            ErrorClass::Fatal => Decision::Stop(RetryStop::Fatal),
            ErrorClass::Retryable if retries >= config.max_retries => {
                Decision::Stop(RetryStop::Exhausted)
            }
            ErrorClass::Retryable => Decision::Retry(backoff::next_delay(retries, config)),
        };

        let next_delay = match &decision {
            Decision::Retry(delay) => Some(*delay),
            Decision::Stop(_) => None,
        };

        match &decision {
            Decision::Retry(delay) => warn!(
                operation = %operation,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            ),
            Decision::Stop(RetryStop::Exhausted) => error!(
                operation = %operation,
                attempts = attempt,
                error = %error,
                "All attempts failed"
            ),
            Decision::Stop(stop) => debug!(
                operation = %operation,
                attempt = attempt,
                reason = %stop,
                error = %error,
                "Not retrying"
            ),
        }

        if let Some(observer) = &self.observer {
            observer.on_failure(&AttemptEvent {
                operation,
                attempt,
                max_attempts,
                class,
                error,
                next_delay,
            });
        }

        decision
    }

    fn succeeded(&self, operation: &str, attempts: u32) {
        if attempts > 1 {
            debug!(operation = %operation, attempts = attempts, "Succeeded after retry");
        }
        if let Some(observer) = &self.observer {
            observer.on_success(operation, attempts);
        }
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}
