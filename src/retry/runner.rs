use super::errors::{AttemptError, RetryError};
use super::source::RetryableSource;
use crate::backoff::{BackoffConfig, BackoffState};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

type Validator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;
type ErrorHook<E> = Arc<dyn Fn(&AttemptError<E>, Duration) + Send + Sync>;
type Classifier<E> = Arc<dyn Fn(&AttemptError<E>) -> bool + Send + Sync>;

/// Backoff cursor for one logical operation.
///
/// Reset it (or create a new one) whenever the operation starts from scratch; keep it across
/// the retries of the same operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    backoff: BackoffState,
    failures: u32,
}

impl RetryState {
    /// Creates a cursor positioned at the start of `config`'s sequence.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            backoff: config.initial_state(),
            failures: 0,
        }
    }

    /// Returns the cursor to the start of the sequence.
    pub fn reset(&mut self, config: &BackoffConfig) {
        *self = Self::new(config);
    }

    /// Failed attempts recorded since the last reset.
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// The wait computed for the most recent failure, or zero.
    pub const fn last_wait(&self) -> Duration {
        self.backoff.last_wait()
    }
}

/// Retry policy plus hooks. See the [module documentation](super).
pub struct Retrier<T, E> {
    backoff: BackoffConfig,
    attempt_timeout: Option<Duration>,
    max_attempts: Option<u32>,
    validate: Option<Validator<T>>,
    on_error: Option<ErrorHook<E>>,
    retryable: Option<Classifier<E>>,
}

impl<T, E> Clone for Retrier<T, E> {
    fn clone(&self) -> Self {
        Self {
            backoff: self.backoff,
            attempt_timeout: self.attempt_timeout,
            max_attempts: self.max_attempts,
            validate: self.validate.clone(),
            on_error: self.on_error.clone(),
            retryable: self.retryable.clone(),
        }
    }
}

impl<T, E> Debug for Retrier<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("backoff", &self.backoff)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("validate", &self.validate.as_ref().map(|_| "<Validator>"))
            .field("on_error", &self.on_error.as_ref().map(|_| "<ErrorHook>"))
            .field("retryable", &self.retryable.as_ref().map(|_| "<Classifier>"))
            .finish()
    }
}

enum Attempt<T, E> {
    Done(Result<T, AttemptError<E>>),
    Cancelled,
}

impl<T, E> Retrier<T, E> {
    /// Creates a retrier that retries forever with the (normalized) `backoff` policy.
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff: backoff.normalize(),
            attempt_timeout: None,
            max_attempts: None,
            validate: None,
            on_error: None,
            retryable: None,
        }
    }

    /// Bounds how long a single attempt may stay outstanding.
    #[must_use]
    pub const fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Bounds the total number of attempts made by [`Retrier::run`].
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Installs a predicate rejecting malformed results.
    #[must_use]
    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Installs a hook observing every failed attempt that will be retried.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AttemptError<E>, Duration) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Installs a classifier; failures it returns `false` for end the loop immediately.
    #[must_use]
    pub fn retryable<F>(mut self, classify: F) -> Self
    where
        F: Fn(&AttemptError<E>) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(classify));
        self
    }

    /// The normalized backoff policy.
    pub const fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// The per-attempt timeout, if any.
    pub const fn timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Creates a fresh [`RetryState`] for this policy.
    pub fn new_state(&self) -> RetryState {
        RetryState::new(&self.backoff)
    }

    /// Runs the `validate` hook on an arrived result.
    ///
    /// # Errors
    ///
    /// Returns [`AttemptError::Rejected`] if the hook rejects `value`.
    pub fn accept(&self, value: T) -> Result<T, AttemptError<E>> {
        match &self.validate {
            Some(validate) => match validate(&value) {
                Ok(()) => Ok(value),
                Err(reason) => Err(AttemptError::Rejected(reason)),
            },
            None => Ok(value),
        }
    }

    /// Returns whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &AttemptError<E>) -> bool {
        self.retryable.as_ref().map_or(true, |classify| classify(error))
    }

    /// Records a failed attempt: advances `state` and notifies the `on_error` hook.
    ///
    /// Returns the wait to apply before the next attempt.
    pub fn record_failure(&self, state: &mut RetryState, error: &AttemptError<E>) -> Duration {
        let (wait, next) = self.backoff.next(state.backoff);
        state.backoff = next;
        state.failures = state.failures.saturating_add(1);
        if let Some(hook) = &self.on_error {
            hook(error, wait);
        }
        wait
    }

    /// Repeats attempts on `source` until one yields a validated result.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Cancelled`] if `cancel` fires, including while waiting between attempts,
    /// - [`RetryError::Permanent`] if the `retryable` classifier rejects a failure,
    /// - [`RetryError::Exhausted`] if the attempt budget runs out.
    pub async fn run<S>(
        &self,
        cancel: &CancellationToken,
        source: &mut S,
    ) -> Result<T, RetryError<E>>
    where
        S: RetryableSource<Output = T, Error = E>,
    {
        let mut state = self.new_state();

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match self.attempt(cancel, source).await {
                Attempt::Cancelled => return Err(RetryError::Cancelled),
                Attempt::Done(Ok(value)) => return Ok(value),
                Attempt::Done(Err(e)) => e,
            };

            if !self.is_retryable(&error) {
                return Err(RetryError::Permanent(error));
            }
            let attempts = state.failures().saturating_add(1);
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: error,
                });
            }

            let wait = self.record_failure(&mut state, &error);
            if sleep_or_cancel(cancel, wait).await {
                return Err(RetryError::Cancelled);
            }
        }
    }

    async fn attempt<S>(&self, cancel: &CancellationToken, source: &mut S) -> Attempt<T, E>
    where
        S: RetryableSource<Output = T, Error = E>,
    {
        let pending = match source.begin_fetch() {
            Ok(p) => p,
            Err(e) => return Attempt::Done(Err(AttemptError::Failed(e))),
        };

        let outcome = match self.attempt_timeout {
            Some(limit) => {
                let timed = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Attempt::Cancelled,
                    r = tokio::time::timeout(limit, pending) => r,
                };
                match timed {
                    Ok(r) => r.map_err(AttemptError::Failed),
                    Err(_) => {
                        source.abandon();
                        Err(AttemptError::TimedOut(limit))
                    }
                }
            }
            None => tokio::select! {
                biased;
                () = cancel.cancelled() => return Attempt::Cancelled,
                r = pending => r.map_err(AttemptError::Failed),
            },
        };

        Attempt::Done(outcome.and_then(|v| self.accept(v)))
    }
}

/// Sleeps for `dur` unless `token` fires first. Returns `true` if cancelled.
async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}
