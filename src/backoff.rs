//! Exponential backoff policy.
//!
//! [`BackoffConfig::next`] is a pure function: it takes the current [`BackoffState`] and returns
//! the wait to apply before the next attempt together with the advanced state. Jitter is drawn
//! from a seeded generator carried inside the state, so a sequence is fully reproducible from
//! its initial seed.
//!
//! Properties of a sequence produced without an intervening reset:
//! - waits never decrease,
//! - waits never exceed [`BackoffConfig::cap`],
//! - after [`BackoffConfig::max_steps`] steps the wait stays constant.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy configuration.
///
/// The `n`-th wait (0-based) is `initial * factor^n`, moved by a symmetric jitter of up to
/// `jitter * base` in either direction, then clamped into `[previous wait, cap]`.
///
/// Out-of-range values are normalized by [`BackoffConfig::normalize`], which every consumer in
/// this crate applies before using a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Wait before the first retry.
    pub initial: Duration,
    /// Multiplier applied on every step.
    pub factor: f64,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
    /// Upper bound for any single wait.
    pub cap: Duration,
    /// Number of steps after which the wait stops growing.
    pub max_steps: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            factor: 3.0,
            jitter: 0.1,
            cap: Duration::from_secs(10 * 60),
            max_steps: 5,
        }
    }
}

/// Cursor over a backoff sequence.
///
/// Obtain a fresh cursor with [`BackoffConfig::initial_state`] (or [`BackoffState::default`] for
/// seed zero) and feed it back into [`BackoffConfig::next`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BackoffState {
    step: u32,
    last_wait: Duration,
    seed: u64,
}

impl BackoffState {
    /// Creates a cursor at step zero using `seed` for jitter.
    pub const fn with_seed(seed: u64) -> Self {
        Self {
            step: 0,
            last_wait: Duration::ZERO,
            seed,
        }
    }

    /// Number of waits produced so far.
    pub const fn step(&self) -> u32 {
        self.step
    }

    /// The most recently produced wait, or zero for a fresh cursor.
    pub const fn last_wait(&self) -> Duration {
        self.last_wait
    }
}

impl BackoffConfig {
    /// Returns a normalized copy of this configuration.
    ///
    /// - `factor` below 1 (or NaN) becomes 1,
    /// - `jitter` is clamped into `[0, 1]` (NaN becomes 0),
    /// - `initial` above `cap` is lowered to `cap`.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.factor.is_nan() || self.factor < 1.0 {
            self.factor = 1.0;
        }
        self.jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };
        if self.initial > self.cap {
            self.initial = self.cap;
        }
        self
    }

    /// Returns a fresh cursor seeded from the process-wide generator.
    pub fn initial_state(&self) -> BackoffState {
        BackoffState::with_seed(fastrand::u64(..))
    }

    /// Computes the next wait and the advanced cursor.
    pub fn next(&self, state: BackoffState) -> (Duration, BackoffState) {
        if state.step >= self.max_steps && state.step > 0 {
            return (state.last_wait, state);
        }

        let mut rng = fastrand::Rng::with_seed(state.seed);
        let base = self.base_wait(state.step);
        let jittered = if self.jitter > 0.0 {
            // Uniform in [-jitter, +jitter] relative to the base.
            let offset = (rng.f64() * 2.0 - 1.0) * self.jitter * base;
            (base + offset).max(0.0)
        } else {
            base
        };

        let wait = secs_to_duration(jittered)
            .max(state.last_wait)
            .min(self.cap);

        let next = BackoffState {
            step: state.step.saturating_add(1),
            last_wait: wait,
            seed: rng.u64(..),
        };
        (wait, next)
    }

    fn base_wait(&self, step: u32) -> f64 {
        let exp = i32::try_from(step).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.factor.powi(exp);
        if base.is_finite() {
            base
        } else {
            self.cap.as_secs_f64()
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
