use super::metrics::MetricsRecorder;
use super::refresher::CertRefresher;
use super::types::CertificateSource;
use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What the refresher does when storing issued certificates keeps failing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Keep retrying with backoff, logging every failure.
    #[default]
    RetryForever,
    /// Stop the refresher after this many consecutive store failures.
    ///
    /// A dispatch error, remote error, timeout or rejection in between restarts the count.
    GiveUpAfter(u32),
}

/// Tunables of a [`CertRefresher`], loadable from a configuration file.
///
/// Every field has a default, so a partial document is enough:
///
/// ```
/// use cert_refresher::refresh::{RefreshConfig, StoreFailurePolicy};
/// use std::time::Duration;
///
/// let config: RefreshConfig = serde_json::from_str(
///     r#"{ "queue_capacity": 16, "store_failure_policy": { "give_up_after": 10 } }"#,
/// )?;
/// assert_eq!(config.queue_capacity, 16);
/// assert_eq!(config.store_failure_policy, StoreFailurePolicy::GiveUpAfter(10));
/// assert_eq!(config.request_timeout, Duration::from_secs(300));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// How long one issuance request may stay unanswered.
    pub request_timeout: Duration,
    /// Backoff applied between failed cycles.
    pub backoff: BackoffConfig,
    /// Capacity of the inbound message queue.
    pub queue_capacity: usize,
    /// Bound used by [`CertRefresher::shutdown_configured`]; `None` waits indefinitely.
    pub shutdown_timeout: Option<Duration>,
    /// Reaction to repeated store failures.
    pub store_failure_policy: StoreFailurePolicy,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Some(DEFAULT_SHUTDOWN_TIMEOUT),
            store_failure_policy: StoreFailurePolicy::RetryForever,
        }
    }
}

impl RefreshConfig {
    /// Returns a normalized copy of this configuration.
    ///
    /// A zero request timeout falls back to the default, a zero queue capacity becomes 1,
    /// `GiveUpAfter(0)` becomes `GiveUpAfter(1)`, and the backoff is normalized.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        self.queue_capacity = self.queue_capacity.max(1);
        if self.store_failure_policy == StoreFailurePolicy::GiveUpAfter(0) {
            self.store_failure_policy = StoreFailurePolicy::GiveUpAfter(1);
        }
        self.backoff = self.backoff.normalize();
        self
    }
}

/// Builder for [`CertRefresher`].
///
/// # Example
///
/// ```no_run
/// use cert_refresher::refresh::{CertRefresher, CertificateSource, StoreFailurePolicy};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(source: Arc<dyn CertificateSource>) -> Result<(), Box<dyn std::error::Error>> {
/// let refresher = CertRefresher::builder(source)
///     .description("local scanner credentials")
///     .request_timeout(Duration::from_secs(60))
///     .store_failure_policy(StoreFailurePolicy::GiveUpAfter(20))
///     .build();
///
/// let token = CancellationToken::new();
/// refresher.start(&token).await?;
/// # refresher.shutdown_configured().await?;
/// # Ok(())
/// # }
/// ```
pub struct CertRefresherBuilder {
    source: Arc<dyn CertificateSource>,
    description: String,
    config: RefreshConfig,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Debug for CertRefresherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRefresherBuilder")
            .field("source", &"<CertificateSource>")
            .field("description", &self.description)
            .field("config", &self.config)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl CertRefresherBuilder {
    /// Creates a builder driving `source` with default settings.
    pub fn new(source: Arc<dyn CertificateSource>) -> Self {
        Self {
            source,
            description: "certificates".to_string(),
            config: RefreshConfig::default(),
            metrics: None,
        }
    }

    /// Sets the human-readable description used in log lines.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub const fn config(mut self, config: RefreshConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffConfig) -> Self {
        // Normalized in `build`.
        self.config.backoff = backoff;
        self
    }

    /// Sets how long one issuance request may stay unanswered.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the inbound queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the store failure policy.
    #[must_use]
    pub const fn store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.config.store_failure_policy = policy;
        self
    }

    /// Sets the shutdown timeout used by [`CertRefresher::shutdown_configured`].
    ///
    /// Default is 30 seconds.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Sets an optional metrics recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the refresher. Nothing runs until [`CertRefresher::start`].
    pub fn build(self) -> CertRefresher {
        CertRefresher::new_with(
            self.source,
            self.description,
            self.config.normalize(),
            self.metrics,
        )
    }
}
