use super::errors::MetricsErrorKind;

/// Trait for recording metrics from a [`CertRefresher`](super::CertRefresher).
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// Prefer stable, low-cardinality labels when recording metrics.
///
/// # Example
///
/// ```no_run
/// use cert_refresher::refresh::{MetricsErrorKind, MetricsRecorder};
/// use std::sync::Arc;
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_refresh(&self) {}
///
///     fn record_retry(&self) {}
///
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("Error: {}", kind.as_str());
///     }
/// }
///
/// let metrics = Arc::new(MyMetrics);
/// // Use with CertRefresherBuilder::metrics()
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records that issued certificates were stored successfully.
    fn record_refresh(&self);

    /// Records that a failed cycle is about to be retried after a backoff wait.
    ///
    /// Recorded exactly once per backoff wait, regardless of the failure kind.
    fn record_retry(&self);

    /// Records an error with a structured error kind.
    fn record_error(&self, kind: MetricsErrorKind);
}
