use super::builder::{CertRefresherBuilder, RefreshConfig};
use super::errors::{MetricsErrorKind, RefreshError};
use super::metrics::MetricsRecorder;
use super::status::{RefreshPhase, RefreshStatus, RefreshUpdates};
use super::supervisor::{Message, Supervisor};
use super::types::{CertificateSource, IssueResponse};
use crate::prelude::{debug, error, info, warn};
use arc_swap::ArcSwap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Self-rescheduling refresher for one set of service certificates.
///
/// After [`CertRefresher::start`] has loaded what is already persisted, a background task
/// keeps the certificates fresh: it requests new ones from the remote authority through the
/// [`CertificateSource`], correlates the answer (delivered via [`ResponseSender`]) with the
/// outstanding request, stores the result, and arms a timer for the next refresh. Failures of
/// any kind are retried with backoff.
///
/// All state transitions happen on that single task, fed by one ordered queue. Callers only
/// enqueue messages or read [`RefreshStatus`] snapshots.
///
/// Dropping the refresher cancels the background task.
pub struct CertRefresher {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) description: String,
    pub(super) source: Arc<dyn CertificateSource>,
    pub(super) config: RefreshConfig,
    pub(super) metrics: Option<Arc<dyn MetricsRecorder>>,

    // Inbound queue. The receiver moves into the background task at start.
    pub(super) tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,

    // Lifecycle.
    closed: AtomicBool,
    finished: AtomicBool,
    pub(super) cancel: CancellationToken,

    // Published state.
    pub(super) status: ArcSwap<RefreshStatus>,
    update_tx: watch::Sender<u64>,
    update_rx: watch::Receiver<u64>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRefresher")
            .field("description", &self.description)
            .field("source", &"<CertificateSource>")
            .field("config", &self.config)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .field("cancel", &self.cancel)
            .field("status", &self.status.load_full())
            .field("supervisor", &"<Mutex<Option<JoinHandle<()>>>>")
            .finish()
    }
}

impl Debug for CertRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Inner {
    pub(super) fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_error(kind);
        }
    }

    pub(super) fn record_refresh(&self) {
        if let Some(metrics) = self.metrics.as_deref() {
            metrics.record_refresh();
        }
    }

    pub(super) fn publish(&self, status: RefreshStatus) {
        self.status.store(Arc::new(status));
    }

    pub(super) fn notify_update(&self, revision: u64) {
        let _ = self.update_tx.send(revision);
    }

    /// Marks the background task as gone. Called by the task itself on exit.
    pub(super) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Ends the refresher when no background task is left to publish the terminal status.
    fn finish_without_task(&self) {
        self.cancel.cancel();
        self.finished.store(true, Ordering::Release);
        let last = self.status.load_full();
        self.publish(RefreshStatus {
            phase: RefreshPhase::Stopped,
            next_refresh_in: None,
            outstanding_request: None,
            ..(*last).clone()
        });
    }
}

impl CertRefresher {
    /// Creates a builder for a refresher driving `source`.
    pub fn builder(source: Arc<dyn CertificateSource>) -> CertRefresherBuilder {
        CertRefresherBuilder::new(source)
    }

    pub(super) fn new_with(
        source: Arc<dyn CertificateSource>,
        description: String,
        config: RefreshConfig,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (update_tx, update_rx) = watch::channel(0u64);

        Self {
            inner: Arc::new(Inner {
                description,
                source,
                config,
                metrics,
                tx,
                rx: Mutex::new(Some(rx)),
                closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                status: ArcSwap::from_pointee(RefreshStatus::idle()),
                update_tx,
                update_rx,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Loads the persisted certificates and starts the background refresh task.
    ///
    /// The refresher stops when `parent` is cancelled or [`CertRefresher::stop`] is called.
    /// Calling `start` again after a successful start has no effect.
    ///
    /// # Errors
    ///
    /// - [`RefreshError::InitialLoad`] if [`CertificateSource::handle_certificates`] fails for
    ///   the persisted state; the refresher is stopped afterwards,
    /// - [`RefreshError::Closed`] if the refresher was stopped before or during start.
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), RefreshError> {
        let mut slot = self.inner.rx.lock().await;
        if self.inner.is_closed() {
            if slot.take().is_some() {
                self.inner.finish_without_task();
            }
            return Err(RefreshError::Closed);
        }
        let Some(rx) = slot.take() else {
            debug!(
                "Refresher already started; ignoring start: description={}",
                self.inner.description
            );
            return Ok(());
        };

        debug!(
            "Loading persisted certificates: description={}",
            self.inner.description
        );
        let loaded = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => None,
            () = parent.cancelled() => None,
            r = self.inner.source.handle_certificates(None) => Some(r),
        };

        let first_refresh = match loaded {
            None => {
                self.inner.finish_without_task();
                return Err(RefreshError::Closed);
            }
            Some(Ok(delay)) => delay,
            Some(Err(e)) => {
                error!(
                    "Initial certificate load failed; refresher not started: description={}, error={}",
                    self.inner.description, e
                );
                self.inner.record_error(MetricsErrorKind::InitialLoad);
                self.inner.finish_without_task();
                return Err(RefreshError::InitialLoad(e));
            }
        };

        let supervisor = Supervisor::new(Arc::clone(&self.inner), rx, parent.clone());
        let handle = tokio::spawn(supervisor.run(first_refresh));
        *self.inner.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Requests the refresher to stop. Returns immediately.
    ///
    /// Pending timers are cancelled, the outstanding request (if any) is abandoned, and no
    /// further issuance happens. Safe to call multiple times, and before `start`.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(
                "Stopping certificate refresher: description={}",
                self.inner.description
            );
        }
        self.inner.cancel.cancel();

        // Never started: the receiver is still parked here and no task will see the token.
        if let Ok(mut slot) = self.inner.rx.try_lock() {
            if slot.take().is_some() {
                self.inner.finish_without_task();
            }
        }
    }

    /// Returns `true` once the refresher has stopped or been asked to stop.
    ///
    /// This covers [`CertRefresher::stop`], cancellation of the parent token, a failed start,
    /// and giving up under [`StoreFailurePolicy::GiveUpAfter`](super::StoreFailurePolicy::GiveUpAfter).
    pub fn stopped(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.finished.load(Ordering::Acquire)
    }

    /// Asks for an immediate refresh cycle.
    ///
    /// Ignored by the background task while a request is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::QueueFull`] if the queue is full, or [`RefreshError::Closed`] if
    /// the refresher has stopped.
    pub fn refresh_now(&self) -> Result<(), RefreshError> {
        if self.stopped() {
            return Err(RefreshError::Closed);
        }
        try_enqueue(&self.inner.tx, Message::IssueNow)
    }

    /// Returns a handle for delivering issuance responses.
    pub fn response_sender(&self) -> ResponseSender {
        ResponseSender {
            tx: self.inner.tx.clone(),
        }
    }

    /// Returns the latest status snapshot.
    pub fn status(&self) -> Arc<RefreshStatus> {
        self.inner.status.load_full()
    }

    /// Returns a handle for receiving refresh notifications.
    ///
    /// The initial revision is 0; loading persisted certificates at start does not notify.
    pub fn updated(&self) -> RefreshUpdates {
        RefreshUpdates::new(self.inner.update_rx.clone())
    }

    /// The description given at construction.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Stops the refresher and waits until its background task has exited.
    ///
    /// Later calls return immediately. The wait is unbounded; use
    /// [`CertRefresher::shutdown_with_timeout`] to cap it.
    pub async fn shutdown(&self) {
        if let Some(task) = self.begin_shutdown().await {
            self.check_join(task.await);
        }
    }

    /// Stops the refresher and gives its background task `timeout` to exit before aborting it.
    ///
    /// Later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::ShutdownTimeout`] if the task was aborted.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), RefreshError> {
        let Some(mut task) = self.begin_shutdown().await else {
            return Ok(());
        };

        if let Ok(joined) = tokio::time::timeout(timeout, &mut task).await {
            self.check_join(joined);
            return Ok(());
        }

        warn!(
            "Refresher task did not exit in time; aborting it: description={}, timeout_ms={}",
            self.inner.description,
            timeout.as_millis()
        );
        task.abort();
        // The only expected outcome is the cancellation caused by `abort`.
        let _ = task.await;
        self.inner.finish_without_task();
        Err(RefreshError::ShutdownTimeout)
    }

    /// [`CertRefresher::shutdown_with_timeout`] with [`RefreshConfig::shutdown_timeout`], or
    /// [`CertRefresher::shutdown`] when that is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::ShutdownTimeout`] if the task was aborted.
    pub async fn shutdown_configured(&self) -> Result<(), RefreshError> {
        match self.inner.config.shutdown_timeout {
            Some(timeout) => self.shutdown_with_timeout(timeout).await,
            None => {
                self.shutdown().await;
                Ok(())
            }
        }
    }

    /// Closes and stops the refresher. Hands out the background task on the first call only.
    async fn begin_shutdown(&self) -> Option<JoinHandle<()>> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.stop();
        self.inner.supervisor.lock().await.take()
    }

    fn check_join(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(
                "Refresher task ended abnormally: description={}, error={}",
                self.inner.description, e
            );
            self.inner.record_error(MetricsErrorKind::SupervisorJoinFailed);
            self.inner.finish_without_task();
        }
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    #[cfg(test)]
    pub(super) async fn take_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.rx.lock().await.take()
    }
}

impl Drop for CertRefresher {
    fn drop(&mut self) {
        // Best-effort cancellation. Do not block in Drop.
        self.inner.cancel.cancel();
    }
}

/// Cloneable handle delivering [`IssueResponse`]s into a refresher's queue.
///
/// Responses are correlated by request id inside the refresher; delivering a stale or unknown
/// response is harmless.
#[derive(Clone, Debug)]
pub struct ResponseSender {
    tx: mpsc::Sender<Message>,
}

impl ResponseSender {
    /// Enqueues `response`, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Closed`] if the refresher's task has exited.
    pub async fn deliver(&self, response: IssueResponse) -> Result<(), RefreshError> {
        self.tx
            .send(Message::Response(response))
            .await
            .map_err(|_| RefreshError::Closed)
    }

    /// Enqueues `response` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::QueueFull`] if the queue is full, or [`RefreshError::Closed`] if
    /// the refresher's task has exited.
    pub fn try_deliver(&self, response: IssueResponse) -> Result<(), RefreshError> {
        try_enqueue(&self.tx, Message::Response(response))
    }
}

fn try_enqueue(tx: &mpsc::Sender<Message>, message: Message) -> Result<(), RefreshError> {
    tx.try_send(message).map_err(|e| match e {
        TrySendError::Full(_) => RefreshError::QueueFull,
        TrySendError::Closed(_) => RefreshError::Closed,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::cert::testing::valid_for;
    use crate::cert::{CertificateBundle, CertificateSet, ServiceType};
    use crate::refresh::{CertificateSourceError, HandleFuture, RequestId, StoreFailurePolicy};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use tokio::time::Instant;

    /// Scriptable source: counts calls and hands successfully dispatched request ids to the test.
    struct Script {
        initial_error: std::sync::Mutex<Option<CertificateSourceError>>,
        dispatch_failures: AtomicU32,
        fail_stores: AtomicBool,
        next_refresh: Duration,
        attempts: std::sync::Mutex<Vec<Instant>>,
        stores: AtomicU32,
        issued: mpsc::UnboundedSender<RequestId>,
    }

    impl Script {
        fn new(next_refresh: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<RequestId>) {
            let (issued, rx) = mpsc::unbounded_channel();
            let script = Self {
                initial_error: std::sync::Mutex::new(None),
                dispatch_failures: AtomicU32::new(0),
                fail_stores: AtomicBool::new(false),
                next_refresh,
                attempts: std::sync::Mutex::new(Vec::new()),
                stores: AtomicU32::new(0),
                issued,
            };
            (Arc::new(script), rx)
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn stores(&self) -> u32 {
            self.stores.load(Ordering::SeqCst)
        }
    }

    struct ScriptedSource(Arc<Script>);

    impl CertificateSource for ScriptedSource {
        fn request_certificates(&self, request_id: RequestId) -> Result<(), CertificateSourceError> {
            self.0.attempts.lock().unwrap().push(Instant::now());
            if self.0.dispatch_failures.load(Ordering::SeqCst) > 0 {
                self.0.dispatch_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CertificateSourceError::dispatch("connection refused"));
            }
            self.0.issued.send(request_id).unwrap();
            Ok(())
        }

        fn handle_certificates(&self, certificates: Option<CertificateSet>) -> HandleFuture {
            let script = Arc::clone(&self.0);
            Box::pin(async move {
                if certificates.is_none() {
                    return match script.initial_error.lock().unwrap().take() {
                        Some(e) => Err(e),
                        None => Ok(Duration::ZERO),
                    };
                }
                script.stores.fetch_add(1, Ordering::SeqCst);
                if script.fail_stores.load(Ordering::SeqCst) {
                    return Err(CertificateSourceError::storage("secret store unavailable"));
                }
                Ok(script.next_refresh)
            })
        }
    }

    #[derive(Default)]
    struct TestMetrics {
        refreshes: AtomicU64,
        retries: AtomicU64,
        errors: std::sync::Mutex<HashMap<MetricsErrorKind, u64>>,
    }

    impl TestMetrics {
        fn errors(&self, kind: MetricsErrorKind) -> u64 {
            *self.errors.lock().unwrap().get(&kind).unwrap_or(&0)
        }
    }

    impl MetricsRecorder for TestMetrics {
        fn record_refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        fn record_retry(&self) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
        fn record_error(&self, kind: MetricsErrorKind) {
            *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
        }
    }

    fn certificates() -> CertificateSet {
        let (ca, _) = valid_for("ca", time::Duration::days(10));
        let (cert, key) = valid_for("scanner-db", time::Duration::days(1));
        CertificateSet::new(ca).unwrap().with(
            ServiceType::ScannerDb,
            CertificateBundle::from_pem(cert, key).unwrap(),
        )
    }

    fn config() -> RefreshConfig {
        RefreshConfig {
            request_timeout: Duration::from_secs(10),
            backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                factor: 2.0,
                jitter: 0.0,
                cap: Duration::from_secs(4),
                max_steps: 10,
            },
            ..RefreshConfig::default()
        }
    }

    fn refresher(script: &Arc<Script>, metrics: &Arc<TestMetrics>) -> CertRefresher {
        CertRefresher::builder(Arc::new(ScriptedSource(Arc::clone(script))))
            .description("test certificates")
            .config(config())
            .metrics(Arc::clone(metrics) as Arc<dyn MetricsRecorder>)
            .build()
    }

    /// Lets the background task drain its queue without reaching any armed timer.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_first_cycle_schedules_next_refresh_without_retries() {
        let (script, mut issued) = Script::new(Duration::from_secs(2));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let mut updates = refresher.updated();

        refresher.start(&CancellationToken::new()).await.unwrap();
        let id = issued.recv().await.unwrap();
        refresher
            .response_sender()
            .deliver(IssueResponse::success(id, certificates()))
            .await
            .unwrap();

        assert_eq!(updates.changed().await.unwrap(), 1);
        let status = refresher.status();
        assert_eq!(status.phase, RefreshPhase::Scheduled);
        assert_eq!(status.next_refresh_in, Some(Duration::from_secs(2)));
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.outstanding_request, None);

        assert_eq!(script.attempts().len(), 1);
        assert_eq!(script.stores(), 1);
        assert_eq!(metrics.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.retries.load(Ordering::SeqCst), 0);

        refresher.shutdown().await;
        assert!(refresher.stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_errors_are_retried_with_non_decreasing_gaps() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        script.dispatch_failures.store(2, Ordering::SeqCst);
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);

        refresher.start(&CancellationToken::new()).await.unwrap();
        let id = issued.recv().await.unwrap();

        let attempts = script.attempts();
        assert_eq!(attempts.len(), 3);
        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert!(first_gap >= Duration::from_secs(1), "{first_gap:?}");
        assert!(second_gap >= first_gap, "{first_gap:?} then {second_gap:?}");
        assert_eq!(metrics.errors(MetricsErrorKind::Dispatch), 2);
        assert_eq!(metrics.retries.load(Ordering::SeqCst), 2);

        let mut updates = refresher.updated();
        refresher
            .response_sender()
            .deliver(IssueResponse::success(id, certificates()))
            .await
            .unwrap();
        assert_eq!(updates.changed().await.unwrap(), 1);
        assert_eq!(script.stores(), 1);
        assert_eq!(refresher.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_are_retried_indefinitely_by_default() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        script.fail_stores.store(true, Ordering::SeqCst);
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let responses = refresher.response_sender();

        refresher.start(&CancellationToken::new()).await.unwrap();
        for _ in 0..6 {
            let id = issued.recv().await.unwrap();
            responses
                .deliver(IssueResponse::success(id, certificates()))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(script.stores(), 6);
        assert_eq!(metrics.errors(MetricsErrorKind::Store), 6);
        assert!(!refresher.stopped());
        let status = refresher.status();
        assert_eq!(status.phase, RefreshPhase::BackoffWait);
        assert_eq!(status.consecutive_failures, 6);
        assert_eq!(status.revision, 0);
        assert_eq!(status.next_refresh_in, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_configured_store_failures() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        script.fail_stores.store(true, Ordering::SeqCst);
        let refresher = CertRefresher::builder(Arc::new(ScriptedSource(Arc::clone(&script))))
            .config(config())
            .store_failure_policy(StoreFailurePolicy::GiveUpAfter(2))
            .build();
        let responses = refresher.response_sender();

        refresher.start(&CancellationToken::new()).await.unwrap();
        for _ in 0..2 {
            let id = issued.recv().await.unwrap();
            responses
                .deliver(IssueResponse::success(id, certificates()))
                .await
                .unwrap();
        }
        settle().await;

        assert!(refresher.stopped());
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert!(matches!(
            responses
                .deliver(IssueResponse::failure(RequestId::new(), "late"))
                .await,
            Err(RefreshError::Closed)
        ));
        assert!(matches!(refresher.refresh_now(), Err(RefreshError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_request_id_has_no_observable_effect() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let responses = refresher.response_sender();

        refresher.start(&CancellationToken::new()).await.unwrap();
        let id = issued.recv().await.unwrap();
        settle().await;
        let before = refresher.status();
        assert_eq!(before.phase, RefreshPhase::AwaitingResponse);
        assert_eq!(before.outstanding_request, Some(id));

        responses
            .try_deliver(IssueResponse::success(RequestId::new(), certificates()))
            .unwrap();
        settle().await;

        assert_eq!(*refresher.status(), *before);
        assert_eq!(script.stores(), 0);
        assert_eq!(script.attempts().len(), 1);
        assert!(issued.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_is_retried_and_its_late_response_ignored() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let responses = refresher.response_sender();
        let mut updates = refresher.updated();

        refresher.start(&CancellationToken::new()).await.unwrap();
        let abandoned = issued.recv().await.unwrap();
        let started = Instant::now();
        let live = issued.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(11));
        assert_ne!(abandoned, live);
        assert_eq!(metrics.errors(MetricsErrorKind::RequestTimeout), 1);

        responses
            .deliver(IssueResponse::success(abandoned, certificates()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(script.stores(), 0);

        responses
            .deliver(IssueResponse::success(live, certificates()))
            .await
            .unwrap();
        assert_eq!(updates.changed().await.unwrap(), 1);
        assert_eq!(script.stores(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_safe_before_start() {
        let (script, _issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);

        refresher.stop();
        refresher.stop();
        assert!(refresher.stopped());
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert!(matches!(
            refresher.start(&CancellationToken::new()).await,
            Err(RefreshError::Closed)
        ));
        refresher.shutdown().await;
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert!(script.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_start_reports_stopped() {
        let (script, _issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let updates = refresher.updated();

        refresher
            .shutdown_with_timeout(Duration::from_secs(1))
            .await
            .unwrap();

        assert!(refresher.stopped());
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert_eq!(updates.last(), 0);
        assert!(matches!(
            refresher.start(&CancellationToken::new()).await,
            Err(RefreshError::Closed)
        ));
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_outstanding_request_and_halts_issuance() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let responses = refresher.response_sender();

        refresher.start(&CancellationToken::new()).await.unwrap();
        let id = issued.recv().await.unwrap();

        refresher.stop();
        refresher.stop();
        refresher
            .shutdown_with_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert_eq!(refresher.status().outstanding_request, None);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(script.attempts().len(), 1);
        assert!(responses
            .deliver(IssueResponse::success(id, certificates()))
            .await
            .is_err());
        assert_eq!(script.stores(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_failure_aborts_start() {
        let (script, _issued) = Script::new(Duration::from_secs(3600));
        *script.initial_error.lock().unwrap() =
            Some(CertificateSourceError::storage("secret owned by someone else"));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);

        let err = refresher
            .start(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::InitialLoad(_)));
        assert!(refresher.stopped());
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
        assert_eq!(metrics.errors(MetricsErrorKind::InitialLoad), 1);
        assert!(script.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_a_no_op() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let token = CancellationToken::new();

        refresher.start(&token).await.unwrap();
        refresher.start(&token).await.unwrap();
        issued.recv().await.unwrap();
        settle().await;
        assert_eq!(script.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_the_refresher() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let token = CancellationToken::new();

        refresher.start(&token).await.unwrap();
        issued.recv().await.unwrap();
        token.cancel();
        settle().await;

        assert!(refresher.stopped());
        assert_eq!(refresher.status().phase, RefreshPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_now_starts_a_cycle_unless_one_is_outstanding() {
        let (script, mut issued) = Script::new(Duration::from_secs(3600));
        let metrics = Arc::new(TestMetrics::default());
        let refresher = refresher(&script, &metrics);
        let mut updates = refresher.updated();

        refresher.start(&CancellationToken::new()).await.unwrap();
        let id = issued.recv().await.unwrap();
        refresher
            .response_sender()
            .deliver(IssueResponse::success(id, certificates()))
            .await
            .unwrap();
        updates.changed().await.unwrap();

        let forced_at = Instant::now();
        refresher.refresh_now().unwrap();
        issued.recv().await.unwrap();
        assert!(forced_at.elapsed() < Duration::from_secs(1));

        refresher.refresh_now().unwrap();
        settle().await;
        assert_eq!(script.attempts().len(), 2);
        assert_eq!(refresher.status().phase, RefreshPhase::AwaitingResponse);
    }
}
