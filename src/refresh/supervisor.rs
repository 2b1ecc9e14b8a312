//! The refresher's background task.
//!
//! One task owns every piece of mutable state and processes one message at a time. Timers and
//! response deliveries only enqueue messages; whether a message still matters is decided here,
//! by comparing its request id or timer id against the live one.

use super::builder::StoreFailurePolicy;
use super::errors::{CertificateSourceError, MetricsErrorKind};
use super::refresher::Inner;
use super::status::{RefreshPhase, RefreshStatus};
use super::timer::{rearm, ScheduledTask};
use super::types::{IssueResponse, RequestId};
use crate::cert::{join_service_types, CertificateSet};
use crate::prelude::{debug, error, info, warn};
use crate::retry::{AttemptError, ErrorTracker, Retrier, RetryState, MAX_CONSECUTIVE_SAME_ERROR};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Inbound queue messages.
#[derive(Debug)]
pub(super) enum Message {
    /// Start a cycle now unless a request is outstanding.
    IssueNow,
    /// The cycle timer with this id elapsed.
    RefreshTimerFired(u64),
    /// The request with this id stayed unanswered for the whole request window.
    RequestTimedOut(RequestId),
    /// The remote authority answered.
    Response(IssueResponse),
}

/// Why one issuance cycle failed.
#[derive(Debug, Error)]
pub(super) enum CycleFailure {
    #[error(transparent)]
    Dispatch(CertificateSourceError),
    #[error("remote authority returned an error: {0}")]
    Remote(String),
    #[error(transparent)]
    Store(CertificateSourceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailureKind {
    Dispatch,
    Remote,
    Timeout,
    Rejected,
    Store,
}

impl FailureKind {
    fn of(error: &AttemptError<CycleFailure>) -> Self {
        match error {
            AttemptError::Failed(CycleFailure::Dispatch(_)) => Self::Dispatch,
            AttemptError::Failed(CycleFailure::Remote(_)) => Self::Remote,
            AttemptError::Failed(CycleFailure::Store(_)) => Self::Store,
            AttemptError::TimedOut(_) => Self::Timeout,
            AttemptError::Rejected(_) => Self::Rejected,
        }
    }

    const fn metrics_kind(self) -> MetricsErrorKind {
        match self {
            Self::Dispatch => MetricsErrorKind::Dispatch,
            Self::Remote => MetricsErrorKind::RemoteIssuance,
            Self::Timeout => MetricsErrorKind::RequestTimeout,
            Self::Rejected => MetricsErrorKind::ResultRejected,
            Self::Store => MetricsErrorKind::Store,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InFlight {
    id: RequestId,
    sent_at: Instant,
}

enum Step {
    Continue,
    Stop,
}

fn validate_certificate_set(set: &CertificateSet) -> Result<(), String> {
    if set.is_empty() {
        return Err("certificate set contains no service certificates".to_string());
    }
    Ok(())
}

pub(super) struct Supervisor {
    inner: Arc<Inner>,
    rx: mpsc::Receiver<Message>,
    parent: CancellationToken,

    retrier: Retrier<CertificateSet, CycleFailure>,
    retry: RetryState,
    errors: ErrorTracker<FailureKind>,
    service_types: String,

    phase: RefreshPhase,
    current_request: Option<InFlight>,
    refresh_timer: Option<ScheduledTask>,
    timeout_timer: Option<ScheduledTask>,
    next_timer_id: u64,
    next_refresh_in: Option<Duration>,
    revision: u64,
    store_failures: u32,
}

impl Supervisor {
    pub(super) fn new(
        inner: Arc<Inner>,
        rx: mpsc::Receiver<Message>,
        parent: CancellationToken,
    ) -> Self {
        let mut retrier = Retrier::new(inner.config.backoff)
            .attempt_timeout(inner.config.request_timeout)
            .validate(validate_certificate_set);
        if let Some(metrics) = inner.metrics.clone() {
            retrier = retrier.on_error(move |_, _| metrics.record_retry());
        }
        let retry = retrier.new_state();
        let service_types = join_service_types(&inner.source.service_types());

        Self {
            inner,
            rx,
            parent,
            retrier,
            retry,
            errors: ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR),
            service_types,
            phase: RefreshPhase::Idle,
            current_request: None,
            refresh_timer: None,
            timeout_timer: None,
            next_timer_id: 0,
            next_refresh_in: None,
            revision: 0,
            store_failures: 0,
        }
    }

    pub(super) async fn run(mut self, first_refresh: Duration) {
        let supervisor_id = fastrand::u64(..);
        info!(
            "Starting certificate refresher: description={}, id={}, first_refresh_ms={}",
            self.inner.description,
            supervisor_id,
            first_refresh.as_millis()
        );

        self.schedule_cycle(first_refresh, RefreshPhase::Scheduled);

        loop {
            let message = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                () = self.parent.cancelled() => {
                    debug!("Parent cancellation received; stopping refresher");
                    break;
                }
                m = self.rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };

            if let Step::Stop = self.handle(message).await {
                break;
            }
        }

        self.enter_stopped();
        info!(
            "Certificate refresher stopped: description={}, id={}, revision={}",
            self.inner.description, supervisor_id, self.revision
        );
    }

    async fn handle(&mut self, message: Message) -> Step {
        match message {
            Message::IssueNow => {
                if let Some(in_flight) = &self.current_request {
                    debug!(
                        "Refresh requested while a request is outstanding; ignoring: description={}, request_id={}",
                        self.inner.description, in_flight.id
                    );
                } else {
                    self.issue();
                }
            }
            Message::RefreshTimerFired(timer_id) => {
                if self.refresh_timer.as_ref().map(ScheduledTask::id) != Some(timer_id) {
                    debug!("Ignoring stale refresh timer: timer_id={}", timer_id);
                    return Step::Continue;
                }
                self.refresh_timer = None;
                self.issue();
            }
            Message::RequestTimedOut(request_id) => {
                let Some(in_flight) = self.take_request(request_id) else {
                    debug!(
                        "Ignoring timeout of unknown request: request_id={}",
                        request_id
                    );
                    return Step::Continue;
                };
                self.fail(AttemptError::TimedOut(in_flight.sent_at.elapsed()));
            }
            Message::Response(response) => {
                let request_id = response.request_id();
                if self.take_request(request_id).is_none() {
                    debug!(
                        "Ignoring response to unknown request: request_id={}",
                        request_id
                    );
                    return Step::Continue;
                }
                match response.into_outcome() {
                    Ok(certificates) => match self.retrier.accept(certificates) {
                        Ok(certificates) => return self.store(certificates).await,
                        Err(rejected) => self.fail(rejected),
                    },
                    Err(message) => self.fail(AttemptError::Failed(CycleFailure::Remote(message))),
                }
            }
        }
        Step::Continue
    }

    /// Clears the live request if `id` matches it. The only place the live request ends.
    fn take_request(&mut self, id: RequestId) -> Option<InFlight> {
        if self.current_request.map(|r| r.id) != Some(id) {
            return None;
        }
        self.timeout_timer = None;
        self.current_request.take()
    }

    fn issue(&mut self) {
        self.refresh_timer = None;
        self.next_refresh_in = None;
        self.set_phase(RefreshPhase::Issuing);

        let request_id = RequestId::new();
        if let Err(e) = self.inner.source.request_certificates(request_id) {
            self.fail(AttemptError::Failed(CycleFailure::Dispatch(e)));
            return;
        }

        debug!(
            "Requested certificates: description={}, request_id={}",
            self.inner.description, request_id
        );
        self.current_request = Some(InFlight {
            id: request_id,
            sent_at: Instant::now(),
        });
        if let Some(timeout) = self.retrier.timeout() {
            let timer_id = self.next_timer_id();
            rearm(
                &mut self.timeout_timer,
                ScheduledTask::spawn(
                    timer_id,
                    timeout,
                    self.inner.tx.clone(),
                    Message::RequestTimedOut(request_id),
                ),
            );
        }
        self.set_phase(RefreshPhase::AwaitingResponse);
    }

    async fn store(&mut self, certificates: CertificateSet) -> Step {
        self.set_phase(RefreshPhase::Storing);

        let pending = self.inner.source.handle_certificates(Some(certificates));
        let result = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return Step::Stop,
            () = self.parent.cancelled() => return Step::Stop,
            r = pending => r,
        };

        match result {
            Ok(next_refresh) => {
                self.revision += 1;
                self.store_failures = 0;
                self.errors.reset();
                self.retry.reset(self.retrier.backoff());
                self.inner.record_refresh();
                info!(
                    "Certificates refreshed: description={}, revision={}, next_refresh_ms={}",
                    self.inner.description,
                    self.revision,
                    next_refresh.as_millis()
                );
                self.schedule_cycle(next_refresh, RefreshPhase::Scheduled);
                self.inner.notify_update(self.revision);
                Step::Continue
            }
            Err(e) => {
                self.store_failures = self.store_failures.saturating_add(1);
                if let StoreFailurePolicy::GiveUpAfter(limit) =
                    self.inner.config.store_failure_policy
                {
                    if self.store_failures >= limit {
                        error!(
                            "Failed to store issued certificates; giving up and stopping refresher: description={}, error={}, consecutive_failures={}",
                            self.inner.description, e, self.store_failures
                        );
                        self.inner.record_error(MetricsErrorKind::Store);
                        return Step::Stop;
                    }
                }
                self.fail(AttemptError::Failed(CycleFailure::Store(e)));
                Step::Continue
            }
        }
    }

    /// Records a failed cycle and arms the retry timer.
    fn fail(&mut self, error: AttemptError<CycleFailure>) {
        let kind = FailureKind::of(&error);
        if kind != FailureKind::Store {
            self.store_failures = 0;
        }
        self.inner.record_error(kind.metrics_kind());
        let wait = self.retrier.record_failure(&mut self.retry, &error);
        self.log_failure(kind, &error, wait);
        self.schedule_cycle(wait, RefreshPhase::BackoffWait);
    }

    fn log_failure(&mut self, kind: FailureKind, error: &AttemptError<CycleFailure>, wait: Duration) {
        let description = &self.inner.description;
        let backoff_ms = wait.as_millis();
        let failures = self.retry.failures();

        if kind != FailureKind::Store && !self.errors.record_error(kind) {
            debug!(
                "Certificate refresh failed (repeated); retrying: description={}, error={}, backoff_ms={}, consecutive_failures={}",
                description, error, backoff_ms, failures
            );
            return;
        }

        match kind {
            FailureKind::Store => error!(
                "Failed to store issued certificates; retrying: description={}, error={}, backoff_ms={}, consecutive_failures={}",
                description, error, backoff_ms, failures
            ),
            FailureKind::Remote => error!(
                "Remote authority failed to issue certificates; retrying: description={}, service_types={}, error={}, backoff_ms={}",
                description, self.service_types, error, backoff_ms
            ),
            FailureKind::Timeout => {
                let waited_ms = match error {
                    AttemptError::TimedOut(waited) => waited.as_millis(),
                    _ => 0,
                };
                warn!(
                    "Certificate request timed out; retrying: description={}, waited_ms={}, backoff_ms={}",
                    description, waited_ms, backoff_ms
                );
            }
            FailureKind::Dispatch => warn!(
                "Failed to dispatch certificate request; retrying: description={}, error={}, backoff_ms={}",
                description, error, backoff_ms
            ),
            FailureKind::Rejected => warn!(
                "Issued certificates rejected; retrying: description={}, error={}, backoff_ms={}",
                description, error, backoff_ms
            ),
        }
    }

    /// Arms the cycle timer, replacing any armed one.
    fn schedule_cycle(&mut self, delay: Duration, phase: RefreshPhase) {
        let timer_id = self.next_timer_id();
        rearm(
            &mut self.refresh_timer,
            ScheduledTask::spawn(
                timer_id,
                delay,
                self.inner.tx.clone(),
                Message::RefreshTimerFired(timer_id),
            ),
        );
        self.next_refresh_in = Some(delay);
        self.set_phase(phase);
    }

    fn enter_stopped(&mut self) {
        self.refresh_timer = None;
        self.timeout_timer = None;
        self.current_request = None;
        self.next_refresh_in = None;
        self.set_phase(RefreshPhase::Stopped);
        self.inner.mark_finished();
    }

    fn next_timer_id(&mut self) -> u64 {
        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        self.next_timer_id
    }

    fn set_phase(&mut self, phase: RefreshPhase) {
        self.phase = phase;
        self.inner.publish(RefreshStatus {
            phase,
            revision: self.revision,
            consecutive_failures: self.retry.failures(),
            next_refresh_in: self.next_refresh_in,
            outstanding_request: self.current_request.map(|r| r.id),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::cert::testing::valid_for;
    use crate::cert::{CertificateBundle, ServiceType};
    use crate::refresh::types::HandleFuture;
    use crate::refresh::{CertRefresher, RefreshConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Observable internals, compared before and after a message.
    #[derive(Debug, PartialEq, Eq)]
    struct Snapshot {
        phase: RefreshPhase,
        current_request: Option<InFlight>,
        refresh_timer: Option<u64>,
        timeout_timer: Option<u64>,
        next_timer_id: u64,
        retry: RetryState,
        revision: u64,
        store_failures: u32,
    }

    impl Supervisor {
        fn snapshot(&self) -> Snapshot {
            Snapshot {
                phase: self.phase,
                current_request: self.current_request,
                refresh_timer: self.refresh_timer.as_ref().map(ScheduledTask::id),
                timeout_timer: self.timeout_timer.as_ref().map(ScheduledTask::id),
                next_timer_id: self.next_timer_id,
                retry: self.retry,
                revision: self.revision,
                store_failures: self.store_failures,
            }
        }

        fn live_request(&self) -> RequestId {
            self.current_request.expect("request should be outstanding").id
        }
    }

    #[derive(Default)]
    struct Fake {
        requests: AtomicU32,
        stores: AtomicU32,
    }

    struct FakeSource(Arc<Fake>);

    impl crate::refresh::CertificateSource for FakeSource {
        fn request_certificates(&self, _id: RequestId) -> Result<(), CertificateSourceError> {
            self.0.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_certificates(&self, _set: Option<CertificateSet>) -> HandleFuture {
            let fake = Arc::clone(&self.0);
            Box::pin(async move {
                fake.stores.fetch_add(1, Ordering::SeqCst);
                Ok(Duration::from_secs(3600))
            })
        }
    }

    fn certificates() -> CertificateSet {
        let (ca, _) = valid_for("ca", time::Duration::days(10));
        let (cert, key) = valid_for("sensor", time::Duration::days(1));
        CertificateSet::new(ca)
            .unwrap()
            .with(ServiceType::Sensor, CertificateBundle::from_pem(cert, key).unwrap())
    }

    /// A supervisor wired to a refresher that was never started, driven by hand.
    async fn supervisor() -> (CertRefresher, Supervisor, Arc<Fake>) {
        let fake = Arc::new(Fake::default());
        let refresher = CertRefresher::builder(Arc::new(FakeSource(Arc::clone(&fake))))
            .config(RefreshConfig {
                request_timeout: Duration::from_secs(10),
                backoff: BackoffConfig {
                    initial: Duration::from_secs(1),
                    factor: 2.0,
                    jitter: 0.0,
                    cap: Duration::from_secs(30),
                    max_steps: 10,
                },
                ..RefreshConfig::default()
            })
            .build();
        let rx = refresher.take_receiver().await.unwrap();
        let supervisor = Supervisor::new(
            Arc::clone(refresher.inner()),
            rx,
            CancellationToken::new(),
        );
        (refresher, supervisor, fake)
    }

    #[tokio::test(start_paused = true)]
    async fn response_with_unknown_request_id_changes_nothing() {
        let (_refresher, mut sup, fake) = supervisor().await;
        sup.issue();
        let before = sup.snapshot();
        assert_eq!(before.phase, RefreshPhase::AwaitingResponse);

        let stray = IssueResponse::success(RequestId::new(), certificates());
        assert!(matches!(sup.handle(Message::Response(stray)).await, Step::Continue));
        assert!(matches!(
            sup.handle(Message::RequestTimedOut(RequestId::new())).await,
            Step::Continue
        ));

        assert_eq!(sup.snapshot(), before);
        assert_eq!(fake.stores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_from_abandoned_cycle_is_ignored() {
        let (_refresher, mut sup, fake) = supervisor().await;

        sup.issue();
        let abandoned = sup.live_request();
        sup.handle(Message::RequestTimedOut(abandoned)).await;
        assert_eq!(sup.phase, RefreshPhase::BackoffWait);
        assert_eq!(sup.retry.failures(), 1);

        let timer = sup.refresh_timer.as_ref().unwrap().id();
        sup.handle(Message::RefreshTimerFired(timer)).await;
        let live = sup.live_request();
        assert_ne!(live, abandoned);

        let before = sup.snapshot();
        sup.handle(Message::Response(IssueResponse::success(abandoned, certificates())))
            .await;
        assert_eq!(sup.snapshot(), before);
        assert_eq!(fake.stores.load(Ordering::SeqCst), 0);

        sup.handle(Message::Response(IssueResponse::success(live, certificates())))
            .await;
        assert_eq!(fake.stores.load(Ordering::SeqCst), 1);
        assert_eq!(sup.phase, RefreshPhase::Scheduled);
        assert_eq!(sup.revision, 1);
        assert_eq!(sup.retry.failures(), 0);
        assert!(sup.current_request.is_none());
        assert!(sup.timeout_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_fire_is_ignored() {
        let (_refresher, mut sup, fake) = supervisor().await;
        sup.schedule_cycle(Duration::from_secs(5), RefreshPhase::Scheduled);
        let replaced = sup.refresh_timer.as_ref().unwrap().id();
        sup.schedule_cycle(Duration::from_secs(7), RefreshPhase::Scheduled);

        let before = sup.snapshot();
        sup.handle(Message::RefreshTimerFired(replaced)).await;
        assert_eq!(sup.snapshot(), before);
        assert_eq!(fake.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_refresh_and_one_timeout_timer_fire() {
        let (_refresher, mut sup, _fake) = supervisor().await;

        for secs in 1..=5 {
            sup.schedule_cycle(Duration::from_secs(secs), RefreshPhase::Scheduled);
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        let fired: Vec<_> = std::iter::from_fn(|| sup.rx.try_recv().ok()).collect();
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], Message::RefreshTimerFired(id) if id == sup.next_timer_id));

        // Issuing drops the cycle timer and arms exactly one timeout timer.
        sup.issue();
        assert!(sup.refresh_timer.is_none());
        sup.handle(Message::IssueNow).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let fired: Vec<_> = std::iter::from_fn(|| sup.rx.try_recv().ok()).collect();
        assert_eq!(fired.len(), 1);
        let live = sup.live_request();
        assert!(matches!(&fired[0], Message::RequestTimedOut(id) if *id == live));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_and_failed_responses_back_off_with_growing_waits() {
        let (_refresher, mut sup, fake) = supervisor().await;

        sup.issue();
        let id = sup.live_request();
        let empty = CertificateSet::new(certificates().ca_pem().to_vec()).unwrap();
        sup.handle(Message::Response(IssueResponse::success(id, empty)))
            .await;
        assert_eq!(sup.phase, RefreshPhase::BackoffWait);
        assert_eq!(sup.next_refresh_in, Some(Duration::from_secs(1)));

        sup.issue();
        let id = sup.live_request();
        sup.handle(Message::Response(IssueResponse::failure(id, "ca unavailable")))
            .await;
        assert_eq!(sup.next_refresh_in, Some(Duration::from_secs(2)));
        assert_eq!(sup.retry.failures(), 2);
        assert_eq!(fake.stores.load(Ordering::SeqCst), 0);

        let status = sup.inner.status.load_full();
        assert_eq!(status.phase, RefreshPhase::BackoffWait);
        assert_eq!(status.consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn issue_now_is_ignored_while_request_outstanding() {
        let (_refresher, mut sup, fake) = supervisor().await;
        sup.handle(Message::IssueNow).await;
        let before = sup.snapshot();
        sup.handle(Message::IssueNow).await;
        assert_eq!(sup.snapshot(), before);
        assert_eq!(fake.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_sets_fail_validation() {
        let set = certificates();
        assert!(validate_certificate_set(&set).is_ok());
        let empty = CertificateSet::new(set.ca_pem().to_vec()).unwrap();
        assert!(validate_certificate_set(&empty).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_count_and_reset() {
        struct FailingStore(Mutex<u32>);
        impl crate::refresh::CertificateSource for FailingStore {
            fn request_certificates(&self, _id: RequestId) -> Result<(), CertificateSourceError> {
                Ok(())
            }
            fn handle_certificates(&self, _set: Option<CertificateSet>) -> HandleFuture {
                let mut left = self.0.lock().unwrap();
                let fail = *left > 0;
                *left = left.saturating_sub(1);
                Box::pin(async move {
                    if fail {
                        Err(CertificateSourceError::storage("disk full"))
                    } else {
                        Ok(Duration::from_secs(60))
                    }
                })
            }
        }

        let refresher = CertRefresher::builder(Arc::new(FailingStore(Mutex::new(2)))).build();
        let rx = refresher.take_receiver().await.unwrap();
        let mut sup = Supervisor::new(Arc::clone(refresher.inner()), rx, CancellationToken::new());

        for expected in 1..=2 {
            sup.issue();
            let id = sup.live_request();
            sup.handle(Message::Response(IssueResponse::success(id, certificates())))
                .await;
            assert_eq!(sup.store_failures, expected);
            assert_eq!(sup.phase, RefreshPhase::BackoffWait);
        }

        sup.issue();
        let id = sup.live_request();
        sup.handle(Message::Response(IssueResponse::success(id, certificates())))
            .await;
        assert_eq!(sup.store_failures, 0);
        assert_eq!(sup.phase, RefreshPhase::Scheduled);
        assert_eq!(sup.next_refresh_in, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_separated_by_other_failures_are_not_consecutive() {
        struct AlwaysFailingStore;
        impl crate::refresh::CertificateSource for AlwaysFailingStore {
            fn request_certificates(&self, _id: RequestId) -> Result<(), CertificateSourceError> {
                Ok(())
            }
            fn handle_certificates(&self, _set: Option<CertificateSet>) -> HandleFuture {
                Box::pin(async { Err(CertificateSourceError::storage("disk full")) })
            }
        }

        let refresher = CertRefresher::builder(Arc::new(AlwaysFailingStore))
            .store_failure_policy(StoreFailurePolicy::GiveUpAfter(2))
            .build();
        let rx = refresher.take_receiver().await.unwrap();
        let mut sup = Supervisor::new(Arc::clone(refresher.inner()), rx, CancellationToken::new());

        sup.issue();
        let id = sup.live_request();
        let step = sup
            .handle(Message::Response(IssueResponse::success(id, certificates())))
            .await;
        assert!(matches!(step, Step::Continue));
        assert_eq!(sup.store_failures, 1);

        sup.issue();
        let id = sup.live_request();
        sup.handle(Message::RequestTimedOut(id)).await;
        assert_eq!(sup.store_failures, 0);

        sup.issue();
        let id = sup.live_request();
        let step = sup
            .handle(Message::Response(IssueResponse::success(id, certificates())))
            .await;
        assert!(matches!(step, Step::Continue));
        assert_eq!(sup.store_failures, 1);

        sup.issue();
        let id = sup.live_request();
        let step = sup
            .handle(Message::Response(IssueResponse::success(id, certificates())))
            .await;
        assert!(matches!(step, Step::Stop));
    }

    #[tokio::test]
    async fn service_types_of_the_source_label_failures() {
        struct Labelled;
        impl crate::refresh::CertificateSource for Labelled {
            fn request_certificates(&self, _id: RequestId) -> Result<(), CertificateSourceError> {
                Ok(())
            }
            fn handle_certificates(&self, _set: Option<CertificateSet>) -> HandleFuture {
                Box::pin(async { Ok(Duration::ZERO) })
            }
            fn service_types(&self) -> Vec<ServiceType> {
                vec![ServiceType::Sensor, ServiceType::AdmissionControl]
            }
        }

        let refresher = CertRefresher::builder(Arc::new(Labelled)).build();
        let rx = refresher.take_receiver().await.unwrap();
        let sup = Supervisor::new(Arc::clone(refresher.inner()), rx, CancellationToken::new());
        assert_eq!(sup.service_types, "sensor,admission-control");

        let (_refresher, unlabelled, _fake) = supervisor().await;
        assert_eq!(unlabelled.service_types, "");
    }

}
