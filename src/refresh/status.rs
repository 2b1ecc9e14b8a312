use super::errors::RefreshError;
use super::types::RequestId;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Where the refresher currently is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshPhase {
    /// Built but not started.
    Idle,
    /// Dispatching an issuance request.
    Issuing,
    /// Waiting for the response to the outstanding request.
    AwaitingResponse,
    /// Handing issued certificates to the source.
    Storing,
    /// Waiting for the next regular refresh.
    Scheduled,
    /// Waiting to retry a failed cycle.
    BackoffWait,
    /// Terminal.
    Stopped,
}

impl RefreshPhase {
    /// Returns a stable string representation, suitable for logs and metrics labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Issuing => "issuing",
            Self::AwaitingResponse => "awaiting_response",
            Self::Storing => "storing",
            Self::Scheduled => "scheduled",
            Self::BackoffWait => "backoff_wait",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a refresher's state, published on every transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshStatus {
    /// Current phase.
    pub phase: RefreshPhase,
    /// Number of successfully stored certificate sets since start.
    pub revision: u64,
    /// Failed attempts since the last successful cycle.
    pub consecutive_failures: u32,
    /// Delay the currently armed cycle timer was set to, if one is armed.
    pub next_refresh_in: Option<Duration>,
    /// Id of the request awaiting a response, if any.
    pub outstanding_request: Option<RequestId>,
}

impl RefreshStatus {
    pub(super) const fn idle() -> Self {
        Self {
            phase: RefreshPhase::Idle,
            revision: 0,
            consecutive_failures: 0,
            next_refresh_in: None,
            outstanding_request: None,
        }
    }
}

/// Handle for receiving refresh notifications from a [`CertRefresher`](super::CertRefresher).
///
/// The value is the refresher's revision: the number of certificate sets stored successfully.
/// Cloning this handle creates another receiver that shares the same update stream. A slow
/// receiver may skip intermediate revisions.
#[derive(Clone, Debug)]
pub struct RefreshUpdates {
    rx: watch::Receiver<u64>,
}

impl RefreshUpdates {
    pub(super) const fn new(rx: watch::Receiver<u64>) -> Self {
        Self { rx }
    }

    /// Waits for the next successful refresh and returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Closed`] if the refresher has been dropped.
    pub async fn changed(&mut self) -> Result<u64, RefreshError> {
        self.rx.changed().await.map_err(|_| RefreshError::Closed)?;
        Ok(*self.rx.borrow())
    }

    /// Returns the last revision without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the revision satisfies `f`, returning immediately if it already does.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Closed`] if the refresher has been dropped.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, RefreshError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let revision = self.changed().await?;
            if f(&revision) {
                return Ok(revision);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_returns_immediately_when_satisfied() {
        let (_tx, rx) = watch::channel(5u64);
        let mut updates = RefreshUpdates::new(rx);
        assert_eq!(updates.wait_for(|&r| r > 3).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_waits_for_matching_revision() {
        let (tx, rx) = watch::channel(0u64);
        let mut updates = RefreshUpdates::new(rx);

        tokio::spawn(async move {
            for revision in 1..=3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(revision);
            }
        });

        assert_eq!(updates.wait_for(|&r| r >= 3).await.unwrap(), 3);
        assert_eq!(updates.last(), 3);
    }

    #[tokio::test]
    async fn changed_fails_once_sender_is_gone() {
        let (tx, rx) = watch::channel(0u64);
        let mut updates = RefreshUpdates::new(rx);
        drop(tx);
        assert!(matches!(updates.changed().await, Err(RefreshError::Closed)));
    }
}
