//! Cancellable one-shot timers that deliver a message into the refresher queue.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A pending timer. Dropping it cancels the timer.
///
/// Each task carries an id chosen by its owner, so a fire that was already queued before the
/// timer got replaced can be recognized as stale.
#[derive(Debug)]
pub(super) struct ScheduledTask {
    id: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Sends `message` on `tx` once `delay` has elapsed.
    pub(super) fn spawn<M>(id: u64, delay: Duration, tx: mpsc::Sender<M>, message: M) -> Self
    where
        M: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A closed queue means the refresher is gone; nothing left to notify.
            let _ = tx.send(message).await;
        });
        Self { id, handle }
    }

    pub(super) const fn id(&self) -> u64 {
        self.id
    }

}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Replaces the task in `slot`, cancelling the previous one first.
pub(super) fn rearm(slot: &mut Option<ScheduledTask>, task: ScheduledTask) {
    drop(slot.take());
    *slot = Some(task);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::channel(4);
        let task = ScheduledTask::spawn(7, Duration::from_secs(5), tx, "fired");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some("fired"));
        assert_eq!(task.id(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_the_previous_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = None;

        rearm(
            &mut slot,
            ScheduledTask::spawn(1, Duration::from_secs(1), tx.clone(), 1u64),
        );
        rearm(
            &mut slot,
            ScheduledTask::spawn(2, Duration::from_secs(3), tx.clone(), 2u64),
        );
        drop(tx);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.recv().await, Some(2));
        drop(slot);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = ScheduledTask::spawn(1, Duration::from_millis(10), tx, ());
        drop(task);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await, None);
    }
}
