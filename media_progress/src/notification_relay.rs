use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::UploadProgressDelegate;
use crate::errors::{Result, map_join_error};

pub(crate) enum Notification {
    UploadStarted,
    ProgressChanged { batch: u64, pending: Arc<PendingProgress> },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Asked by the relay after each progress delivery for `batch` whether that batch is done.
/// Returns true exactly once per batch, when nothing is running any more.
pub(crate) trait FinishLatch: Send + Sync {
    fn claim_finish(&self, batch: u64) -> bool;
}

/// Holds the most recent fraction of one batch until the relay picks it up.
#[derive(Default)]
pub(crate) struct PendingProgress {
    fraction_bits: AtomicU64,
    scheduled: AtomicBool,

    /// Set when the batch was dropped after it stopped running but before its finish was
    /// reported; the next delivery for it reports the finish.
    finish_on_delivery: AtomicBool,
}

impl PendingProgress {
    /// Stores the fraction; returns true if the caller must schedule a delivery.
    fn store(&self, fraction: f64) -> bool {
        self.fraction_bits.store(fraction.to_bits(), Ordering::SeqCst);
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    fn take(&self) -> f64 {
        // Clear first so a store racing with us schedules another delivery rather than being lost.
        self.scheduled.store(false, Ordering::SeqCst);
        f64::from_bits(self.fraction_bits.load(Ordering::SeqCst))
    }

    fn take_finish_on_delivery(&self) -> bool {
        self.finish_on_delivery.swap(false, Ordering::SeqCst)
    }
}

/// Posts the progress changes of one batch from any thread onto the relay queue, coalescing
/// updates that arrive before the relay gets to them.
#[derive(Clone)]
pub(crate) struct ProgressPoster {
    sender: mpsc::UnboundedSender<Notification>,
    batch: u64,
    pending: Arc<PendingProgress>,
}

impl ProgressPoster {
    pub(crate) fn post_progress(&self, fraction: f64) {
        if !self.pending.store(fraction) {
            return;
        }

        let notification = Notification::ProgressChanged {
            batch: self.batch,
            pending: self.pending.clone(),
        };

        if self.sender.send(notification).is_err() {
            // The relay is gone; nothing will ever be delivered.
            self.pending.scheduled.store(false, Ordering::SeqCst);
        }
    }

    /// Makes a delivery still queued for this batch report the finish once it has been
    /// delivered.  No-op if nothing is queued.
    pub(crate) fn finish_on_delivery(&self) {
        self.pending.finish_on_delivery.store(true, Ordering::SeqCst);
    }
}

/// The single context on which delegate callbacks run.
///
/// Producers on arbitrary threads post into an unbounded queue; one spawned task drains it and
/// calls the delegate, so callbacks never overlap and arrive in posting order.
pub(crate) struct NotificationRelay {
    sender: mpsc::UnboundedSender<Notification>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationRelay {
    /// Spawns the relay task on the current tokio runtime.
    pub(crate) fn spawn(
        delegate: Arc<dyn UploadProgressDelegate>,
        finish_latch: Weak<dyn FinishLatch>,
        notification_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_relay(receiver, delegate, finish_latch, notification_interval));

        Self {
            sender,
            task: Mutex::new(Some(task)),
        }
    }

    /// A poster for the progress of `batch`, with its own pending slot.
    pub(crate) fn progress_poster(&self, batch: u64) -> ProgressPoster {
        ProgressPoster {
            sender: self.sender.clone(),
            batch,
            pending: Arc::new(PendingProgress::default()),
        }
    }

    pub(crate) fn post_upload_started(&self) {
        if self.sender.send(Notification::UploadStarted).is_err() {
            debug!("Upload start not delivered; notification relay has shut down.");
        }
    }

    /// Waits until everything posted before this call has been delivered.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(Notification::Flush(done_tx)).is_err() {
            return;
        }
        // An error here means the relay stopped; there is nothing left to wait for.
        let _ = done_rx.await;
    }

    /// Delivers everything already posted, then stops the relay task.  Later posts are dropped.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let _ = self.sender.send(Notification::Shutdown);

        let task = self.task.lock().take();

        match task {
            Some(task) => task.await.map_err(map_join_error),
            None => Ok(()),
        }
    }
}

async fn run_relay(
    mut receiver: mpsc::UnboundedReceiver<Notification>,
    delegate: Arc<dyn UploadProgressDelegate>,
    finish_latch: Weak<dyn FinishLatch>,
    notification_interval: Duration,
) {
    let mut last_delivery: Option<Instant> = None;

    while let Some(notification) = receiver.recv().await {
        match notification {
            Notification::UploadStarted => delegate.did_start_uploading().await,
            Notification::ProgressChanged { batch, pending } => {
                if !notification_interval.is_zero()
                    && let Some(last) = last_delivery
                {
                    tokio::time::sleep_until(last + notification_interval).await;
                }

                let fraction = pending.take();
                delegate.progress_did_change(fraction as f32).await;
                last_delivery = Some(Instant::now());

                // Check the latch first: a batch dropped while we were delivering sets
                // finish_on_delivery before the latch stops recognizing it.
                let finished = finish_latch.upgrade().is_some_and(|latch| latch.claim_finish(batch))
                    || pending.take_finish_on_delivery();
                if finished {
                    info!("Upload finished");
                    delegate.did_finish_upload().await;
                }
            },
            Notification::Flush(done) => {
                let _ = done.send(());
            },
            Notification::Shutdown => break,
        }
    }

    debug!("Upload notification relay stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::verification_wrapper::{DelegateEvent, DelegateVerificationWrapper};
    use crate::NoOpUploadDelegate;

    #[derive(Default)]
    struct CountingLatch {
        claims: AtomicUsize,
        finished: AtomicBool,
    }

    impl FinishLatch for CountingLatch {
        fn claim_finish(&self, _batch: u64) -> bool {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.finished.swap(false, Ordering::SeqCst)
        }
    }

    #[test]
    fn test_pending_progress_coalesces() {
        let pending = PendingProgress::default();
        assert!(pending.store(0.1));
        assert!(!pending.store(0.2));
        assert!(!pending.store(0.3));
        assert_eq!(pending.take(), 0.3);
        assert!(pending.store(0.4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_delivers_in_order() {
        let verifier = DelegateVerificationWrapper::new(NoOpUploadDelegate::new());
        let latch = Arc::new(CountingLatch::default());
        let weak_latch: Weak<dyn FinishLatch> = Arc::downgrade(&latch) as Weak<dyn FinishLatch>;
        let relay = NotificationRelay::spawn(verifier.clone(), weak_latch, Duration::ZERO);

        relay.post_upload_started();
        let poster = relay.progress_poster(0);
        poster.post_progress(0.5);
        relay.flush().await;

        latch.finished.store(true, Ordering::SeqCst);
        poster.post_progress(1.0);
        relay.flush().await;

        // Further progress after the finish has been claimed does not finish again.
        poster.post_progress(1.0);
        relay.flush().await;

        assert_eq!(
            verifier.events(),
            vec![
                DelegateEvent::UploadStarted,
                DelegateEvent::ProgressChanged(0.5),
                DelegateEvent::ProgressChanged(1.0),
                DelegateEvent::UploadFinished,
                DelegateEvent::ProgressChanged(1.0),
            ]
        );
        assert_eq!(latch.claims.load(Ordering::SeqCst), 3);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_posts_after_shutdown_are_dropped() {
        let verifier = DelegateVerificationWrapper::new(NoOpUploadDelegate::new());
        let latch = Arc::new(CountingLatch::default());
        let weak_latch: Weak<dyn FinishLatch> = Arc::downgrade(&latch) as Weak<dyn FinishLatch>;
        let relay = NotificationRelay::spawn(verifier.clone(), weak_latch, Duration::ZERO);

        relay.post_upload_started();
        relay.shutdown().await.unwrap();

        relay.post_upload_started();
        relay.progress_poster(0).post_progress(0.7);
        relay.flush().await;

        // A second shutdown is a no-op.
        relay.shutdown().await.unwrap();
        assert_eq!(verifier.events(), vec![DelegateEvent::UploadStarted]);
    }

    #[tokio::test]
    async fn test_interval_throttles_deliveries() {
        tokio::time::pause();

        let verifier = DelegateVerificationWrapper::new(NoOpUploadDelegate::new());
        let latch = Arc::new(CountingLatch::default());
        let weak_latch: Weak<dyn FinishLatch> = Arc::downgrade(&latch) as Weak<dyn FinishLatch>;
        let relay = NotificationRelay::spawn(verifier.clone(), weak_latch, Duration::from_millis(100));

        relay.post_upload_started();
        let poster = relay.progress_poster(0);
        poster.post_progress(0.1);
        relay.flush().await;

        let start = Instant::now();
        poster.post_progress(0.2);
        poster.post_progress(0.3);
        relay.flush().await;

        // The second delivery waited out the interval and carries only the latest value.
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(
            verifier.events(),
            vec![
                DelegateEvent::UploadStarted,
                DelegateEvent::ProgressChanged(0.1),
                DelegateEvent::ProgressChanged(0.3),
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_on_delivery_for_dropped_batch() {
        let verifier = DelegateVerificationWrapper::new(NoOpUploadDelegate::new());
        let latch = Arc::new(CountingLatch::default());
        let weak_latch: Weak<dyn FinishLatch> = Arc::downgrade(&latch) as Weak<dyn FinishLatch>;
        let relay = NotificationRelay::spawn(verifier.clone(), weak_latch, Duration::ZERO);

        relay.post_upload_started();
        let old_batch = relay.progress_poster(0);
        old_batch.post_progress(1.0);
        old_batch.finish_on_delivery();

        // A new batch gets its own slot; its first value does not leak into the old delivery.
        relay.post_upload_started();
        let new_batch = relay.progress_poster(1);
        new_batch.post_progress(0.2);
        relay.flush().await;

        assert_eq!(
            verifier.events(),
            vec![
                DelegateEvent::UploadStarted,
                DelegateEvent::ProgressChanged(1.0),
                DelegateEvent::UploadFinished,
                DelegateEvent::UploadStarted,
                DelegateEvent::ProgressChanged(0.2),
            ]
        );

        // The flag is consumed by the delivery.
        old_batch.post_progress(0.9);
        relay.flush().await;
        assert_eq!(verifier.n_finished(), 1);
    }
}
