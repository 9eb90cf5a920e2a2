use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate_progress::{AggregateProgress, ProgressSnapshot};
use crate::constants::PROGRESS_NOTIFICATION_INTERVAL_MS;
use crate::errors::{MediaProgressError, Result};
use crate::notification_relay::{FinishLatch, NotificationRelay, ProgressPoster};
use crate::unit_progress::UnitProgress;
use crate::UploadProgressDelegate;

/// One tracked upload.
struct WorkUnit<M, E> {
    progress: UnitProgress,
    media: M,
    error: Option<E>,
}

impl<M, E> WorkUnit<M, E> {
    fn is_failed(&self) -> bool {
        !self.progress.is_cancelled() && self.error.is_some()
    }
}

struct CoordinatorState<M, E> {
    /// The current batch.  None while idle.
    aggregate: Option<AggregateProgress>,

    /// Numbers batches so that deliveries queued for an earlier one are told apart.
    batch: u64,

    /// Posts the current batch's progress to the relay.
    poster: Option<ProgressPoster>,

    work_units: HashMap<Arc<str>, WorkUnit<M, E>>,

    /// Set once the finish of the current aggregate has been reported.
    finish_reported: bool,
}

impl<M, E> CoordinatorState<M, E> {
    fn is_running(&self) -> bool {
        let Some(aggregate) = &self.aggregate else {
            return false;
        };

        if aggregate.is_cancelled() {
            return false;
        }

        // With nothing tracked individually, only fast-path completions move the batch along.
        if self.work_units.is_empty() {
            let snapshot = aggregate.snapshot();
            return snapshot.completed_unit_count < snapshot.total_unit_count;
        }

        self.work_units
            .values()
            .any(|unit| !unit.progress.is_cancelled() && !unit.progress.is_complete())
    }

    fn cancel_and_stop_track(&mut self, media_id: &str) {
        let Some(unit) = self.work_units.remove(media_id) else {
            return;
        };

        if !unit.progress.is_complete() {
            debug!("Cancelling upload of media {media_id}");
            unit.progress.cancel();
        }
    }

    /// Drops the aggregate, unsubscribing from it first.  If the batch is done but its finish
    /// has not been reported yet, a delivery still queued for it reports the finish.
    fn detach_aggregate(&mut self) {
        let finish_unreported = !self.finish_reported && !self.is_running();

        if let Some(aggregate) = self.aggregate.take() {
            aggregate.set_observer(None);
        }

        if let Some(poster) = self.poster.take()
            && finish_unreported
        {
            poster.finish_on_delivery();
        }
    }

    fn media_ids_where(&self, predicate: impl Fn(&WorkUnit<M, E>) -> bool) -> Vec<Arc<str>> {
        let mut ids: Vec<Arc<str>> = self
            .work_units
            .iter()
            .filter(|(_, unit)| predicate(unit))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

struct CoordinatorShared<M, E> {
    state: Mutex<CoordinatorState<M, E>>,
}

impl<M, E> FinishLatch for CoordinatorShared<M, E>
where
    M: Send,
    E: Send,
{
    fn claim_finish(&self, batch: u64) -> bool {
        let mut state = self.state.lock();

        if state.aggregate.is_none() || state.batch != batch || state.finish_reported || state.is_running() {
            return false;
        }

        state.finish_reported = true;
        true
    }
}

/// Aggregates the progress of many concurrent media uploads into one fraction and keeps the
/// per-upload bookkeeping (domain object, attached error, cancellation) keyed by media ID.
///
/// The upload orchestration calls `track_items` with the number of items in a batch, then
/// `track_progress` for each upload as it starts, and drives the returned [`UnitProgress`]
/// handles from wherever the transfers run.  Changes to the overall fraction reach the
/// delegate through a single relay task; see [`UploadProgressDelegate`].
///
/// `M` is the domain object stored with each upload and `E` the error type callers attach;
/// both are stored and handed back without interpretation.
///
/// Must be created from within a tokio runtime.
pub struct UploadProgressCoordinator<M, E> {
    shared: Arc<CoordinatorShared<M, E>>,
    relay: NotificationRelay,
}

impl<M, E> UploadProgressCoordinator<M, E>
where
    M: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(delegate: Arc<dyn UploadProgressDelegate>) -> Self {
        Self::with_notification_interval(delegate, Duration::from_millis(*PROGRESS_NOTIFICATION_INTERVAL_MS))
    }

    /// Like `new`, but progress deliveries to the delegate are spaced at least
    /// `notification_interval` apart.
    pub fn with_notification_interval(
        delegate: Arc<dyn UploadProgressDelegate>,
        notification_interval: Duration,
    ) -> Self {
        let shared = Arc::new(CoordinatorShared {
            state: Mutex::new(CoordinatorState {
                aggregate: None,
                batch: 0,
                poster: None,
                work_units: HashMap::new(),
                finish_reported: false,
            }),
        });

        let finish_latch: Weak<dyn FinishLatch> = Arc::downgrade(&shared) as Weak<dyn FinishLatch>;
        let relay = NotificationRelay::spawn(delegate, finish_latch, notification_interval);

        Self { shared, relay }
    }

    /// Declares that `count` more items are expected.
    ///
    /// If the previous batch has stopped running, it is discarded and a new one starts, which
    /// notifies the delegate that uploading started.  While a batch is running, the items are
    /// added to it.
    pub fn track_items(&self, count: u64) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut state = self.shared.state.lock();

        if state.aggregate.is_some() && !state.is_running() {
            debug!("Previous upload batch is idle; starting a new one.");
            state.detach_aggregate();
        }

        let aggregate = match state.aggregate.clone() {
            Some(aggregate) => aggregate,
            None => {
                let aggregate = AggregateProgress::new(0);
                state.batch += 1;

                let poster = self.relay.progress_poster(state.batch);
                let observer_poster = poster.clone();
                aggregate.set_observer(Some(Box::new(move |fraction| observer_poster.post_progress(fraction))));

                state.aggregate = Some(aggregate.clone());
                state.poster = Some(poster);
                state.finish_reported = false;

                info!("Upload started");
                self.relay.post_upload_started();
                aggregate
            },
        };

        aggregate.increment_total_unit_count(count);
        debug!("Tracking {count} more items; total is now {}", aggregate.total_unit_count());
    }

    /// Starts tracking `progress` as the upload of `media` under `media_id`, replacing any
    /// upload already tracked under that ID.  The upload accounts for one of the items declared
    /// through `track_items`.
    ///
    /// Fails, leaving everything unchanged, if no batch has been started or if `progress`
    /// already belongs to a batch.
    pub fn track_progress(&self, progress: UnitProgress, media: M, media_id: impl Into<Arc<str>>) -> Result<()> {
        let media_id = media_id.into();
        let mut state = self.shared.state.lock();

        let Some(aggregate) = state.aggregate.clone() else {
            warn!("Media {media_id} not tracked: no upload batch has been started.");
            return Err(MediaProgressError::NoActiveAggregate {
                media_id: media_id.to_string(),
            });
        };

        if !aggregate.add_child(&progress, 1) {
            warn!("Media {media_id} not tracked: its progress already belongs to a batch.");
            return Err(MediaProgressError::AlreadyAttached {
                media_id: media_id.to_string(),
            });
        }

        let unit = WorkUnit {
            progress,
            media,
            error: None,
        };

        if state.work_units.insert(media_id.clone(), unit).is_some() {
            debug!("Replaced tracked upload of media {media_id}");
        }

        Ok(())
    }

    /// Marks one item as done without tracking it, e.g. media that already existed remotely.
    pub fn finish_one_item(&self) {
        let state = self.shared.state.lock();

        if let Some(aggregate) = &state.aggregate {
            aggregate.increment_completed_unit_count(1);
        }
    }

    pub fn attach_error(&self, error: E, media_id: &str) {
        let mut state = self.shared.state.lock();

        match state.work_units.get_mut(media_id) {
            Some(unit) => {
                debug!("Upload of media {media_id} failed");
                unit.error = Some(error);
            },
            None => debug!("Error for untracked media {media_id} ignored"),
        }
    }

    pub fn error_for(&self, media_id: &str) -> Option<E> {
        self.shared.state.lock().work_units.get(media_id).and_then(|u| u.error.clone())
    }

    pub fn media_for(&self, media_id: &str) -> Option<M> {
        self.shared.state.lock().work_units.get(media_id).map(|u| u.media.clone())
    }

    pub fn progress_for(&self, media_id: &str) -> Option<UnitProgress> {
        self.shared.state.lock().work_units.get(media_id).map(|u| u.progress.clone())
    }

    /// True if `media_id` is tracked and its upload has not completed.
    pub fn is_media_in_progress(&self, media_id: &str) -> bool {
        self.shared
            .state
            .lock()
            .work_units
            .get(media_id)
            .is_some_and(|u| !u.progress.is_complete())
    }

    /// The fraction of the current batch completed; 0 while idle.
    pub fn total_progress(&self) -> f64 {
        self.shared
            .state
            .lock()
            .aggregate
            .as_ref()
            .map_or(0.0, |a| a.fraction_completed())
    }

    /// True while the current batch has work left: a tracked upload that is neither cancelled
    /// nor complete or, if nothing is tracked individually, items not yet completed.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_running()
    }

    pub fn has_failed_media(&self) -> bool {
        self.shared.state.lock().work_units.values().any(WorkUnit::is_failed)
    }

    pub fn cancelled_media_ids(&self) -> Vec<Arc<str>> {
        self.shared.state.lock().media_ids_where(|u| u.progress.is_cancelled())
    }

    /// Tracked uploads that are neither cancelled nor failed.  Includes completed uploads that
    /// have not been untracked yet.
    pub fn in_progress_media_ids(&self) -> Vec<Arc<str>> {
        self.shared
            .state
            .lock()
            .media_ids_where(|u| !u.progress.is_cancelled() && u.error.is_none())
    }

    pub fn failed_media_ids(&self) -> Vec<Arc<str>> {
        self.shared.state.lock().media_ids_where(WorkUnit::is_failed)
    }

    pub fn tracked_media_count(&self) -> usize {
        self.shared.state.lock().work_units.len()
    }

    /// The counts behind `total_progress`; None while idle.
    pub fn aggregate_snapshot(&self) -> Option<ProgressSnapshot> {
        self.shared.state.lock().aggregate.as_ref().map(|a| a.snapshot())
    }

    /// Cancels the upload of `media_id` if it hasn't completed, and stops tracking it either way.
    pub fn cancel_and_stop_track(&self, media_id: &str) {
        self.shared.state.lock().cancel_and_stop_track(media_id);
    }

    /// Cancels and untracks every upload, then cancels the batch itself.
    pub fn cancel_and_stop_all_in_progress_media(&self) {
        let mut state = self.shared.state.lock();

        let media_ids: Vec<Arc<str>> = state.work_units.keys().cloned().collect();
        for media_id in media_ids {
            state.cancel_and_stop_track(&media_id);
        }

        if let Some(aggregate) = &state.aggregate {
            info!("Upload batch cancelled");
            aggregate.cancel();
        }
    }

    /// Forgets every tracked upload.  The batch itself is only dropped if nothing is running;
    /// a running batch keeps its counts and keeps reporting progress.
    pub fn stop_tracking_of_all_media(&self) {
        let mut state = self.shared.state.lock();

        if state.is_running() {
            debug!("Upload batch still running; keeping it while untracking all media.");
        } else {
            state.detach_aggregate();
        }

        state.work_units.clear();
    }

    pub fn stop_tracking_all_failed_media(&self) {
        let mut state = self.shared.state.lock();
        state.work_units.retain(|_, unit| !unit.is_failed());
    }

    /// Waits until every notification posted so far has reached the delegate.
    pub async fn flush(&self) {
        self.relay.flush().await;
    }

    /// Delivers pending notifications and stops the relay.  Queries keep working afterwards,
    /// but the delegate hears nothing more.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if let Some(aggregate) = &state.aggregate {
                aggregate.set_observer(None);
            }
        }

        self.relay.shutdown().await
    }
}
