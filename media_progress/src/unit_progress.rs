use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::aggregate_progress::AggregateInner;

/// Where a unit reports its updates to.
pub(crate) struct ParentLink {
    pub(crate) aggregate: Weak<AggregateInner>,
    pub(crate) child_id: u64,
}

struct UnitProgressInner {
    completed_unit_count: AtomicI64,
    total_unit_count: AtomicI64,
    cancellation: CancellationToken,
    parent: Mutex<Option<ParentLink>>,
}

/// The progress of a single unit of work, e.g. one media upload.
///
/// This is a cheap, cloneable handle; the upload task keeps one clone and drives it from whatever
/// thread it runs on, while the coordinator keeps another to answer queries.  Both counts only
/// ever increase.  Cancellation is cooperative: cancelling marks the handle and wakes anything
/// waiting on [`UnitProgress::cancelled`], but it is up to the upload task to stop its I/O.
#[derive(Clone)]
pub struct UnitProgress {
    inner: Arc<UnitProgressInner>,
}

impl UnitProgress {
    pub fn new(total_unit_count: i64) -> Self {
        Self {
            inner: Arc::new(UnitProgressInner {
                completed_unit_count: AtomicI64::new(0),
                total_unit_count: AtomicI64::new(total_unit_count.max(0)),
                cancellation: CancellationToken::new(),
                parent: Mutex::new(None),
            }),
        }
    }

    pub fn completed_unit_count(&self) -> i64 {
        self.inner.completed_unit_count.load(Ordering::Acquire)
    }

    pub fn total_unit_count(&self) -> i64 {
        self.inner.total_unit_count.load(Ordering::Acquire)
    }

    /// completed / total in [0, 1]; 0 while the total is unknown.
    pub fn fraction_completed(&self) -> f64 {
        fraction_of(self.completed_unit_count(), self.total_unit_count())
    }

    /// True once completed has caught up with total.  A handle with a zero total counts as
    /// complete here, as nothing is left to do on it.
    pub fn is_complete(&self) -> bool {
        self.completed_unit_count() >= self.total_unit_count()
    }

    /// Whether a parent should fold this unit into its completed count.  Unlike `is_complete`,
    /// this requires a known, non-zero total.
    pub(crate) fn is_finished(&self) -> bool {
        let total = self.total_unit_count();
        total > 0 && self.completed_unit_count() >= total
    }

    /// Sets the completed count.  Values below the current count are ignored.
    pub fn set_completed_unit_count(&self, completed_unit_count: i64) {
        let old = self
            .inner
            .completed_unit_count
            .fetch_max(completed_unit_count, Ordering::AcqRel);

        if completed_unit_count > old {
            self.notify_parent();
        }
    }

    pub fn increment_completed_unit_count(&self, increment: i64) {
        if increment <= 0 {
            return;
        }
        self.inner.completed_unit_count.fetch_add(increment, Ordering::AcqRel);
        self.notify_parent();
    }

    /// Grows the total, e.g. once the final size of the upload is known.  Values below the
    /// current total are ignored.
    pub fn set_total_unit_count(&self, total_unit_count: i64) {
        let old = self.inner.total_unit_count.fetch_max(total_unit_count, Ordering::AcqRel);

        if total_unit_count > old {
            self.notify_parent();
        }
    }

    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Resolves once this unit has been cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.cancellation.clone();
        async move { token.cancelled().await }
    }

    /// A token that is cancelled together with this unit, for use with `select!` or for
    /// passing down into the transfer code.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub(crate) fn ptr_eq(&self, other: &UnitProgress) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Links this unit to a parent.  Fails if it already reports to a live parent.
    pub(crate) fn link_parent(&self, link: ParentLink) -> bool {
        let mut parent = self.inner.parent.lock();

        if parent.as_ref().is_some_and(|p| p.aggregate.strong_count() > 0) {
            return false;
        }

        *parent = Some(link);
        true
    }

    pub(crate) fn unlink_parent(&self) {
        *self.inner.parent.lock() = None;
    }

    fn notify_parent(&self) {
        // Copy the link out so that the parent's lock is never taken while holding ours.
        let link = {
            let parent = self.inner.parent.lock();
            parent.as_ref().map(|p| (p.aggregate.clone(), p.child_id))
        };

        if let Some((aggregate, child_id)) = link
            && let Some(aggregate) = aggregate.upgrade()
        {
            aggregate.child_did_update(child_id);
        }
    }
}

impl Debug for UnitProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitProgress")
            .field("completed_unit_count", &self.completed_unit_count())
            .field("total_unit_count", &self.total_unit_count())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) fn fraction_of(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (completed as f64 / total as f64).clamp(0.0, 1.0)
}
