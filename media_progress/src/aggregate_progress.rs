use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use more_asserts::debug_assert_le;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::unit_progress::{ParentLink, UnitProgress};

/// Called with the new fraction completed whenever it changes.  Runs while the aggregate's
/// state is locked, so it must not block or call back into the aggregate.
pub type ProgressObserver = Box<dyn Fn(f64) + Send + Sync>;

/// A point-in-time view of an aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub completed_unit_count: i64,
    pub total_unit_count: i64,
    pub fraction_completed: f64,
    pub is_cancelled: bool,
}

struct AttachedChild {
    progress: UnitProgress,

    /// How many of the parent's units this child accounts for.
    pending_unit_count: i64,
}

#[derive(Default)]
struct AggregateState {
    total_unit_count: i64,

    /// Units completed directly plus the pending units of every child that has finished.
    completed_unit_count: i64,

    /// Children still in flight.  Finished children are folded into completed_unit_count and removed.
    children: HashMap<u64, AttachedChild>,
    next_child_id: u64,

    /// The last fraction reported to the observer.
    fraction_completed: f64,

    observer: Option<ProgressObserver>,
}

impl AggregateState {
    fn add_completed_units(&mut self, n_units: i64) {
        let completed = self.completed_unit_count.saturating_add(n_units);

        if completed > self.total_unit_count {
            debug!(
                "Completion of {n_units} units would exceed the aggregate total ({completed} > {}); clamping.",
                self.total_unit_count
            );
        }

        self.completed_unit_count = completed.min(self.total_unit_count);
        debug_assert_le!(self.completed_unit_count, self.total_unit_count);
    }

    /// Moves a finished child's units into the completed count.
    fn fold_if_finished(&mut self, child_id: u64) {
        let Some(child) = self.children.get(&child_id) else {
            return;
        };

        if !child.progress.is_finished() {
            return;
        }

        if let Some(child) = self.children.remove(&child_id) {
            child.progress.unlink_parent();
            self.add_completed_units(child.pending_unit_count);
        }
    }

    fn compute_fraction(&self) -> f64 {
        if self.total_unit_count <= 0 {
            return 0.0;
        }

        let in_flight: f64 = self
            .children
            .values()
            .map(|c| c.pending_unit_count as f64 * c.progress.fraction_completed())
            .sum();

        ((self.completed_unit_count as f64 + in_flight) / self.total_unit_count as f64).clamp(0.0, 1.0)
    }

    fn recompute(&mut self) {
        let fraction_completed = self.compute_fraction();

        if fraction_completed != self.fraction_completed {
            self.fraction_completed = fraction_completed;

            if let Some(observer) = &self.observer {
                observer(fraction_completed);
            }
        }
    }
}

pub(crate) struct AggregateInner {
    state: Mutex<AggregateState>,
    cancellation: CancellationToken,
}

impl AggregateInner {
    /// Entry point for children reporting an update.
    pub(crate) fn child_did_update(&self, child_id: u64) {
        let mut state = self.state.lock();
        state.fold_if_finished(child_id);
        state.recompute();
    }
}

/// Overall progress across a dynamic set of units of work.
///
/// Each attached child contributes `pending_unit_count × child.fraction_completed` to the
/// completed side, so the fraction moves smoothly as individual uploads advance regardless of
/// their own granularity.  Units can also be completed directly through
/// `increment_completed_unit_count` for work that needed no tracking.  Totals are only ever
/// incremented; there is no way to recompute them from the children.
#[derive(Clone)]
pub struct AggregateProgress {
    inner: Arc<AggregateInner>,
}

impl AggregateProgress {
    pub fn new(total_unit_count: i64) -> Self {
        Self {
            inner: Arc::new(AggregateInner {
                state: Mutex::new(AggregateState {
                    total_unit_count: total_unit_count.max(0),
                    ..Default::default()
                }),
                cancellation: CancellationToken::new(),
            }),
        }
    }

    pub fn increment_total_unit_count(&self, increment: i64) {
        if increment <= 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.total_unit_count = state.total_unit_count.saturating_add(increment);
        state.recompute();
    }

    pub fn increment_completed_unit_count(&self, increment: i64) {
        if increment <= 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.add_completed_units(increment);
        state.recompute();
    }

    /// Attaches `child` as accounting for `pending_unit_count` of this aggregate's units.
    ///
    /// Returns false, leaving everything unchanged, if the child already reports to another
    /// live aggregate.
    pub fn add_child(&self, child: &UnitProgress, pending_unit_count: i64) -> bool {
        let mut state = self.inner.state.lock();

        let child_id = state.next_child_id;

        let linked = child.link_parent(ParentLink {
            aggregate: Arc::downgrade(&self.inner),
            child_id,
        });

        if !linked {
            return false;
        }

        state.next_child_id += 1;
        state.children.insert(
            child_id,
            AttachedChild {
                progress: child.clone(),
                pending_unit_count: pending_unit_count.max(0),
            },
        );

        // The child may have made progress, or even finished, before it was attached.
        state.fold_if_finished(child_id);
        state.recompute();

        if self.inner.cancellation.is_cancelled() {
            child.cancel();
        }

        true
    }

    pub fn completed_unit_count(&self) -> i64 {
        self.inner.state.lock().completed_unit_count
    }

    pub fn total_unit_count(&self) -> i64 {
        self.inner.state.lock().total_unit_count
    }

    /// completed / total in [0, 1], counting partial progress of attached children; 0 while
    /// the total is 0.
    pub fn fraction_completed(&self) -> f64 {
        self.inner.state.lock().compute_fraction()
    }

    /// Number of children still in flight.
    pub fn attached_child_count(&self) -> usize {
        self.inner.state.lock().children.len()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.inner.state.lock();
        ProgressSnapshot {
            completed_unit_count: state.completed_unit_count,
            total_unit_count: state.total_unit_count,
            fraction_completed: state.compute_fraction(),
            is_cancelled: self.inner.cancellation.is_cancelled(),
        }
    }

    /// Cancels the aggregate and every child still attached to it.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();

        let children: Vec<UnitProgress> = {
            let state = self.inner.state.lock();
            state.children.values().map(|c| c.progress.clone()).collect()
        };

        debug!("Cancelling aggregate progress with {} attached children", children.len());

        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Installs or removes (with None) the observer.  Replaces any existing observer.
    pub fn set_observer(&self, observer: Option<ProgressObserver>) {
        self.inner.state.lock().observer = observer;
    }
}

impl Debug for AggregateProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("AggregateProgress")
            .field("completed_unit_count", &snapshot.completed_unit_count)
            .field("total_unit_count", &snapshot.total_unit_count)
            .field("fraction_completed", &snapshot.fraction_completed)
            .field("is_cancelled", &snapshot.is_cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn test_empty_aggregate_reports_zero() {
        let aggregate = AggregateProgress::new(0);
        assert_eq!(aggregate.fraction_completed(), 0.0);
        assert_eq!(aggregate.snapshot(), ProgressSnapshot::default());
    }

    #[test]
    fn test_weighted_children() {
        let aggregate = AggregateProgress::new(3);
        let a = UnitProgress::new(100);
        let b = UnitProgress::new(10);
        assert!(aggregate.add_child(&a, 1));
        assert!(aggregate.add_child(&b, 1));

        a.set_completed_unit_count(50);
        assert_close(aggregate.fraction_completed(), 0.5 / 3.0);

        // Granularity of the child does not matter, only its fraction.
        b.set_completed_unit_count(5);
        assert_close(aggregate.fraction_completed(), 1.0 / 3.0);

        // Direct completions count as whole units.
        aggregate.increment_completed_unit_count(1);
        assert_close(aggregate.fraction_completed(), 2.0 / 3.0);
        assert_eq!(aggregate.completed_unit_count(), 1);
    }

    #[test]
    fn test_finished_children_fold_into_completed() {
        let aggregate = AggregateProgress::new(2);
        let a = UnitProgress::new(4);
        aggregate.add_child(&a, 1);
        assert_eq!(aggregate.attached_child_count(), 1);

        a.set_completed_unit_count(4);
        assert_eq!(aggregate.completed_unit_count(), 1);
        assert_eq!(aggregate.attached_child_count(), 0);
        assert_close(aggregate.fraction_completed(), 0.5);

        // Once folded, further updates to the child do nothing.
        a.set_total_unit_count(8);
        assert_close(aggregate.fraction_completed(), 0.5);
    }

    #[test]
    fn test_child_finished_before_attach() {
        let aggregate = AggregateProgress::new(1);
        let a = UnitProgress::new(3);
        a.set_completed_unit_count(3);

        aggregate.add_child(&a, 1);
        assert_eq!(aggregate.completed_unit_count(), 1);
        assert_eq!(aggregate.fraction_completed(), 1.0);
    }

    #[test]
    fn test_child_cannot_join_two_aggregates() {
        let first = AggregateProgress::new(1);
        let second = AggregateProgress::new(1);
        let a = UnitProgress::new(10);

        assert!(first.add_child(&a, 1));
        assert!(!second.add_child(&a, 1));

        // Once the first aggregate is gone the child is free again.
        drop(first);
        assert!(second.add_child(&a, 1));
    }

    #[test]
    fn test_completed_never_exceeds_total() {
        let aggregate = AggregateProgress::new(1);
        aggregate.increment_completed_unit_count(1);
        aggregate.increment_completed_unit_count(1);

        let snapshot = aggregate.snapshot();
        assert_eq!(snapshot.completed_unit_count, 1);
        assert_eq!(snapshot.total_unit_count, 1);
        assert_eq!(snapshot.fraction_completed, 1.0);
    }

    #[test]
    fn test_observer_sees_changes_only() {
        let aggregate = AggregateProgress::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0.0f64));
        {
            let calls = calls.clone();
            let last = last.clone();
            aggregate.set_observer(Some(Box::new(move |f| {
                calls.fetch_add(1, Ordering::SeqCst);
                *last.lock() = f;
            })));
        }

        // 0 / 2 is still 0: no change, no call.
        aggregate.increment_total_unit_count(2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let a = UnitProgress::new(10);
        aggregate.add_child(&a, 1);
        a.set_completed_unit_count(5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_close(*last.lock(), 0.25);

        // Repeating the same count is not a change.
        a.set_completed_unit_count(5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        aggregate.set_observer(None);
        a.set_completed_unit_count(10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_close(aggregate.fraction_completed(), 0.5);
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let aggregate = AggregateProgress::new(2);
        let a = UnitProgress::new(10);
        let b = UnitProgress::new(10);
        aggregate.add_child(&a, 1);
        aggregate.add_child(&b, 1);
        b.set_completed_unit_count(10);

        aggregate.cancel();
        assert!(aggregate.is_cancelled());
        assert!(a.is_cancelled());
        // b had already finished and been detached.
        assert!(!b.is_cancelled());

        // Children attached after cancellation are cancelled immediately.
        let c = UnitProgress::new(10);
        aggregate.add_child(&c, 1);
        assert!(c.is_cancelled());
        assert!(aggregate.snapshot().is_cancelled);
    }

    #[test]
    fn test_concurrent_children_updates() {
        let aggregate = AggregateProgress::new(8);
        let children: Vec<UnitProgress> = (0..8).map(|_| UnitProgress::new(1000)).collect();
        for c in &children {
            aggregate.add_child(c, 1);
        }

        std::thread::scope(|s| {
            for c in &children {
                s.spawn(move || {
                    for _ in 0..1000 {
                        c.increment_completed_unit_count(1);
                    }
                });
            }
        });

        let snapshot = aggregate.snapshot();
        assert_eq!(snapshot.completed_unit_count, 8);
        assert_eq!(snapshot.fraction_completed, 1.0);
        assert_eq!(aggregate.attached_child_count(), 0);
    }
}
