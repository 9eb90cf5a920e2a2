use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::UploadProgressDelegate;

/// A delegate callback as seen by the verification wrapper.
#[derive(Clone, Debug, PartialEq)]
pub enum DelegateEvent {
    UploadStarted,
    ProgressChanged(f32),
    UploadFinished,
}

#[derive(Debug, Default)]
struct VerificationState {
    events: Vec<DelegateEvent>,
    batch_started: bool,
    batch_finished: bool,
}

/// Wraps a delegate, records every callback and panics if the callbacks break the delegate
/// contract: fractions outside [0, 1], progress or finish before any start, or more than one
/// finish for a batch.
#[derive(Debug)]
pub struct DelegateVerificationWrapper {
    inner: Arc<dyn UploadProgressDelegate>,
    state: Mutex<VerificationState>,
    changed: Notify,
}

impl DelegateVerificationWrapper {
    pub fn new(inner: Arc<dyn UploadProgressDelegate>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Mutex::new(VerificationState::default()),
            changed: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.state.lock().events.clone()
    }

    pub fn n_started(&self) -> usize {
        self.count(|e| matches!(e, DelegateEvent::UploadStarted))
    }

    pub fn n_finished(&self) -> usize {
        self.count(|e| matches!(e, DelegateEvent::UploadFinished))
    }

    pub fn last_fraction(&self) -> Option<f32> {
        self.state.lock().events.iter().rev().find_map(|e| match e {
            DelegateEvent::ProgressChanged(f) => Some(*f),
            _ => None,
        })
    }

    /// Waits until `condition` holds for the events recorded so far.
    pub async fn wait_until(&self, condition: impl Fn(&[DelegateEvent]) -> bool) {
        loop {
            // Register before checking so a callback between the check and the await is not missed.
            let changed = self.changed.notified();

            if condition(&self.state.lock().events) {
                return;
            }

            changed.await;
        }
    }

    fn count(&self, predicate: impl Fn(&DelegateEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| predicate(e)).count()
    }

    fn record(&self, event: DelegateEvent) {
        self.state.lock().events.push(event);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl UploadProgressDelegate for DelegateVerificationWrapper {
    async fn progress_did_change(&self, fraction: f32) {
        {
            let state = self.state.lock();
            assert!((0.0..=1.0).contains(&fraction), "Progress fraction {fraction} out of range.");
            assert!(state.batch_started, "Progress reported before any upload started.");
        }

        self.inner.progress_did_change(fraction).await;
        self.record(DelegateEvent::ProgressChanged(fraction));
    }

    async fn did_start_uploading(&self) {
        {
            let mut state = self.state.lock();
            state.batch_started = true;
            state.batch_finished = false;
        }

        self.inner.did_start_uploading().await;
        self.record(DelegateEvent::UploadStarted);
    }

    async fn did_finish_upload(&self) {
        {
            let mut state = self.state.lock();
            assert!(state.batch_started, "Upload finished before any upload started.");
            assert!(!state.batch_finished, "Upload finished twice for the same batch.");
            state.batch_finished = true;
        }

        self.inner.did_finish_upload().await;
        self.record(DelegateEvent::UploadFinished);
    }
}
