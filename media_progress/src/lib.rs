pub mod aggregate_progress;
pub mod constants;
mod coordinator;
mod errors;
mod no_op_delegate;
mod notification_relay;
mod unit_progress;
pub mod verification_wrapper;

pub use aggregate_progress::{AggregateProgress, ProgressObserver, ProgressSnapshot};
pub use coordinator::UploadProgressCoordinator;
pub use errors::{MediaProgressError, Result};
pub use no_op_delegate::NoOpUploadDelegate;
pub use unit_progress::UnitProgress;

/// Receives the coordinator's notifications.
///
/// All calls for one coordinator are made from a single relay task, one at a time and in the
/// order they were posted, no matter which threads drive the underlying uploads.
#[async_trait::async_trait]
pub trait UploadProgressDelegate: std::fmt::Debug + Send + Sync {
    /// The aggregate fraction completed changed.  Rapid changes are coalesced; the value passed
    /// is the latest one at the time of delivery.
    async fn progress_did_change(&self, fraction: f32);

    /// A new upload batch started tracking.
    async fn did_start_uploading(&self) {}

    /// Nothing is running any more.  Called at most once per batch.
    async fn did_finish_upload(&self) {}
}
