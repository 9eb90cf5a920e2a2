use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MediaProgressError {
    #[error("No upload is being tracked; call track_items before tracking media {media_id}")]
    NoActiveAggregate { media_id: String },

    #[error("Progress for media {media_id} already reports to another aggregate")]
    AlreadyAttached { media_id: String },

    #[error("Notification relay panicked: {0}")]
    RelayTaskPanic(String),

    #[error("Notification relay cancelled; possible runtime shutdown in progress ({0})")]
    RelayTaskCancelled(String),

    #[error("Notification relay join error: {0}")]
    RelayJoinError(JoinError),
}

pub type Result<T> = std::result::Result<T, MediaProgressError>;

pub(crate) fn map_join_error(e: JoinError) -> MediaProgressError {
    if e.is_panic() {
        // Most likely a delegate callback panicked; pass it on.
        error!("Panic reported on the upload notification relay: {e:?}");
        MediaProgressError::RelayTaskPanic(format!("{e:?}"))
    } else if e.is_cancelled() {
        MediaProgressError::RelayTaskCancelled(format!("{e}"))
    } else {
        MediaProgressError::RelayJoinError(e)
    }
}
