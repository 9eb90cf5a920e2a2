use std::sync::Arc;

use async_trait::async_trait;

use crate::UploadProgressDelegate;

#[derive(Debug, Default)]
pub struct NoOpUploadDelegate;

impl NoOpUploadDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

#[async_trait]
impl UploadProgressDelegate for NoOpUploadDelegate {
    async fn progress_did_change(&self, _fraction: f32) {}
}
