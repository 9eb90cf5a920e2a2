//! Simulates a batch of concurrent media uploads feeding one coordinator.
//!
//! Each upload advances in steps on its own task; a few can be made to fail, be cancelled
//! midway, or be skipped as already uploaded.  Delegate callbacks are logged, and a summary of
//! the coordinator's view is printed at the end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use media_logging::{LoggingConfig, init_logging};
use media_progress::{UnitProgress, UploadProgressCoordinator, UploadProgressDelegate};
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of media items to upload.
    #[arg(long, default_value_t = 8)]
    items: u64,

    /// Progress steps per upload.
    #[arg(long, default_value_t = 20)]
    steps: i64,

    #[arg(long, default_value_t = 25)]
    step_delay_ms: u64,

    /// How many uploads fail halfway.
    #[arg(long, default_value_t = 1)]
    fail: u64,

    /// How many uploads get cancelled halfway.
    #[arg(long, default_value_t = 1)]
    cancel: u64,

    /// How many items are already on the server and complete immediately.
    #[arg(long, default_value_t = 1)]
    already_uploaded: u64,
}

#[derive(Clone, Debug)]
struct SimulatedMedia {
    name: String,
    size_bytes: u64,
}

#[derive(Clone, Debug)]
struct SimulatedError(String);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Complete,
    Fail,
    Cancel,
}

#[derive(Debug)]
struct LoggingDelegate;

#[async_trait]
impl UploadProgressDelegate for LoggingDelegate {
    async fn progress_did_change(&self, fraction: f32) {
        info!("Progress: {:.1}%", fraction * 100.0);
    }

    async fn did_start_uploading(&self) {
        info!("Delegate: upload started");
    }

    async fn did_finish_upload(&self) {
        info!("Delegate: upload finished");
    }
}

async fn simulate_upload(
    coordinator: Arc<UploadProgressCoordinator<SimulatedMedia, SimulatedError>>,
    progress: UnitProgress,
    media_id: String,
    outcome: Outcome,
    step_delay: Duration,
) {
    let total = progress.total_unit_count();
    let cancelled = progress.cancelled();
    tokio::pin!(cancelled);

    for step in 0..total {
        if step == total / 2 {
            match outcome {
                Outcome::Fail => {
                    warn!("Upload of {media_id} failed at step {step}");
                    coordinator.attach_error(SimulatedError(format!("connection reset at step {step}")), &media_id);
                    return;
                },
                Outcome::Cancel => progress.cancel(),
                Outcome::Complete => {},
            }
        }

        tokio::select! {
            _ = &mut cancelled => {
                info!("Upload of {media_id} cancelled at step {step}");
                return;
            },
            _ = tokio::time::sleep(step_delay) => {},
        }

        progress.increment_completed_unit_count(1);
    }

    info!("Upload of {media_id} complete");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(LoggingConfig::new(format!("simulate_uploads {}", env!("CARGO_PKG_VERSION"))));

    let coordinator = Arc::new(UploadProgressCoordinator::<SimulatedMedia, SimulatedError>::new(Arc::new(
        LoggingDelegate,
    )));

    coordinator.track_items(args.items);

    let step_delay = Duration::from_millis(args.step_delay_ms);
    let mut uploads = JoinSet::new();

    for i in 0..args.items {
        if i < args.already_uploaded {
            coordinator.finish_one_item();
            continue;
        }

        let outcome = if i < args.already_uploaded + args.fail {
            Outcome::Fail
        } else if i < args.already_uploaded + args.fail + args.cancel {
            Outcome::Cancel
        } else {
            Outcome::Complete
        };

        let media = SimulatedMedia {
            name: format!("IMG_{:04}.jpg", i + 1),
            size_bytes: 1_500_000 + i * 250_000,
        };
        let media_id = format!("media-{i}");
        // Vary the granularity a little so uploads progress at different rates.
        let progress = UnitProgress::new(args.steps.max(1) + (i % 5) as i64 * 3);

        info!("Uploading {} ({} bytes) as {media_id}", media.name, media.size_bytes);
        coordinator.track_progress(progress.clone(), media, media_id.as_str())?;

        uploads.spawn(simulate_upload(coordinator.clone(), progress, media_id, outcome, step_delay));
    }

    while let Some(result) = uploads.join_next().await {
        result?;
    }

    coordinator.flush().await;

    println!("Total progress:   {:.1}%", coordinator.total_progress() * 100.0);
    println!("Still running:    {}", coordinator.is_running());
    println!("Tracked media:    {}", coordinator.tracked_media_count());
    println!("Cancelled media:  {:?}", coordinator.cancelled_media_ids());
    for media_id in coordinator.failed_media_ids() {
        let name = coordinator.media_for(&media_id).map(|m| m.name).unwrap_or_default();
        let error = coordinator.error_for(&media_id).map(|e| e.0).unwrap_or_default();
        println!("Failed media:     {media_id} ({name}): {error}");
    }

    coordinator.stop_tracking_all_failed_media();
    coordinator.stop_tracking_of_all_media();
    coordinator.shutdown().await?;

    Ok(())
}
