//! Periodic telemetry upload: take the accumulated deltas, submit them, and
//! put them back if the channel did not accept the entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::{SharedState, UploadBatch};
use crate::telemetry::TelemetrySink;

/// Run one upload cycle.
///
/// The take happens in a single lock scope, so an increment either lands
/// before it (and is in this batch) or after it (and stays for the next one).
/// The lock is not held across the network call.
pub async fn upload_once(state: &SharedState, sink: &dyn TelemetrySink) -> Result<UploadBatch> {
    let batch = state.write().await.take_upload(Instant::now());

    match sink.submit(&batch).await {
        Ok(()) => Ok(batch),
        Err(e) => {
            state.write().await.restore(&batch);
            Err(e)
        }
    }
}

/// Run the upload loop until cancelled. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    state: SharedState,
    sink: Arc<dyn TelemetrySink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    // First upload one full interval after start so readings can arrive.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_sec = interval.as_secs(), "uploader started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match upload_once(&state, sink.as_ref()).await {
                    Ok(batch) => info!(
                        temperature = batch.temperature,
                        illumination = batch.illumination,
                        detections = batch.detections,
                        secure_sec = batch.secure_mode_secs,
                        auto_light_sec = batch.auto_light_secs,
                        "telemetry uploaded"
                    ),
                    Err(e) => warn!("telemetry upload failed, keeping deltas for next cycle: {e:#}"),
                }
            }
            _ = cancel.cancelled() => {
                info!("uploader shutting down");
                break;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
