use crate::buffer::{EsSample, SharedEsBuffer};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default cadence when the retained GOP is too short to infer one
const FALLBACK_FRAME_INTERVAL: Duration = Duration::from_millis(40);

/// Snapshot the most recent retained GOP of the source variant
fn snapshot_gop(buffer: &Arc<SharedEsBuffer>) -> Option<Vec<EsSample>> {
    let variant = buffer.source_variant()?;
    let video = variant.video_track();
    let samples = video.read_from(0, usize::MAX);
    let last_kf = samples.iter().rposition(|s| s.is_keyframe)?;
    let gop: Vec<EsSample> = samples[last_kf..].to_vec();
    (!gop.is_empty()).then_some(gop)
}

/// Feed the source variant while the upstream is down by re-emitting the
/// last retained GOP at its original cadence with continued timestamps.
///
/// The relay carries no encoder, so this is a repeat of real upstream
/// bytes rather than synthesized slate content; connected clients keep
/// receiving decodable video until recovery.
pub async fn run_fallback(buffer: Arc<SharedEsBuffer>, cancel: CancellationToken) -> Result<()> {
    let Some(gop) = snapshot_gop(&buffer) else {
        bail!("no retained keyframe to build a fallback loop from");
    };
    let Some(variant) = buffer.source_variant() else {
        bail!("no source variant");
    };
    let video = variant.video_track().clone();

    // cadence from the GOP's own timing
    let frame_interval = if gop.len() >= 2 {
        let span = (gop.last().unwrap().pts - gop[0].pts).max(0) as u64;
        let per_frame_ticks = span / (gop.len() as u64 - 1).max(1);
        if per_frame_ticks == 0 {
            FALLBACK_FRAME_INTERVAL
        } else {
            Duration::from_micros(per_frame_ticks * 1_000_000 / 90_000)
        }
    } else {
        FALLBACK_FRAME_INTERVAL
    };
    let ticks_per_frame = (frame_interval.as_secs_f64() * 90_000.0) as i64;

    info!(
        "fallback feed started: {} samples per loop, {:?} cadence",
        gop.len(),
        frame_interval
    );

    let mut next_pts = video
        .read_from(video.latest_sequence().saturating_sub(1), 2)
        .last()
        .map(|s| s.pts + ticks_per_frame)
        .unwrap_or(gop.last().unwrap().pts + ticks_per_frame);

    loop {
        for sample in &gop {
            if cancel.is_cancelled() || buffer.is_closed() {
                debug!("fallback feed stopped");
                return Ok(());
            }
            let dts_offset = sample.pts - sample.dts;
            video.write(
                next_pts,
                next_pts - dts_offset,
                sample.data.clone(),
                sample.is_keyframe,
            );
            next_pts += ticks_per_frame;
            tokio::select! {
                _ = tokio::time::sleep(frame_interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
