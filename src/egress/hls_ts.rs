use crate::buffer::{EsSample, EsVariant, SharedEsBuffer};
use crate::codec;
use crate::egress::{EgressConfig, OutputFormat, Processor, ProcessorCore, Segment, SegmentWindow};
use crate::error::RelayError;
use crate::mux::TsMuxer;
use crate::variant::CodecVariant;
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Samples read per pump iteration
pub(crate) const PUMP_BATCH: usize = 128;

/// Interleave a video and an audio batch by decode timestamp.
/// `true` marks video samples.
pub(crate) fn interleave(video: Vec<EsSample>, audio: Vec<EsSample>) -> Vec<(bool, EsSample)> {
    let mut merged: Vec<(bool, EsSample)> = video
        .into_iter()
        .map(|s| (true, s))
        .chain(audio.into_iter().map(|s| (false, s)))
        .collect();
    merged.sort_by_key(|(_, s)| s.dts);
    merged
}

/// HLS with MPEG-TS segments: one persistent muxer whose output is cut into
/// segments on keyframe boundaries near the target duration.
pub struct HlsTsProcessor {
    core: ProcessorCore,
    buffer: Arc<SharedEsBuffer>,
    config: EgressConfig,
    window: RwLock<SegmentWindow>,
    first_segment: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl HlsTsProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: CodecVariant,
        config: EgressConfig,
        parent: &tokio_util::sync::CancellationToken,
    ) -> Self {
        let window = SegmentWindow::new(config.max_segments, config.playlist_segments);
        Self {
            core: ProcessorCore::new(OutputFormat::HlsTs, variant_key, parent),
            buffer,
            config,
            window: RwLock::new(window),
            first_segment: watch::channel(false).0,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EgressConfig {
        &self.config
    }

    /// Render the media playlist, waiting a bounded time for the first
    /// segment when the stream is still starting.
    pub async fn playlist(&self) -> Result<String> {
        self.core.touch_playlist();
        if self.window.read().unwrap().is_empty() {
            let mut rx = self.first_segment.subscribe();
            let waited = tokio::time::timeout(
                self.config.playlist_wait(),
                rx.wait_for(|ready| *ready),
            )
            .await;
            if waited.is_err() || waited.unwrap().is_err() {
                return Err(RelayError::SegmentNotReady.into());
            }
        }
        let window = self.window.read().unwrap();
        Ok(window.render_playlist(self.config.target_duration, |seq| format!("segment{seq}.ts")))
    }

    pub fn segment(&self, sequence: u64) -> Result<Segment> {
        self.window
            .read()
            .unwrap()
            .get(sequence)
            .cloned()
            .ok_or_else(|| RelayError::NotFound.into())
    }

    pub fn segment_count(&self) -> usize {
        self.window.read().unwrap().len()
    }

    async fn run(self: Arc<Self>) {
        let cancel = self.core.cancel.clone();
        let variant = match self
            .buffer
            .get_or_create_variant(&self.core.variant_key, &cancel)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!("hls-ts pump could not resolve variant: {:#}", e);
                return;
            }
        };
        variant.register_consumer(self.core.id);
        if let Err(e) = self.pump(&variant).await {
            warn!("hls-ts pump ended: {:#}", e);
        }
        variant.unregister_consumer(&self.core.id);
        self.buffer.unregister_processor(&self.core.id);
        debug!("hls-ts processor {} finished", self.core.id);
    }

    async fn pump(&self, variant: &Arc<EsVariant>) -> Result<()> {
        let key = variant.key().clone();
        let video = variant.video_track().clone();
        let audio = variant.audio_track().clone();
        let mut mux = TsMuxer::new(
            key.has_video().then_some(key.video.as_str()),
            key.has_audio().then_some(key.audio.as_str()),
        )?;
        mux.write_psi();

        let mut video_cursor = video.latest_sequence();
        let mut audio_cursor = audio.latest_sequence();
        let mut started = !key.has_video();
        let mut segment_start_pts: Option<i64> = None;
        let mut segment_starts_on_keyframe = false;
        let mut last_pts: Option<i64> = None;
        let mut pending_discontinuity = false;
        let mut wrote_any = false;

        loop {
            let notified_video = video.notify_chan();
            let notified_audio = audio.notify_chan();

            let video_batch = if key.has_video() {
                video.read_from(video_cursor, PUMP_BATCH)
            } else {
                Vec::new()
            };
            let audio_batch = if key.has_audio() {
                audio.read_from(audio_cursor, PUMP_BATCH)
            } else {
                Vec::new()
            };

            if video_batch.is_empty() && audio_batch.is_empty() {
                if self.buffer.is_source_completed() || self.buffer.is_closed() {
                    // flush the partial tail segment and finish
                    if wrote_any {
                        if let Some(start) = segment_start_pts {
                            let duration =
                                (last_pts.unwrap_or(start) - start).max(0) as f32 / 90_000.0;
                            self.finalize_segment(
                                &mut mux,
                                duration,
                                segment_starts_on_keyframe,
                                pending_discontinuity,
                            );
                        }
                    }
                    self.window.write().unwrap().mark_ended();
                    info!("hls-ts processor {}: source completed", self.core.id);
                    return Ok(());
                }
                tokio::select! {
                    _ = self.core.cancel.cancelled() => return Ok(()),
                    _ = notified_video => {}
                    _ = notified_audio => {}
                }
                continue;
            }

            if let Some(s) = video_batch.last() {
                video_cursor = s.sequence;
            }
            if let Some(s) = audio_batch.last() {
                audio_cursor = s.sequence;
            }
            variant.update_consumer_position(self.core.id, video_cursor, audio_cursor);

            for (is_video, sample) in interleave(video_batch, audio_batch) {
                if is_video {
                    if !started {
                        if !sample.is_keyframe {
                            continue;
                        }
                        started = true;
                    }
                    // detect a backwards jump (fallback switchover)
                    if let Some(prev) = last_pts {
                        if sample.pts + 90_000 < prev {
                            pending_discontinuity = true;
                        }
                    }

                    if let Some(start) = segment_start_pts {
                        let buffered = (sample.pts - start).max(0) as f32 / 90_000.0;
                        let natural = buffered >= self.config.target_duration && sample.is_keyframe;
                        let forced = buffered >= self.config.target_duration * 1.5;
                        if wrote_any && (natural || forced) {
                            self.finalize_segment(
                                &mut mux,
                                buffered,
                                segment_starts_on_keyframe,
                                pending_discontinuity,
                            );
                            pending_discontinuity = false;
                            segment_start_pts = Some(sample.pts);
                            segment_starts_on_keyframe = sample.is_keyframe;
                            mux.write_psi();
                        }
                    } else {
                        segment_start_pts = Some(sample.pts);
                        segment_starts_on_keyframe = sample.is_keyframe;
                    }

                    let data = self.with_parameter_sets(&sample);
                    mux.write_video(sample.pts, sample.dts, &data, sample.is_keyframe)?;
                    wrote_any = true;
                    last_pts = Some(sample.pts);
                } else {
                    if !started {
                        continue;
                    }
                    if segment_start_pts.is_none() {
                        segment_start_pts = Some(sample.pts);
                        segment_starts_on_keyframe = false;
                    }
                    if !key.has_video() {
                        // audio-only: cut purely on duration
                        if let Some(start) = segment_start_pts {
                            let buffered = (sample.pts - start).max(0) as f32 / 90_000.0;
                            if wrote_any && buffered >= self.config.target_duration {
                                self.finalize_segment(&mut mux, buffered, false, false);
                                segment_start_pts = Some(sample.pts);
                                mux.write_psi();
                            }
                        }
                    }
                    mux.write_audio(sample.pts, &sample.data)?;
                    wrote_any = true;
                    last_pts = Some(sample.pts);
                }
            }
        }
    }

    /// Re-inject SPS/PPS ahead of keyframes that do not carry them in-band,
    /// so every segment is independently decodable.
    fn with_parameter_sets(&self, sample: &EsSample) -> Bytes {
        if !sample.is_keyframe {
            return sample.data.clone();
        }
        let codec_name = &self.core.variant_key.video;
        if codec::contains_parameter_sets(codec_name, &sample.data) {
            return sample.data.clone();
        }
        let variant = self.buffer.get_variant(&self.core.variant_key);
        let params = variant.and_then(|v| v.video_track().params());
        match params {
            Some(p) if !p.is_empty() => {
                let prefix = p.to_annexb();
                let mut out = BytesMut::with_capacity(prefix.len() + sample.data.len());
                out.extend_from_slice(&prefix);
                out.extend_from_slice(&sample.data);
                out.freeze()
            }
            _ => sample.data.clone(),
        }
    }

    fn finalize_segment(
        &self,
        mux: &mut TsMuxer,
        duration: f32,
        starts_on_keyframe: bool,
        discontinuity: bool,
    ) {
        let data = mux.take();
        if data.is_empty() {
            return;
        }
        self.core.bandwidth.add(data.len() as u64);
        let seq = self.window.write().unwrap().push(
            data,
            duration,
            starts_on_keyframe,
            discontinuity,
        );
        debug!(
            "hls-ts {} segment {} [{:.3}s]",
            self.core.id, seq, duration
        );
        self.first_segment.send_replace(true);
    }
}

#[async_trait]
impl Processor for HlsTsProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        self.buffer.register_processor(self.core.id);
        let this = self.clone();
        tokio::spawn(this.run());
        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.cancel.cancel();
    }
}
