use crate::buffer::{EsSample, EsVariant, SharedEsBuffer};
use crate::codec;
use crate::egress::hls_ts::{interleave, PUMP_BATCH};
use crate::egress::{EgressConfig, OutputFormat, Processor, ProcessorCore, Segment, SegmentWindow};
use crate::error::RelayError;
use crate::mux::fmp4::{FragmentSample, FragmentTrack, FragmentWriter, InitSegment, TrackConfig};
use crate::variant::CodecVariant;
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;
/// Assumed AAC frame duration in 90kHz ticks at 48kHz (1024 samples)
const DEFAULT_AUDIO_DURATION: u32 = 1920;
const DEFAULT_VIDEO_DURATION: u32 = 3000;

/// Shared machinery for fMP4-based outputs (HLS-fMP4 and DASH): a
/// once-written init segment and a sliding window of moof+mdat fragments.
pub struct FragmentEngine {
    config: EgressConfig,
    window: RwLock<SegmentWindow>,
    init: RwLock<Option<Bytes>>,
    writer: Mutex<FragmentWriter>,
    first_segment: watch::Sender<bool>,
}

impl FragmentEngine {
    pub fn new(config: EgressConfig) -> Self {
        let window = SegmentWindow::new(config.max_segments, config.playlist_segments);
        Self {
            config,
            window: RwLock::new(window),
            init: RwLock::new(None),
            writer: Mutex::new(FragmentWriter::new()),
            first_segment: watch::channel(false).0,
        }
    }

    pub fn config(&self) -> &EgressConfig {
        &self.config
    }

    /// The ftyp+moov init segment; not ready until codec parameters have
    /// been seen
    pub fn init_segment(&self) -> Result<Bytes> {
        self.init
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::SegmentNotReady.into())
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

    pub fn with_window<T>(&self, f: impl FnOnce(&SegmentWindow) -> T) -> T {
        f(&self.window.read().unwrap())
    }

    pub async fn wait_first_segment(&self) -> Result<()> {
        if !self.window.read().unwrap().is_empty() {
            return Ok(());
        }
        let mut rx = self.first_segment.subscribe();
        let waited =
            tokio::time::timeout(self.config.playlist_wait(), rx.wait_for(|ready| *ready)).await;
        if waited.is_err() || waited.unwrap().is_err() {
            return Err(RelayError::SegmentNotReady.into());
        }
        Ok(())
    }

    fn try_build_init(&self, key: &CodecVariant, variant: &Arc<EsVariant>) -> bool {
        if self.init.read().unwrap().is_some() {
            return true;
        }
        let mut tracks = Vec::new();
        if key.has_video() {
            let Some(params) = variant.video_track().params() else {
                return false;
            };
            tracks.push(TrackConfig::video(VIDEO_TRACK_ID, &key.video, Some(params)));
        }
        if key.has_audio() {
            let mut audio = TrackConfig::audio(AUDIO_TRACK_ID, &key.audio, 48_000, 2);
            // fragments carry 90kHz timestamps end to end
            audio.timescale = 90_000;
            tracks.push(audio);
        }
        match InitSegment::build(&tracks) {
            Ok(init) => {
                info!("fMP4 init segment built ({} bytes)", init.len());
                *self.init.write().unwrap() = Some(init);
                true
            }
            Err(e) => {
                warn!("init segment build failed: {:#}", e);
                false
            }
        }
    }

    fn flush_fragment(
        &self,
        core: &ProcessorCore,
        video: &mut Vec<EsSample>,
        audio: &mut Vec<EsSample>,
        discontinuity: bool,
    ) {
        if video.is_empty() && audio.is_empty() {
            return;
        }
        let starts_on_keyframe = video.first().map(|s| s.is_keyframe).unwrap_or(false);
        let mut tracks = Vec::new();
        let mut duration_ticks = 0i64;

        if !video.is_empty() {
            let mut data = BytesMut::new();
            let mut samples = Vec::with_capacity(video.len());
            for (i, s) in video.iter().enumerate() {
                let avcc = codec::annexb_to_length_prefixed(&s.data);
                let duration = video
                    .get(i + 1)
                    .map(|n| (n.dts - s.dts).max(1) as u32)
                    .unwrap_or(DEFAULT_VIDEO_DURATION);
                samples.push(FragmentSample {
                    duration,
                    size: avcc.len() as u32,
                    cts_offset: (s.pts - s.dts) as i32,
                    is_keyframe: s.is_keyframe,
                });
                duration_ticks += duration as i64;
                data.extend_from_slice(&avcc);
            }
            tracks.push(FragmentTrack {
                track_id: VIDEO_TRACK_ID,
                base_decode_time: video[0].dts.max(0) as u64,
                samples,
                data: data.freeze(),
            });
        }
        if !audio.is_empty() {
            let mut data = BytesMut::new();
            let mut samples = Vec::with_capacity(audio.len());
            for (i, s) in audio.iter().enumerate() {
                let duration = audio
                    .get(i + 1)
                    .map(|n| (n.pts - s.pts).max(1) as u32)
                    .unwrap_or(DEFAULT_AUDIO_DURATION);
                samples.push(FragmentSample {
                    duration,
                    size: s.data.len() as u32,
                    cts_offset: 0,
                    is_keyframe: false,
                });
                data.extend_from_slice(&s.data);
            }
            if tracks.is_empty() {
                duration_ticks = samples.iter().map(|s| s.duration as i64).sum();
            }
            tracks.push(FragmentTrack {
                track_id: AUDIO_TRACK_ID,
                base_decode_time: audio[0].pts.max(0) as u64,
                samples,
                data: data.freeze(),
            });
        }

        let fragment = match self.writer.lock().unwrap().write_fragment(&tracks) {
            Ok(f) => f,
            Err(e) => {
                warn!("fragment build failed: {:#}", e);
                video.clear();
                audio.clear();
                return;
            }
        };
        core.bandwidth.add(fragment.len() as u64);
        let duration = duration_ticks as f32 / 90_000.0;
        let seq = self.window.write().unwrap().push(
            fragment,
            duration,
            starts_on_keyframe,
            discontinuity,
        );
        debug!("fmp4 {} fragment {} [{:.3}s]", core.id, seq, duration);
        self.first_segment.send_replace(true);
        video.clear();
        audio.clear();
    }

    /// The consuming loop: accumulate samples, cut fragments at keyframes
    /// near the target duration, mirror the HLS-TS boundary rule.
    pub async fn pump(
        &self,
        core: &ProcessorCore,
        buffer: &Arc<SharedEsBuffer>,
        variant: &Arc<EsVariant>,
    ) -> Result<()> {
        let key = variant.key().clone();
        let video = variant.video_track().clone();
        let audio = variant.audio_track().clone();

        let mut video_cursor = video.latest_sequence();
        let mut audio_cursor = audio.latest_sequence();
        let mut started = !key.has_video();
        let mut pending_video: Vec<EsSample> = Vec::new();
        let mut pending_audio: Vec<EsSample> = Vec::new();
        let mut fragment_start_pts: Option<i64> = None;
        let mut last_pts: Option<i64> = None;
        let mut pending_discontinuity = false;

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
                if buffer.is_source_completed() || buffer.is_closed() {
                    self.flush_fragment(
                        core,
                        &mut pending_video,
                        &mut pending_audio,
                        pending_discontinuity,
                    );
                    self.window.write().unwrap().mark_ended();
                    return Ok(());
                }
                tokio::select! {
                    _ = core.cancel.cancelled() => return Ok(()),
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
            variant.update_consumer_position(core.id, video_cursor, audio_cursor);

            for (is_video, sample) in interleave(video_batch, audio_batch) {
                if is_video {
                    if !started {
                        if !sample.is_keyframe {
                            continue;
                        }
                        started = true;
                    }
                    if sample.is_keyframe && !self.try_build_init(&key, variant) {
                        continue;
                    }
                    if let Some(prev) = last_pts {
                        if sample.pts + 90_000 < prev {
                            pending_discontinuity = true;
                        }
                    }
                    if let Some(start) = fragment_start_pts {
                        let buffered = (sample.pts - start).max(0) as f32 / 90_000.0;
                        let natural =
                            buffered >= self.config.target_duration && sample.is_keyframe;
                        let forced = buffered >= self.config.target_duration * 1.5;
                        if natural || forced {
                            self.flush_fragment(
                                core,
                                &mut pending_video,
                                &mut pending_audio,
                                pending_discontinuity,
                            );
                            pending_discontinuity = false;
                            fragment_start_pts = Some(sample.pts);
                        }
                    } else {
                        fragment_start_pts = Some(sample.pts);
                    }
                    last_pts = Some(sample.pts);
                    pending_video.push(sample);
                } else {
                    if !started {
                        continue;
                    }
                    if fragment_start_pts.is_none() {
                        fragment_start_pts = Some(sample.pts);
                    }
                    if !key.has_video() {
                        if let Some(start) = fragment_start_pts {
                            let buffered = (sample.pts - start).max(0) as f32 / 90_000.0;
                            if buffered >= self.config.target_duration
                                && !pending_audio.is_empty()
                            {
                                self.flush_fragment(
                                    core,
                                    &mut pending_video,
                                    &mut pending_audio,
                                    false,
                                );
                                fragment_start_pts = Some(sample.pts);
                            }
                        }
                        // audio-only init needs no parameter sets
                        self.try_build_init(&key, variant);
                    }
                    last_pts = Some(sample.pts);
                    pending_audio.push(sample);
                }
            }
        }
    }
}

/// HLS with fMP4 segments: EXT-X-MAP init plus moof+mdat media segments,
/// served through `?init=...` / `?seg=<n>`.
pub struct HlsFmp4Processor {
    core: ProcessorCore,
    buffer: Arc<SharedEsBuffer>,
    engine: FragmentEngine,
    stopped: AtomicBool,
}

impl HlsFmp4Processor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: CodecVariant,
        config: EgressConfig,
        parent: &tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            core: ProcessorCore::new(OutputFormat::HlsFmp4, variant_key, parent),
            buffer,
            engine: FragmentEngine::new(config),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &FragmentEngine {
        &self.engine
    }

    pub async fn playlist(&self) -> Result<String> {
        self.core.touch_playlist();
        self.engine.wait_first_segment().await?;
        let target = self.engine.config().target_duration;
        Ok(self.engine.with_window(|w| {
            w.render_playlist_ext(
                target,
                6,
                Some("?format=hls-fmp4&init=main"),
                |seq| format!("?format=hls-fmp4&seg={seq}"),
            )
        }))
    }

    pub fn init_segment(&self) -> Result<Bytes> {
        self.engine.init_segment()
    }

    pub fn segment(&self, sequence: u64) -> Result<Segment> {
        self.engine.segment(sequence)
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
                warn!("hls-fmp4 pump could not resolve variant: {:#}", e);
                return;
            }
        };
        variant.register_consumer(self.core.id);
        if let Err(e) = self.engine.pump(&self.core, &self.buffer, &variant).await {
            warn!("hls-fmp4 pump ended: {:#}", e);
        }
        variant.unregister_consumer(&self.core.id);
        self.buffer.unregister_processor(&self.core.id);
    }
}

#[async_trait]
impl Processor for HlsFmp4Processor {
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

    /// Idle when no playlist request has arrived for two full windows
    fn is_idle(&self) -> bool {
        let config = self.engine.config();
        let horizon = config.playlist_segments as f32 * config.target_duration * 2.0;
        self.core.since_last_playlist_request().as_secs_f32() > horizon
    }
}
