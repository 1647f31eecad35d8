use crate::buffer::EsVariant;
use crate::worker::{
    DaemonRegistry, DaemonStreamManager, RpcFrame, RpcPayload, RpcSample, SampleBatch,
    TranscodeStart, TranscodeStop,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod factory;
pub mod strategy;

pub use factory::{BackendSelection, GpuExhaustionPolicy, TranscoderConfig, TranscoderFactory};
pub use strategy::{default_selection_strategy, SelectionCriteria, SelectionStrategy};

const SAMPLE_BATCH_MAX: usize = 64;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Codec targets and quality for one transcode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeProfile {
    #[serde(default)]
    pub video_encoder: Option<String>,
    #[serde(default)]
    pub audio_encoder: Option<String>,
    #[serde(default = "TranscodeProfile::default_video_bitrate")]
    pub video_bitrate_kbps: u32,
    #[serde(default = "TranscodeProfile::default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "TranscodeProfile::default_preset")]
    pub video_preset: String,
    #[serde(default)]
    pub preferred_hwaccel: Option<String>,
    #[serde(default)]
    pub require_gpu: bool,
}

impl TranscodeProfile {
    fn default_video_bitrate() -> u32 {
        3000
    }
    fn default_audio_bitrate() -> u32 {
        128
    }
    fn default_preset() -> String {
        "veryfast".into()
    }
}

#[derive(Debug, Clone)]
pub struct TranscoderStats {
    pub samples_in: u64,
    pub samples_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub encoding_speed: f32,
}

#[derive(Debug)]
struct StatsInner {
    samples_in: AtomicU64,
    samples_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    encoding_speed: AtomicU32,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            samples_in: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            encoding_speed: AtomicU32::new(0),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn snapshot(&self) -> TranscoderStats {
        TranscoderStats {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_activity: *self.last_activity.lock().unwrap(),
            encoding_speed: f32::from_bits(self.encoding_speed.load(Ordering::Relaxed)),
        }
    }
}

/// Reads samples from a source variant, produces samples into a target
/// variant through a worker over RPC.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(self: Arc<Self>) -> Result<()>;
    /// Idempotent; unregisters the consumer and tears down the RPC stream
    async fn stop(&self, reason: &str);
    fn stats(&self) -> TranscoderStats;
    /// Cancelled once the transcoder has fully stopped
    fn closed_chan(&self) -> CancellationToken;
}

/// FIFO wait queue for GPU sessions under the `queue` exhaustion policy.
/// `notify` wakes at most one waiter and never blocks.
pub struct GpuWaitQueue {
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl GpuWaitQueue {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push_back(tx);
        rx
    }

    /// At-most-once wake of the longest waiter
    pub fn notify(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
            // receiver gave up (timeout); try the next one
        }
    }
}

impl Default for GpuWaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a reserved GPU encode session when the job ends
pub struct GpuLease {
    registry: Arc<DaemonRegistry>,
    daemon_id: String,
    queue: Arc<GpuWaitQueue>,
}

impl GpuLease {
    pub fn new(registry: Arc<DaemonRegistry>, daemon_id: String, queue: Arc<GpuWaitQueue>) -> Self {
        Self {
            registry,
            daemon_id,
            queue,
        }
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        self.registry.release_gpu_session(&self.daemon_id);
        self.queue.notify();
    }
}

/// The single transcoder implementation: local and remote backends differ
/// only in how the daemon came to exist (spawned subprocess vs registered
/// remote), both speak the same multiplexed stream.
pub struct RpcTranscoder {
    job_id: Uuid,
    daemon_id: String,
    channel_name: String,
    start_msg: TranscodeStart,
    source: Arc<EsVariant>,
    target: Arc<EsVariant>,
    daemon_tx: mpsc::Sender<RpcFrame>,
    stream_manager: Arc<DaemonStreamManager>,
    registry: Arc<DaemonRegistry>,
    cancel: CancellationToken,
    closed: CancellationToken,
    stats: Arc<StatsInner>,
    started: AtomicBool,
    stopped: AtomicBool,
    stream_send_timeout: Duration,
    max_errors: u64,
    /// Keeps a local worker subprocess alive for the job's duration
    worker: Mutex<Option<Arc<crate::worker::spawner::SpawnedWorker>>>,
    gpu_lease: Mutex<Option<GpuLease>>,
}

impl RpcTranscoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Uuid,
        daemon_id: String,
        channel_name: String,
        start_msg: TranscodeStart,
        source: Arc<EsVariant>,
        target: Arc<EsVariant>,
        daemon_tx: mpsc::Sender<RpcFrame>,
        stream_manager: Arc<DaemonStreamManager>,
        registry: Arc<DaemonRegistry>,
        parent: &CancellationToken,
        config: &TranscoderConfig,
    ) -> Self {
        Self {
            job_id,
            daemon_id,
            channel_name,
            start_msg,
            source,
            target,
            daemon_tx,
            stream_manager,
            registry,
            cancel: parent.child_token(),
            closed: CancellationToken::new(),
            stats: Arc::new(StatsInner::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stream_send_timeout: config.stream_send_timeout,
            max_errors: config.max_errors,
            worker: Mutex::new(None),
            gpu_lease: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub(crate) fn attach_worker(&self, worker: Arc<crate::worker::spawner::SpawnedWorker>) {
        *self.worker.lock().unwrap() = Some(worker);
    }

    pub(crate) fn attach_gpu_lease(&self, lease: GpuLease) {
        *self.gpu_lease.lock().unwrap() = Some(lease);
    }

    async fn send_job_frame(&self, payload: RpcPayload) -> Result<()> {
        let frame = RpcFrame::job(self.job_id, payload);
        if tokio::time::timeout(self.stream_send_timeout, self.daemon_tx.send(frame))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            bail!("rpc send to daemon {} stalled", self.daemon_id);
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut job_rx: mpsc::Receiver<RpcFrame>) {
        if let Err(e) = self.clone().run_inner(&mut job_rx).await {
            warn!(
                "transcoder {} ({}) ended: {:#}",
                self.job_id, self.channel_name, e
            );
        }
        self.teardown().await;
    }

    async fn run_inner(self: Arc<Self>, job_rx: &mut mpsc::Receiver<RpcFrame>) -> Result<()> {
        self.send_job_frame(RpcPayload::TranscodeStart(self.start_msg.clone()))
            .await?;

        // wait for the worker to accept the job
        let ack = tokio::time::timeout(ACK_TIMEOUT, async {
            loop {
                match job_rx.recv().await {
                    Some(RpcFrame {
                        payload: RpcPayload::TranscodeAck(ack),
                        ..
                    }) => return Ok(ack),
                    Some(_) => continue,
                    None => bail!("stream closed before ack"),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for transcode ack"))??;
        if !ack.success {
            bail!(
                "worker rejected transcode: {}",
                ack.error.unwrap_or_default()
            );
        }
        info!(
            "transcode {} running on {} (video={}, audio={})",
            self.job_id, self.daemon_id, ack.actual_video_encoder, ack.actual_audio_encoder
        );
        self.registry.job_started(&self.daemon_id);

        let consumer_id = self.job_id;
        self.source.register_consumer(consumer_id);
        let video = self.source.video_track().clone();
        let audio = self.source.audio_track().clone();
        let mut video_cursor = video.latest_sequence();
        let mut audio_cursor = audio.latest_sequence();
        // forward nothing until the source produces a keyframe
        let mut video_started = false;

        loop {
            // drain worker output first so a busy source cannot starve it
            while let Ok(frame) = job_rx.try_recv() {
                self.handle_worker_frame(frame)?;
            }

            let notified_video = video.notify_chan();
            let notified_audio = audio.notify_chan();

            let video_batch = if video_started {
                video.read_from(video_cursor, SAMPLE_BATCH_MAX)
            } else {
                let batch = video.read_from_keyframe(video_cursor, SAMPLE_BATCH_MAX);
                if !batch.is_empty() {
                    video_started = true;
                }
                batch
            };
            // audio is never keyframe-gated
            let audio_batch = audio.read_from(audio_cursor, SAMPLE_BATCH_MAX);

            if !video_batch.is_empty() || !audio_batch.is_empty() {
                if let Some(last) = video_batch.last() {
                    video_cursor = last.sequence;
                }
                if let Some(last) = audio_batch.last() {
                    audio_cursor = last.sequence;
                }
                self.source
                    .update_consumer_position(consumer_id, video_cursor, audio_cursor);

                let batch = SampleBatch {
                    video_samples: video_batch
                        .iter()
                        .map(|s| RpcSample {
                            pts: s.pts,
                            dts: Some(s.dts),
                            data: s.data.clone(),
                            is_keyframe: s.is_keyframe,
                            sequence: s.sequence,
                        })
                        .collect(),
                    audio_samples: audio_batch
                        .iter()
                        .map(|s| RpcSample {
                            pts: s.pts,
                            dts: None,
                            data: s.data.clone(),
                            is_keyframe: false,
                            sequence: s.sequence,
                        })
                        .collect(),
                    is_source: self.source.is_source(),
                };
                let n = batch.video_samples.len() + batch.audio_samples.len();
                let bytes: usize = batch
                    .video_samples
                    .iter()
                    .chain(batch.audio_samples.iter())
                    .map(|s| s.data.len())
                    .sum();
                self.send_job_frame(RpcPayload::SampleBatch(batch)).await?;
                self.stats.samples_in.fetch_add(n as u64, Ordering::Relaxed);
                self.stats
                    .bytes_in
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                self.stats.touch();
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                incoming = job_rx.recv() => {
                    let Some(frame) = incoming else {
                        bail!("daemon stream closed");
                    };
                    self.handle_worker_frame(frame)?;
                }
                _ = notified_video => {}
                _ = notified_audio => {}
            }
        }
    }

    fn handle_worker_frame(&self, frame: RpcFrame) -> Result<()> {
        match frame.payload {
            RpcPayload::SampleBatch(batch) => {
                let video = self.target.video_track();
                let audio = self.target.audio_track();
                let mut n = 0u64;
                let mut bytes = 0u64;
                for s in batch.video_samples {
                    bytes += s.data.len() as u64;
                    n += 1;
                    video.write(s.pts, s.dts.unwrap_or(s.pts), s.data, s.is_keyframe);
                }
                for s in batch.audio_samples {
                    bytes += s.data.len() as u64;
                    n += 1;
                    audio.write(s.pts, s.pts, s.data, false);
                }
                self.stats.samples_out.fetch_add(n, Ordering::Relaxed);
                self.stats.bytes_out.fetch_add(bytes, Ordering::Relaxed);
                self.stats.touch();
            }
            RpcPayload::TranscodeStats(stats) => {
                self.stats
                    .encoding_speed
                    .store(stats.encoding_speed.to_bits(), Ordering::Relaxed);
            }
            RpcPayload::TranscodeError(e) => {
                warn!("worker error on job {}: {} {}", self.job_id, e.code, e.message);
                let errors = self.stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors >= self.max_errors {
                    bail!("error threshold reached ({errors})");
                }
            }
            other => debug!("unexpected job frame: {:?}", other),
        }
        Ok(())
    }

    async fn teardown(&self) {
        // half-close politely; the worker ends the job on stop
        let stop = RpcFrame::job(
            self.job_id,
            RpcPayload::TranscodeStop(TranscodeStop {
                reason: "stopped".into(),
            }),
        );
        self.daemon_tx.try_send(stop).ok();
        self.stream_manager.close_job(&self.job_id);
        self.source.unregister_consumer(&self.job_id);
        self.registry.job_finished(&self.daemon_id);
        self.gpu_lease.lock().unwrap().take();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.cleanup().await;
        }
        self.closed.cancel();
    }
}

#[async_trait]
impl Transcoder for RpcTranscoder {
    async fn start(self: Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let job_rx = self.stream_manager.open_job(self.job_id);
        let this = self.clone();
        tokio::spawn(this.run(job_rx));
        Ok(())
    }

    async fn stop(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping transcoder {}: {}", self.job_id, reason);
        self.cancel.cancel();
        if !self.started.load(Ordering::SeqCst) {
            // no pump was ever spawned, nothing will run teardown
            self.closed.cancel();
            return;
        }
        tokio::time::timeout(Duration::from_secs(5), self.closed.cancelled())
            .await
            .ok();
    }

    fn stats(&self) -> TranscoderStats {
        self.stats.snapshot()
    }

    fn closed_chan(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gpu_wait_queue_fifo_and_single_wake() {
        let q = GpuWaitQueue::new();
        let mut first = q.enqueue();
        let mut second = q.enqueue();
        assert_eq!(q.len(), 2);

        q.notify();
        assert!(first.try_recv().is_ok(), "longest waiter wakes first");
        assert!(second.try_recv().is_err(), "single wake per notify");

        q.notify();
        assert!(second.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_gpu_wait_queue_skips_abandoned_waiters() {
        let q = GpuWaitQueue::new();
        let gone = q.enqueue();
        drop(gone); // timed out caller
        let mut alive = q.enqueue();
        q.notify();
        assert!(alive.try_recv().is_ok(), "wake falls through to a live waiter");
        assert!(q.is_empty());
    }

    #[test]
    fn test_profile_defaults() {
        let profile: TranscodeProfile = serde_json::from_str("{}").unwrap();
        assert_eq!(profile.video_bitrate_kbps, 3000);
        assert_eq!(profile.audio_bitrate_kbps, 128);
        assert_eq!(profile.video_preset, "veryfast");
        assert!(!profile.require_gpu);
    }

    #[test]
    fn test_stats_snapshot() {
        let inner = StatsInner::new();
        inner.samples_in.fetch_add(5, Ordering::Relaxed);
        inner.bytes_out.fetch_add(1000, Ordering::Relaxed);
        inner
            .encoding_speed
            .store(1.5f32.to_bits(), Ordering::Relaxed);
        let snap = inner.snapshot();
        assert_eq!(snap.samples_in, 5);
        assert_eq!(snap.bytes_out, 1000);
        assert!((snap.encoding_speed - 1.5).abs() < f32::EPSILON);
    }
}
