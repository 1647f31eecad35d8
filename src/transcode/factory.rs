use crate::buffer::EsVariant;
use crate::error::RelayError;
use crate::transcode::strategy::{SelectionCriteria, SelectionStrategy};
use crate::transcode::{GpuLease, GpuWaitQueue, RpcTranscoder, TranscodeProfile};
use crate::variant::CodecVariant;
use crate::worker::{DaemonRegistry, DaemonStreamManager, TranscodeStart, WorkerSpawner};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do when every eligible GPU is at its session limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuExhaustionPolicy {
    #[default]
    Fallback,
    Queue,
    Reject,
}

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub gpu_policy: GpuExhaustionPolicy,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
    /// How long a full RPC send buffer may stall before the transcoder
    /// records an error and closes
    pub stream_send_timeout: Duration,
    /// Worker error count that closes the transcoder
    pub max_errors: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            gpu_policy: GpuExhaustionPolicy::Fallback,
            max_queue_size: 16,
            queue_timeout: Duration::from_secs(10),
            stream_send_timeout: Duration::from_secs(5),
            max_errors: 50,
        }
    }
}

/// Outcome of backend selection
#[derive(Debug, Clone)]
pub struct BackendSelection {
    pub daemon_id: String,
    pub video_encoder: String,
    pub used_fallback: bool,
    pub waited_for_gpu: bool,
    pub gpu_reserved: bool,
}

/// Canonical software replacement for a hardware encoder
pub fn software_equivalent(hw_encoder: &str) -> Option<&'static str> {
    match hw_encoder {
        "h264_nvenc" | "h264_qsv" | "h264_vaapi" | "h264_amf" | "h264_videotoolbox" => {
            Some("libx264")
        }
        "hevc_nvenc" | "hevc_qsv" | "hevc_vaapi" | "hevc_amf" | "hevc_videotoolbox" => {
            Some("libx265")
        }
        other if other.starts_with("hevc") || other.starts_with("h265") => Some("libx265"),
        other if other.starts_with("h264") => Some("libx264"),
        _ => None,
    }
}

fn hardware_encoder_for(codec: &str) -> String {
    match codec {
        "h265" | "hevc" => "hevc_nvenc".into(),
        _ => format!("{codec}_nvenc"),
    }
}

fn software_encoder_for(codec: &str) -> String {
    match codec {
        "h264" => "libx264".into(),
        "h265" | "hevc" => "libx265".into(),
        other => other.to_string(),
    }
}

/// Produces transcoders: remote daemons first, a spawned local worker
/// subprocess second, otherwise the request fails.
pub struct TranscoderFactory {
    registry: Arc<DaemonRegistry>,
    stream_manager: Arc<DaemonStreamManager>,
    spawner: Arc<WorkerSpawner>,
    strategy: Arc<dyn SelectionStrategy>,
    config: TranscoderConfig,
    gpu_queue: Arc<GpuWaitQueue>,
}

impl TranscoderFactory {
    pub fn new(
        registry: Arc<DaemonRegistry>,
        stream_manager: Arc<DaemonStreamManager>,
        spawner: Arc<WorkerSpawner>,
        strategy: Arc<dyn SelectionStrategy>,
        config: TranscoderConfig,
    ) -> Self {
        Self {
            registry,
            stream_manager,
            spawner,
            strategy,
            config,
            gpu_queue: Arc::new(GpuWaitQueue::new()),
        }
    }

    /// Wake one queued GPU waiter; non-blocking, at most one wake
    pub fn notify_gpu_available(&self) {
        self.gpu_queue.notify();
    }

    pub fn queue_len(&self) -> usize {
        self.gpu_queue.len()
    }

    fn try_select(&self, criteria: &SelectionCriteria) -> Option<BackendSelection> {
        let daemons = self.registry.get_all();
        let daemon_id = self.strategy.select(&daemons, criteria)?;
        let encoder = criteria
            .required_encoder
            .clone()
            .unwrap_or_else(|| software_encoder_for(&criteria.target_video_codec));
        if criteria.require_gpu {
            // the session count may have moved since selection looked
            if !self.registry.reserve_gpu_session(&daemon_id) {
                return None;
            }
            return Some(BackendSelection {
                daemon_id,
                video_encoder: encoder,
                used_fallback: false,
                waited_for_gpu: false,
                gpu_reserved: true,
            });
        }
        Some(BackendSelection {
            daemon_id,
            video_encoder: encoder,
            used_fallback: false,
            waited_for_gpu: false,
            gpu_reserved: false,
        })
    }

    /// Pick a daemon for the job, applying the GPU exhaustion policy
    pub async fn select_backend(&self, criteria: &SelectionCriteria) -> Result<BackendSelection> {
        if let Some(sel) = self.try_select(criteria) {
            return Ok(sel);
        }
        if !criteria.require_gpu {
            return Err(RelayError::NoBackendAvailable.into());
        }

        match self.config.gpu_policy {
            GpuExhaustionPolicy::Reject => Err(RelayError::NoBackendAvailable.into()),
            GpuExhaustionPolicy::Fallback => {
                let hw_encoder = criteria
                    .required_encoder
                    .clone()
                    .unwrap_or_else(|| hardware_encoder_for(&criteria.target_video_codec));
                let sw_encoder = software_equivalent(&hw_encoder)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| software_encoder_for(&criteria.target_video_codec));
                let relaxed = SelectionCriteria {
                    require_gpu: false,
                    required_encoder: Some(sw_encoder.clone()),
                    required_hwaccel: None,
                    ..criteria.clone()
                };
                debug!(
                    "GPU sessions exhausted, falling back {} -> {}",
                    hw_encoder, sw_encoder
                );
                match self.try_select(&relaxed) {
                    Some(mut sel) => {
                        sel.used_fallback = true;
                        Ok(sel)
                    }
                    None => Err(RelayError::NoBackendAvailable.into()),
                }
            }
            GpuExhaustionPolicy::Queue => {
                if self.gpu_queue.len() >= self.config.max_queue_size {
                    warn!("GPU wait queue full");
                    return Err(RelayError::NoBackendAvailable.into());
                }
                let deadline = tokio::time::Instant::now() + self.config.queue_timeout;
                loop {
                    let waiter = self.gpu_queue.enqueue();
                    let woken = tokio::time::timeout_at(deadline, waiter).await;
                    match woken {
                        Ok(Ok(())) => {
                            if let Some(mut sel) = self.try_select(criteria) {
                                sel.waited_for_gpu = true;
                                return Ok(sel);
                            }
                            // someone else claimed the session; keep waiting
                        }
                        _ => return Err(RelayError::NoBackendAvailable.into()),
                    }
                }
            }
        }
    }

    /// Build a transcoder for `source -> target`, spawning a local worker if
    /// no registered daemon qualifies.
    pub async fn create(
        &self,
        channel_name: &str,
        source_key: &CodecVariant,
        target_key: &CodecVariant,
        source: Arc<EsVariant>,
        target: Arc<EsVariant>,
        profile: &TranscodeProfile,
        parent: &CancellationToken,
    ) -> Result<Arc<RpcTranscoder>> {
        let criteria = SelectionCriteria {
            source_video_codec: source_key.video.clone(),
            target_video_codec: target_key.video.clone(),
            required_encoder: profile.video_encoder.clone(),
            required_decoder: None,
            required_hwaccel: profile.preferred_hwaccel.clone(),
            require_gpu: profile.require_gpu,
        };

        let mut spawned_worker = None;
        let selection = match self.select_backend(&criteria).await {
            Ok(sel) => sel,
            Err(e)
                if matches!(
                    e.downcast_ref::<RelayError>(),
                    Some(RelayError::NoBackendAvailable)
                ) =>
            {
                info!("no remote backend for {target_key}, spawning local worker");
                let worker = self.spawner.spawn().await.map_err(|spawn_err| {
                    warn!("local worker spawn failed: {:#}", spawn_err);
                    RelayError::NoBackendAvailable
                })?;
                let sel = BackendSelection {
                    daemon_id: worker.daemon_id.clone(),
                    video_encoder: criteria
                        .required_encoder
                        .clone()
                        .unwrap_or_else(|| software_encoder_for(&target_key.video)),
                    used_fallback: false,
                    waited_for_gpu: false,
                    gpu_reserved: false,
                };
                spawned_worker = Some(worker);
                sel
            }
            Err(e) => return Err(e),
        };

        let record = self
            .registry
            .get(&selection.daemon_id)
            .ok_or(RelayError::NoBackendAvailable)?;
        let Some(daemon_tx) = record.sender.clone() else {
            return Err(RelayError::NoBackendAvailable.into());
        };

        let job_id = Uuid::new_v4();
        let start_msg = TranscodeStart {
            job_id,
            channel_name: channel_name.to_string(),
            source_video_codec: source_key.video.clone(),
            source_audio_codec: source_key.audio.clone(),
            target_video_codec: target_key.video.clone(),
            target_audio_codec: target_key.audio.clone(),
            video_encoder: selection.video_encoder.clone(),
            audio_encoder: profile
                .audio_encoder
                .clone()
                .unwrap_or_else(|| target_key.audio.clone()),
            video_bitrate_kbps: profile.video_bitrate_kbps,
            audio_bitrate_kbps: profile.audio_bitrate_kbps,
            video_preset: profile.video_preset.clone(),
            preferred_hwaccel: profile.preferred_hwaccel.clone().unwrap_or_default(),
            output_format: "es".into(),
            ..Default::default()
        };

        let transcoder = Arc::new(RpcTranscoder::new(
            job_id,
            selection.daemon_id.clone(),
            channel_name.to_string(),
            start_msg,
            source,
            target,
            daemon_tx,
            self.stream_manager.clone(),
            self.registry.clone(),
            parent,
            &self.config,
        ));
        if selection.gpu_reserved {
            transcoder.attach_gpu_lease(GpuLease::new(
                self.registry.clone(),
                selection.daemon_id.clone(),
                self.gpu_queue.clone(),
            ));
        }
        if let Some(worker) = spawned_worker {
            transcoder.attach_worker(worker);
        }
        info!(
            "transcoder {} -> {} on daemon {} (fallback={}, waited={})",
            source_key, target_key, selection.daemon_id, selection.used_fallback,
            selection.waited_for_gpu
        );
        Ok(transcoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::default_selection_strategy;
    use crate::worker::{
        DaemonCapabilities, GpuInfo, RegisterRequest, RegistryConfig, SpawnerConfig,
    };

    fn factory_with(policy: GpuExhaustionPolicy, queue_timeout: Duration) -> TranscoderFactory {
        let registry = Arc::new(DaemonRegistry::new(RegistryConfig::default()));
        let stream_manager = Arc::new(DaemonStreamManager::new(registry.clone()));
        let spawner = WorkerSpawner::new(
            SpawnerConfig {
                binary_path: Some("/nonexistent".into()),
                ..Default::default()
            },
            registry.clone(),
        );
        TranscoderFactory::new(
            registry,
            stream_manager,
            spawner,
            default_selection_strategy(),
            TranscoderConfig {
                gpu_policy: policy,
                max_queue_size: 4,
                queue_timeout,
                ..Default::default()
            },
        )
    }

    fn add_daemon(factory: &TranscoderFactory, id: &str, encoders: &[&str], gpus: Vec<GpuInfo>) {
        factory.registry.register(
            RegisterRequest {
                daemon_id: id.into(),
                daemon_name: id.into(),
                version: "1".into(),
                capabilities: DaemonCapabilities {
                    video_encoders: encoders.iter().map(|s| s.to_string()).collect(),
                    video_decoders: vec!["h264".into()],
                    audio_encoders: vec!["aac".into()],
                    audio_decoders: vec!["aac".into()],
                    hardware_accels: vec![],
                    gpus,
                    max_concurrent_jobs: 4,
                },
            },
            None,
        );
    }

    fn exhausted_gpu() -> GpuInfo {
        GpuInfo {
            index: 0,
            name: String::new(),
            class: String::new(),
            max_encode_sessions: 3,
            active_encode_sessions: 3,
        }
    }

    fn nvenc_criteria() -> SelectionCriteria {
        SelectionCriteria {
            source_video_codec: "h264".into(),
            target_video_codec: "h264".into(),
            required_encoder: Some("h264_nvenc".into()),
            require_gpu: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gpu_exhaustion_fallback_selects_cpu_daemon() {
        let factory = factory_with(GpuExhaustionPolicy::Fallback, Duration::from_secs(1));
        add_daemon(&factory, "gpu-daemon", &["h264_nvenc"], vec![exhausted_gpu()]);
        add_daemon(&factory, "cpu-daemon", &["libx264"], vec![]);

        let sel = factory.select_backend(&nvenc_criteria()).await.unwrap();
        assert_eq!(sel.daemon_id, "cpu-daemon");
        assert!(sel.used_fallback);
        assert_eq!(sel.video_encoder, "libx264");
        assert!(!sel.gpu_reserved);
    }

    #[tokio::test]
    async fn test_gpu_exhaustion_reject() {
        let factory = factory_with(GpuExhaustionPolicy::Reject, Duration::from_secs(1));
        add_daemon(&factory, "gpu-daemon", &["h264_nvenc"], vec![exhausted_gpu()]);
        let err = factory.select_backend(&nvenc_criteria()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NoBackendAvailable)
        ));
    }

    #[tokio::test]
    async fn test_gpu_queue_released_session_wakes_waiter() {
        let factory = Arc::new(factory_with(
            GpuExhaustionPolicy::Queue,
            Duration::from_secs(1),
        ));
        add_daemon(&factory, "gpu-daemon", &["h264_nvenc"], vec![exhausted_gpu()]);

        let f = factory.clone();
        let waiter =
            tokio::spawn(async move { f.select_backend(&nvenc_criteria()).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        // a session frees up
        factory.registry.release_gpu_session("gpu-daemon");
        factory.notify_gpu_available();

        let sel = tokio::time::timeout(Duration::from_millis(300), waiter)
            .await
            .expect("woke within 300ms")
            .unwrap()
            .unwrap();
        assert_eq!(sel.daemon_id, "gpu-daemon");
        assert!(sel.waited_for_gpu);
        assert!(sel.gpu_reserved);
    }

    #[tokio::test]
    async fn test_gpu_queue_timeout() {
        let factory = factory_with(GpuExhaustionPolicy::Queue, Duration::from_millis(100));
        add_daemon(&factory, "gpu-daemon", &["h264_nvenc"], vec![exhausted_gpu()]);
        let err = factory.select_backend(&nvenc_criteria()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NoBackendAvailable)
        ));
    }

    #[tokio::test]
    async fn test_gpu_queue_fifo_order() {
        let factory = Arc::new(factory_with(
            GpuExhaustionPolicy::Queue,
            Duration::from_secs(2),
        ));
        add_daemon(&factory, "gpu-daemon", &["h264_nvenc"], vec![exhausted_gpu()]);

        let f1 = factory.clone();
        let first = tokio::spawn(async move { f1.select_backend(&nvenc_criteria()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let f2 = factory.clone();
        let second = tokio::spawn(async move { f2.select_backend(&nvenc_criteria()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // one release wakes exactly the first waiter
        factory.registry.release_gpu_session("gpu-daemon");
        factory.notify_gpu_available();
        let sel = tokio::time::timeout(Duration::from_millis(500), first)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(sel.waited_for_gpu);
        assert!(!second.is_finished(), "second waiter still queued");

        factory.registry.release_gpu_session("gpu-daemon");
        factory.notify_gpu_available();
        let sel2 = tokio::time::timeout(Duration::from_millis(500), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(sel2.waited_for_gpu);
    }

    #[tokio::test]
    async fn test_no_daemons_no_worker_binary_fails() {
        let factory = factory_with(GpuExhaustionPolicy::Fallback, Duration::from_secs(1));
        let err = factory
            .select_backend(&SelectionCriteria {
                source_video_codec: "h264".into(),
                target_video_codec: "h264".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::NoBackendAvailable)
        ));
    }

    #[test]
    fn test_software_equivalents() {
        assert_eq!(software_equivalent("h264_nvenc"), Some("libx264"));
        assert_eq!(software_equivalent("hevc_nvenc"), Some("libx265"));
        assert_eq!(software_equivalent("h264_qsv"), Some("libx264"));
        assert_eq!(software_equivalent("hevc_vaapi"), Some("libx265"));
        assert_eq!(software_equivalent("h264_amf"), Some("libx264"));
        assert_eq!(software_equivalent("h264_videotoolbox"), Some("libx264"));
        assert_eq!(software_equivalent("hevc_weird"), Some("libx265"));
        assert_eq!(software_equivalent("libx264"), None);
    }
}
