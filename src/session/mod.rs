use crate::buffer::{SharedEsBuffer, TrackLimits};
use crate::egress::{
    AnyProcessor, ClientInfo, DashProcessor, EgressConfig, HlsTsProcessor, MpegTsProcessor,
    OutputFormat, PassthroughConfig, PassthroughProvider,
};
use crate::egress::fragmented::HlsFmp4Processor;
use crate::error::RelayError;
use crate::ingress::{self, IngestKind};
use crate::transcode::{Transcoder, TranscodeProfile, TranscoderFactory};
use crate::variant::CodecVariant;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub mod fallback;
pub mod manager;

pub use manager::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    InFallback,
    RecoveryAttempt,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub recovery_interval: Duration,
    pub fallback_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(5),
            fallback_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub format: String,
    pub variant: String,
    pub clients: usize,
    pub bytes_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: Uuid,
    pub channel_id: String,
    pub state: SessionState,
    pub client_count: usize,
    pub bytes_ingested: u64,
    pub uptime_secs: u64,
    pub processors: Vec<ProcessorStats>,
    pub transcoders: usize,
}

/// Orchestrates one channel: the ingest task feeding the shared buffer,
/// processors fanning out to clients, transcoders for non-source variants,
/// fallback and recovery, and idle-based teardown.
pub struct SessionController {
    pub id: Uuid,
    pub channel_id: String,
    pub source_url: Url,
    ingest_kind: IngestKind,
    profile: TranscodeProfile,
    buffer: Arc<SharedEsBuffer>,
    processors: RwLock<HashMap<(OutputFormat, CodecVariant), AnyProcessor>>,
    transcoders: tokio::sync::Mutex<HashMap<CodecVariant, Arc<dyn Transcoder>>>,
    passthrough: Option<Arc<PassthroughProvider>>,
    clients: RwLock<HashMap<Uuid, ClientInfo>>,
    state: watch::Sender<SessionState>,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    idle_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    factory: Arc<TranscoderFactory>,
    egress_config: EgressConfig,
    config: SessionConfig,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: String,
        source_url: Url,
        ingest_kind: IngestKind,
        profile: TranscodeProfile,
        passthrough_enabled: bool,
        limits: TrackLimits,
        egress_config: EgressConfig,
        config: SessionConfig,
        factory: Arc<TranscoderFactory>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let passthrough = if passthrough_enabled {
            let format = match ingest_kind {
                IngestKind::Hls => Some(OutputFormat::HlsTs),
                IngestKind::Dash => Some(OutputFormat::Dash),
                _ => None,
            };
            format.map(|f| {
                Arc::new(PassthroughProvider::new(
                    source_url.clone(),
                    f,
                    PassthroughConfig::default(),
                ))
            })
        } else {
            None
        };
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel_id,
            source_url,
            ingest_kind,
            profile,
            buffer: Arc::new(SharedEsBuffer::new(limits)),
            processors: RwLock::new(HashMap::new()),
            transcoders: tokio::sync::Mutex::new(HashMap::new()),
            passthrough,
            clients: RwLock::new(HashMap::new()),
            state: watch::channel(SessionState::Starting).0,
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            idle_since: Mutex::new(Some(Instant::now())),
            cancel: parent.child_token(),
            factory,
            egress_config,
            config,
            http: reqwest::Client::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn buffer(&self) -> &Arc<SharedEsBuffer> {
        &self.buffer
    }

    pub fn passthrough(&self) -> Option<&Arc<PassthroughProvider>> {
        self.passthrough.as_ref()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_chan(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let prev = *self.state.borrow();
        if prev != next {
            info!("session {} [{}]: {:?} -> {:?}", self.id, self.channel_id, prev, next);
            self.state.send_replace(next);
        }
    }

    /// Launch the ingest state machine and the idle reaper
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.clone().run_ingest_loop().await;
        });
        let this = self.clone();
        tokio::spawn(async move {
            this.run_idle_check().await;
        });
        // promote Starting -> Running once codecs are known
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = this.cancel.clone();
            if this
                .buffer
                .get_or_create_variant(&CodecVariant::source(), &cancel)
                .await
                .is_ok()
                && this.state() == SessionState::Starting
            {
                this.set_state(SessionState::Running);
            }
        });
    }

    async fn run_ingest_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = ingress::run_ingest(
                self.ingest_kind,
                &self.source_url,
                &self.buffer,
                &self.http,
                &self.cancel,
            )
            .await;

            match result {
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!("session {}: upstream completed", self.channel_id);
                    // processors drain and emit ENDLIST; nothing to recover
                    break;
                }
                Err(e) => {
                    let transient = e
                        .downcast_ref::<RelayError>()
                        .map(|k| k.is_transient())
                        .unwrap_or(true);
                    if !transient || !self.config.fallback_enabled {
                        warn!("session {}: fatal upstream error: {:#}", self.channel_id, e);
                        self.close().await;
                        break;
                    }
                    warn!(
                        "session {}: upstream error, entering fallback: {:#}",
                        self.channel_id, e
                    );
                    if !self.fallback_until_recovered().await {
                        break;
                    }
                    // recovered: reconnect the upstream
                }
            }
        }
    }

    /// Feed fallback content and probe until the upstream answers again.
    /// Returns false when the session should stop instead of reconnecting.
    async fn fallback_until_recovered(&self) -> bool {
        self.set_state(SessionState::InFallback);
        let fallback_cancel = self.cancel.child_token();
        let feed = tokio::spawn(fallback::run_fallback(
            self.buffer.clone(),
            fallback_cancel.clone(),
        ));

        let recovered = loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.recovery_interval) => {}
                _ = self.cancel.cancelled() => break false,
            }
            self.set_state(SessionState::RecoveryAttempt);
            match ingress::probe_upstream(&self.http, &self.source_url).await {
                Ok(()) => {
                    info!("session {}: upstream recovered", self.channel_id);
                    break true;
                }
                Err(e) => {
                    debug!("session {}: probe failed: {:#}", self.channel_id, e);
                    self.set_state(SessionState::InFallback);
                }
            }
        };

        fallback_cancel.cancel();
        feed.abort();
        if recovered {
            self.set_state(SessionState::Running);
        }
        recovered
    }

    async fn run_idle_check(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return,
            }
            let idle_for = {
                let idle_since = self.idle_since.lock().unwrap();
                idle_since.map(|t| t.elapsed())
            };
            if self.client_count() == 0 {
                if let Some(idle_for) = idle_for {
                    if idle_for > self.config.idle_timeout {
                        info!(
                            "session {} idle for {:?}, closing",
                            self.channel_id, idle_for
                        );
                        self.close().await;
                        return;
                    }
                }
            }
            // periodic client-map hygiene for request-based protocols
            let processors: Vec<AnyProcessor> =
                self.processors.read().unwrap().values().cloned().collect();
            for p in processors {
                p.core()
                    .cleanup_inactive_clients(self.egress_config.client_timeout());
            }
        }
    }

    /// Track a client at the session level (idle detection)
    pub fn add_client(&self, user_agent: &str, remote_addr: &str) -> ClientInfo {
        let info = ClientInfo {
            id: Uuid::new_v4(),
            user_agent: user_agent.to_string(),
            remote_addr: remote_addr.to_string(),
        };
        self.clients.write().unwrap().insert(info.id, info.clone());
        *self.idle_since.lock().unwrap() = None;
        *self.last_activity.lock().unwrap() = Instant::now();
        info
    }

    pub fn remove_client(&self, id: &Uuid) -> Result<()> {
        let mut clients = self.clients.write().unwrap();
        if clients.remove(id).is_none() {
            return Err(RelayError::ClientNotFound.into());
        }
        if clients.is_empty() {
            *self.idle_since.lock().unwrap() = Some(Instant::now());
        }
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Resolve the variant a client asked for; `copy` means the source
    fn resolve_variant_key(&self, requested: Option<&CodecVariant>) -> CodecVariant {
        match requested {
            Some(v) if !v.is_source_alias() => v.clone(),
            _ => CodecVariant::source(),
        }
    }

    /// Whether serving `key` needs a transcoder (a non-source variant)
    async fn needs_transcoder(&self, key: &CodecVariant) -> bool {
        if key.is_source_alias() {
            return false;
        }
        // unknown source: let ensure_transcoder resolve it first
        self.buffer
            .source_variant_key()
            .map(|source| &source != key)
            .unwrap_or(true)
    }

    async fn ensure_transcoder(&self, target_key: &CodecVariant) -> Result<()> {
        let mut transcoders = self.transcoders.lock().await;
        if transcoders.contains_key(target_key) {
            return Ok(());
        }
        let source = self
            .buffer
            .get_or_create_variant(&CodecVariant::source(), &self.cancel)
            .await?;
        let source_key = source.key().clone();
        if &source_key == target_key {
            // the requested variant turned out to be the source itself
            return Ok(());
        }
        let target = self
            .buffer
            .get_or_create_variant(target_key, &self.cancel)
            .await?;
        let transcoder = self
            .factory
            .create(
                &self.channel_id,
                &source_key,
                target_key,
                source,
                target,
                &self.profile,
                &self.cancel,
            )
            .await?;
        transcoder.clone().start().await?;
        transcoders.insert(target_key.clone(), transcoder);
        Ok(())
    }

    /// Processor lookup with lazy creation; retries once when a racing stop
    /// marked the existing instance
    pub async fn get_or_create_processor(
        &self,
        format: OutputFormat,
        requested: Option<&CodecVariant>,
    ) -> Result<AnyProcessor> {
        let key = self.resolve_variant_key(requested);
        if self.needs_transcoder(&key).await {
            self.ensure_transcoder(&key).await?;
        }

        for _ in 0..2 {
            let map_key = (format, key.clone());
            {
                let processors = self.processors.read().unwrap();
                if let Some(p) = processors.get(&map_key) {
                    if !p.core().is_stopping() {
                        return Ok(p.clone());
                    }
                }
            }
            let created = self.create_processor(format, key.clone());
            let existing_result = {
                let mut processors = self.processors.write().unwrap();
                match processors.get(&map_key) {
                    Some(existing) if !existing.core().is_stopping() => {
                        Some(existing.clone())
                    }
                    _ => {
                        processors.insert(map_key, created.clone());
                        None
                    }
                }
            };
            if let Some(existing) = existing_result {
                return Ok(existing);
            }
            created.start().await?;
            return Ok(created);
        }
        Err(RelayError::ProcessorStopping.into())
    }

    fn create_processor(&self, format: OutputFormat, key: CodecVariant) -> AnyProcessor {
        debug!(
            "session {}: creating {} processor for {}",
            self.channel_id, format, key
        );
        match format {
            OutputFormat::HlsTs => AnyProcessor::HlsTs(Arc::new(HlsTsProcessor::new(
                self.buffer.clone(),
                key,
                self.egress_config.clone(),
                &self.cancel,
            ))),
            OutputFormat::HlsFmp4 => AnyProcessor::HlsFmp4(Arc::new(HlsFmp4Processor::new(
                self.buffer.clone(),
                key,
                self.egress_config.clone(),
                &self.cancel,
            ))),
            OutputFormat::Dash => AnyProcessor::Dash(Arc::new(DashProcessor::new(
                self.buffer.clone(),
                key,
                self.egress_config.clone(),
                &self.cancel,
            ))),
            OutputFormat::MpegTs => AnyProcessor::MpegTs(Arc::new(MpegTsProcessor::new(
                self.buffer.clone(),
                key,
                &self.cancel,
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancel everything, reap transcoders and processors, close the
    /// buffer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing session {} [{}]", self.id, self.channel_id);
        self.cancel.cancel();

        let processors: Vec<AnyProcessor> =
            self.processors.write().unwrap().drain().map(|(_, p)| p).collect();
        for p in processors {
            p.stop().await;
        }
        let transcoders: Vec<Arc<dyn Transcoder>> = self
            .transcoders
            .lock()
            .await
            .drain()
            .map(|(_, t)| t)
            .collect();
        for t in transcoders {
            t.stop("session closed").await;
        }
        self.buffer.close();
        self.clients.write().unwrap().clear();
        self.set_state(SessionState::Closed);
    }

    pub fn stats(&self) -> SessionStats {
        let processors = self.processors.read().unwrap();
        SessionStats {
            id: self.id,
            channel_id: self.channel_id.clone(),
            state: self.state(),
            client_count: self.client_count(),
            bytes_ingested: self.buffer.bytes_ingested(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            processors: processors
                .values()
                .map(|p| {
                    let core = p.core();
                    ProcessorStats {
                        format: core.format.to_string(),
                        variant: core.variant_key.to_string(),
                        clients: core.client_count(),
                        bytes_per_second: core.bandwidth.current_bps(),
                    }
                })
                .collect(),
            transcoders: self.transcoders.try_lock().map(|t| t.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::{default_selection_strategy, TranscoderConfig};
    use crate::worker::{DaemonRegistry, DaemonStreamManager, RegistryConfig, SpawnerConfig, WorkerSpawner};

    fn factory() -> Arc<TranscoderFactory> {
        let registry = Arc::new(DaemonRegistry::new(RegistryConfig::default()));
        let stream_manager = Arc::new(DaemonStreamManager::new(registry.clone()));
        let spawner = WorkerSpawner::new(
            SpawnerConfig {
                binary_path: Some("/nonexistent".into()),
                ..Default::default()
            },
            registry.clone(),
        );
        Arc::new(TranscoderFactory::new(
            registry,
            stream_manager,
            spawner,
            default_selection_strategy(),
            TranscoderConfig::default(),
        ))
    }

    fn session(idle_timeout: Duration) -> Arc<SessionController> {
        SessionController::new(
            "ch1".into(),
            "http://127.0.0.1:1/void.ts".parse().unwrap(),
            IngestKind::Mpegts,
            TranscodeProfile::default(),
            false,
            TrackLimits::default(),
            EgressConfig::default(),
            SessionConfig {
                idle_timeout,
                ..Default::default()
            },
            factory(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_client_tracking_and_idle_since() {
        let s = session(Duration::from_secs(60));
        let a = s.add_client("vlc/3.0", "10.0.0.1:4242");
        let b = s.add_client("mpv/0.38", "10.0.0.2:4243");
        assert_eq!(s.client_count(), 2);
        assert!(s.idle_since.lock().unwrap().is_none());

        s.remove_client(&a.id).unwrap();
        assert!(s.idle_since.lock().unwrap().is_none());
        s.remove_client(&b.id).unwrap();
        assert!(s.idle_since.lock().unwrap().is_some(), "last removal marks idle");

        let err = s.remove_client(&a.id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ClientNotFound)
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let s = session(Duration::from_millis(100));
        s.start();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(s.is_closed());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let s = session(Duration::from_secs(60));
        s.close().await;
        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.buffer().is_closed());
    }

    #[tokio::test]
    async fn test_processor_reuse_and_stop_race() {
        let s = session(Duration::from_secs(60));
        s.buffer.set_source(CodecVariant::new("h264", "aac")).unwrap();
        let p1 = s
            .get_or_create_processor(OutputFormat::HlsTs, None)
            .await
            .unwrap();
        let p2 = s
            .get_or_create_processor(OutputFormat::HlsTs, None)
            .await
            .unwrap();
        assert_eq!(p1.core().id, p2.core().id, "same processor reused");

        // a racing stop marks it; the next request gets a fresh processor
        assert!(p1.core().try_mark_for_stopping());
        let p3 = s
            .get_or_create_processor(OutputFormat::HlsTs, None)
            .await
            .unwrap();
        assert_ne!(p1.core().id, p3.core().id);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let s = session(Duration::from_secs(60));
        s.buffer.set_source(CodecVariant::new("h264", "aac")).unwrap();
        s.get_or_create_processor(OutputFormat::HlsTs, None)
            .await
            .unwrap();
        let stats = s.stats();
        assert_eq!(stats.channel_id, "ch1");
        assert_eq!(stats.processors.len(), 1);
        assert_eq!(stats.processors[0].variant, "h264/aac");
    }
}
