use crate::bandwidth::BandwidthTracker;
use crate::error::RelayError;
use crate::variant::CodecVariant;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub mod dash;
pub mod fragmented;
pub mod hls_ts;
pub mod mpegts;
pub mod passthrough;
pub mod segment;

pub use dash::DashProcessor;
pub use hls_ts::HlsTsProcessor;
pub use mpegts::MpegTsProcessor;
pub use passthrough::{PassthroughConfig, PassthroughProvider};
pub use segment::SegmentWindow;

/// Container format served to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    HlsTs,
    HlsFmp4,
    Dash,
    MpegTs,
}

impl OutputFormat {
    /// Parse the `format` query parameter
    pub fn from_query(s: &str) -> Option<Self> {
        Some(match s {
            "hls" | "hls-ts" | "auto" => OutputFormat::HlsTs,
            "hls-fmp4" | "fmp4" => OutputFormat::HlsFmp4,
            "dash" => OutputFormat::Dash,
            "mpegts" => OutputFormat::MpegTs,
            _ => return None,
        })
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::HlsTs => "application/vnd.apple.mpegurl",
            OutputFormat::HlsFmp4 => "application/vnd.apple.mpegurl",
            OutputFormat::Dash => "application/dash+xml",
            OutputFormat::MpegTs => "video/mp2t",
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputFormat::HlsTs => "hls-ts",
            OutputFormat::HlsFmp4 => "hls-fmp4",
            OutputFormat::Dash => "dash",
            OutputFormat::MpegTs => "mpegts",
        };
        write!(f, "{s}")
    }
}

/// Output unit produced by a processor
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub duration: f32,
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    pub is_keyframe: bool,
    pub discontinuity: bool,
}

/// Sliding-window and playlist sizing for segmented outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "EgressConfig::default_target_duration")]
    pub target_duration: f32,
    #[serde(default = "EgressConfig::default_max_segments")]
    pub max_segments: usize,
    #[serde(default = "EgressConfig::default_playlist_segments")]
    pub playlist_segments: usize,
    /// How long a playlist request waits for the first segment before 503
    #[serde(default = "EgressConfig::default_playlist_wait_secs")]
    pub playlist_wait_secs: u64,
    /// Clients with no activity for this long are evicted
    #[serde(default = "EgressConfig::default_client_timeout_secs")]
    pub client_timeout_secs: u64,
}

impl EgressConfig {
    fn default_target_duration() -> f32 {
        6.0
    }
    fn default_max_segments() -> usize {
        30
    }
    fn default_playlist_segments() -> usize {
        5
    }
    fn default_playlist_wait_secs() -> u64 {
        5
    }
    fn default_client_timeout_secs() -> u64 {
        60
    }

    pub fn playlist_wait(&self) -> Duration {
        Duration::from_secs(self.playlist_wait_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            target_duration: Self::default_target_duration(),
            max_segments: Self::default_max_segments(),
            playlist_segments: Self::default_playlist_segments(),
            playlist_wait_secs: Self::default_playlist_wait_secs(),
            client_timeout_secs: Self::default_client_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: Uuid,
    pub user_agent: String,
    pub remote_addr: String,
}

struct ClientEntry {
    info: ClientInfo,
    /// Streaming clients (continuous TS) receive chunks here; request-based
    /// clients (HLS/DASH) have no writer
    writer: Option<mpsc::Sender<Bytes>>,
    last_activity: Instant,
    bytes_sent: Arc<AtomicU64>,
    waiting_for_keyframe: bool,
}

struct ClientMap {
    clients: HashMap<Uuid, ClientEntry>,
    /// Set by try_mark_for_stopping; rejects registrations until cleared
    stopping: bool,
}

/// Shared bookkeeping every processor composes: the client map, bandwidth
/// tracker and activity timestamps.
///
/// HTTP writes never happen under the map lock; `broadcast` snapshots
/// writers first and sends after releasing it.
pub struct ProcessorCore {
    pub id: Uuid,
    pub format: OutputFormat,
    pub variant_key: CodecVariant,
    clients: RwLock<ClientMap>,
    pub bandwidth: BandwidthTracker,
    last_playlist_request: Mutex<Instant>,
    pub cancel: CancellationToken,
}

/// Queue depth per streaming client; a client that stays this far behind
/// starts losing chunks
const CLIENT_QUEUE: usize = 256;

impl ProcessorCore {
    pub fn new(format: OutputFormat, variant_key: CodecVariant, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            format,
            variant_key,
            clients: RwLock::new(ClientMap {
                clients: HashMap::new(),
                stopping: false,
            }),
            bandwidth: BandwidthTracker::default(),
            last_playlist_request: Mutex::new(Instant::now()),
            cancel: parent.child_token(),
        }
    }

    /// Register or refresh a client. Re-registering an existing id updates
    /// its writer and activity instead of duplicating the entry.
    pub fn register_client(
        &self,
        info: ClientInfo,
        writer: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Arc<AtomicU64>> {
        let mut map = self.clients.write().unwrap();
        if map.stopping {
            return Err(RelayError::ProcessorStopping.into());
        }
        let entry = map.clients.entry(info.id).or_insert_with(|| ClientEntry {
            info: info.clone(),
            writer: None,
            last_activity: Instant::now(),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            waiting_for_keyframe: true,
        });
        entry.last_activity = Instant::now();
        if writer.is_some() {
            entry.writer = writer;
            entry.waiting_for_keyframe = true;
        }
        Ok(entry.bytes_sent.clone())
    }

    pub fn remove_client(&self, id: &Uuid) -> Result<()> {
        let mut map = self.clients.write().unwrap();
        if map.clients.remove(id).is_none() {
            return Err(RelayError::ClientNotFound.into());
        }
        Ok(())
    }

    /// Refresh activity for a request-based client; no-op when unknown
    pub fn touch_client(&self, id: &Uuid) {
        let mut map = self.clients.write().unwrap();
        if let Some(entry) = map.clients.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().clients.len()
    }

    pub fn client_ids(&self) -> Vec<Uuid> {
        self.clients.read().unwrap().clients.keys().copied().collect()
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .unwrap()
            .clients
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn client_bytes_sent(&self, id: &Uuid) -> Option<u64> {
        self.clients
            .read()
            .unwrap()
            .clients
            .get(id)
            .map(|c| c.bytes_sent.load(Ordering::Relaxed))
    }

    /// Evict clients idle longer than `timeout`
    pub fn cleanup_inactive_clients(&self, timeout: Duration) -> usize {
        let mut map = self.clients.write().unwrap();
        let before = map.clients.len();
        let now = Instant::now();
        map.clients
            .retain(|_, c| now.duration_since(c.last_activity) <= timeout);
        before - map.clients.len()
    }

    /// Check-and-set under the client-map lock: succeeds only while no
    /// clients are registered, and every later register_client fails with
    /// [RelayError::ProcessorStopping] until [ProcessorCore::clear_stopping].
    pub fn try_mark_for_stopping(&self) -> bool {
        let mut map = self.clients.write().unwrap();
        if map.stopping {
            return true;
        }
        if !map.clients.is_empty() {
            return false;
        }
        map.stopping = true;
        true
    }

    pub fn clear_stopping(&self) {
        self.clients.write().unwrap().stopping = false;
    }

    pub fn is_stopping(&self) -> bool {
        self.clients.read().unwrap().stopping
    }

    pub fn touch_playlist(&self) {
        *self.last_playlist_request.lock().unwrap() = Instant::now();
    }

    pub fn since_last_playlist_request(&self) -> Duration {
        self.last_playlist_request.lock().unwrap().elapsed()
    }

    /// Send a chunk to every streaming client.
    ///
    /// `keyframe_boundary` releases clients still waiting for a safe entry
    /// point. Writers are captured under the lock, writes happen outside it;
    /// dead clients are unregistered silently.
    pub fn broadcast(&self, data: &Bytes, keyframe_boundary: bool) {
        let targets: Vec<(Uuid, mpsc::Sender<Bytes>, Arc<AtomicU64>)> = {
            let mut map = self.clients.write().unwrap();
            map.clients
                .iter_mut()
                .filter_map(|(id, entry)| {
                    if entry.waiting_for_keyframe {
                        if !keyframe_boundary {
                            return None;
                        }
                        entry.waiting_for_keyframe = false;
                    }
                    entry
                        .writer
                        .as_ref()
                        .map(|w| (*id, w.clone(), entry.bytes_sent.clone()))
                })
                .collect()
        };

        let mut dead = Vec::new();
        for (id, writer, bytes_sent) in targets {
            match writer.try_send(data.clone()) {
                Ok(()) => {
                    bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                    self.bandwidth.add(data.len() as u64);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // client is behind; drop the chunk, keep the client
                    debug!("client {} lagging, chunk dropped", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut map = self.clients.write().unwrap();
            for id in dead {
                map.clients.remove(&id);
            }
        }
    }

    pub fn client_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(CLIENT_QUEUE)
    }
}

/// Shared lifecycle of all four processor kinds
#[async_trait]
pub trait Processor: Send + Sync {
    fn core(&self) -> &ProcessorCore;
    /// Spawn the consuming pump
    async fn start(self: Arc<Self>) -> Result<()>;
    /// Idempotent teardown
    async fn stop(&self);
    /// Default: idle iff no clients. HLS-fMP4 overrides on playlist age.
    fn is_idle(&self) -> bool {
        self.core().client_count() == 0
    }
}

/// Concrete processor dispatch for the HTTP layer
#[derive(Clone)]
pub enum AnyProcessor {
    HlsTs(Arc<HlsTsProcessor>),
    HlsFmp4(Arc<fragmented::HlsFmp4Processor>),
    Dash(Arc<DashProcessor>),
    MpegTs(Arc<MpegTsProcessor>),
}

impl AnyProcessor {
    pub fn as_processor(&self) -> Arc<dyn Processor> {
        match self {
            AnyProcessor::HlsTs(p) => p.clone(),
            AnyProcessor::HlsFmp4(p) => p.clone(),
            AnyProcessor::Dash(p) => p.clone(),
            AnyProcessor::MpegTs(p) => p.clone(),
        }
    }

    pub fn core(&self) -> &ProcessorCore {
        match self {
            AnyProcessor::HlsTs(p) => p.core(),
            AnyProcessor::HlsFmp4(p) => p.core(),
            AnyProcessor::Dash(p) => p.core(),
            AnyProcessor::MpegTs(p) => p.core(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            AnyProcessor::HlsTs(p) => p.clone().start().await,
            AnyProcessor::HlsFmp4(p) => p.clone().start().await,
            AnyProcessor::Dash(p) => p.clone().start().await,
            AnyProcessor::MpegTs(p) => p.clone().start().await,
        }
    }

    pub async fn stop(&self) {
        self.as_processor().stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ProcessorCore {
        ProcessorCore::new(
            OutputFormat::HlsTs,
            CodecVariant::new("h264", "aac"),
            &CancellationToken::new(),
        )
    }

    fn client(id: Uuid) -> ClientInfo {
        ClientInfo {
            id,
            user_agent: "test/1.0".into(),
            remote_addr: "127.0.0.1:1234".into(),
        }
    }

    #[test]
    fn test_register_updates_not_duplicates() {
        let core = core();
        let id = Uuid::new_v4();
        core.register_client(client(id), None).unwrap();
        core.register_client(client(id), None).unwrap();
        assert_eq!(core.client_count(), 1);
    }

    #[test]
    fn test_stopping_rejects_registration() {
        let core = core();
        assert!(core.try_mark_for_stopping());
        let err = core.register_client(client(Uuid::new_v4()), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ProcessorStopping)
        ));
        // until explicitly cleared
        core.clear_stopping();
        assert!(core.register_client(client(Uuid::new_v4()), None).is_ok());
    }

    #[test]
    fn test_try_mark_fails_with_clients() {
        let core = core();
        core.register_client(client(Uuid::new_v4()), None).unwrap();
        assert!(!core.try_mark_for_stopping());
    }

    #[test]
    fn test_try_mark_race_single_winner_semantics() {
        // A marks, B's register fails, repeated marks stay true
        let core = core();
        assert!(core.try_mark_for_stopping());
        assert!(core.try_mark_for_stopping());
        assert!(core
            .register_client(client(Uuid::new_v4()), None)
            .is_err());
    }

    #[test]
    fn test_remove_unknown_client() {
        let core = core();
        let err = core.remove_client(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ClientNotFound)
        ));
    }

    #[test]
    fn test_cleanup_inactive() {
        let core = core();
        core.register_client(client(Uuid::new_v4()), None).unwrap();
        assert_eq!(core.cleanup_inactive_clients(Duration::from_secs(60)), 0);
        assert_eq!(core.cleanup_inactive_clients(Duration::from_nanos(0)), 1);
        assert_eq!(core.client_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_waits_for_keyframe() {
        let core = core();
        let id = Uuid::new_v4();
        let (tx, mut rx) = ProcessorCore::client_channel();
        core.register_client(client(id), Some(tx)).unwrap();

        core.broadcast(&Bytes::from_static(b"before"), false);
        assert!(rx.try_recv().is_err(), "data before keyframe is discarded");

        core.broadcast(&Bytes::from_static(b"idr"), true);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"idr"));
        // subsequent non-keyframe chunks flow
        core.broadcast(&Bytes::from_static(b"delta"), false);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"delta"));
        assert_eq!(core.client_bytes_sent(&id), Some(8));
    }

    #[tokio::test]
    async fn test_broadcast_unregisters_dead_clients() {
        let core = core();
        let id = Uuid::new_v4();
        let (tx, rx) = ProcessorCore::client_channel();
        core.register_client(client(id), Some(tx)).unwrap();
        drop(rx);
        core.broadcast(&Bytes::from_static(b"x"), true);
        assert_eq!(core.client_count(), 0);
    }
}
