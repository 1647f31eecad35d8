use crate::error::RelayError;
use crate::worker::{DaemonCapabilities, HeartbeatRequest, RegisterRequest, RpcFrame};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Connected,
    Unhealthy,
    Disconnected,
}

/// One registered worker daemon
#[derive(Debug, Clone)]
pub struct DaemonRecord {
    pub daemon_id: String,
    pub name: String,
    pub version: String,
    pub state: DaemonState,
    pub capabilities: DaemonCapabilities,
    pub active_jobs: u32,
    pub last_heartbeat: Instant,
    pub heartbeats_missed: u32,
    /// Outbound half of the daemon's RPC stream
    pub sender: Option<mpsc::Sender<RpcFrame>>,
}

impl DaemonRecord {
    /// Whether this daemon may accept one more job of the given class
    pub fn is_eligible(&self, require_gpu: bool) -> bool {
        if self.state != DaemonState::Connected {
            return false;
        }
        if self.active_jobs >= self.capabilities.max_concurrent_jobs {
            return false;
        }
        if require_gpu && !self.capabilities.gpus.iter().any(|g| g.has_free_session()) {
            return false;
        }
        true
    }

    pub fn has_encoder(&self, encoder: &str) -> bool {
        self.capabilities
            .video_encoders
            .iter()
            .chain(self.capabilities.audio_encoders.iter())
            .any(|e| e == encoder)
    }

    pub fn has_decoder(&self, decoder: &str) -> bool {
        self.capabilities
            .video_decoders
            .iter()
            .chain(self.capabilities.audio_decoders.iter())
            .any(|d| d == decoder)
    }

    pub fn load(&self) -> f64 {
        if self.capabilities.max_concurrent_jobs == 0 {
            return 1.0;
        }
        self.active_jobs as f64 / self.capabilities.max_concurrent_jobs as f64
    }

    pub fn available_encode_sessions(&self) -> u32 {
        self.capabilities
            .gpus
            .iter()
            .map(|g| g.max_encode_sessions.saturating_sub(g.active_encode_sessions))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(with = "duration_secs", default = "RegistryConfig::default_cleanup")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs", default = "RegistryConfig::default_heartbeat")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_secs", default = "RegistryConfig::default_remove")]
    pub remove_timeout: Duration,
}

impl RegistryConfig {
    fn default_cleanup() -> Duration {
        Duration::from_secs(5)
    }
    fn default_heartbeat() -> Duration {
        Duration::from_secs(15)
    }
    fn default_remove() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Self::default_cleanup(),
            heartbeat_timeout: Self::default_heartbeat(),
            remove_timeout: Self::default_remove(),
        }
    }
}

/// Seconds-as-integer (de)serialization for config durations
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Tracks every worker daemon known to this coordinator.
///
/// Heartbeat and selection hold a single lock; transitions between
/// Connected, Unhealthy and removed are therefore linearizable.
#[derive(Debug)]
pub struct DaemonRegistry {
    config: RegistryConfig,
    daemons: Mutex<HashMap<String, DaemonRecord>>,
}

impl DaemonRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            daemons: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, req: RegisterRequest, sender: Option<mpsc::Sender<RpcFrame>>) {
        let mut daemons = self.daemons.lock().unwrap();
        info!(
            "daemon {} registered ({} v{})",
            req.daemon_id, req.daemon_name, req.version
        );
        daemons.insert(
            req.daemon_id.clone(),
            DaemonRecord {
                daemon_id: req.daemon_id,
                name: req.daemon_name,
                version: req.version,
                state: DaemonState::Connected,
                capabilities: req.capabilities,
                active_jobs: 0,
                last_heartbeat: Instant::now(),
                heartbeats_missed: 0,
                sender,
            },
        );
    }

    pub fn handle_heartbeat(&self, req: &HeartbeatRequest) -> Result<()> {
        let mut daemons = self.daemons.lock().unwrap();
        let Some(record) = daemons.get_mut(&req.daemon_id) else {
            return Err(RelayError::DaemonNotRegistered(req.daemon_id.clone()).into());
        };
        if record.state == DaemonState::Unhealthy {
            info!("daemon {} recovered", req.daemon_id);
        }
        record.state = DaemonState::Connected;
        record.heartbeats_missed = 0;
        record.last_heartbeat = Instant::now();
        record.active_jobs = req.active_jobs.len() as u32;
        Ok(())
    }

    pub fn unregister(&self, daemon_id: &str, reason: &str) {
        let mut daemons = self.daemons.lock().unwrap();
        if daemons.remove(daemon_id).is_some() {
            info!("daemon {} unregistered: {}", daemon_id, reason);
        }
    }

    pub fn get(&self, daemon_id: &str) -> Option<DaemonRecord> {
        self.daemons.lock().unwrap().get(daemon_id).cloned()
    }

    pub fn get_all(&self) -> Vec<DaemonRecord> {
        self.daemons.lock().unwrap().values().cloned().collect()
    }

    /// Daemons currently in Connected state
    pub fn get_active(&self) -> Vec<DaemonRecord> {
        self.daemons
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.state == DaemonState::Connected)
            .cloned()
            .collect()
    }

    /// Connected daemons with spare job capacity
    pub fn get_available(&self) -> Vec<DaemonRecord> {
        self.daemons
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.is_eligible(false))
            .cloned()
            .collect()
    }

    pub fn get_with_capability(&self, encoder: &str) -> Vec<DaemonRecord> {
        self.daemons
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.is_eligible(false) && d.has_encoder(encoder))
            .cloned()
            .collect()
    }

    pub fn get_with_available_gpu(&self) -> Vec<DaemonRecord> {
        self.daemons
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.is_eligible(true))
            .cloned()
            .collect()
    }

    /// Apply a selection strategy to the current daemon snapshot
    pub fn select_daemon(
        &self,
        strategy: &dyn crate::transcode::SelectionStrategy,
        criteria: &crate::transcode::SelectionCriteria,
    ) -> Option<DaemonRecord> {
        let daemons = self.get_all();
        let id = strategy.select(&daemons, criteria)?;
        daemons.into_iter().find(|d| d.daemon_id == id)
    }

    pub fn connected_count(&self) -> usize {
        self.get_active().len()
    }

    pub fn total_count(&self) -> usize {
        self.daemons.lock().unwrap().len()
    }

    /// Atomically claim a GPU encode session on the daemon, if one is free
    pub fn reserve_gpu_session(&self, daemon_id: &str) -> bool {
        let mut daemons = self.daemons.lock().unwrap();
        let Some(record) = daemons.get_mut(daemon_id) else {
            return false;
        };
        for gpu in &mut record.capabilities.gpus {
            if gpu.has_free_session() {
                gpu.active_encode_sessions += 1;
                return true;
            }
        }
        false
    }

    pub fn release_gpu_session(&self, daemon_id: &str) {
        let mut daemons = self.daemons.lock().unwrap();
        let Some(record) = daemons.get_mut(daemon_id) else {
            return;
        };
        if let Some(gpu) = record
            .capabilities
            .gpus
            .iter_mut()
            .find(|g| g.active_encode_sessions > 0)
        {
            gpu.active_encode_sessions -= 1;
        }
    }

    pub fn job_started(&self, daemon_id: &str) {
        if let Some(record) = self.daemons.lock().unwrap().get_mut(daemon_id) {
            record.active_jobs += 1;
        }
    }

    pub fn job_finished(&self, daemon_id: &str) {
        if let Some(record) = self.daemons.lock().unwrap().get_mut(daemon_id) {
            record.active_jobs = record.active_jobs.saturating_sub(1);
        }
    }

    /// One sweep of the health checker; returns removed daemon ids
    pub fn cleanup_pass(&self) -> Vec<String> {
        let mut daemons = self.daemons.lock().unwrap();
        let now = Instant::now();
        let mut removed = Vec::new();
        daemons.retain(|id, record| {
            let silent_for = now.duration_since(record.last_heartbeat);
            if silent_for > self.config.remove_timeout
                || record.state == DaemonState::Disconnected
            {
                warn!("removing daemon {} (silent {:?})", id, silent_for);
                removed.push(id.clone());
                return false;
            }
            if silent_for > self.config.heartbeat_timeout && record.state == DaemonState::Connected
            {
                warn!("daemon {} marked unhealthy (silent {:?})", id, silent_for);
                record.state = DaemonState::Unhealthy;
                record.heartbeats_missed += 1;
            }
            true
        });
        removed
    }

    pub fn spawn_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_pass();
                        if !removed.is_empty() {
                            debug!("cleanup removed {} daemons", removed.len());
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::GpuInfo;

    pub(crate) fn register_daemon(
        registry: &DaemonRegistry,
        id: &str,
        gpus: Vec<GpuInfo>,
        encoders: &[&str],
    ) {
        registry.register(
            RegisterRequest {
                daemon_id: id.to_string(),
                daemon_name: format!("test-{id}"),
                version: "1.0".into(),
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

    fn heartbeat(id: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            daemon_id: id.to_string(),
            system_stats: Default::default(),
            active_jobs: vec![],
        }
    }

    #[test]
    fn test_unknown_heartbeat_fails() {
        let registry = DaemonRegistry::new(RegistryConfig::default());
        let err = registry.handle_heartbeat(&heartbeat("ghost")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::DaemonNotRegistered(_))
        ));
    }

    #[test]
    fn test_heartbeat_restores_unhealthy() {
        let registry = DaemonRegistry::new(RegistryConfig {
            cleanup_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(0),
            remove_timeout: Duration::from_secs(60),
        });
        register_daemon(&registry, "d1", vec![], &["libx264"]);
        registry.cleanup_pass();
        let record = registry.get("d1").unwrap();
        assert_eq!(record.state, DaemonState::Unhealthy);
        assert_eq!(record.heartbeats_missed, 1);

        registry.handle_heartbeat(&heartbeat("d1")).unwrap();
        let record = registry.get("d1").unwrap();
        assert_eq!(record.state, DaemonState::Connected);
        assert_eq!(record.heartbeats_missed, 0);
    }

    #[test]
    fn test_cleanup_removes_after_remove_timeout() {
        let registry = DaemonRegistry::new(RegistryConfig {
            cleanup_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(0),
            remove_timeout: Duration::from_millis(0),
        });
        register_daemon(&registry, "d1", vec![], &["libx264"]);
        std::thread::sleep(Duration::from_millis(5));
        let removed = registry.cleanup_pass();
        assert_eq!(removed, vec!["d1".to_string()]);
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_gpu_session_reserve_release() {
        let registry = DaemonRegistry::new(RegistryConfig::default());
        register_daemon(
            &registry,
            "gpu",
            vec![GpuInfo {
                index: 0,
                name: "test".into(),
                class: "consumer".into(),
                max_encode_sessions: 2,
                active_encode_sessions: 0,
            }],
            &["h264_nvenc"],
        );
        assert!(registry.reserve_gpu_session("gpu"));
        assert!(registry.reserve_gpu_session("gpu"));
        assert!(!registry.reserve_gpu_session("gpu"));
        registry.release_gpu_session("gpu");
        assert!(registry.reserve_gpu_session("gpu"));
    }

    #[test]
    fn test_eligibility() {
        let registry = DaemonRegistry::new(RegistryConfig::default());
        register_daemon(
            &registry,
            "gpu",
            vec![GpuInfo {
                index: 0,
                name: String::new(),
                class: String::new(),
                max_encode_sessions: 1,
                active_encode_sessions: 1,
            }],
            &["h264_nvenc"],
        );
        let record = registry.get("gpu").unwrap();
        assert!(record.is_eligible(false));
        assert!(!record.is_eligible(true), "no free GPU sessions");
        assert!(record.has_encoder("h264_nvenc"));
        assert!(!record.has_encoder("libx265"));
    }

    #[test]
    fn test_filters() {
        let registry = DaemonRegistry::new(RegistryConfig::default());
        register_daemon(&registry, "cpu", vec![], &["libx264"]);
        register_daemon(
            &registry,
            "gpu",
            vec![GpuInfo {
                index: 0,
                name: String::new(),
                class: String::new(),
                max_encode_sessions: 3,
                active_encode_sessions: 0,
            }],
            &["h264_nvenc"],
        );
        assert_eq!(registry.get_with_capability("libx264").len(), 1);
        assert_eq!(registry.get_with_available_gpu().len(), 1);
        assert_eq!(registry.get_available().len(), 2);
        assert_eq!(registry.connected_count(), 2);
    }
}
