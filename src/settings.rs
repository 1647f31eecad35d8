use crate::buffer::TrackLimits;
use crate::egress::EgressConfig;
use crate::ingress::IngestKind;
use crate::session::SessionConfig;
use crate::transcode::{GpuExhaustionPolicy, TranscodeProfile, TranscoderConfig};
use crate::worker::{RegistryConfig, SpawnerConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the relay serves clients.
///
/// `smart` runs the full engine (passthrough, repackage or transcode per
/// request); `direct` keeps the relay out of the media path entirely and
/// only redirects clients to the upstream or byte-proxies it, rejecting
/// requests that would need a format conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Direct,
    #[default]
    Smart,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Direct => "direct",
            StreamMode::Smart => "smart",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source_url: String,
    #[serde(default)]
    pub ingest: IngestKind,
    /// Feed the last GOP while the upstream is down instead of failing
    #[serde(default)]
    pub fallback: bool,
    /// Serve upstream HLS/DASH directly when the requested format matches
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub profile: Option<TranscodeProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    #[serde(default = "BufferSettings::default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "BufferSettings::default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "BufferSettings::default_max_duration_secs")]
    pub max_duration_secs: u64,
}

impl BufferSettings {
    fn default_max_samples() -> usize {
        2048
    }
    fn default_max_bytes() -> usize {
        64 * 1024 * 1024
    }
    fn default_max_duration_secs() -> u64 {
        60
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_samples: Self::default_max_samples(),
            max_bytes: Self::default_max_bytes(),
            max_duration_secs: Self::default_max_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "SessionSettings::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "SessionSettings::default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
}

impl SessionSettings {
    fn default_idle_timeout_secs() -> u64 {
        60
    }
    fn default_recovery_interval_secs() -> u64 {
        5
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            recovery_interval_secs: Self::default_recovery_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderSettings {
    #[serde(default)]
    pub gpu_exhaustion_policy: GpuExhaustionPolicy,
    #[serde(default = "TranscoderSettings::default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "TranscoderSettings::default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default = "TranscoderSettings::default_stream_send_timeout_secs")]
    pub stream_send_timeout_secs: u64,
    #[serde(default = "TranscoderSettings::default_max_errors")]
    pub max_errors: u64,
    /// Explicit worker binary path; TVARR_WORKER_BINARY and PATH lookup
    /// otherwise
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
    #[serde(default = "TranscoderSettings::default_max_concurrent_spawns")]
    pub max_concurrent_spawns: usize,
    #[serde(default = "TranscoderSettings::default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "TranscoderSettings::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl TranscoderSettings {
    fn default_max_queue_size() -> usize {
        16
    }
    fn default_queue_timeout_secs() -> u64 {
        10
    }
    fn default_stream_send_timeout_secs() -> u64 {
        5
    }
    fn default_max_errors() -> u64 {
        50
    }
    fn default_max_concurrent_spawns() -> usize {
        4
    }
    fn default_startup_timeout_secs() -> u64 {
        15
    }
    fn default_shutdown_timeout_secs() -> u64 {
        5
    }
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            gpu_exhaustion_policy: GpuExhaustionPolicy::default(),
            max_queue_size: Self::default_max_queue_size(),
            queue_timeout_secs: Self::default_queue_timeout_secs(),
            stream_send_timeout_secs: Self::default_stream_send_timeout_secs(),
            max_errors: Self::default_max_errors(),
            worker_binary: None,
            max_concurrent_spawns: Self::default_max_concurrent_spawns(),
            startup_timeout_secs: Self::default_startup_timeout_secs(),
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP listen address for clients
    #[serde(default = "Settings::default_listen_http")]
    pub listen_http: String,

    /// Listen address worker daemons connect back to
    #[serde(default = "Settings::default_listen_worker")]
    pub listen_worker: String,

    #[serde(default)]
    pub public_url: Option<String>,

    #[serde(default)]
    pub stream_mode: StreamMode,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub buffer: BufferSettings,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub transcoder: TranscoderSettings,
}

impl Settings {
    fn default_listen_http() -> String {
        "127.0.0.1:8380".into()
    }
    fn default_listen_worker() -> String {
        "127.0.0.1:8390".into()
    }

    /// Load `config.yaml` (or an explicit path) with `APP_`-prefixed
    /// environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;
        Ok(builder.try_deserialize()?)
    }

    pub fn track_limits(&self) -> TrackLimits {
        TrackLimits {
            max_samples: self.buffer.max_samples,
            max_bytes: self.buffer.max_bytes,
            max_duration: Duration::from_secs(self.buffer.max_duration_secs),
            timescale: 90_000,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            recovery_interval: Duration::from_secs(self.session.recovery_interval_secs),
            fallback_enabled: false,
        }
    }

    pub fn transcoder_config(&self) -> TranscoderConfig {
        TranscoderConfig {
            gpu_policy: self.transcoder.gpu_exhaustion_policy,
            max_queue_size: self.transcoder.max_queue_size,
            queue_timeout: Duration::from_secs(self.transcoder.queue_timeout_secs),
            stream_send_timeout: Duration::from_secs(self.transcoder.stream_send_timeout_secs),
            max_errors: self.transcoder.max_errors,
        }
    }

    pub fn spawner_config(&self) -> SpawnerConfig {
        SpawnerConfig {
            binary_path: self.transcoder.worker_binary.clone(),
            coordinator_url: self.listen_worker.clone(),
            max_concurrent_spawns: self.transcoder.max_concurrent_spawns,
            startup_timeout: Duration::from_secs(self.transcoder.startup_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.transcoder.shutdown_timeout_secs),
            log_level: "info".into(),
            auth_token: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_http: Self::default_listen_http(),
            listen_worker: Self::default_listen_worker(),
            public_url: None,
            stream_mode: StreamMode::default(),
            channels: Vec::new(),
            buffer: BufferSettings::default(),
            egress: EgressConfig::default(),
            session: SessionSettings::default(),
            registry: RegistryConfig::default(),
            transcoder: TranscoderSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Settings {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
listen_http: 0.0.0.0:8080
channels:
  - id: sports
    source_url: http://origin.example/sports.m3u8
    ingest: hls
    fallback: true
    profile:
      require_gpu: true
      video_bitrate_kbps: 4500
transcoder:
  gpu_exhaustion_policy: queue
"#;
        let settings = from_yaml(yaml);
        assert_eq!(settings.listen_http, "0.0.0.0:8080");
        assert_eq!(settings.channels.len(), 1);
        let ch = &settings.channels[0];
        assert_eq!(ch.ingest, IngestKind::Hls);
        assert!(ch.fallback);
        assert_eq!(ch.profile.as_ref().unwrap().video_bitrate_kbps, 4500);
        assert_eq!(
            settings.transcoder.gpu_exhaustion_policy,
            GpuExhaustionPolicy::Queue
        );
        // defaults fill the rest
        assert_eq!(settings.egress.max_segments, 30);
        assert_eq!(settings.session.idle_timeout_secs, 60);
    }

    #[test]
    fn test_derived_configs() {
        let settings = Settings::default();
        let limits = settings.track_limits();
        assert_eq!(limits.timescale, 90_000);
        let tc = settings.transcoder_config();
        assert_eq!(tc.max_queue_size, 16);
        let sc = settings.spawner_config();
        assert_eq!(sc.coordinator_url, settings.listen_worker);
    }
}
