use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

pub mod registry;
pub mod spawner;
pub mod stream;

pub use registry::{DaemonRecord, DaemonRegistry, DaemonState, RegistryConfig};
pub use spawner::{SpawnerConfig, WorkerSpawner};
pub use stream::DaemonStreamManager;

/// Interval a healthy daemon is expected to heartbeat at
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// One GPU advertised by a worker daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub index: u32,
    #[serde(default)]
    pub name: String,
    /// Device class, e.g. "consumer" / "datacenter"
    #[serde(default)]
    pub class: String,
    pub max_encode_sessions: u32,
    #[serde(default)]
    pub active_encode_sessions: u32,
}

impl GpuInfo {
    pub fn has_free_session(&self) -> bool {
        self.active_encode_sessions < self.max_encode_sessions
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DaemonCapabilities {
    #[serde(default)]
    pub video_encoders: Vec<String>,
    #[serde(default)]
    pub video_decoders: Vec<String>,
    #[serde(default)]
    pub audio_encoders: Vec<String>,
    #[serde(default)]
    pub audio_decoders: Vec<String>,
    #[serde(default)]
    pub hardware_accels: Vec<String>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: Uuid,
    #[serde(default)]
    pub encoding_speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub daemon_id: String,
    pub daemon_name: String,
    pub version: String,
    pub capabilities: DaemonCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub daemon_id: String,
    #[serde(default)]
    pub system_stats: SystemStats,
    #[serde(default)]
    pub active_jobs: Vec<ActiveJob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeStart {
    pub job_id: Uuid,
    pub channel_name: String,
    pub source_video_codec: String,
    pub source_audio_codec: String,
    pub target_video_codec: String,
    pub target_audio_codec: String,
    pub video_encoder: String,
    pub audio_encoder: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub video_preset: String,
    #[serde(default)]
    pub preferred_hwaccel: String,
    #[serde(default)]
    pub hw_device: String,
    #[serde(default)]
    pub encoder_overrides: Vec<String>,
    #[serde(default)]
    pub global_flags: String,
    #[serde(default)]
    pub input_flags: String,
    #[serde(default)]
    pub output_flags: String,
    #[serde(default)]
    pub output_format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeAck {
    pub success: bool,
    #[serde(default)]
    pub actual_video_encoder: String,
    #[serde(default)]
    pub actual_audio_encoder: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSample {
    pub pts: i64,
    #[serde(default)]
    pub dts: Option<i64>,
    #[serde(with = "serde_bytes_compat")]
    pub data: Bytes,
    #[serde(default)]
    pub is_keyframe: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleBatch {
    #[serde(default)]
    pub video_samples: Vec<RpcSample>,
    #[serde(default)]
    pub audio_samples: Vec<RpcSample>,
    #[serde(default)]
    pub is_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub encoding_speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeStop {
    pub reason: String,
}

/// One-of payload carried by every frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcPayload {
    Register(RegisterRequest),
    RegisterAck {
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Heartbeat(HeartbeatRequest),
    HeartbeatAck,
    TranscodeStart(TranscodeStart),
    TranscodeAck(TranscodeAck),
    SampleBatch(SampleBatch),
    TranscodeStats(TranscodeStats),
    TranscodeError(TranscodeError),
    TranscodeStop(TranscodeStop),
}

/// Wire frame: job frames carry the job id so one daemon stream can
/// multiplex many concurrent transcodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFrame {
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub payload: RpcPayload,
}

impl RpcFrame {
    pub fn control(payload: RpcPayload) -> Self {
        Self {
            job_id: None,
            payload,
        }
    }

    pub fn job(job_id: Uuid, payload: RpcPayload) -> Self {
        Self {
            job_id: Some(job_id),
            payload,
        }
    }
}

/// Length-delimited JSON framing over any bytestream
pub fn rpc_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(64 * 1024 * 1024)
        .new_codec()
}

pub fn encode_frame(frame: &RpcFrame) -> Result<Bytes> {
    Ok(serde_json::to_vec(frame)
        .context("encoding rpc frame")?
        .into())
}

pub fn decode_frame(data: &[u8]) -> Result<RpcFrame> {
    serde_json::from_slice(data).context("decoding rpc frame")
}

/// The `detect` output of the worker binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectOutput {
    pub ffmpeg: FfmpegInfo,
    pub capabilities: DaemonCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegInfo {
    pub version: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Bytes <-> JSON array of numbers; framing is opaque to the contract so a
/// plain array keeps the messages debuggable
mod serde_bytes_compat {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(data.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let v: Vec<u8> = Vec::deserialize(d)?;
        Ok(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = RpcFrame::job(
            Uuid::new_v4(),
            RpcPayload::SampleBatch(SampleBatch {
                video_samples: vec![RpcSample {
                    pts: 1000,
                    dts: Some(900),
                    data: Bytes::from_static(&[1, 2, 3]),
                    is_keyframe: true,
                    sequence: 7,
                }],
                audio_samples: vec![],
                is_source: true,
            }),
        );
        let encoded = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.job_id, frame.job_id);
        match decoded.payload {
            RpcPayload::SampleBatch(b) => {
                assert_eq!(b.video_samples.len(), 1);
                assert_eq!(b.video_samples[0].sequence, 7);
                assert_eq!(&b.video_samples[0].data[..], &[1, 2, 3]);
                assert!(b.is_source);
            }
            other => panic!("wrong payload {:?}", other),
        }
    }

    #[test]
    fn test_detect_output_parses_worker_json() {
        let doc = r#"{
            "ffmpeg": {"version": "7.1", "paths": ["/usr/bin/ffmpeg"]},
            "capabilities": {
                "video_encoders": ["libx264", "h264_nvenc"],
                "video_decoders": ["h264"],
                "audio_encoders": ["aac"],
                "audio_decoders": ["aac"],
                "hardware_accels": ["cuda"],
                "gpus": [{"index": 0, "name": "RTX", "class": "consumer",
                          "max_encode_sessions": 3, "active_encode_sessions": 0}],
                "max_concurrent_jobs": 4
            }
        }"#;
        let parsed: DetectOutput = serde_json::from_str(doc).unwrap();
        assert_eq!(parsed.ffmpeg.version, "7.1");
        assert_eq!(parsed.capabilities.gpus.len(), 1);
        assert!(parsed.capabilities.gpus[0].has_free_session());
    }
}
