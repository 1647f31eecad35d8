use anyhow::Result;
use bytes::Bytes;

pub mod cmaf;
pub mod mpegts;

pub use cmaf::CmafDemuxer;
pub use mpegts::TsDemuxer;

/// Timescale every demux adapter normalizes timestamps to before samples
/// enter the shared buffer
pub const RELAY_TIMESCALE: u32 = 90_000;

/// What a demuxer learned about one elementary stream
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub codec: String,
    /// Original container timescale (informational; samples are normalized)
    pub timescale: u32,
    /// Audio only
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackInfo {
    pub fn video(codec: &str, timescale: u32) -> Self {
        Self {
            codec: codec.to_string(),
            timescale,
            sample_rate: 0,
            channels: 0,
        }
    }

    pub fn audio(codec: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec: codec.to_string(),
            timescale: sample_rate,
            sample_rate,
            channels,
        }
    }
}

/// The bytes-to-samples callback contract between low-level demux
/// primitives and the relay core.
///
/// `on_codecs` fires exactly once, before the first sample, as soon as the
/// container metadata (PMT, moov) has been parsed. All timestamps are in
/// [RELAY_TIMESCALE] ticks.
pub trait SampleSink: Send {
    fn on_codecs(&mut self, video: Option<TrackInfo>, audio: Option<TrackInfo>) -> Result<()>;
    fn on_video_sample(&mut self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) -> Result<()>;
    fn on_audio_sample(&mut self, pts: i64, data: Bytes) -> Result<()>;
    /// Clean end of stream
    fn on_eof(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An incremental container parser fed from the network
pub trait Demuxer: Send {
    /// Feed a chunk of container bytes, emitting samples through `sink`
    fn push(&mut self, data: &[u8], sink: &mut dyn SampleSink) -> Result<()>;
    /// Flush partially-assembled state and signal clean EOF
    fn finish(&mut self, sink: &mut dyn SampleSink) -> Result<()>;
}
