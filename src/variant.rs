use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Video codec names this relay understands well enough to route
pub const KNOWN_VIDEO_CODECS: &[&str] = &["h264", "h265", "hevc", "av1", "vp9", "mpeg2"];

/// Audio codec names this relay understands well enough to route
pub const KNOWN_AUDIO_CODECS: &[&str] = &["aac", "ac3", "eac3", "mp3", "opus", "flac"];

/// A codec combination identifying one variant within a session.
///
/// Serialized as `<video>/<audio>` (e.g. `h264/aac`). Either half may be
/// empty for video-only or audio-only streams. The sentinel
/// [CodecVariant::source] (`source/source`, alias `copy`) refers to whatever
/// codecs the ingest demuxer discovered and is resolved by the buffer at use
/// time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CodecVariant {
    pub video: String,
    pub audio: String,
}

impl CodecVariant {
    pub const SOURCE_NAME: &'static str = "source";

    pub fn new(video: impl Into<String>, audio: impl Into<String>) -> Self {
        Self {
            video: video.into().to_lowercase(),
            audio: audio.into().to_lowercase(),
        }
    }

    /// The `source/source` sentinel
    pub fn source() -> Self {
        Self::new(Self::SOURCE_NAME, Self::SOURCE_NAME)
    }

    pub fn is_source_alias(&self) -> bool {
        self.video == Self::SOURCE_NAME && self.audio == Self::SOURCE_NAME
    }

    pub fn has_video(&self) -> bool {
        !self.video.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    /// Whether both halves name codecs the relay can interpret.
    ///
    /// An empty half is a valid "absent" track, but a variant with no tracks
    /// at all is never valid.
    pub fn is_supported(&self) -> bool {
        if self.is_source_alias() {
            return true;
        }
        if !self.has_video() && !self.has_audio() {
            return false;
        }
        let video_ok = !self.has_video() || KNOWN_VIDEO_CODECS.contains(&self.video.as_str());
        let audio_ok = !self.has_audio() || KNOWN_AUDIO_CODECS.contains(&self.audio.as_str());
        video_ok && audio_ok
    }
}

impl FromStr for CodecVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("copy") || s.eq_ignore_ascii_case("source/source") {
            return Ok(Self::source());
        }
        let Some((video, audio)) = s.split_once('/') else {
            bail!("invalid codec variant {:?}, expected <video>/<audio>", s);
        };
        Ok(Self::new(video, audio))
    }
}

impl Display for CodecVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.video, self.audio)
    }
}

impl TryFrom<String> for CodecVariant {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CodecVariant> for String {
    fn from(value: CodecVariant) -> Self {
        value.to_string()
    }
}
