use crate::buffer::SharedEsBuffer;
use crate::egress::fragmented::FragmentEngine;
use crate::egress::{EgressConfig, OutputFormat, Processor, ProcessorCore, Segment};
use crate::variant::CodecVariant;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// DASH output: the fMP4 fragment engine plus an MPD manifest whose
/// initialization and media URLs are opaque proxy references.
pub struct DashProcessor {
    core: ProcessorCore,
    buffer: Arc<SharedEsBuffer>,
    engine: FragmentEngine,
    stopped: AtomicBool,
}

impl DashProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: CodecVariant,
        config: EgressConfig,
        parent: &tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            core: ProcessorCore::new(OutputFormat::Dash, variant_key, parent),
            buffer,
            engine: FragmentEngine::new(config),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &FragmentEngine {
        &self.engine
    }

    pub fn init_segment(&self) -> Result<Bytes> {
        self.engine.init_segment()
    }

    pub fn segment(&self, sequence: u64) -> Result<Segment> {
        self.engine.segment(sequence)
    }

    /// Live-profile MPD listing the advertised window with proxy URLs
    pub async fn manifest(&self) -> Result<String> {
        self.core.touch_playlist();
        self.engine.wait_first_segment().await?;

        let config = self.engine.config();
        let target = config.target_duration;
        let mime = if self.core.variant_key.has_video() {
            "video/mp4"
        } else {
            "audio/mp4"
        };
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        Ok(self.engine.with_window(|window| {
            let mut mpd = String::new();
            let _ = writeln!(mpd, r#"<?xml version="1.0" encoding="utf-8"?>"#);
            let _ = writeln!(
                mpd,
                r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" profiles="urn:mpeg:dash:profile:isoff-live:2011" type="{}" publishTime="{}" minimumUpdatePeriod="PT{:.0}S" minBufferTime="PT2S">"#,
                if window.is_ended() { "static" } else { "dynamic" },
                now,
                target.max(1.0),
            );
            let _ = writeln!(mpd, r#"  <Period id="0" start="PT0S">"#);
            let _ = writeln!(
                mpd,
                r#"    <AdaptationSet mimeType="{mime}" segmentAlignment="true">"#
            );
            let _ = writeln!(mpd, r#"      <Representation id="main" bandwidth="0">"#);
            let _ = writeln!(
                mpd,
                r#"        <SegmentList timescale="90000" duration="{}" startNumber="{}">"#,
                (target * 90_000.0) as u64,
                window.media_sequence(),
            );
            let _ = writeln!(
                mpd,
                r#"          <Initialization sourceURL="?format=dash&amp;init=main"/>"#
            );
            for seg in window.advertised() {
                let _ = writeln!(
                    mpd,
                    r#"          <SegmentURL media="?format=dash&amp;seg={}"/>"#,
                    seg.sequence
                );
            }
            let _ = writeln!(mpd, "        </SegmentList>");
            let _ = writeln!(mpd, "      </Representation>");
            let _ = writeln!(mpd, "    </AdaptationSet>");
            let _ = writeln!(mpd, "  </Period>");
            let _ = writeln!(mpd, "</MPD>");
            mpd
        }))
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
                warn!("dash pump could not resolve variant: {:#}", e);
                return;
            }
        };
        variant.register_consumer(self.core.id);
        if let Err(e) = self.engine.pump(&self.core, &self.buffer, &variant).await {
            warn!("dash pump ended: {:#}", e);
        }
        variant.unregister_consumer(&self.core.id);
        self.buffer.unregister_processor(&self.core.id);
    }
}

#[async_trait]
impl Processor for DashProcessor {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TrackLimits;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn keyframe_with_params() -> Bytes {
        let mut v = Vec::new();
        v.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1e, 0xac]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xeb, 0xe3]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xaa, 0xbb]);
        Bytes::from(v)
    }

    #[tokio::test]
    async fn test_manifest_lists_proxy_urls() {
        let buffer = Arc::new(SharedEsBuffer::new(TrackLimits::default()));
        let key = CodecVariant::new("h264", "");
        let variant = buffer.set_source(key.clone()).unwrap();
        let cancel = CancellationToken::new();
        let config = EgressConfig {
            target_duration: 1.0,
            ..Default::default()
        };
        let processor = Arc::new(DashProcessor::new(buffer.clone(), key, config, &cancel));
        processor.clone().start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let video = variant.video_track().clone();
        for i in 0..7i64 {
            let pts = i * 45_000;
            video.write(pts, pts, keyframe_with_params(), true);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for _ in 0..100 {
            if processor.engine().segment_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mpd = processor.manifest().await.unwrap();
        assert!(mpd.contains(r#"type="dynamic""#));
        assert!(mpd.contains("?format=dash&amp;init=main"));
        assert!(mpd.contains("?format=dash&amp;seg="));
        assert!(!mpd.contains("BaseURL"), "no BaseURL in generated MPD");
        processor.stop().await;
    }
}
