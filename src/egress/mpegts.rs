use crate::buffer::{EsVariant, SharedEsBuffer};
use crate::egress::hls_ts::{interleave, PUMP_BATCH};
use crate::egress::{ClientInfo, OutputFormat, Processor, ProcessorCore};
use crate::mux::TsMuxer;
use crate::variant::CodecVariant;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Continuous MPEG-TS: no segmentation, the muxer's output is broadcast to
/// every connected client. New clients discard everything until the next
/// video IDR crosses the muxer.
pub struct MpegTsProcessor {
    core: ProcessorCore,
    buffer: Arc<SharedEsBuffer>,
    stopped: AtomicBool,
}

impl MpegTsProcessor {
    pub fn new(
        buffer: Arc<SharedEsBuffer>,
        variant_key: CodecVariant,
        parent: &tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            core: ProcessorCore::new(OutputFormat::MpegTs, variant_key, parent),
            buffer,
            stopped: AtomicBool::new(false),
        }
    }

    /// Attach a streaming client; returns the byte stream for the response
    pub fn add_client(&self, info: ClientInfo) -> Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = ProcessorCore::client_channel();
        self.core.register_client(info, Some(tx))?;
        Ok(rx)
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
                warn!("mpegts pump could not resolve variant: {:#}", e);
                return;
            }
        };
        variant.register_consumer(self.core.id);
        if let Err(e) = self.pump(&variant).await {
            warn!("mpegts pump ended: {:#}", e);
        }
        variant.unregister_consumer(&self.core.id);
        self.buffer.unregister_processor(&self.core.id);
        debug!("mpegts processor {} finished", self.core.id);
    }

    async fn pump(&self, variant: &Arc<EsVariant>) -> Result<()> {
        let key = variant.key().clone();
        let video = variant.video_track().clone();
        let audio = variant.audio_track().clone();
        let mut mux = TsMuxer::new(
            key.has_video().then_some(key.video.as_str()),
            key.has_audio().then_some(key.audio.as_str()),
        )?;
        mux.write_psi();
        // the PSI prefix reaches clients with their first keyframe chunk

        let mut video_cursor = video.latest_sequence();
        let mut audio_cursor = audio.latest_sequence();
        // audio-only streams have no IDR to wait for
        let audio_only = !key.has_video();

        loop {
            let notified_video = video.notify_chan();
            let notified_audio = audio.notify_chan();

            let video_batch = if key.has_video() {
                video.read_from(video_cursor, PUMP_BATCH)
            } else {
                Vec::new()
            };
            let audio_batch = if key.has_audio() {
                audio.read_from(audio_cursor, PUMP_BATCH)
            } else {
                Vec::new()
            };

            if video_batch.is_empty() && audio_batch.is_empty() {
                if self.buffer.is_source_completed() || self.buffer.is_closed() {
                    let tail = mux.take();
                    if !tail.is_empty() {
                        self.core.broadcast(&tail, audio_only);
                    }
                    return Ok(());
                }
                tokio::select! {
                    _ = self.core.cancel.cancelled() => return Ok(()),
                    _ = notified_video => {}
                    _ = notified_audio => {}
                }
                continue;
            }

            if let Some(s) = video_batch.last() {
                video_cursor = s.sequence;
            }
            if let Some(s) = audio_batch.last() {
                audio_cursor = s.sequence;
            }
            variant.update_consumer_position(self.core.id, video_cursor, audio_cursor);

            for (is_video, sample) in interleave(video_batch, audio_batch) {
                let keyframe_boundary = if is_video {
                    if sample.is_keyframe {
                        // repeat PAT/PMT so clients released at this IDR can
                        // decode from their first chunk
                        mux.write_psi();
                    }
                    mux.write_video(sample.pts, sample.dts, &sample.data, sample.is_keyframe)?;
                    sample.is_keyframe
                } else {
                    mux.write_audio(sample.pts, &sample.data)?;
                    audio_only
                };
                let chunk = mux.take();
                if !chunk.is_empty() {
                    self.core.broadcast(&chunk, keyframe_boundary);
                }
            }
        }
    }
}

#[async_trait]
impl Processor for MpegTsProcessor {
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
    use uuid::Uuid;

    fn keyframe_au() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xaa, 0xbb])
    }

    fn delta_au() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x99])
    }

    fn client() -> ClientInfo {
        ClientInfo {
            id: Uuid::new_v4(),
            user_agent: "test".into(),
            remote_addr: "127.0.0.1:9".into(),
        }
    }

    #[tokio::test]
    async fn test_client_joins_at_keyframe() {
        let buffer = Arc::new(SharedEsBuffer::new(TrackLimits::default()));
        let key = CodecVariant::new("h264", "");
        let variant = buffer.set_source(key.clone()).unwrap();
        let cancel = CancellationToken::new();
        let processor = Arc::new(MpegTsProcessor::new(buffer.clone(), key, &cancel));
        processor.clone().start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rx = processor.add_client(client()).unwrap();
        let video = variant.video_track().clone();

        // a delta frame first: the waiting client must not receive it
        video.write(0, 0, delta_au(), false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // the IDR unlocks the client
        video.write(3000, 3000, keyframe_au(), true);
        let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("keyframe chunk within 1s")
            .expect("channel open");
        assert_eq!(chunk.len() % 188, 0);
        assert_eq!(chunk[0], 0x47);

        // later deltas flow freely
        video.write(6000, 6000, delta_au(), false);
        let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!chunk.is_empty());
        processor.stop().await;
        processor.stop().await; // idempotent
    }
}
