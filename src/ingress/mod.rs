use crate::buffer::{EsVariant, SharedEsBuffer};
use crate::demux::{CmafDemuxer, Demuxer, SampleSink, TrackInfo, TsDemuxer};
use crate::error::{classify_upstream_status, RelayError};
use crate::variant::CodecVariant;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// How the upstream delivers the stream. Classification/probing is an
/// external concern; the channel configuration states it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    #[default]
    Mpegts,
    Hls,
    Cmaf,
    Dash,
}

/// SampleSink wiring demuxer callbacks into the session's shared buffer
pub struct BufferSink {
    buffer: Arc<SharedEsBuffer>,
    variant: Option<Arc<EsVariant>>,
}

impl BufferSink {
    pub fn new(buffer: Arc<SharedEsBuffer>) -> Self {
        Self {
            buffer,
            variant: None,
        }
    }
}

impl SampleSink for BufferSink {
    fn on_codecs(&mut self, video: Option<TrackInfo>, audio: Option<TrackInfo>) -> Result<()> {
        let key = CodecVariant::new(
            video.as_ref().map(|t| t.codec.as_str()).unwrap_or(""),
            audio.as_ref().map(|t| t.codec.as_str()).unwrap_or(""),
        );
        info!("upstream codecs discovered: {}", key);
        self.variant = Some(self.buffer.set_source(key)?);
        Ok(())
    }

    fn on_video_sample(&mut self, pts: i64, dts: i64, data: Bytes, is_keyframe: bool) -> Result<()> {
        let variant = self
            .variant
            .as_ref()
            .context("video sample before codec discovery")?;
        variant.video_track().write(pts, dts, data, is_keyframe);
        Ok(())
    }

    fn on_audio_sample(&mut self, pts: i64, data: Bytes) -> Result<()> {
        let variant = self
            .variant
            .as_ref()
            .context("audio sample before codec discovery")?;
        variant.audio_track().write(pts, pts, data, false);
        Ok(())
    }

    fn on_eof(&mut self) -> Result<()> {
        info!("upstream signalled clean end of stream");
        self.buffer.mark_source_completed();
        Ok(())
    }
}

fn transient(e: impl ToString) -> anyhow::Error {
    RelayError::UpstreamTransient(e.to_string()).into()
}

/// Run one ingest connection until EOF, error or cancellation.
///
/// Returns Ok on clean upstream EOF. A mid-stream close without an
/// end-of-stream marker is classified transient so the session can decide
/// to enter fallback rather than treat it as completion.
pub async fn run_ingest(
    kind: IngestKind,
    url: &Url,
    buffer: &Arc<SharedEsBuffer>,
    client: &reqwest::Client,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut sink = BufferSink::new(buffer.clone());
    match kind {
        IngestKind::Mpegts => {
            let mut demux = TsDemuxer::new();
            stream_body(url, buffer, client, cancel, &mut demux, &mut sink).await
        }
        IngestKind::Cmaf => {
            let mut demux = CmafDemuxer::new();
            stream_body(url, buffer, client, cancel, &mut demux, &mut sink).await
        }
        IngestKind::Hls => run_hls_ingest(url, buffer, client, cancel, &mut sink).await,
        IngestKind::Dash => run_dash_ingest(url, buffer, client, cancel, &mut sink).await,
    }
}

/// Continuous container over HTTP (TS or fMP4): one long GET
async fn stream_body(
    url: &Url,
    buffer: &Arc<SharedEsBuffer>,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    demux: &mut dyn Demuxer,
    sink: &mut BufferSink,
) -> Result<()> {
    let rsp = client.get(url.clone()).send().await.map_err(transient)?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(classify_upstream_status(status.as_u16(), "ingest").into());
    }
    let mut stream = rsp.bytes_stream();
    loop {
        tokio::select! {
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(data)) => {
                        buffer.add_bytes_ingested(data.len() as u64);
                        demux.push(&data, sink)?;
                    }
                    Some(Err(e)) => return Err(transient(e)),
                    None => {
                        // upstream closed; only a clean EOF counts as done
                        demux.finish(sink)?;
                        return Ok(());
                    }
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn fetch_bytes(client: &reqwest::Client, url: &Url, context: &str) -> Result<Bytes> {
    let rsp = client.get(url.clone()).send().await.map_err(transient)?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(classify_upstream_status(status.as_u16(), context).into());
    }
    rsp.bytes().await.map_err(transient)
}

/// HLS: poll the media playlist and feed each new segment through the TS
/// demuxer in order
async fn run_hls_ingest(
    url: &Url,
    buffer: &Arc<SharedEsBuffer>,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    sink: &mut BufferSink,
) -> Result<()> {
    let mut demux = TsDemuxer::new();
    let mut next_media_sequence: Option<u64> = None;
    loop {
        let body = fetch_bytes(client, url, "hls playlist").await?;
        let (_, playlist) = m3u8_rs::parse_playlist(&body)
            .map_err(|e| RelayError::UpstreamFatal(format!("bad playlist: {e}")))?;
        let pl = match playlist {
            m3u8_rs::Playlist::MediaPlaylist(pl) => pl,
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                let variant = master.variants.first().ok_or_else(|| {
                    RelayError::UpstreamFatal("master playlist with no variants".into())
                })?;
                let variant_url = url.join(&variant.uri).map_err(transient)?;
                debug!("hls ingest following variant {}", variant_url);
                return Box::pin(run_hls_ingest(&variant_url, buffer, client, cancel, sink))
                    .await;
            }
        };

        let target = Duration::from_secs_f32((pl.target_duration as f32).max(1.0));
        let mut seq = pl.media_sequence;
        for seg in &pl.segments {
            let this_seq = seq;
            seq += 1;
            if let Some(next) = next_media_sequence {
                if this_seq < next {
                    continue;
                }
            }
            let seg_url = url.join(&seg.uri).map_err(transient)?;
            let data = fetch_bytes(client, &seg_url, "hls segment").await?;
            buffer.add_bytes_ingested(data.len() as u64);
            demux.push(&data, sink)?;
            next_media_sequence = Some(this_seq + 1);
            if cancel.is_cancelled() {
                return Ok(());
            }
        }

        if pl.end_list {
            demux.finish(sink)?;
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(target / 2) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// DASH: poll the MPD and feed init + media fragments through the CMAF
/// demuxer. Attribute-level parsing is enough for the SegmentList/URL
/// shapes relays encounter.
async fn run_dash_ingest(
    url: &Url,
    buffer: &Arc<SharedEsBuffer>,
    client: &reqwest::Client,
    cancel: &CancellationToken,
    sink: &mut BufferSink,
) -> Result<()> {
    let mut demux = CmafDemuxer::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut init_fed = false;
    loop {
        let body = fetch_bytes(client, url, "dash manifest").await?;
        let text = String::from_utf8_lossy(&body);

        if !init_fed {
            if let Some(init) = extract_attr_values(&text, "initialization=\"").first() {
                let init_url = url.join(init).map_err(transient)?;
                let data = fetch_bytes(client, &init_url, "dash init").await?;
                buffer.add_bytes_ingested(data.len() as u64);
                demux.push(&data, sink)?;
                init_fed = true;
            }
        }
        for media in extract_attr_values(&text, "media=\"") {
            if seen.contains(&media) {
                continue;
            }
            let seg_url = url.join(&media).map_err(transient)?;
            let data = fetch_bytes(client, &seg_url, "dash segment").await?;
            buffer.add_bytes_ingested(data.len() as u64);
            demux.push(&data, sink)?;
            seen.insert(media);
            if seen.len() > 256 {
                seen.clear();
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
        }

        if text.contains("type=\"static\"") {
            demux.finish(sink)?;
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

fn extract_attr_values(text: &str, attr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(attr) {
        let start = pos + attr.len();
        let Some(len) = rest[start..].find('"') else {
            break;
        };
        let value = &rest[start..start + len];
        if !value.contains('$') {
            // templated URLs need a number substitution we do not track
            out.push(value.to_string());
        }
        rest = &rest[start + len..];
    }
    out
}

/// Issue a recovery probe: HEAD against the upstream
pub async fn probe_upstream(client: &reqwest::Client, url: &Url) -> Result<()> {
    let rsp = client
        .head(url.clone())
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(transient)?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(classify_upstream_status(status.as_u16(), "probe").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TrackLimits;
    use crate::mux::TsMuxer;

    #[test]
    fn test_extract_attr_values() {
        let text = r#"<SegmentTemplate initialization="init.mp4" media="seg-$Number$.m4s"/>
<SegmentURL media="s1.m4s"/><SegmentURL media="s2.m4s"/>"#;
        assert_eq!(extract_attr_values(text, "initialization=\""), vec!["init.mp4"]);
        // templated media is skipped, explicit URLs kept
        assert_eq!(extract_attr_values(text, "media=\""), vec!["s1.m4s", "s2.m4s"]);
    }

    #[test]
    fn test_buffer_sink_announces_and_writes() {
        let buffer = Arc::new(SharedEsBuffer::new(TrackLimits::default()));
        let mut sink = BufferSink::new(buffer.clone());
        sink.on_codecs(Some(TrackInfo::video("h264", 90_000)), None)
            .unwrap();
        assert_eq!(
            buffer.source_variant_key(),
            Some(CodecVariant::new("h264", ""))
        );
        sink.on_video_sample(0, 0, Bytes::from_static(&[0, 0, 0, 1, 0x65, 1]), true)
            .unwrap();
        let variant = buffer.source_variant().unwrap();
        assert_eq!(variant.video_track().len(), 1);
        assert!(!buffer.is_source_completed());
        sink.on_eof().unwrap();
        assert!(buffer.is_source_completed());
    }

    #[tokio::test]
    async fn test_mpegts_ingest_end_to_end() {
        // serve a small TS file over a local HTTP socket
        let mut mux = TsMuxer::new(Some("h264"), None).unwrap();
        mux.write_psi();
        for i in 0..10i64 {
            let key = i % 5 == 0;
            let data: &[u8] = if key {
                &[0, 0, 0, 1, 0x65, 0xaa]
            } else {
                &[0, 0, 0, 1, 0x41, 0xbb]
            };
            mux.write_video(i * 3000, i * 3000, data, key).unwrap();
        }
        let body = mux.take();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = body.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: video/mp2t\r\ncontent-length: {}\r\n\r\n",
                served.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(&served).await.unwrap();
        });

        let buffer = Arc::new(SharedEsBuffer::new(TrackLimits::default()));
        let url: Url = format!("http://{addr}/stream.ts").parse().unwrap();
        let cancel = CancellationToken::new();
        run_ingest(
            IngestKind::Mpegts,
            &url,
            &buffer,
            &reqwest::Client::new(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(buffer.is_source_completed());
        assert_eq!(buffer.bytes_ingested(), body.len() as u64);
        let variant = buffer.source_variant().unwrap();
        assert_eq!(variant.video_track().len(), 10);
    }

    #[tokio::test]
    async fn test_upstream_4xx_is_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        let buffer = Arc::new(SharedEsBuffer::new(TrackLimits::default()));
        let url: Url = format!("http://{addr}/missing.ts").parse().unwrap();
        let err = run_ingest(
            IngestKind::Mpegts,
            &url,
            &buffer,
            &reqwest::Client::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::UpstreamFatal(_))
        ));
    }
}
